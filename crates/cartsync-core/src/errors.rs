/// Rejection of a cart operation. Every variant maps to a stable wire code.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CartError {
    // Validation
    #[error("unknown or unavailable item: {0}")]
    InvalidItem(String),
    #[error("option {option} is not offered for item {item}")]
    InvalidCustomization { item: String, option: String },
    #[error("quantity {requested} is outside 1..={max}")]
    InvalidQuantity { requested: i64, max: u32 },
    #[error("no line matches {0}")]
    LineNotFound(String),
    #[error("cart already holds the maximum of {limit} lines")]
    CartFull { limit: usize },

    // Session lifecycle
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("closing sessions is disabled on this server")]
    CloseNotAllowed,

    // Protocol
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CartError {
    /// Stable code clients switch on.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidItem(_) => "INVALID_ITEM",
            Self::InvalidCustomization { .. } => "INVALID_CUSTOMIZATION",
            Self::InvalidQuantity { .. } => "INVALID_QUANTITY",
            Self::LineNotFound(_) => "LINE_NOT_FOUND",
            Self::CartFull { .. } => "CART_FULL",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::CloseNotAllowed => "CLOSE_NOT_ALLOWED",
            Self::MalformedRequest(_) => "MALFORMED_REQUEST",
            Self::UnknownEvent(_) => "UNKNOWN_EVENT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The channel has lost its session and must re-join.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }

    /// Message safe to put on the wire. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Failure loading or validating a menu catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid catalog: {0}")]
    Invalid(String),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CartError::InvalidItem("x".into()).code(), "INVALID_ITEM");
        assert_eq!(
            CartError::InvalidQuantity { requested: 0, max: 99 }.code(),
            "INVALID_QUANTITY"
        );
        assert_eq!(CartError::LineNotFound("x".into()).code(), "LINE_NOT_FOUND");
        assert_eq!(
            CartError::SessionNotFound("s".into()).code(),
            "SESSION_NOT_FOUND"
        );
        assert_eq!(CartError::Internal("db".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn only_session_not_found_is_terminal() {
        assert!(CartError::SessionNotFound("s".into()).is_terminal());
        assert!(!CartError::LineNotFound("l".into()).is_terminal());
        assert!(!CartError::CloseNotAllowed.is_terminal());
    }

    #[test]
    fn internal_details_are_hidden() {
        let err = CartError::Internal("disk I/O error on carts.db".into());
        assert_eq!(err.public_message(), "internal error");
        let err = CartError::LineNotFound("burger".into());
        assert_eq!(err.public_message(), "no line matches burger");
    }

    #[test]
    fn catalog_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: CatalogError = json_err.into();
        assert!(err.to_string().contains("parse catalog JSON"));
    }
}
