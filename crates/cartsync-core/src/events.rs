//! Cart channel protocol.
//!
//! Frames are JSON text: `{"event": "cart:add", "data": {...}, "requestId": 7}`.
//! Inbound frames parse into [`ClientEvent`]; outbound frames are built from
//! [`ServerEvent`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cart::{CartSnapshot, LineKey};
use crate::errors::CartError;
use crate::ids::{ItemId, OptionId, SessionId};

pub const CART_JOIN: &str = "cart:join";
pub const CART_LEAVE: &str = "cart:leave";
pub const CART_ADD: &str = "cart:add";
pub const CART_UPDATE: &str = "cart:update";
pub const CART_REMOVE: &str = "cart:remove";
pub const CART_CLEAR: &str = "cart:clear";
pub const CART_CLOSE: &str = "cart:close";

pub const CART_UPDATED: &str = "cart:updated";
pub const CART_ERROR: &str = "cart:error";
pub const CART_CLOSED: &str = "cart:closed";

/// Kind of client request, echoed back in `cart:error`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Join,
    Leave,
    Add,
    Update,
    Remove,
    Clear,
    Close,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Clear => "clear",
            Self::Close => "close",
        }
    }

    pub fn event_name(self) -> &'static str {
        match self {
            Self::Join => CART_JOIN,
            Self::Leave => CART_LEAVE,
            Self::Add => CART_ADD,
            Self::Update => CART_UPDATE,
            Self::Remove => CART_REMOVE,
            Self::Clear => CART_CLEAR,
            Self::Close => CART_CLOSE,
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            CART_JOIN => Some(Self::Join),
            CART_LEAVE => Some(Self::Leave),
            CART_ADD => Some(Self::Add),
            CART_UPDATE => Some(Self::Update),
            CART_REMOVE => Some(Self::Remove),
            CART_CLEAR => Some(Self::Clear),
            CART_CLOSE => Some(Self::Close),
            _ => None,
        }
    }

    /// Operations that change cart contents.
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::Add | Self::Update | Self::Remove | Self::Clear)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default, rename = "requestId")]
    request_id: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub session_id: SessionId,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPayload {
    pub item_id: ItemId,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default, alias = "options")]
    pub customizations: Vec<OptionId>,
}

fn default_quantity() -> i64 {
    1
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub line: LineKey,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default, alias = "options")]
    pub customizations: Option<Vec<OptionId>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePayload {
    pub line: LineKey,
    #[serde(default)]
    pub quantity: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Join(JoinPayload),
    Leave,
    Add(AddPayload),
    Update(UpdatePayload),
    Remove(RemovePayload),
    Clear,
    Close,
}

impl ClientEvent {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Join(_) => Operation::Join,
            Self::Leave => Operation::Leave,
            Self::Add(_) => Operation::Add,
            Self::Update(_) => Operation::Update,
            Self::Remove(_) => Operation::Remove,
            Self::Clear => Operation::Clear,
            Self::Close => Operation::Close,
        }
    }
}

/// A parsed inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundFrame {
    pub event: ClientEvent,
    pub request_id: Option<Value>,
}

/// A frame that could not be turned into a [`ClientEvent`].
///
/// Carries whatever could be recovered so the error reply can still name the
/// operation and echo the request id.
#[derive(Clone, Debug, PartialEq)]
pub struct RejectedFrame {
    pub operation: Option<Operation>,
    pub request_id: Option<Value>,
    pub error: CartError,
}

pub fn parse_frame(raw: &str) -> Result<InboundFrame, RejectedFrame> {
    let envelope: Envelope = serde_json::from_str(raw).map_err(|e| RejectedFrame {
        operation: None,
        request_id: None,
        error: CartError::MalformedRequest(format!("invalid frame: {e}")),
    })?;

    let request_id = envelope.request_id;
    let Some(operation) = Operation::from_event_name(&envelope.event) else {
        return Err(RejectedFrame {
            operation: None,
            request_id,
            error: CartError::UnknownEvent(envelope.event),
        });
    };

    let data = match envelope.data {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };

    let parsed = match operation {
        Operation::Join => serde_json::from_value(data).map(ClientEvent::Join),
        Operation::Leave => Ok(ClientEvent::Leave),
        Operation::Add => serde_json::from_value(data).map(ClientEvent::Add),
        Operation::Update => serde_json::from_value(data).map(ClientEvent::Update),
        Operation::Remove => serde_json::from_value(data).map(ClientEvent::Remove),
        Operation::Clear => Ok(ClientEvent::Clear),
        Operation::Close => Ok(ClientEvent::Close),
    };

    match parsed {
        Ok(event) => Ok(InboundFrame { event, request_id }),
        Err(e) => Err(RejectedFrame {
            operation: Some(operation),
            request_id,
            error: CartError::MalformedRequest(format!("{}: {e}", operation.event_name())),
        }),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub operation: Option<Operation>,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

impl ErrorPayload {
    pub fn new(operation: Option<Operation>, error: &CartError, request_id: Option<Value>) -> Self {
        Self {
            operation,
            code: error.code().to_string(),
            message: error.public_message(),
            request_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// A client asked for the session to be closed.
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedPayload {
    pub session_id: SessionId,
    pub reason: CloseReason,
}

/// Server → client frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "cart:updated")]
    Updated(CartSnapshot),
    #[serde(rename = "cart:error")]
    Error(ErrorPayload),
    #[serde(rename = "cart:closed")]
    Closed(ClosedPayload),
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Updated(_) => CART_UPDATED,
            Self::Error(_) => CART_ERROR,
            Self::Closed(_) => CART_CLOSED,
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::Cart;

    #[test]
    fn parse_add_with_defaults() {
        let frame = parse_frame(r#"{"event":"cart:add","data":{"itemId":"burger"}}"#).unwrap();
        assert_eq!(
            frame.event,
            ClientEvent::Add(AddPayload {
                item_id: ItemId::from_raw("burger"),
                quantity: 1,
                customizations: vec![],
            })
        );
        assert!(frame.request_id.is_none());
    }

    #[test]
    fn parse_add_accepts_options_alias_and_request_id() {
        let frame = parse_frame(
            r#"{"event":"cart:add","requestId":"r-1","data":{"itemId":"burger","quantity":2,"options":["cheese"]}}"#,
        )
        .unwrap();
        let ClientEvent::Add(add) = frame.event else {
            panic!("expected add");
        };
        assert_eq!(add.quantity, 2);
        assert_eq!(add.customizations, vec![OptionId::from_raw("cheese")]);
        assert_eq!(frame.request_id, Some(serde_json::json!("r-1")));
    }

    #[test]
    fn parse_remove_line_key() {
        let frame =
            parse_frame(r#"{"event":"cart:remove","data":{"line":"burger#cheese"}}"#).unwrap();
        let ClientEvent::Remove(rm) = frame.event else {
            panic!("expected remove");
        };
        assert_eq!(rm.line.to_string(), "burger#cheese");
        assert_eq!(rm.quantity, None);
    }

    #[test]
    fn parse_clear_without_data() {
        let frame = parse_frame(r#"{"event":"cart:clear"}"#).unwrap();
        assert_eq!(frame.event, ClientEvent::Clear);
    }

    #[test]
    fn parse_join() {
        let frame =
            parse_frame(r#"{"event":"cart:join","data":{"sessionId":"table-4"}}"#).unwrap();
        assert_eq!(
            frame.event,
            ClientEvent::Join(JoinPayload {
                session_id: SessionId::from_raw("table-4")
            })
        );
    }

    #[test]
    fn unknown_event_keeps_request_id() {
        let rejected = parse_frame(r#"{"event":"cart:explode","requestId":3}"#).unwrap_err();
        assert_eq!(rejected.operation, None);
        assert_eq!(rejected.request_id, Some(serde_json::json!(3)));
        assert_eq!(rejected.error.code(), "UNKNOWN_EVENT");
    }

    #[test]
    fn bad_payload_names_operation() {
        let rejected =
            parse_frame(r#"{"event":"cart:update","data":{"quantity":2}}"#).unwrap_err();
        assert_eq!(rejected.operation, Some(Operation::Update));
        assert_eq!(rejected.error.code(), "MALFORMED_REQUEST");
    }

    #[test]
    fn invalid_json_is_malformed() {
        let rejected = parse_frame("not json").unwrap_err();
        assert_eq!(rejected.error.code(), "MALFORMED_REQUEST");
    }

    #[test]
    fn error_frame_shape() {
        let payload = ErrorPayload::new(
            Some(Operation::Remove),
            &CartError::LineNotFound("burger".into()),
            Some(serde_json::json!(9)),
        );
        let json: Value =
            serde_json::from_str(&ServerEvent::Error(payload).to_frame().unwrap()).unwrap();
        assert_eq!(json["event"], "cart:error");
        assert_eq!(json["data"]["operation"], "remove");
        assert_eq!(json["data"]["code"], "LINE_NOT_FOUND");
        assert_eq!(json["data"]["requestId"], 9);
    }

    #[test]
    fn updated_frame_shape() {
        let snap = Cart::new(SessionId::from_raw("t9")).snapshot();
        let frame = ServerEvent::Updated(snap).to_frame().unwrap();
        let json: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["event"], "cart:updated");
        assert_eq!(json["data"]["sessionId"], "t9");
        assert_eq!(json["data"]["version"], 0);
    }

    #[test]
    fn event_names_round_trip_through_operation() {
        for op in [
            Operation::Join,
            Operation::Leave,
            Operation::Add,
            Operation::Update,
            Operation::Remove,
            Operation::Clear,
            Operation::Close,
        ] {
            assert_eq!(Operation::from_event_name(op.event_name()), Some(op));
        }
        assert!(Operation::Add.is_mutation());
        assert!(!Operation::Join.is_mutation());
    }
}
