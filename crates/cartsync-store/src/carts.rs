use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::instrument;

use cartsync_core::ids::SessionId;
use cartsync_core::{Cart, CartLine};

use crate::database::Database;
use crate::error::StoreError;

/// Durable home of accepted cart states.
///
/// `save` runs before a new state is committed in memory, so a failing
/// store leaves the live cart untouched.
pub trait CartStore: Send + Sync {
    fn save(&self, cart: &Cart) -> Result<(), StoreError>;
    fn load(&self, session_id: &SessionId) -> Result<Option<Cart>, StoreError>;
    /// Returns whether a cart was stored.
    fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError>;
    fn count(&self) -> Result<u64, StoreError>;

    /// Whether stored carts outlive the process. Carts in a non-durable
    /// store are dropped when their session is evicted.
    fn is_durable(&self) -> bool {
        true
    }
}

/// SQLite-backed carts.
#[derive(Clone)]
pub struct CartRepo {
    db: Database,
}

impl CartRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl CartStore for CartRepo {
    #[instrument(skip(self, cart), fields(session_id = %cart.session_id(), version = cart.version()))]
    fn save(&self, cart: &Cart) -> Result<(), StoreError> {
        let lines = serde_json::to_string(cart.lines())?;
        let version = i64::try_from(cart.version())
            .map_err(|_| StoreError::Serialization("cart version exceeds i64".into()))?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO carts (session_id, version, lines, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id) DO UPDATE SET
                    version = excluded.version,
                    lines = excluded.lines,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    cart.session_id().as_str(),
                    version,
                    lines,
                    cart.created_at().to_rfc3339(),
                    cart.updated_at().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn load(&self, session_id: &SessionId) -> Result<Option<Cart>, StoreError> {
        let row = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version, lines, created_at, updated_at FROM carts WHERE session_id = ?1",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))),
                None => Ok(None),
            }
        })?;

        let Some((version, lines, created_at, updated_at)) = row else {
            return Ok(None);
        };

        let version = u64::try_from(version).map_err(|_| StoreError::CorruptRow {
            table: "carts",
            column: "version",
            detail: format!("negative version {version}"),
        })?;
        let lines: Vec<CartLine> =
            serde_json::from_str(&lines).map_err(|e| StoreError::CorruptRow {
                table: "carts",
                column: "lines",
                detail: format!("invalid JSON: {e}"),
            })?;

        Ok(Some(Cart::restore(
            session_id.clone(),
            version,
            lines,
            parse_timestamp(&created_at, "created_at")?,
            parse_timestamp(&updated_at, "updated_at")?,
        )))
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM carts WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM carts", [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
    }
}

fn parse_timestamp(raw: &str, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: "carts",
            column,
            detail: e.to_string(),
        })
}

/// Process-local store used when no database path is configured.
#[derive(Default)]
pub struct MemoryStore {
    carts: Mutex<HashMap<SessionId, Cart>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CartStore for MemoryStore {
    fn save(&self, cart: &Cart) -> Result<(), StoreError> {
        self.carts
            .lock()
            .insert(cart.session_id().clone(), cart.clone());
        Ok(())
    }

    fn load(&self, session_id: &SessionId) -> Result<Option<Cart>, StoreError> {
        Ok(self.carts.lock().get(session_id).cloned())
    }

    fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.carts.lock().remove(session_id).is_some())
    }

    fn count(&self) -> Result<u64, StoreError> {
        Ok(self.carts.lock().len() as u64)
    }

    fn is_durable(&self) -> bool {
        false
    }
}
