//! Settings sections.

use serde::{Deserialize, Serialize};

/// Root settings document (`~/.cartsync/settings.json`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CartsyncSettings {
    pub server: ServerSettings,
    pub sessions: SessionSettings,
    pub store: StoreSettings,
    pub catalog: CatalogSettings,
    pub logging: LoggingSettings,
}

/// Network and connection lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks a free port.
    pub port: u16,
    /// Outbound frames buffered per connection before it counts as slow.
    pub max_send_queue: usize,
    /// Ping interval.
    pub heartbeat_interval_secs: u64,
    /// A connection without a pong for this long is dropped.
    pub client_timeout_secs: u64,
    /// How often dead connections are swept.
    pub cleanup_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9092,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
        }
    }
}

/// Cart session lifecycle and limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Evict a session this long after its last subscriber left. `0` disables eviction.
    pub idle_timeout_secs: u64,
    /// How often the eviction sweep runs.
    pub eviction_interval_secs: u64,
    /// Whether clients may send `cart:close`.
    pub allow_explicit_close: bool,
    pub max_lines: usize,
    pub max_line_quantity: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1_800,
            eviction_interval_secs: 60,
            allow_explicit_close: true,
            max_lines: 100,
            max_line_quantity: 99,
        }
    }
}

/// Cart persistence. Without a path carts live only in memory.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Menu source.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub menu_path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` wins when set.
    pub level: String,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}
