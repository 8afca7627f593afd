mod metrics;

pub use metrics::{
    CounterSample, GaugeSample, HistogramSample, HistogramSummary, MetricsRecorder, MetricsReport,
};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "cartsync_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; plain text otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build from a level string such as `"debug"`. Unknown strings fall back to INFO.
    pub fn from_level_str(level: &str, json: bool) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json,
        }
    }

    fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Handle returned by [`init_telemetry`]. Holds the process-wide metrics recorder.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Initialize logging and metrics. Call once at startup.
///
/// A second call keeps the first subscriber and still returns a fresh recorder.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    if let Err(e) = tracing_subscriber::registry().with(fmt_layer).try_init() {
        eprintln!("cartsync-telemetry: subscriber already set: {e}");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directive_includes_module_levels() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("cartsync_server".into(), Level::DEBUG)],
            json: false,
        };
        assert_eq!(config.filter_directive(), "warn,cartsync_server=debug");
    }

    #[test]
    fn level_string_parsing() {
        assert_eq!(TelemetryConfig::from_level_str("debug", true).log_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::from_level_str("loud", true).log_level, Level::INFO);
    }

    #[test]
    fn init_twice_does_not_panic() {
        let a = init_telemetry(TelemetryConfig::default());
        let b = init_telemetry(TelemetryConfig::from_level_str("trace", false));
        a.metrics().counter_inc("x", &[], 1);
        assert_eq!(b.metrics().counter_get("x", &[]), 0);
    }
}
