use std::sync::Arc;

use cartsync_core::events::{ErrorPayload, Operation, ServerEvent};
use cartsync_core::CartError;
use cartsync_telemetry::MetricsRecorder;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::client::Channel;

/// Replies to a rejected request on the originating channel only.
pub struct ErrorReporter {
    metrics: Arc<MetricsRecorder>,
}

impl ErrorReporter {
    pub fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self { metrics }
    }

    /// Send one `cart:error` frame to `channel`. Returns whether it was queued.
    pub fn report(
        &self,
        channel: &dyn Channel,
        operation: Option<Operation>,
        err: &CartError,
        request_id: Option<Value>,
    ) -> bool {
        let op = operation.map_or("unknown", Operation::as_str);
        match err {
            CartError::Internal(detail) => {
                error!(channel_id = %channel.id(), operation = op, detail = %detail, "request failed");
            }
            _ => {
                debug!(channel_id = %channel.id(), operation = op, code = err.code(), "request rejected");
            }
        }
        self.metrics
            .counter_inc("cart_errors_total", &[("code", err.code())], 1);

        let payload = ErrorPayload::new(operation, err, request_id);
        let frame = match ServerEvent::Error(payload).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(channel_id = %channel.id(), error = %e, "failed to encode error frame");
                return false;
            }
        };
        match channel.try_send(frame) {
            Ok(()) => true,
            Err(reason) => {
                warn!(channel_id = %channel.id(), ?reason, "could not deliver error frame");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DeliveryError;
    use cartsync_core::ids::ChannelId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Sink {
        id: ChannelId,
        frames: Mutex<Vec<String>>,
    }

    impl Channel for Sink {
        fn id(&self) -> &ChannelId {
            &self.id
        }
        fn try_send(&self, frame: String) -> Result<(), DeliveryError> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    fn reporter() -> (ErrorReporter, Arc<MetricsRecorder>) {
        let metrics = Arc::new(MetricsRecorder::new());
        (ErrorReporter::new(Arc::clone(&metrics)), metrics)
    }

    #[test]
    fn error_frame_carries_code_and_request_id() {
        let (reporter, metrics) = reporter();
        let sink = Sink::default();
        assert!(reporter.report(
            &sink,
            Some(Operation::Remove),
            &CartError::LineNotFound("burger".into()),
            Some(serde_json::json!(7)),
        ));

        let frames = sink.frames.lock();
        let v: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["event"], "cart:error");
        assert_eq!(v["data"]["operation"], "remove");
        assert_eq!(v["data"]["code"], "LINE_NOT_FOUND");
        assert_eq!(v["data"]["requestId"], 7);
        assert_eq!(
            metrics.counter_get("cart_errors_total", &[("code", "LINE_NOT_FOUND")]),
            1
        );
    }

    #[test]
    fn internal_details_stay_server_side() {
        let (reporter, _) = reporter();
        let sink = Sink::default();
        reporter.report(
            &sink,
            Some(Operation::Add),
            &CartError::Internal("disk I/O error at /var/lib/carts.db".into()),
            None,
        );
        let frames = sink.frames.lock();
        let v: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["data"]["code"], "INTERNAL_ERROR");
        assert!(!v["data"]["message"].as_str().unwrap().contains("/var/lib"));
        assert!(v["data"].get("requestId").is_none());
    }
}
