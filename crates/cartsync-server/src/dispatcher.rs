use std::sync::Arc;

use cartsync_core::events::{ClosedPayload, ServerEvent};
use cartsync_core::ids::ChannelId;
use cartsync_core::CartSnapshot;
use cartsync_telemetry::MetricsRecorder;
use tracing::{debug, error, warn};

use crate::client::{Channel, DeliveryError};
use crate::sessions::SessionSlot;

/// Outcome of one fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Channels whose queue was full or closed. They are unsubscribed.
    pub dropped: Vec<ChannelId>,
    /// A newer snapshot had already gone out; nothing was sent.
    pub superseded: bool,
}

/// Pushes full cart snapshots to every subscriber of a session.
pub struct BroadcastDispatcher {
    metrics: Arc<MetricsRecorder>,
}

impl BroadcastDispatcher {
    pub fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self { metrics }
    }

    /// Send `snapshot` as `cart:updated` to all of `slot`'s subscribers, the
    /// originator included.
    pub fn broadcast(&self, slot: &SessionSlot, snapshot: CartSnapshot) -> BroadcastReport {
        let version = snapshot.version;
        let Some(frame) = encode_snapshot(slot, snapshot) else {
            return BroadcastReport::default();
        };

        slot.with_published(|published| {
            if version <= *published {
                debug!(
                    session_id = %slot.id(),
                    version,
                    published = *published,
                    "skipping superseded snapshot"
                );
                return BroadcastReport {
                    superseded: true,
                    ..BroadcastReport::default()
                };
            }
            *published = version;
            self.fan_out(slot, &frame, version, slot.subscribers())
        })
    }

    /// Bring a channel that just subscribed up to date.
    ///
    /// A snapshot newer than anything published goes to every subscriber.
    /// One at the published version goes to `joiner` alone. An older one is
    /// dropped, since `joiner` already received the newer broadcast.
    pub fn welcome(
        &self,
        slot: &SessionSlot,
        joiner: Arc<dyn Channel>,
        snapshot: CartSnapshot,
    ) -> BroadcastReport {
        let version = snapshot.version;
        let Some(frame) = encode_snapshot(slot, snapshot) else {
            return BroadcastReport::default();
        };

        slot.with_published(|published| {
            if version > *published {
                *published = version;
                self.fan_out(slot, &frame, version, slot.subscribers())
            } else if version == *published {
                self.fan_out(slot, &frame, version, vec![joiner])
            } else {
                debug!(
                    session_id = %slot.id(),
                    channel_id = %joiner.id(),
                    version,
                    published = *published,
                    "joiner already holds a newer snapshot"
                );
                BroadcastReport {
                    superseded: true,
                    ..BroadcastReport::default()
                }
            }
        })
    }

    fn fan_out(
        &self,
        slot: &SessionSlot,
        frame: &str,
        version: u64,
        channels: Vec<Arc<dyn Channel>>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for channel in channels {
            match channel.try_send(frame.to_owned()) {
                Ok(()) => report.delivered += 1,
                Err(reason) => {
                    warn!(
                        session_id = %slot.id(),
                        channel_id = %channel.id(),
                        version,
                        reason = reason_str(reason),
                        "delivery failed, unsubscribing channel"
                    );
                    slot.remove_subscriber(channel.id());
                    report.dropped.push(channel.id().clone());
                }
            }
        }

        self.metrics.counter_inc(
            "cart_broadcast_deliveries_total",
            &[],
            report.delivered as u64,
        );
        if !report.dropped.is_empty() {
            self.metrics
                .counter_inc("cart_broadcast_dropped_total", &[], report.dropped.len() as u64);
        }
        debug!(
            session_id = %slot.id(),
            version,
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "snapshot sent"
        );
        report
    }

    /// Tell the channels of a closed session that it is gone. Best effort.
    pub fn notify_closed(&self, channels: &[Arc<dyn Channel>], payload: ClosedPayload) -> usize {
        let session_id = payload.session_id.clone();
        let frame = match ServerEvent::Closed(payload).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "failed to encode close notice");
                return 0;
            }
        };
        channels
            .iter()
            .filter(|channel| channel.try_send(frame.clone()).is_ok())
            .count()
    }
}

fn encode_snapshot(slot: &SessionSlot, snapshot: CartSnapshot) -> Option<String> {
    let version = snapshot.version;
    match ServerEvent::Updated(snapshot).to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(session_id = %slot.id(), version, error = %e, "failed to encode snapshot");
            None
        }
    }
}

fn reason_str(reason: DeliveryError) -> &'static str {
    match reason {
        DeliveryError::Full => "queue_full",
        DeliveryError::Closed => "closed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRegistry;
    use cartsync_core::events::CloseReason;
    use cartsync_core::ids::SessionId;
    use cartsync_store::MemoryStore;
    use parking_lot::Mutex;

    /// Records frames; fails with `fail_with` when set.
    struct Recorder {
        id: ChannelId,
        frames: Mutex<Vec<String>>,
        fail_with: Option<DeliveryError>,
    }

    impl Recorder {
        fn new(fail_with: Option<DeliveryError>) -> Arc<Self> {
            Arc::new(Self {
                id: ChannelId::new(),
                frames: Mutex::new(Vec::new()),
                fail_with,
            })
        }
    }

    impl Channel for Recorder {
        fn id(&self) -> &ChannelId {
            &self.id
        }
        fn try_send(&self, frame: String) -> Result<(), DeliveryError> {
            if let Some(e) = self.fail_with {
                return Err(e);
            }
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    fn setup() -> (SessionRegistry, BroadcastDispatcher, Arc<MetricsRecorder>) {
        let metrics = Arc::new(MetricsRecorder::new());
        let registry =
            SessionRegistry::new(Arc::new(MemoryStore::new()), None, Arc::clone(&metrics));
        (registry, BroadcastDispatcher::new(Arc::clone(&metrics)), metrics)
    }

    fn snapshot_at(session: &str, version: u64) -> CartSnapshot {
        let mut snap = cartsync_core::Cart::new(SessionId::from_raw(session)).snapshot();
        snap.version = version;
        snap
    }

    #[test]
    fn every_subscriber_gets_identical_frame() {
        let (registry, dispatcher, metrics) = setup();
        let a = Recorder::new(None);
        let b = Recorder::new(None);
        let slot = registry.subscribe(&SessionId::from_raw("t1"), a.clone()).unwrap();
        registry.subscribe(&SessionId::from_raw("t1"), b.clone()).unwrap();

        let report = dispatcher.broadcast(&slot, snapshot_at("t1", 1));
        assert_eq!(report.delivered, 2);
        assert!(report.dropped.is_empty());

        let fa = a.frames.lock().clone();
        let fb = b.frames.lock().clone();
        assert_eq!(fa.len(), 1);
        assert_eq!(fa, fb);
        let v: serde_json::Value = serde_json::from_str(&fa[0]).unwrap();
        assert_eq!(v["event"], "cart:updated");
        assert_eq!(v["data"]["version"], 1);
        assert_eq!(metrics.counter_get("cart_broadcast_deliveries_total", &[]), 2);
    }

    #[test]
    fn failed_channel_is_unsubscribed_others_still_served() {
        let (registry, dispatcher, metrics) = setup();
        let ok = Recorder::new(None);
        let slow = Recorder::new(Some(DeliveryError::Full));
        let slot = registry.subscribe(&SessionId::from_raw("t1"), ok.clone()).unwrap();
        registry.subscribe(&SessionId::from_raw("t1"), slow.clone()).unwrap();

        let report = dispatcher.broadcast(&slot, snapshot_at("t1", 1));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![slow.id.clone()]);
        assert!(!slot.has_subscriber(&slow.id));
        assert!(slot.has_subscriber(&ok.id));
        assert_eq!(metrics.counter_get("cart_broadcast_dropped_total", &[]), 1);
    }

    #[test]
    fn superseded_snapshot_is_skipped() {
        let (registry, dispatcher, _) = setup();
        let a = Recorder::new(None);
        let slot = registry.subscribe(&SessionId::from_raw("t1"), a.clone()).unwrap();

        assert_eq!(dispatcher.broadcast(&slot, snapshot_at("t1", 3)).delivered, 1);
        let late = dispatcher.broadcast(&slot, snapshot_at("t1", 2));
        assert!(late.superseded);
        assert_eq!(late.delivered, 0);
        assert_eq!(a.frames.lock().len(), 1);
    }

    fn versions(channel: &Recorder) -> Vec<u64> {
        channel
            .frames
            .lock()
            .iter()
            .map(|f| serde_json::from_str::<serde_json::Value>(f).unwrap()["data"]["version"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn welcome_at_published_version_reaches_joiner_only() {
        let (registry, dispatcher, _) = setup();
        let old = Recorder::new(None);
        let joiner = Recorder::new(None);
        let slot = registry.subscribe(&SessionId::from_raw("t1"), old.clone()).unwrap();
        dispatcher.broadcast(&slot, snapshot_at("t1", 2));
        registry.subscribe(&SessionId::from_raw("t1"), joiner.clone()).unwrap();

        let report = dispatcher.welcome(&slot, joiner.clone(), snapshot_at("t1", 2));
        assert_eq!(report.delivered, 1);
        assert_eq!(versions(&joiner), vec![2]);
        assert_eq!(versions(&old), vec![2]);
    }

    #[test]
    fn welcome_ahead_of_broadcast_publishes_to_everyone() {
        let (registry, dispatcher, _) = setup();
        let old = Recorder::new(None);
        let joiner = Recorder::new(None);
        let slot = registry.subscribe(&SessionId::from_raw("t1"), old.clone()).unwrap();
        registry.subscribe(&SessionId::from_raw("t1"), joiner.clone()).unwrap();

        // The joiner read version 2 before the broadcasts of 1 and 2 went out.
        let report = dispatcher.welcome(&slot, joiner.clone(), snapshot_at("t1", 2));
        assert_eq!(report.delivered, 2);
        assert!(dispatcher.broadcast(&slot, snapshot_at("t1", 1)).superseded);
        assert!(dispatcher.broadcast(&slot, snapshot_at("t1", 2)).superseded);
        dispatcher.broadcast(&slot, snapshot_at("t1", 3));

        assert_eq!(versions(&joiner), vec![2, 3]);
        assert_eq!(versions(&old), vec![2, 3]);
    }

    #[test]
    fn stale_welcome_is_dropped() {
        let (registry, dispatcher, _) = setup();
        let joiner = Recorder::new(None);
        let slot = registry.subscribe(&SessionId::from_raw("t1"), joiner.clone()).unwrap();
        dispatcher.broadcast(&slot, snapshot_at("t1", 4));

        let report = dispatcher.welcome(&slot, joiner.clone(), snapshot_at("t1", 3));
        assert!(report.superseded);
        assert_eq!(versions(&joiner), vec![4]);
    }

    #[test]
    fn concurrent_broadcasts_arrive_in_order() {
        let (registry, dispatcher, _) = setup();
        let a = Recorder::new(None);
        let slot = registry.subscribe(&SessionId::from_raw("t1"), a.clone()).unwrap();
        let dispatcher = Arc::new(dispatcher);

        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let dispatcher = Arc::clone(&dispatcher);
                let slot = &slot;
                scope.spawn(move || {
                    for v in (1..=200u64).filter(|v| v % 4 == worker) {
                        dispatcher.broadcast(slot, snapshot_at("t1", v));
                    }
                });
            }
        });

        let seen = versions(&a);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last(), Some(&200));
    }

    #[test]
    fn close_notice_reaches_channels() {
        let (_, dispatcher, _) = setup();
        let a = Recorder::new(None);
        let gone = Recorder::new(Some(DeliveryError::Closed));
        let channels: Vec<Arc<dyn Channel>> = vec![a.clone(), gone];
        let sent = dispatcher.notify_closed(
            &channels,
            ClosedPayload {
                session_id: SessionId::from_raw("t1"),
                reason: CloseReason::Closed,
            },
        );
        assert_eq!(sent, 1);
        let v: serde_json::Value = serde_json::from_str(&a.frames.lock()[0]).unwrap();
        assert_eq!(v["event"], "cart:closed");
        assert_eq!(v["data"]["reason"], "closed");
    }
}
