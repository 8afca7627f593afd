//! Live ordering sessions.
//!
//! Each session owns its cart behind a fair async mutex and the set of
//! channels subscribed to it. The registry creates sessions on first
//! reference (restoring persisted carts), closes them on request and evicts
//! them once idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cartsync_core::ids::{ChannelId, SessionId};
use cartsync_core::{Cart, CartError};
use cartsync_store::CartStore;
use cartsync_telemetry::MetricsRecorder;
use dashmap::DashMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::Channel;

struct Members {
    channels: HashMap<ChannelId, Arc<dyn Channel>>,
    /// Set while there are no subscribers.
    idle_since: Option<Instant>,
    /// Once set the slot is detached from the registry for good.
    closed: bool,
}

/// One live session: its cart and its subscribers.
pub struct SessionSlot {
    id: SessionId,
    cart: Mutex<Cart>,
    members: RwLock<Members>,
    /// Highest version sent to subscribers. Held while frames are enqueued.
    published: SyncMutex<u64>,
}

impl SessionSlot {
    fn new(cart: Cart) -> Self {
        Self {
            id: cart.session_id().clone(),
            published: SyncMutex::new(cart.version()),
            cart: Mutex::new(cart),
            members: RwLock::new(Members {
                channels: HashMap::new(),
                idle_since: Some(Instant::now()),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Exclusive access to the cart. Waiters are served in arrival order.
    pub async fn lock(&self) -> MutexGuard<'_, Cart> {
        self.cart.lock().await
    }

    pub fn is_closed(&self) -> bool {
        self.members.read().closed
    }

    pub fn has_subscriber(&self, channel_id: &ChannelId) -> bool {
        self.members.read().channels.contains_key(channel_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.members.read().channels.len()
    }

    /// Current subscribers, copied out so delivery happens without the lock.
    pub fn subscribers(&self) -> Vec<Arc<dyn Channel>> {
        self.members.read().channels.values().cloned().collect()
    }

    /// Add `channel`. Fails once the slot has been closed or evicted.
    fn add_subscriber(&self, channel: Arc<dyn Channel>) -> bool {
        let mut members = self.members.write();
        if members.closed {
            return false;
        }
        members.idle_since = None;
        members.channels.insert(channel.id().clone(), channel);
        true
    }

    /// Remove a channel. Returns whether it was subscribed.
    pub fn remove_subscriber(&self, channel_id: &ChannelId) -> bool {
        let mut members = self.members.write();
        let removed = members.channels.remove(channel_id).is_some();
        if removed && members.channels.is_empty() {
            members.idle_since = Some(Instant::now());
        }
        removed
    }

    /// Run `publish` with the highest published version held exclusively.
    ///
    /// Snapshots are enqueued inside `publish`, so every subscriber sees
    /// versions in the order they were published.
    pub fn with_published<R>(&self, publish: impl FnOnce(&mut u64) -> R) -> R {
        let mut published = self.published.lock();
        publish(&mut *published)
    }

    pub fn published_version(&self) -> u64 {
        *self.published.lock()
    }

    fn close(&self) -> Vec<Arc<dyn Channel>> {
        let mut members = self.members.write();
        members.closed = true;
        members.idle_since = None;
        members.channels.drain().map(|(_, c)| c).collect()
    }

    /// Close if nobody has been subscribed for at least `timeout`.
    fn close_if_idle(&self, now: Instant, timeout: Duration) -> bool {
        let mut members = self.members.write();
        let idle = members.channels.is_empty()
            && members
                .idle_since
                .is_some_and(|since| now.saturating_duration_since(since) >= timeout);
        if idle {
            members.closed = true;
        }
        idle
    }
}

/// Registry of live sessions, keyed by session id.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    store: Arc<dyn CartStore>,
    idle_timeout: Option<Duration>,
    metrics: Arc<MetricsRecorder>,
}

impl SessionRegistry {
    /// `idle_timeout` of `None` disables eviction.
    pub fn new(
        store: Arc<dyn CartStore>,
        idle_timeout: Option<Duration>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            idle_timeout,
            metrics,
        }
    }

    pub fn store(&self) -> &dyn CartStore {
        self.store.as_ref()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<SessionSlot>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }

    /// Return the live session, creating it (from the store if persisted) when absent.
    pub fn get_or_create(&self, session_id: &SessionId) -> Result<Arc<SessionSlot>, CartError> {
        if let Some(slot) = self.get(session_id) {
            return Ok(slot);
        }

        let cart = match self.store.load(session_id) {
            Ok(Some(cart)) => {
                debug!(session_id = %session_id, version = cart.version(), "restored persisted cart");
                cart
            }
            Ok(None) => Cart::new(session_id.clone()),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "failed to load persisted cart");
                return Err(CartError::Internal(format!("load cart: {e}")));
            }
        };

        let slot = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                info!(session_id = %session_id, version = cart.version(), "session created");
                Arc::new(SessionSlot::new(cart))
            })
            .clone();
        self.record_active();
        Ok(slot)
    }

    /// Subscribe `channel` to the session, creating the session if needed.
    pub fn subscribe(
        &self,
        session_id: &SessionId,
        channel: Arc<dyn Channel>,
    ) -> Result<Arc<SessionSlot>, CartError> {
        loop {
            let slot = self.get_or_create(session_id)?;
            if slot.add_subscriber(Arc::clone(&channel)) {
                debug!(session_id = %session_id, channel_id = %channel.id(), "subscribed");
                return Ok(slot);
            }
            // Closed between lookup and subscribe; drop the stale entry and retry.
            let _ = self
                .sessions
                .remove_if(session_id, |_, live| Arc::ptr_eq(live, &slot));
        }
    }

    /// Remove `channel_id` from the session. Returns whether it was subscribed.
    pub fn unsubscribe(&self, session_id: &SessionId, channel_id: &ChannelId) -> bool {
        let Some(slot) = self.get(session_id) else {
            return false;
        };
        let removed = slot.remove_subscriber(channel_id);
        if removed {
            debug!(session_id = %session_id, channel_id = %channel_id, "unsubscribed");
        }
        removed
    }

    /// Close a session for good: detach it, delete its persisted cart and
    /// return the channels that were still subscribed.
    ///
    /// Waits for any in-flight mutation to finish first.
    pub async fn close(&self, session_id: &SessionId) -> Result<Vec<Arc<dyn Channel>>, CartError> {
        let slot = self
            .get(session_id)
            .ok_or_else(|| CartError::SessionNotFound(session_id.to_string()))?;

        let _cart = slot.lock().await;
        if slot.is_closed() {
            return Err(CartError::SessionNotFound(session_id.to_string()));
        }
        self.store.delete(session_id).map_err(|e| {
            error!(session_id = %session_id, error = %e, "failed to delete persisted cart");
            CartError::Internal(format!("delete cart: {e}"))
        })?;

        let channels = slot.close();
        let _ = self
            .sessions
            .remove_if(session_id, |_, live| Arc::ptr_eq(live, &slot));
        self.record_active();
        info!(session_id = %session_id, notified = channels.len(), "session closed");
        Ok(channels)
    }

    /// Evict sessions idle for at least the configured timeout. Persisted
    /// carts are kept, so a later join restores them.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let Some(timeout) = self.idle_timeout else {
            return 0;
        };

        let candidates: Vec<Arc<SessionSlot>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().subscriber_count() == 0)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut evicted = 0;
        for slot in candidates {
            // A held lock means a mutation is still being persisted.
            let Ok(_cart) = slot.cart.try_lock() else {
                continue;
            };
            let removed = self
                .sessions
                .remove_if(&slot.id, |_, live| {
                    Arc::ptr_eq(live, &slot) && slot.close_if_idle(now, timeout)
                })
                .is_some();
            if removed {
                evicted += 1;
                info!(session_id = %slot.id, "idle session evicted");
                if !self.store.is_durable() {
                    self.forget(&slot.id);
                }
            }
        }

        if evicted > 0 {
            self.metrics
                .counter_inc("cart_sessions_evicted_total", &[], evicted as u64);
            self.record_active();
        }
        evicted
    }

    /// Drop the stored cart of an evicted session.
    fn forget(&self, session_id: &SessionId) {
        if let Err(e) = self.store.delete(session_id) {
            error!(session_id = %session_id, error = %e, "failed to release evicted cart");
        }
    }

    fn record_active(&self) {
        self.metrics
            .gauge_set("cart_sessions_active", &[], self.sessions.len() as i64);
    }
}

/// Run [`SessionRegistry::evict_idle`] every `interval` until shutdown.
pub fn start_eviction_task(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => break,
            }
            let evicted = registry.evict_idle(Instant::now());
            if evicted > 0 {
                debug!(evicted, remaining = registry.count(), "eviction sweep");
            }
        }
    })
}
