//! Inbound event handling.
//!
//! Mutations run in two phases. Catalog references are resolved first,
//! without any lock held. Then, under the session lock, the successor cart is
//! staged, persisted and committed. The snapshot is broadcast after the lock
//! is released. A rejection at any step leaves the session untouched.

use std::sync::Arc;
use std::time::Instant;

use cartsync_core::catalog::{self, Catalog};
use cartsync_core::events::{
    parse_frame, AddPayload, ClientEvent, CloseReason, ClosedPayload, InboundFrame,
    RemovePayload, UpdatePayload,
};
use cartsync_core::ids::SessionId;
use cartsync_core::{CartError, CartMachine, CartSnapshot, LineKey, Mutation};
use cartsync_telemetry::MetricsRecorder;
use tracing::{debug, error, info, instrument};

use crate::client::{Channel, Client, ClientRegistry, FrameHandler};
use crate::dispatcher::{BroadcastDispatcher, BroadcastReport};
use crate::reporter::ErrorReporter;
use crate::sessions::{SessionRegistry, SessionSlot};

/// Everything the handlers need, shared by all connections.
pub struct CartService {
    sessions: Arc<SessionRegistry>,
    clients: Arc<ClientRegistry>,
    catalog: Arc<dyn Catalog>,
    machine: CartMachine,
    dispatcher: BroadcastDispatcher,
    reporter: ErrorReporter,
    metrics: Arc<MetricsRecorder>,
    allow_close: bool,
}

impl CartService {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        clients: Arc<ClientRegistry>,
        catalog: Arc<dyn Catalog>,
        machine: CartMachine,
        metrics: Arc<MetricsRecorder>,
        allow_close: bool,
    ) -> Self {
        Self {
            sessions,
            clients,
            catalog,
            machine,
            dispatcher: BroadcastDispatcher::new(Arc::clone(&metrics)),
            reporter: ErrorReporter::new(Arc::clone(&metrics)),
            metrics,
            allow_close,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Handle one raw inbound frame from `client`.
    pub async fn handle(&self, client: &Arc<Client>, raw: &str) {
        let InboundFrame { event, request_id } = match parse_frame(raw) {
            Ok(frame) => frame,
            Err(rejected) => {
                self.reporter.report(
                    &**client,
                    rejected.operation,
                    &rejected.error,
                    rejected.request_id,
                );
                return;
            }
        };

        let operation = event.operation();
        let result = match event {
            ClientEvent::Join(p) => self.join(client, p.session_id).await,
            ClientEvent::Leave => {
                self.leave(client);
                Ok(())
            }
            ClientEvent::Close => self.close(client).await,
            mutation => self.mutate(client, mutation).await,
        };

        if let Err(err) = result {
            // The session is gone; the client has to join again.
            if err.is_terminal() {
                self.leave(client);
            }
            self.reporter
                .report(&**client, Some(operation), &err, request_id);
        }
    }

    /// Subscribe `client` to `session_id` and send it the current cart.
    #[instrument(skip_all, fields(channel_id = %client.id(), session_id = %session_id))]
    async fn join(&self, client: &Arc<Client>, session_id: SessionId) -> Result<(), CartError> {
        if !session_id.is_well_formed() {
            return Err(CartError::MalformedRequest(format!(
                "invalid session id {:?}",
                session_id.as_str()
            )));
        }
        if let Some(previous) = client.session() {
            if previous != session_id {
                self.sessions.unsubscribe(&previous, client.id());
            }
        }

        let channel: Arc<dyn Channel> = Arc::clone(client) as Arc<dyn Channel>;
        let slot = self.sessions.subscribe(&session_id, Arc::clone(&channel))?;
        client.bind(session_id);

        let snapshot = slot.lock().await.snapshot();
        let report = self.dispatcher.welcome(&slot, channel, snapshot);
        debug!(
            version = slot.published_version(),
            delivered = report.delivered,
            superseded = report.superseded,
            "joiner brought up to date"
        );
        Ok(())
    }

    fn leave(&self, client: &Client) {
        if let Some(session_id) = client.unbind() {
            self.sessions.unsubscribe(&session_id, client.id());
            debug!(channel_id = %client.id(), session_id = %session_id, "left session");
        }
    }

    /// The live session `client` is subscribed to.
    fn bound_slot(&self, client: &Client) -> Result<Arc<SessionSlot>, CartError> {
        let session_id = client
            .session()
            .ok_or_else(|| CartError::SessionNotFound("no session joined".into()))?;
        match self.sessions.get(&session_id) {
            Some(slot) if slot.has_subscriber(client.id()) => Ok(slot),
            _ => Err(CartError::SessionNotFound(session_id.to_string())),
        }
    }

    async fn mutate(&self, client: &Arc<Client>, event: ClientEvent) -> Result<(), CartError> {
        let operation = event.operation();
        let started = Instant::now();
        let result = self.try_mutate(client, event).await;

        let outcome = if result.is_ok() { "ok" } else { "rejected" };
        self.metrics.counter_inc(
            "cart_mutations_total",
            &[("operation", operation.as_str()), ("outcome", outcome)],
            1,
        );
        self.metrics.histogram_observe(
            "cart_mutation_duration_us",
            &[("operation", operation.as_str())],
            started.elapsed().as_micros() as f64,
        );
        result.map(|_| ())
    }

    #[instrument(skip_all, fields(channel_id = %client.id(), operation = event.operation().as_str()))]
    async fn try_mutate(
        &self,
        client: &Arc<Client>,
        event: ClientEvent,
    ) -> Result<BroadcastReport, CartError> {
        let slot = self.bound_slot(client)?;
        let mutation = self.resolve(&slot, event).await?;
        let snapshot = self.commit(&slot, mutation).await?;
        Ok(self.dispatcher.broadcast(&slot, snapshot))
    }

    /// Turn an event into a priced [`Mutation`]. No session lock is held
    /// while the catalog is consulted.
    async fn resolve(&self, slot: &SessionSlot, event: ClientEvent) -> Result<Mutation, CartError> {
        match event {
            ClientEvent::Add(AddPayload {
                item_id,
                quantity,
                customizations,
            }) => {
                let selection =
                    catalog::resolve(self.catalog.as_ref(), &item_id, &customizations).await?;
                Ok(Mutation::Add { selection, quantity })
            }
            ClientEvent::Update(UpdatePayload {
                line,
                quantity,
                customizations,
            }) => {
                let selection = match customizations {
                    Some(options) => {
                        self.ensure_line(slot, &line).await?;
                        Some(catalog::resolve(self.catalog.as_ref(), line.item_id(), &options).await?)
                    }
                    None => None,
                };
                Ok(Mutation::Update {
                    line,
                    quantity,
                    selection,
                })
            }
            ClientEvent::Remove(RemovePayload { line, quantity }) => {
                Ok(Mutation::Remove { line, quantity })
            }
            ClientEvent::Clear => Ok(Mutation::Clear),
            other => Err(CartError::UnknownEvent(
                other.operation().event_name().to_string(),
            )),
        }
    }

    /// A missing line is reported as such before the catalog is asked about it.
    async fn ensure_line(&self, slot: &SessionSlot, line: &LineKey) -> Result<(), CartError> {
        if slot.lock().await.find(line).is_some() {
            Ok(())
        } else {
            Err(CartError::LineNotFound(line.to_string()))
        }
    }

    /// Stage, persist and commit under the session lock.
    async fn commit(&self, slot: &SessionSlot, mutation: Mutation) -> Result<CartSnapshot, CartError> {
        let mut cart = slot.lock().await;
        if slot.is_closed() {
            return Err(CartError::SessionNotFound(slot.id().to_string()));
        }

        let next = self.machine.stage(&cart, mutation)?;
        if let Err(e) = self.sessions.store().save(&next) {
            error!(session_id = %slot.id(), version = next.version(), error = %e, "failed to persist cart");
            return Err(CartError::Internal(format!("persist cart: {e}")));
        }
        *cart = next;
        let snapshot = cart.snapshot();
        drop(cart);

        debug!(session_id = %slot.id(), version = snapshot.version, lines = snapshot.lines.len(), "mutation applied");
        Ok(snapshot)
    }

    #[instrument(skip_all, fields(channel_id = %client.id()))]
    async fn close(&self, client: &Arc<Client>) -> Result<(), CartError> {
        if !self.allow_close {
            return Err(CartError::CloseNotAllowed);
        }
        let slot = self.bound_slot(client)?;
        let session_id = slot.id().clone();
        let channels = self.sessions.close(&session_id).await?;

        for channel in &channels {
            if let Some(member) = self.clients.get(channel.id()) {
                if member.session().as_ref() == Some(&session_id) {
                    let _ = member.unbind();
                }
            }
        }
        let notified = self.dispatcher.notify_closed(
            &channels,
            ClosedPayload {
                session_id: session_id.clone(),
                reason: CloseReason::Closed,
            },
        );
        info!(session_id = %session_id, notified, "session closed by client");
        Ok(())
    }

    /// Drop a connection: leave its session and forget it.
    pub fn disconnect(&self, client: &Client) {
        self.leave(client);
        if self.clients.unregister(client.id()).is_some() {
            info!(channel_id = %client.id(), "client disconnected");
        }
        self.metrics
            .gauge_set("ws_connections_active", &[], self.clients.count() as i64);
    }

    /// Register a new connection.
    pub fn connect(&self) -> (Arc<Client>, tokio::sync::mpsc::Receiver<String>) {
        let (client, rx) = self.clients.register();
        self.metrics
            .gauge_set("ws_connections_active", &[], self.clients.count() as i64);
        info!(channel_id = %client.id(), "client connected");
        (client, rx)
    }
}

#[async_trait::async_trait]
impl FrameHandler for CartService {
    async fn on_frame(&self, client: &Arc<Client>, raw: &str) {
        self.handle(client, raw).await;
    }

    async fn on_disconnect(&self, client: &Arc<Client>) {
        self.disconnect(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartsync_core::InMemoryCatalog;
    use cartsync_store::MemoryStore;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn service(allow_close: bool) -> Arc<CartService> {
        let metrics = Arc::new(MetricsRecorder::new());
        let catalog = InMemoryCatalog::from_json_str(
            r#"{"items": [
                {"id": "burger", "name": "Burger", "unitPrice": 1000,
                 "options": [{"id": "cheese", "name": "Cheese", "priceDelta": 150}]},
                {"id": "fries", "name": "Fries", "unitPrice": 350}
            ]}"#,
        )
        .unwrap();
        Arc::new(CartService::new(
            Arc::new(SessionRegistry::new(
                Arc::new(MemoryStore::new()),
                None,
                Arc::clone(&metrics),
            )),
            Arc::new(ClientRegistry::new(1_024, Duration::from_secs(90))),
            Arc::new(catalog),
            CartMachine::default(),
            metrics,
            allow_close,
        ))
    }

    fn frame(event: &str, data: Value) -> String {
        json!({"event": event, "data": data}).to_string()
    }

    fn next(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn join_sends_snapshot_to_joiner_only() {
        let svc = service(true);
        let (a, mut rx_a) = svc.connect();
        let (b, mut rx_b) = svc.connect();
        svc.handle(&a, &frame("cart:join", json!({"sessionId": "t1"}))).await;
        let snap = next(&mut rx_a);
        assert_eq!(snap["event"], "cart:updated");
        assert_eq!(snap["data"]["sessionId"], "t1");

        svc.handle(&b, &frame("cart:join", json!({"sessionId": "t1"}))).await;
        next(&mut rx_b);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(svc.sessions().count(), 1);
    }

    #[tokio::test]
    async fn late_joiner_gets_current_version_once() {
        let svc = service(true);
        let (a, mut rx_a) = svc.connect();
        svc.handle(&a, &frame("cart:join", json!({"sessionId": "t1"}))).await;
        next(&mut rx_a);
        for _ in 0..3 {
            svc.handle(&a, &frame("cart:add", json!({"itemId": "fries"}))).await;
            next(&mut rx_a);
        }

        let (b, mut rx_b) = svc.connect();
        svc.handle(&b, &frame("cart:join", json!({"sessionId": "t1"}))).await;
        let snap = next(&mut rx_b);
        assert_eq!(snap["data"]["version"], 3);
        assert!(rx_b.try_recv().is_err());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn blank_session_id_is_malformed() {
        let svc = service(true);
        let (a, mut rx) = svc.connect();
        svc.handle(&a, &frame("cart:join", json!({"sessionId": "  "}))).await;
        assert_eq!(next(&mut rx)["data"]["code"], "MALFORMED_REQUEST");
        assert!(a.session().is_none());
    }

    #[tokio::test]
    async fn switching_sessions_leaves_the_old_one() {
        let svc = service(true);
        let (a, mut rx) = svc.connect();
        svc.handle(&a, &frame("cart:join", json!({"sessionId": "t1"}))).await;
        svc.handle(&a, &frame("cart:join", json!({"sessionId": "t2"}))).await;
        next(&mut rx);
        next(&mut rx);
        let old = svc.sessions().get(&SessionId::from_raw("t1")).unwrap();
        assert_eq!(old.subscriber_count(), 0);
        assert_eq!(a.session(), Some(SessionId::from_raw("t2")));
    }

    #[tokio::test]
    async fn leave_stops_broadcasts() {
        let svc = service(true);
        let (a, mut rx_a) = svc.connect();
        let (b, mut rx_b) = svc.connect();
        for c in [&a, &b] {
            svc.handle(c, &frame("cart:join", json!({"sessionId": "t1"}))).await;
        }
        next(&mut rx_a);
        next(&mut rx_b);

        svc.handle(&b, &frame("cart:leave", json!({}))).await;
        svc.handle(&a, &frame("cart:add", json!({"itemId": "fries"}))).await;
        assert_eq!(next(&mut rx_a)["data"]["version"], 1);
        assert!(rx_b.try_recv().is_err());

        // A departed channel can no longer mutate.
        svc.handle(&b, &frame("cart:clear", json!({}))).await;
        assert_eq!(next(&mut rx_b)["data"]["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn update_of_missing_line_reports_line_not_found() {
        let svc = service(true);
        let (a, mut rx) = svc.connect();
        svc.handle(&a, &frame("cart:join", json!({"sessionId": "t1"}))).await;
        next(&mut rx);
        svc.handle(
            &a,
            &frame("cart:update", json!({"line": "pizza", "customizations": ["olives"]})),
        )
        .await;
        assert_eq!(next(&mut rx)["data"]["code"], "LINE_NOT_FOUND");
    }

    #[tokio::test]
    async fn concurrent_mutations_are_serialized() {
        let svc = service(true);
        let (a, mut rx_a) = svc.connect();
        let (b, mut rx_b) = svc.connect();
        for c in [&a, &b] {
            svc.handle(c, &frame("cart:join", json!({"sessionId": "t1"}))).await;
        }
        next(&mut rx_a);
        next(&mut rx_b);

        let mut tasks = Vec::new();
        for client in [a.clone(), b.clone()] {
            let svc = Arc::clone(&svc);
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    svc.handle(&client, &frame("cart:add", json!({"itemId": "fries"})))
                        .await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let slot = svc.sessions().get(&SessionId::from_raw("t1")).unwrap();
        let cart = slot.lock().await;
        assert_eq!(cart.version(), 40);
        assert_eq!(cart.lines()[0].quantity, 40);
        drop(cart);

        // Each subscriber saw strictly increasing versions.
        for rx in [&mut rx_a, &mut rx_b] {
            let mut last = 0;
            while let Ok(raw) = rx.try_recv() {
                let v: Value = serde_json::from_str(&raw).unwrap();
                let version = v["data"]["version"].as_u64().unwrap();
                assert!(version > last);
                last = version;
            }
            assert_eq!(last, 40);
        }
        assert_eq!(
            svc.metrics()
                .counter_get("cart_mutations_total", &[("operation", "add"), ("outcome", "ok")]),
            40
        );
    }

    #[tokio::test]
    async fn disconnect_unsubscribes_and_unregisters() {
        let svc = service(true);
        let (a, mut rx) = svc.connect();
        svc.handle(&a, &frame("cart:join", json!({"sessionId": "t1"}))).await;
        next(&mut rx);
        svc.disconnect(&a);
        assert_eq!(svc.clients().count(), 0);
        let slot = svc.sessions().get(&SessionId::from_raw("t1")).unwrap();
        assert_eq!(slot.subscriber_count(), 0);
        assert_eq!(svc.metrics().gauge_get("ws_connections_active", &[]), 0);
    }
}
