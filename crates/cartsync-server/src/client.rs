use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use cartsync_core::ids::{ChannelId, SessionId};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Why a frame could not be queued for a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    /// Outbound queue is full; the client is not keeping up.
    Full,
    /// The connection is gone.
    Closed,
}

/// An outbound frame sink attached to one connection.
pub trait Channel: Send + Sync {
    fn id(&self) -> &ChannelId;
    /// Queue a frame without waiting.
    fn try_send(&self, frame: String) -> Result<(), DeliveryError>;
}

/// A connected WebSocket client.
pub struct Client {
    id: ChannelId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
    session_id: Mutex<Option<SessionId>>,
}

impl Client {
    fn new(id: ChannelId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
            session_id: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Session this client last joined.
    pub fn session(&self) -> Option<SessionId> {
        self.session_id.lock().clone()
    }

    /// Bind to `session_id`, returning the previous binding.
    pub fn bind(&self, session_id: SessionId) -> Option<SessionId> {
        self.session_id.lock().replace(session_id)
    }

    pub fn unbind(&self) -> Option<SessionId> {
        self.session_id.lock().take()
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

impl Channel for Client {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn try_send(&self, frame: String) -> Result<(), DeliveryError> {
        if !self.is_connected() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected WebSocket clients.
pub struct ClientRegistry {
    clients: DashMap<ChannelId, Arc<Client>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
            client_timeout,
        }
    }

    /// Register a new client and return it with the receiving end of its queue.
    pub fn register(&self) -> (Arc<Client>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let client = Arc::new(Client::new(ChannelId::new(), tx));
        self.clients.insert(client.id.clone(), Arc::clone(&client));
        (client, rx)
    }

    /// Remove a client by ID.
    pub fn unregister(&self, id: &ChannelId) -> Option<Arc<Client>> {
        let (_, client) = self.clients.remove(id)?;
        client.connected.store(false, Ordering::Relaxed);
        Some(client)
    }

    pub fn get(&self, id: &ChannelId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients that haven't answered a ping within the timeout.
    pub fn cleanup_dead_clients(&self) -> Vec<Arc<Client>> {
        let dead: Vec<ChannelId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        dead.iter()
            .filter_map(|id| {
                let client = self.unregister(id)?;
                tracing::info!(channel_id = %id, "cleaned up dead client");
                Some(client)
            })
            .collect()
    }
}

/// Per-connection frame handling, implemented by the cart service.
#[async_trait::async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn on_frame(&self, client: &Arc<Client>, raw: &str);
    async fn on_disconnect(&self, client: &Arc<Client>);
}

/// Handle a WebSocket connection: split into reader/writer, manage lifecycle with heartbeat.
///
/// Frames from one connection are handled in arrival order; the reader awaits
/// each one before reading the next.
pub async fn handle_ws_connection<H: FrameHandler>(
    socket: WebSocket,
    client: Arc<Client>,
    mut rx: mpsc::Receiver<String>,
    handler: Arc<H>,
    heartbeat: Duration,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward queued frames to the socket + periodic ping
    let writer_client = Arc::clone(&client);
    let writer_shutdown = shutdown.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(channel_id = %writer_client.id, "sent ping");
                }
                () = writer_shutdown.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }

        writer_client.connected.store(false, Ordering::Relaxed);
    });

    // Reader task: hand frames to the handler, track pongs
    let reader_client = Arc::clone(&client);
    let reader_handler = Arc::clone(&handler);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    reader_handler.on_frame(&reader_client, text.as_str()).await;
                }
                WsMessage::Pong(_) => reader_client.record_pong(),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    handler.on_disconnect(&client).await;
}

/// Periodically drop clients that stopped answering pings.
pub fn start_cleanup_task<H: FrameHandler>(
    registry: Arc<ClientRegistry>,
    handler: Arc<H>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => break,
            }
            let removed = registry.cleanup_dead_clients();
            for client in &removed {
                handler.on_disconnect(client).await;
            }
            if !removed.is_empty() {
                tracing::info!(removed = removed.len(), "dead client cleanup");
            }
        }
    })
}
