use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use strata_core::SubscriptionId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected WebSocket client and the subscriptions it opened.
pub struct Client {
    pub id: ClientId,
    pub subscriptions: Vec<SubscriptionId>,
    pub tx: mpsc::Sender<String>,
    pub connected: AtomicBool,
    pub last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            subscriptions: Vec::new(),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Mutex<Client>>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let client = Arc::new(Mutex::new(Client::new(id.clone(), tx)));
        self.clients.insert(id.clone(), client);
        (id, rx)
    }

    /// Remove a client. Returns the subscriptions it still held, for the
    /// caller to cancel.
    pub async fn unregister(&self, id: &ClientId) -> Vec<SubscriptionId> {
        let Some((_, client)) = self.clients.remove(id) else {
            return Vec::new();
        };
        let mut client = client.lock().await;
        client.connected.store(false, Ordering::Relaxed);
        std::mem::take(&mut client.subscriptions)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub async fn add_subscription(&self, client_id: &ClientId, subscription: SubscriptionId) -> bool {
        let Some(client) = self.clients.get(client_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        client.lock().await.subscriptions.push(subscription);
        true
    }

    /// Forget `subscription` on `client_id`. Returns whether it was held.
    pub async fn remove_subscription(&self, client_id: &ClientId, subscription: &SubscriptionId) -> bool {
        let Some(client) = self.clients.get(client_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        let mut client = client.lock().await;
        let before = client.subscriptions.len();
        client.subscriptions.retain(|s| s != subscription);
        client.subscriptions.len() != before
    }

    pub async fn subscriptions_of(&self, client_id: &ClientId) -> Vec<SubscriptionId> {
        match self.clients.get(client_id).map(|c| Arc::clone(c.value())) {
            Some(client) => client.lock().await.subscriptions.clone(),
            None => Vec::new(),
        }
    }

    /// Send a message to a specific client. A full queue drops the message.
    pub async fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        let Some(client) = self.clients.get(client_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        let tx = client.lock().await.tx.clone();
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(client_id = %client_id, msg_len = msg.len(), "send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients that haven't answered pings within the timeout.
    /// Their subscriptions end when the forwarders notice the client is gone.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter_map(|entry| match entry.value().try_lock() {
                Ok(client) if !client.is_alive() => Some(client.id.clone()),
                _ => None,
            })
            .collect();

        for id in &dead {
            if let Some((_, client)) = self.clients.remove(id) {
                if let Ok(c) = client.try_lock() {
                    c.connected.store(false, Ordering::Relaxed);
                }
            }
            tracing::info!(client_id = %id, "cleaned up dead client");
        }
        dead.len()
    }
}

/// Pump one WebSocket connection until either side closes: outbound frames
/// from `rx` plus a periodic ping, inbound text frames to `on_message`.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
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
                    tracing::trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => {
                    if let Some(client) = reader_registry.clients.get(&reader_cid) {
                        if let Ok(c) = client.try_lock() {
                            c.record_pong();
                        }
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
}

pub fn start_cleanup_task(registry: Arc<ClientRegistry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed, "dead client cleanup");
            }
        }
    })
}
