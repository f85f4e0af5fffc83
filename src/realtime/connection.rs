// Realtime connection management
// Owns the single Socket.IO connection of the signed-in user: connect with the
// bearer token, reconnect with a bounded fixed backoff, emit events with or
// without acknowledgments, and forward inbound events to the session.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;
use url::Url;

use super::codec::{EnginePacket, SocketPacket, DEFAULT_NAMESPACE};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// What the connection reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Connected,
    Disconnected { reason: String },
    ConnectError { message: String },
    ReconnectFailed { attempts: u32 },
    /// A server event; `payload` is its first argument (or null).
    Event { name: String, payload: Value },
}

/// Pending acknowledgment for an emitted event.
pub struct Ack {
    event: String,
    rx: oneshot::Receiver<Value>,
}

impl Ack {
    pub fn new(event: impl Into<String>, rx: oneshot::Receiver<Value>) -> Self {
        Ack {
            event: event.into(),
            rx,
        }
    }

    /// Resolves with the first ack argument, or fails if the connection
    /// dropped the ack before the server answered.
    pub async fn wait(self) -> SyncResult<Value> {
        self.rx.await.map_err(|_| SyncError::AckDropped(self.event))
    }
}

/// Everything the rest of the client may do with the realtime connection.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn emit(&self, event: &str, payload: Value) -> SyncResult<()>;

    async fn emit_with_ack(&self, event: &str, payload: Value) -> SyncResult<Ack>;
}

struct Shared {
    connected: AtomicBool,
    next_ack: AtomicU64,
    acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
}

impl Shared {
    fn new() -> Self {
        Shared {
            connected: AtomicBool::new(false),
            next_ack: AtomicU64::new(0),
            acks: Mutex::new(HashMap::new()),
        }
    }

    fn drop_pending_acks(&self) {
        if let Ok(mut acks) = self.acks.lock() {
            if !acks.is_empty() {
                debug!("Dropping {} pending acknowledgments", acks.len());
            }
            acks.clear();
        }
    }

    fn resolve_ack(&self, id: u64, value: Value) {
        let sender = match self.acks.lock() {
            Ok(mut acks) => acks.remove(&id),
            Err(_) => None,
        };
        match sender {
            Some(tx) => {
                if tx.send(value).is_err() {
                    debug!("Ack {} arrived after its waiter gave up", id);
                }
            }
            None => debug!("Ack {} does not match any pending emit", id),
        }
    }
}

/// Cloneable handle onto one live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    outgoing: mpsc::Sender<SocketPacket>,
    shared: Arc<Shared>,
}

#[async_trait]
impl RealtimeChannel for ConnectionHandle {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: &str, payload: Value) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        debug!("Emitting {}", event);
        self.outgoing
            .send(SocketPacket::event(event, payload, None))
            .await
            .map_err(|_| SyncError::NotConnected)
    }

    async fn emit_with_ack(&self, event: &str, payload: Value) -> SyncResult<Ack> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let id = self.shared.next_ack.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut acks) = self.shared.acks.lock() {
            acks.insert(id, tx);
        }
        debug!("Emitting {} with ack id {}", event, id);
        if self.outgoing.send(SocketPacket::event(event, payload, Some(id))).await.is_err() {
            if let Ok(mut acks) = self.shared.acks.lock() {
                acks.remove(&id);
            }
            return Err(SyncError::NotConnected);
        }
        Ok(Ack::new(event, rx))
    }
}

struct LiveConnection {
    handle: ConnectionHandle,
    task: JoinHandle<()>,
}

/// Owns at most one live connection at a time.
pub struct ConnectionManager {
    config: SyncConfig,
    events: mpsc::Sender<RealtimeEvent>,
    current: Mutex<Option<LiveConnection>>,
}

impl ConnectionManager {
    pub fn new(config: SyncConfig) -> (Self, mpsc::Receiver<RealtimeEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        (
            ConnectionManager {
                config,
                events,
                current: Mutex::new(None),
            },
            events_rx,
        )
    }

    /// Connect with `token`, tearing down any previous connection first.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, token: &str) -> SyncResult<ConnectionHandle> {
        self.disconnect();
        if token.trim().is_empty() {
            warn!("Refusing to open a realtime connection without a token");
            return Err(SyncError::Unauthorized);
        }

        let url = build_socket_url(&self.config.server_url)?;
        let (outgoing_tx, outgoing_rx) = mpsc::channel(100);
        let shared = Arc::new(Shared::new());
        let handle = ConnectionHandle {
            outgoing: outgoing_tx,
            shared: shared.clone(),
        };

        let task = tokio::spawn(connection_loop(
            url,
            token.to_string(),
            self.config.reconnect.attempts,
            self.config.reconnect.backoff(),
            outgoing_rx,
            shared,
            self.events.clone(),
        ));

        match self.current.lock() {
            Ok(mut current) => {
                *current = Some(LiveConnection {
                    handle: handle.clone(),
                    task,
                })
            }
            Err(_) => {
                task.abort();
                return Err(SyncError::NotConnected);
            }
        }
        Ok(handle)
    }

    /// Tear down the live connection, if any. Pending acks are dropped and the
    /// old connection task stops producing events.
    pub fn disconnect(&self) {
        let previous = match self.current.lock() {
            Ok(mut current) => current.take(),
            Err(_) => None,
        };
        if let Some(live) = previous {
            info!("Tearing down realtime connection");
            live.task.abort();
            let was_connected = live.handle.shared.connected.swap(false, Ordering::SeqCst);
            live.handle.shared.drop_pending_acks();
            if was_connected {
                let _ = self.events.try_send(RealtimeEvent::Disconnected {
                    reason: "client disconnect".to_string(),
                });
            }
        }
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.current
            .lock()
            .ok()
            .and_then(|current| current.as_ref().map(|live| live.handle.clone()))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl RealtimeChannel for ConnectionManager {
    fn is_connected(&self) -> bool {
        self.handle().map(|h| h.is_connected()).unwrap_or(false)
    }

    async fn emit(&self, event: &str, payload: Value) -> SyncResult<()> {
        match self.handle() {
            Some(handle) => handle.emit(event, payload).await,
            None => Err(SyncError::NotConnected),
        }
    }

    async fn emit_with_ack(&self, event: &str, payload: Value) -> SyncResult<Ack> {
        match self.handle() {
            Some(handle) => handle.emit_with_ack(event, payload).await,
            None => Err(SyncError::NotConnected),
        }
    }
}

/// `http(s)://host` → `ws(s)://host/socket.io/?EIO=4&transport=websocket`
pub fn build_socket_url(server_url: &str) -> SyncResult<Url> {
    let mut url = Url::parse(server_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SyncError::Malformed(format!("unsupported scheme '{}'", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Malformed(format!("cannot use scheme {} for {}", scheme, server_url)))?;
    url.set_path("/socket.io/");
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    Ok(url)
}

enum SessionEnd {
    /// The owner dropped every handle; stop for good.
    ClientClosed,
    /// Server or network ended the session.
    Lost { was_connected: bool, reason: String },
}

async fn connection_loop(
    url: Url,
    token: String,
    max_attempts: u32,
    backoff: std::time::Duration,
    mut outgoing_rx: mpsc::Receiver<SocketPacket>,
    shared: Arc<Shared>,
    events: mpsc::Sender<RealtimeEvent>,
) {
    let mut attempt = 0u32;

    loop {
        info!("Connecting to realtime server at {}", url.host_str().unwrap_or("?"));
        let end = match run_session(&url, &token, &mut outgoing_rx, &shared, &events).await {
            Ok(end) => end,
            Err(e) => {
                error!("Realtime connection failed: {}", e);
                let was_connected = shared.connected.load(Ordering::SeqCst);
                if !was_connected {
                    forward(&events, RealtimeEvent::ConnectError { message: e.to_string() }).await;
                }
                SessionEnd::Lost {
                    was_connected,
                    reason: e.to_string(),
                }
            }
        };

        shared.connected.store(false, Ordering::SeqCst);
        shared.drop_pending_acks();

        match end {
            SessionEnd::ClientClosed => {
                info!("Realtime connection closed by client");
                return;
            }
            SessionEnd::Lost { was_connected, reason } => {
                if was_connected {
                    attempt = 0;
                    forward(&events, RealtimeEvent::Disconnected { reason }).await;
                }
            }
        }

        if attempt >= max_attempts {
            error!("Giving up on realtime connection after {} reconnect attempts", attempt);
            forward(&events, RealtimeEvent::ReconnectFailed { attempts: attempt }).await;
            return;
        }
        attempt += 1;
        info!("Reconnecting in {:?} (attempt {}/{})", backoff, attempt, max_attempts);
        tokio::time::sleep(backoff).await;
    }
}

async fn forward(events: &mpsc::Sender<RealtimeEvent>, event: RealtimeEvent) {
    if events.send(event).await.is_err() {
        debug!("Realtime event receiver is gone");
    }
}

async fn run_session(
    url: &Url,
    token: &str,
    outgoing_rx: &mut mpsc::Receiver<SocketPacket>,
    shared: &Shared,
    events: &mpsc::Sender<RealtimeEvent>,
) -> SyncResult<SessionEnd> {
    let mut request = url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| SyncError::Malformed(format!("token is not a valid header value: {}", e)))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (ws_stream, _) = connect_async(request).await?;
    let (mut write, mut read) = ws_stream.split();
    let mut connected = false;

    loop {
        tokio::select! {
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Ok(SessionEnd::Lost { was_connected: connected, reason: "server closed connection".into() });
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Realtime transport error: {}", e);
                        return Ok(SessionEnd::Lost { was_connected: connected, reason: e.to_string() });
                    }
                };

                let packet = match EnginePacket::decode(text.as_str()) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("Dropping undecodable frame: {}", e);
                        continue;
                    }
                };

                match packet {
                    EnginePacket::Open(_) => {
                        debug!("Engine handshake received, joining default namespace");
                        let connect = SocketPacket::connect(Some(json!({ "token": token })));
                        write.send(WsMessage::Text(connect.to_frame().into())).await?;
                    }
                    EnginePacket::Ping => {
                        write.send(WsMessage::Text(EnginePacket::Pong.encode().into())).await?;
                    }
                    EnginePacket::Close => {
                        return Ok(SessionEnd::Lost { was_connected: connected, reason: "engine close".into() });
                    }
                    EnginePacket::Message(body) => match SocketPacket::decode(&body) {
                        Ok(SocketPacket::Connect { .. }) => {
                            info!("Realtime connection established");
                            connected = true;
                            shared.connected.store(true, Ordering::SeqCst);
                            forward(events, RealtimeEvent::Connected).await;
                        }
                        Ok(SocketPacket::ConnectError { data, .. }) => {
                            let message = data
                                .as_ref()
                                .and_then(|d| d.get("message"))
                                .and_then(Value::as_str)
                                .unwrap_or("connection refused")
                                .to_string();
                            warn!("Server refused the realtime connection: {}", message);
                            forward(events, RealtimeEvent::ConnectError { message: message.clone() }).await;
                            return Ok(SessionEnd::Lost { was_connected: connected, reason: message });
                        }
                        Ok(SocketPacket::Disconnect { .. }) => {
                            return Ok(SessionEnd::Lost { was_connected: connected, reason: "server disconnect".into() });
                        }
                        Ok(SocketPacket::Event { namespace, name, .. }) if namespace != DEFAULT_NAMESPACE => {
                            debug!("Dropping {} for unjoined namespace {}", name, namespace);
                        }
                        Ok(SocketPacket::Event { name, mut args, .. }) => {
                            let payload = if args.is_empty() { Value::Null } else { args.swap_remove(0) };
                            debug!("Received {}", name);
                            forward(events, RealtimeEvent::Event { name, payload }).await;
                        }
                        Ok(SocketPacket::Ack { id, mut args, .. }) => {
                            let value = if args.is_empty() { Value::Null } else { args.swap_remove(0) };
                            shared.resolve_ack(id, value);
                        }
                        Err(e) => warn!("Dropping undecodable socket packet: {}", e),
                    },
                    EnginePacket::Pong | EnginePacket::Upgrade | EnginePacket::Noop => {}
                }
            }

            packet = outgoing_rx.recv() => {
                match packet {
                    Some(packet) => {
                        write.send(WsMessage::Text(packet.to_frame().into())).await?;
                    }
                    None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return Ok(SessionEnd::ClientClosed);
                    }
                }
            }
        }
    }
}
