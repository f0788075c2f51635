//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐  upgrade: /doc/<project>?token=…   ┌── AccessGate (401 before upgrade)
//!            ├────────────────────────────────────┤
//! Client B ──┘                                    └── DocumentRegistry ── LiveDocument
//!                                                                           │
//!                                                      ┌────────────────────┼────────────────┐
//!                                                      ▼                    ▼                ▼
//!                                                BroadcastGroup     PersistenceGateway    yrs Doc
//! ```
//!
//! Per canvas connection: authorize, attach to the live document, answer the
//! join with the full state and the server's state vector, replay stored
//! presence, then relay. Updates are broadcast first and persisted second.
//! A revoked connection is closed with code 4403 whatever the current ACL.
//!
//! Lobby connections (`/lobby/<project>`) only receive signals.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::access::{
    AccessError, AccessGate, AccessRevoked, AuthenticatedUser, ConnectionCredentials,
    ConnectionTicket, DocumentName,
};
use crate::presence::AwarenessMessage;
use crate::protocol::{
    MessageType, PeerInfo, ProtocolError, SyncMessage, CLOSE_ACCESS_REVOKED,
    CLOSE_ACCESS_REVOKED_REASON,
};
use crate::registry::{DocumentRegistry, LiveDocument, RegistryError};
use crate::signals::Signal;

/// A v1 update carrying no structs and an empty delete set.
const EMPTY_UPDATE: &[u8] = &[0, 0];

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Seconds between keep-alive pings. Zero disables them.
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("document error: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub revoked_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    revoked_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            revoked_connections: self.revoked_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Everything a connection task needs.
struct Shared {
    config: ServerConfig,
    gate: Arc<AccessGate>,
    registry: Arc<DocumentRegistry>,
    stats: AtomicServerStats,
}

pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, gate: Arc<AccessGate>, registry: Arc<DocumentRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                gate,
                registry,
                stats: AtomicServerStats::default(),
            }),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn gate(&self) -> &Arc<AccessGate> {
        &self.shared.gate
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.shared.registry
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats.snapshot()
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and accept connections forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), ServerError> {
    let mut admitted: Option<(DocumentName, AuthenticatedUser)> = None;
    let gate = shared.gate.clone();
    let authorize = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let uri = request.uri();
        let authorization = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        let credentials = ConnectionCredentials::from_parts(uri.query(), authorization);
        let outcome = DocumentName::parse(uri.path())
            .and_then(|name| gate.authorize_connect(&credentials, &name).map(|user| (name, user)));
        match outcome {
            Ok(granted) => {
                admitted = Some(granted);
                Ok(response)
            }
            Err(e) => {
                log::info!("Refused upgrade of {} from {addr}: {e}", uri.path());
                let mut refusal = ErrorResponse::new(Some(e.to_string()));
                *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                Err(refusal)
            }
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, authorize).await {
        Ok(ws) => ws,
        Err(e) => {
            shared.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            log::debug!("Handshake with {addr} failed: {e}");
            return Ok(());
        }
    };
    let Some((name, user)) = admitted else {
        return Ok(());
    };

    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("{} ({}) connected to {name} from {addr}", user.name, user.user_id);

    let result = match name {
        DocumentName::Canvas(project_id) => run_canvas(ws, project_id, user, &shared).await,
        DocumentName::Lobby(project_id) => run_lobby(ws, project_id, user, &shared).await,
    };

    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("Connection to {name} from {addr} closed");
    result
}

fn heartbeat(shared: &Shared) -> Option<tokio::time::Interval> {
    let secs = shared.config.heartbeat_interval_secs;
    (secs > 0).then(|| {
        let period = Duration::from_secs(secs);
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    })
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), ServerError> {
    sink.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

async fn close(sink: &mut WsSink, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        log::debug!("Close frame not delivered: {e}");
    }
}

// ─── Canvas connections ───────────────────────────────────────────

struct CanvasSession {
    project_id: Uuid,
    user: AuthenticatedUser,
    document: Arc<LiveDocument>,
    peer: Option<PeerInfo>,
    relay: Option<broadcast::Receiver<Arc<Vec<u8>>>>,
}

async fn next_relayed(
    relay: &mut Option<broadcast::Receiver<Arc<Vec<u8>>>>,
) -> Result<Arc<Vec<u8>>, broadcast::error::RecvError> {
    match relay {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Register a canvas connection for revocation, then check access again.
/// A revoke that landed after the upgrade was authorized is caught here.
fn admit(
    gate: &AccessGate,
    project_id: Uuid,
    user_id: Uuid,
) -> Result<(ConnectionTicket, mpsc::UnboundedReceiver<AccessRevoked>), AccessError> {
    let (ticket, kicks) = gate.register(project_id, user_id);
    if let Err(e) = gate.authorize_project(user_id, project_id) {
        gate.unregister(&ticket);
        return Err(e);
    }
    Ok((ticket, kicks))
}

async fn run_canvas(
    ws: WebSocketStream<TcpStream>,
    project_id: Uuid,
    user: AuthenticatedUser,
    shared: &Arc<Shared>,
) -> Result<(), ServerError> {
    let (ticket, mut kicks) = match admit(&shared.gate, project_id, user.user_id) {
        Ok(registered) => registered,
        Err(e) => {
            log::info!("Access of {} to {project_id} withdrawn during handshake: {e}", user.user_id);
            shared.stats.revoked_connections.fetch_add(1, Ordering::Relaxed);
            let (mut sink, _) = ws.split();
            close(&mut sink, CloseCode::from(CLOSE_ACCESS_REVOKED), CLOSE_ACCESS_REVOKED_REASON).await;
            return Ok(());
        }
    };
    let document = match shared.registry.acquire(project_id).await {
        Ok(document) => document,
        Err(e) => {
            shared.gate.unregister(&ticket);
            return Err(e.into());
        }
    };
    let (mut sink, mut stream) = ws.split();

    let mut session = CanvasSession {
        project_id,
        user,
        document,
        peer: None,
        relay: None,
    };

    let result = if session.document.broadcast().peer_count().await >= shared.config.max_peers_per_room {
        log::warn!("Document {project_id} is full, refusing {}", session.user.user_id);
        close(&mut sink, CloseCode::Again, "document full").await;
        Ok(())
    } else {
        canvas_loop(&mut session, &mut sink, &mut stream, &mut kicks, shared).await
    };

    let broadcast = session.document.broadcast().clone();
    if let Some(info) = session.peer.take() {
        broadcast.remove_peer(&info.peer_id).await;
        if let Err(e) = broadcast.broadcast(&SyncMessage::peer_left(info.peer_id, project_id)) {
            log::warn!("Failed to announce departure of {}: {e}", info.peer_id);
        }
        log::info!("Peer {} ({}) left {project_id}", info.name, info.peer_id);
    }
    shared.gate.unregister(&ticket);
    shared.registry.release(project_id).await;
    result
}

async fn canvas_loop(
    session: &mut CanvasSession,
    sink: &mut WsSink,
    stream: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    kicks: &mut tokio::sync::mpsc::UnboundedReceiver<crate::access::AccessRevoked>,
    shared: &Arc<Shared>,
) -> Result<(), ServerError> {
    let mut heartbeat = heartbeat(shared);

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    shared.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    shared.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    match SyncMessage::decode(&data) {
                        Ok(msg) => session.handle(msg, &data, sink, shared).await?,
                        Err(e) => log::warn!("Undecodable message on {}: {e}", session.project_id),
                    }
                }
                Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("WebSocket error on {}: {e}", session.project_id);
                    break;
                }
                Some(Ok(_)) => {}
            },

            relayed = next_relayed(&mut session.relay) => match relayed {
                Ok(data) => {
                    let own = session.peer.as_ref().map(|p| p.peer_id);
                    let echo = SyncMessage::decode(&data).map(|m| Some(m.peer_id) == own).unwrap_or(false);
                    if !echo {
                        sink.send(Message::Binary(data.to_vec().into())).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Peer {:?} lagged by {n} messages", session.peer.as_ref().map(|p| p.peer_id));
                    session.document.broadcast().record_dropped(n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            Some(_) = kicks.recv() => {
                log::info!("Closing connection of {} to {}: access revoked", session.user.user_id, session.project_id);
                shared.stats.revoked_connections.fetch_add(1, Ordering::Relaxed);
                close(sink, CloseCode::from(CLOSE_ACCESS_REVOKED), CLOSE_ACCESS_REVOKED_REASON).await;
                break;
            }

            _ = next_tick(&mut heartbeat) => {
                sink.send(Message::Ping(Vec::new().into())).await?;
            }
        }
    }
    Ok(())
}

impl CanvasSession {
    fn sender_id(&self, msg: &SyncMessage) -> Uuid {
        self.peer.as_ref().map_or(msg.peer_id, |p| p.peer_id)
    }

    async fn handle(
        &mut self,
        msg: SyncMessage,
        raw: &[u8],
        sink: &mut WsSink,
        shared: &Shared,
    ) -> Result<(), ServerError> {
        match msg.msg_type {
            MessageType::PeerJoined => self.join(&msg, sink).await?,
            MessageType::SyncStep1 => match self.document.encode_diff(&msg.payload) {
                Ok(diff) => send(sink, &SyncMessage::sync_step2(Uuid::nil(), self.project_id, diff)).await?,
                Err(e) => log::warn!("Bad state vector on {}: {e}", self.project_id),
            },
            MessageType::SyncStep2 | MessageType::Delta => self.integrate(msg, shared).await,
            MessageType::Awareness => self.relay_presence(&msg, raw).await,
            MessageType::Ping => send(sink, &SyncMessage::pong(msg.peer_id)).await?,
            MessageType::Pong => log::trace!("Pong from {}", msg.peer_id),
            other => log::debug!("Unhandled message type {other:?} on {}", self.project_id),
        }
        Ok(())
    }

    async fn join(&mut self, msg: &SyncMessage, sink: &mut WsSink) -> Result<(), ServerError> {
        if self.peer.is_some() {
            log::debug!("Ignoring repeated join from {}", msg.peer_id);
            return Ok(());
        }
        let mut info = msg
            .peer_info()
            .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, self.user.name.clone()));
        info.user_id = Some(self.user.user_id);

        let broadcast = self.document.broadcast().clone();
        self.relay = Some(broadcast.add_peer(info.clone()).await);

        send(sink, &SyncMessage::sync_step2(Uuid::nil(), self.project_id, self.document.encode_state())).await?;
        send(sink, &SyncMessage::sync_step1(Uuid::nil(), self.project_id, self.document.state_vector())).await?;
        for presence in broadcast.presence_snapshot(info.peer_id).await {
            sink.send(Message::Binary(presence.to_vec().into())).await?;
        }

        broadcast.broadcast(&SyncMessage::peer_joined(self.project_id, &info)?)?;
        log::info!("Peer {} ({}) joined {}", info.name, info.peer_id, self.project_id);
        self.peer = Some(info);
        Ok(())
    }

    /// Merge, broadcast, then persist.
    async fn integrate(&self, msg: SyncMessage, shared: &Shared) {
        if msg.payload == EMPTY_UPDATE {
            return;
        }
        let sender = self.sender_id(&msg);
        let correction = match self.document.apply_update(&msg.payload) {
            Ok(correction) => correction,
            Err(e) => {
                log::warn!("Rejected update from {sender} on {}: {e}", self.project_id);
                return;
            }
        };

        let broadcast = self.document.broadcast();
        let relay = SyncMessage::delta(sender, self.project_id, msg.clock, msg.payload);
        if let Err(e) = broadcast.broadcast(&relay) {
            log::warn!("Failed to relay update on {}: {e}", self.project_id);
        }
        // Nil sender: the author needs the correction too.
        if let Some(fix) = &correction {
            if let Err(e) = broadcast.broadcast(&SyncMessage::delta(Uuid::nil(), self.project_id, 0, fix.clone())) {
                log::warn!("Failed to relay correction on {}: {e}", self.project_id);
            }
        }

        let gateway = shared.registry.gateway();
        // Failures are logged by the gateway and never reach the peer.
        let _ = gateway.persist_update(self.project_id, &relay.payload).await;
        if let Some(fix) = correction {
            let _ = gateway.persist_update(self.project_id, &fix).await;
        }
    }

    async fn relay_presence(&self, msg: &SyncMessage, raw: &[u8]) {
        let sender = self.sender_id(msg);
        let broadcast = self.document.broadcast();
        let encoded = Arc::new(raw.to_vec());
        match AwarenessMessage::decode(&msg.payload) {
            Ok(AwarenessMessage::Leave { .. }) => broadcast.forget_presence(&sender).await,
            Ok(AwarenessMessage::State { .. }) => broadcast.remember_presence(sender, encoded.clone()).await,
            Err(e) => {
                log::warn!("Dropping malformed presence from {sender}: {e}");
                return;
            }
        }
        broadcast.broadcast_raw(encoded);
    }
}

// ─── Lobby connections ────────────────────────────────────────────

async fn run_lobby(
    ws: WebSocketStream<TcpStream>,
    project_id: Uuid,
    user: AuthenticatedUser,
    shared: &Arc<Shared>,
) -> Result<(), ServerError> {
    let mut signals = shared.gate.subscribe_signals(project_id);
    let result = relay_signals(ws, project_id, &user, shared, &mut signals).await;
    shared.gate.unsubscribe_signals(project_id, signals);
    result
}

async fn relay_signals(
    ws: WebSocketStream<TcpStream>,
    project_id: Uuid,
    user: &AuthenticatedUser,
    shared: &Arc<Shared>,
    signals: &mut broadcast::Receiver<Signal>,
) -> Result<(), ServerError> {
    let (mut sink, mut stream) = ws.split();
    let mut heartbeat = heartbeat(shared);

    let pending = Signal::PendingRequests {
        count: shared.gate.pending_request_count(project_id),
    };
    send(&mut sink, &SyncMessage::signal(project_id, &pending)?).await?;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    if let Ok(msg) = SyncMessage::decode(&data) {
                        if msg.msg_type == MessageType::Ping {
                            send(&mut sink, &SyncMessage::pong(msg.peer_id)).await?;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("WebSocket error on lobby {project_id}: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },

            signal = signals.recv() => match signal {
                Ok(signal) if signal.is_for(user.user_id) => {
                    send(&mut sink, &SyncMessage::signal(project_id, &signal)?).await?;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Lobby listener {} lagged by {n} signals", user.user_id);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = next_tick(&mut heartbeat) => {
                sink.send(Message::Ping(Vec::new().into())).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MemoryDirectory;
    use crate::persistence::{PersistenceConfig, PersistenceGateway};
    use crate::registry::RegistryConfig;
    use crate::signals::SignalHub;
    use crate::storage::MemoryStore;

    fn server(config: ServerConfig) -> SyncServer {
        let gate = Arc::new(AccessGate::new(
            Arc::new(MemoryDirectory::new()),
            Arc::new(SignalHub::default()),
        ));
        let gateway = Arc::new(PersistenceGateway::new(
            Arc::new(MemoryStore::new()),
            PersistenceConfig::default(),
        ));
        let registry = Arc::new(DocumentRegistry::new(gateway, RegistryConfig::default()));
        SyncServer::new(config, gate, registry)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_server_stats_initial() {
        let stats = server(ServerConfig::default()).stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.rejected_connections, 0);
        assert_eq!(stats.total_messages, 0);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = server(ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        });
        let listener = server.bind().await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_disabled() {
        let shared = Shared {
            config: ServerConfig {
                heartbeat_interval_secs: 0,
                ..ServerConfig::default()
            },
            gate: server(ServerConfig::default()).gate().clone(),
            registry: server(ServerConfig::default()).registry().clone(),
            stats: AtomicServerStats::default(),
        };
        assert!(heartbeat(&shared).is_none());
    }

    #[test]
    fn test_admit_rechecks_access_after_registering() {
        let directory = Arc::new(MemoryDirectory::new());
        let owner = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let project = Uuid::new_v4();
        directory.add_project(project, owner, None);
        directory.add_project_collaborator(project, bob);
        let gate = AccessGate::new(directory.clone(), Arc::new(SignalHub::default()));

        let (ticket, _kicks) = admit(&gate, project, bob).unwrap();
        assert_eq!(gate.open_connections(project, bob), 1);
        gate.unregister(&ticket);

        // Revoked after the upgrade was authorized but before registration.
        directory.remove_project_collaborator(project, bob);
        assert_eq!(gate.revoke(project, bob), 0);
        assert!(matches!(admit(&gate, project, bob), Err(AccessError::Forbidden { .. })));
        assert_eq!(gate.open_connections(project, bob), 0);
    }
}
