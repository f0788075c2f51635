//! WebSocket client for the sync server.
//!
//! The client moves bytes; it holds no document. Applications feed
//! [`SyncEvent`]s into their own [`weave_core::CanvasStore`] and pass the
//! updates it produces to [`SyncClient::send_delta`].
//!
//! Handles:
//! - connection lifecycle, with the token in the upgrade's `Authorization` header
//! - the join handshake (`PeerJoined`, then answering the server's state vector)
//! - delta and presence send/receive
//! - an offline queue for edits made while disconnected
//! - close codes, so a revoked session (4403) is told apart from a network drop

use std::collections::VecDeque;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::access::DocumentName;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, CLOSE_ACCESS_REVOKED};
use crate::signals::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("upgrade refused: {0}")]
    Unauthorized(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("not connected")]
    NotConnected,
    #[error("offline queue is full")]
    QueueFull,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    /// The socket closed. `code` is the close code the server sent, if any.
    Disconnected { code: Option<u16>, reason: String },
    /// Full state or a diff sent by the server in answer to a join or a state vector.
    StateSynced(Vec<u8>),
    /// The server's state vector; answer with [`SyncClient::send_sync_step2`].
    SyncRequested(Vec<u8>),
    RemoteDelta { peer_id: Uuid, clock: u64, update: Vec<u8> },
    Presence(AwarenessMessage),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    Signal(Signal),
    /// The server replaced the whole document; local undo history is stale.
    Replaced,
}

impl SyncEvent {
    /// Whether this event reports a close caused by revoked access.
    pub fn is_access_revoked(&self) -> bool {
        matches!(self, SyncEvent::Disconnected { code: Some(code), .. } if *code == CLOSE_ACCESS_REVOKED)
    }
}

/// Edits made while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false when the queue is full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedDelta { clock, payload });
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|d| (d.clock, d.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.payload.len()).sum()
    }
}

pub struct SyncClient {
    peer_info: PeerInfo,
    document: DocumentName,
    token: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    clock: Arc<RwLock<u64>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(
        peer_info: PeerInfo,
        document: DocumentName,
        server_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            document,
            token: token.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (only once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.document)
    }

    /// Upgrade request carrying the token as `Authorization: Bearer`.
    fn request(&self) -> Result<Request, ClientError> {
        let mut request = self
            .url()
            .into_client_request()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ClientError::Connection(format!("unusable token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        Ok(request)
    }

    /// Connect, join and replay the offline queue.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let request = match self.request() {
            Ok(request) => request,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(match e {
                    tokio_tungstenite::tungstenite::Error::Http(response)
                        if response.status() == StatusCode::UNAUTHORIZED =>
                    {
                        let reason = response
                            .body()
                            .as_ref()
                            .map(|b| String::from_utf8_lossy(b).into_owned())
                            .unwrap_or_default();
                        ClientError::Unauthorized(reason)
                    }
                    other => ClientError::Connection(other.to_string()),
                });
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        if let DocumentName::Canvas(project_id) = self.document {
            self.send(SyncMessage::peer_joined(project_id, &self.peer_info)?).await?;
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued deltas", queued.len());
            for (clock, payload) in queued {
                let msg = SyncMessage::delta(self.peer_info.peer_id, self.project_id(), clock, payload);
                self.send(msg).await?;
            }
        }

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let peer_id = self.peer_info.peer_id;
        tokio::spawn(async move {
            let mut close_code = None;
            let mut close_reason = String::new();
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let Ok(sync_msg) = SyncMessage::decode(&data) else {
                            log::warn!("Undecodable message from server");
                            continue;
                        };
                        if sync_msg.peer_id == peer_id {
                            continue;
                        }
                        if let Some(event) = Self::event_for(sync_msg) {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            close_code = Some(u16::from(frame.code));
                            close_reason = frame.reason.to_string();
                        }
                        break;
                    }
                    Err(e) => {
                        log::debug!("Connection error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx
                .send(SyncEvent::Disconnected {
                    code: close_code,
                    reason: close_reason,
                })
                .await;
        });

        Ok(())
    }

    fn event_for(msg: SyncMessage) -> Option<SyncEvent> {
        match msg.msg_type {
            MessageType::SyncStep2 => Some(SyncEvent::StateSynced(msg.payload)),
            MessageType::SyncStep1 => Some(SyncEvent::SyncRequested(msg.payload)),
            MessageType::Delta => Some(SyncEvent::RemoteDelta {
                peer_id: msg.peer_id,
                clock: msg.clock,
                update: msg.payload,
            }),
            MessageType::Awareness => AwarenessMessage::decode(&msg.payload)
                .map(SyncEvent::Presence)
                .ok(),
            MessageType::PeerJoined => msg.peer_info().map(SyncEvent::PeerJoined).ok(),
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
            MessageType::Signal => msg.payload_as::<Signal>().map(SyncEvent::Signal).ok(),
            MessageType::Replaced => Some(SyncEvent::Replaced),
            MessageType::Ping | MessageType::Pong => None,
        }
    }

    fn project_id(&self) -> Uuid {
        self.document.project_id()
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Binary(msg.encode()?.into()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    async fn next_clock(&self) -> u64 {
        let mut clock = self.clock.write().await;
        *clock += 1;
        *clock
    }

    /// Send a document update. Queued while disconnected.
    pub async fn send_delta(&self, yrs_update: Vec<u8>) -> Result<(), ClientError> {
        let clock = self.next_clock().await;
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            return if queue.enqueue(clock, yrs_update) {
                Ok(())
            } else {
                Err(ClientError::QueueFull)
            };
        }
        self.send(SyncMessage::delta(self.peer_info.peer_id, self.project_id(), clock, yrs_update))
            .await
    }

    /// Send a presence message. Dropped while disconnected.
    pub async fn send_awareness(&self, presence: &AwarenessMessage) -> Result<(), ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let msg = SyncMessage::awareness(
            self.peer_info.peer_id,
            self.project_id(),
            presence.clock(),
            presence.encode()?,
        );
        self.send(msg).await
    }

    pub async fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ClientError> {
        self.send(SyncMessage::sync_step1(self.peer_info.peer_id, self.project_id(), state_vector))
            .await
    }

    /// Answer the server's state vector with the updates it is missing.
    pub async fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ClientError> {
        self.send(SyncMessage::sync_step2(self.peer_info.peer_id, self.project_id(), diff))
            .await
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send(SyncMessage::ping(self.peer_info.peer_id)).await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn document(&self) -> DocumentName {
        self.document
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
