//! Sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── Sequencer ── replica runtime
//! Client B ──┘        │                │
//!                     │                └── StorageBackend
//!                     │                        ├── versions (summary trees)
//!                     │                        └── op log (LZ4)
//!                     ▼
//!               BroadcastGroup ──┬──────────┬──────────┐
//!                                ▼          ▼          ▼
//!                             Client A   Client B   Client C
//! ```
//!
//! A room opens when its first peer joins and closes, after writing a
//! final summary, when its last peer leaves. Every submitted batch is
//! sequenced, appended to the op log, applied to the replica and
//! broadcast under the room lock, so all peers see one total order. A
//! batch the op log refuses ends the session and is never broadcast.

pub mod room;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use osucad_core::Beatmap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::beatmap::{self, BeatmapError};
use crate::broadcast::BroadcastFrame;
use crate::codec::CodecError;
use crate::object::registry::TypeRegistry;
use crate::op::{ClientId, DocumentId};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::runtime::{DocumentRuntime, RuntimeError};
use crate::storage::{DocumentRecord, MemoryStorage, RocksStorage, StorageBackend, StoreConfig, StoreError};
use crate::summary::SummaryTree;
use crate::transport::LocalTransport;

pub use room::{load_replica, JoinRejection, Room, Sequencer};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Sequenced ops between two stored versions of a document
    pub summary_interval_ops: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            summary_interval_ops: 1000,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 8,
            broadcast_capacity: 64,
            summary_interval_ops: 50,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub sequenced_ops: u64,
    pub summaries_written: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Beatmap(#[from] BeatmapError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("document {0} not found")]
    NotFound(DocumentId),
    #[error("connection closed")]
    ConnectionClosed,
}

type RoomHandle = Arc<Mutex<Room>>;

pub(crate) struct ServerShared {
    config: ServerConfig,
    rooms: RwLock<HashMap<DocumentId, RoomHandle>>,
    stats: RwLock<ServerStats>,
    storage: Arc<dyn StorageBackend>,
    registry: TypeRegistry,
}

/// The sync server. Cheap to clone; clones share rooms and storage.
#[derive(Clone)]
pub struct SyncServer {
    shared: Arc<ServerShared>,
}

impl SyncServer {
    /// Open RocksDB at `config.storage_path`, or keep everything in memory
    /// when it is unset. Beatmap documents are registered.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let storage: Arc<dyn StorageBackend> = match &config.storage_path {
            Some(path) => Arc::new(RocksStorage::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStorage::new()),
        };
        Ok(Self::with_storage(config, storage, beatmap::registry()))
    }

    pub fn with_storage(
        config: ServerConfig,
        storage: Arc<dyn StorageBackend>,
        registry: TypeRegistry,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
                storage,
                registry,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.shared.storage
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Store a new document whose first version is `summary`.
    pub fn create_document(&self, id: DocumentId, summary: &SummaryTree) -> Result<DocumentRecord, ServerError> {
        let record = self.shared.storage.create_document(id, summary, 0)?;
        log::info!("Created document {id}");
        Ok(record)
    }

    /// Store `beatmap` as a new document.
    pub fn import_beatmap(&self, id: DocumentId, beatmap: &Beatmap) -> Result<DocumentRecord, ServerError> {
        let summary = beatmap::new_document(id, beatmap)?;
        self.create_document(id, &summary)
    }

    /// Current state of a document, whether or not its room is open.
    pub async fn export_beatmap(&self, id: DocumentId) -> Result<Beatmap, ServerError> {
        let room = self.shared.rooms.read().await.get(&id).cloned();
        if let Some(room) = room {
            let room = room.lock().await;
            return Ok(beatmap::export(room.runtime())?);
        }
        let runtime = self.load_document(id)?;
        Ok(beatmap::export(&runtime)?)
    }

    /// Fresh replica of a stored document.
    pub fn load_document(&self, id: DocumentId) -> Result<DocumentRuntime, ServerError> {
        load_replica(id, self.shared.storage.as_ref(), self.shared.registry.clone())
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>, ServerError> {
        Ok(self.shared.storage.list_documents()?)
    }

    /// An in-process connection running the same session loop as a socket.
    pub fn connect_local(&self) -> LocalTransport {
        LocalTransport::new(self.clone())
    }

    pub(crate) fn spawn_local_session(&self, inbound: mpsc::Receiver<Vec<u8>>, outbound: mpsc::Sender<Vec<u8>>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.run_session(Connection::Local { inbound, outbound }, "local").await {
                log::debug!("Local session ended: {e}");
            }
        });
    }

    /// Summarize every open room. Used on shutdown.
    pub async fn summarize_all(&self) -> Result<usize, ServerError> {
        let rooms: Vec<RoomHandle> = self.shared.rooms.read().await.values().cloned().collect();
        let mut written = 0;
        for room in rooms {
            if room.lock().await.summarize()? {
                written += 1;
            }
        }
        self.shared.stats.write().await.summaries_written += written as u64;
        Ok(written)
    }

    /// Bind `config.bind_addr` and serve WebSocket connections forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let documents = self.shared.storage.list_documents()?.len();
        log::info!(
            "Sync server listening on {} ({documents} stored documents)",
            listener.local_addr()?
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Either side of a session: a WebSocket or an in-process channel pair.
enum Connection {
    WebSocket(WebSocketStream<TcpStream>),
    Local {
        inbound: mpsc::Receiver<Vec<u8>>,
        outbound: mpsc::Sender<Vec<u8>>,
    },
}

impl Connection {
    /// Next binary frame, `None` once the peer went away.
    async fn next_frame(&mut self) -> Option<Vec<u8>> {
        match self {
            Connection::WebSocket(ws) => loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => return Some(data.into()),
                    Some(Ok(Message::Ping(data))) => {
                        if ws.send(Message::Pong(data)).await.is_err() {
                            return None;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Err(e)) => {
                        log::debug!("WebSocket error: {e}");
                        return None;
                    }
                    Some(Ok(_)) => {}
                }
            },
            Connection::Local { inbound, .. } => inbound.recv().await,
        }
    }

    async fn send_frame(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        match self {
            Connection::WebSocket(ws) => {
                ws.send(Message::Binary(bytes.to_vec().into())).await?;
                Ok(())
            }
            Connection::Local { outbound, .. } => outbound
                .send(bytes.to_vec())
                .await
                .map_err(|_| ServerError::ConnectionClosed),
        }
    }

    async fn send(&mut self, msg: &SyncMessage) -> Result<(), ServerError> {
        self.send_frame(&msg.encode()?).await
    }
}

/// Per-connection state once the peer joined a room.
struct Membership {
    client_id: ClientId,
    document_id: DocumentId,
    room: RoomHandle,
    receiver: broadcast::Receiver<BroadcastFrame>,
}

impl ServerShared {
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");
        self.run_session(Connection::WebSocket(ws), &addr.to_string()).await
    }

    async fn run_session(&self, mut conn: Connection, peer: &str) -> Result<(), ServerError> {
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership: Option<Membership> = None;
        let result = self.session_loop(&mut conn, &mut membership).await;
        if let Err(e) = &result {
            log::warn!("Session {peer} failed: {e}");
        }
        log::info!("Connection closed from {peer}");

        if let Some(m) = membership {
            if let Err(e) = self.leave(m).await {
                log::error!("Failed to leave room: {e}");
            }
        }
        self.stats.write().await.active_connections -= 1;
        result
    }

    async fn session_loop(
        &self,
        conn: &mut Connection,
        membership: &mut Option<Membership>,
    ) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                frame = conn.next_frame() => {
                    let Some(bytes) = frame else { return Ok(()) };
                    {
                        let mut s = self.stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += bytes.len() as u64;
                    }
                    match SyncMessage::decode(&bytes) {
                        Ok(msg) => self.handle_message(conn, membership, msg).await?,
                        Err(e) => log::warn!("Failed to decode message: {e}"),
                    }
                }

                frame = async {
                    match membership.as_mut() {
                        Some(m) => m.receiver.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(m) = membership.as_ref() else { continue };
                    match frame {
                        Ok(frame) => {
                            if frame.is_for(&m.client_id) {
                                conn.send_frame(&frame.bytes).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Peer {} lagged by {n} messages", m.client_id);
                            m.room.lock().await.broadcast().record_dropped(n);
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        conn: &mut Connection,
        membership: &mut Option<Membership>,
        msg: SyncMessage,
    ) -> Result<(), ServerError> {
        match msg.msg_type {
            MessageType::Join => {
                if membership.is_some() {
                    log::warn!("Ignoring second join on one connection");
                    return Ok(());
                }
                let request = msg.join_request()?;
                match self.join(msg.doc_id, msg.client_id, request).await? {
                    Ok((joined, room)) => {
                        conn.send(&joined.reply).await?;
                        *membership = Some(Membership {
                            client_id: joined.user.client_id,
                            document_id: msg.doc_id,
                            room,
                            receiver: joined.receiver,
                        });
                    }
                    Err(reason) => {
                        log::info!("Rejected join to {}: {reason}", msg.doc_id);
                        conn.send(&SyncMessage::join_rejected(msg.doc_id, &reason)).await?;
                    }
                }
            }

            MessageType::SubmitOps => {
                let Some(m) = membership.as_ref() else {
                    log::debug!("SubmitOps before join");
                    return Ok(());
                };
                let batch = msg.submitted_ops()?;
                let (count, summarized) = {
                    let mut room = m.room.lock().await;
                    let before = room.summary_sequence();
                    let count = room.submit(m.client_id, batch)?;
                    (count, room.summary_sequence() != before)
                };
                let mut s = self.stats.write().await;
                s.sequenced_ops += count as u64;
                if summarized {
                    s.summaries_written += 1;
                }
            }

            MessageType::Signal => {
                let Some(m) = membership.as_ref() else {
                    return Ok(());
                };
                let signal = msg.signal_payload()?;
                log::trace!("Signal {} from {} in {}", signal.name, m.client_id, m.document_id);
                let stamped = SyncMessage::signal(m.client_id, m.document_id, &signal)?;
                m.room
                    .lock()
                    .await
                    .broadcast()
                    .broadcast(m.client_id, &stamped, false)?;
            }

            MessageType::Ping => {
                let id = membership.as_ref().map_or(msg.client_id, |m| m.client_id);
                conn.send(&SyncMessage::pong(id)).await?;
            }

            other => log::debug!("Unhandled message type: {other:?}"),
        }
        Ok(())
    }

    /// Open the room if needed and admit the peer.
    async fn join(
        &self,
        document_id: DocumentId,
        proposed_id: ClientId,
        request: crate::protocol::JoinRequest,
    ) -> Result<Result<(room::Joined, RoomHandle), String>, ServerError> {
        loop {
            let room = match self.get_or_open(document_id).await {
                Ok(room) => room,
                Err(ServerError::NotFound(_)) => return Ok(Err(format!("document {document_id} not found"))),
                Err(e) => return Err(e),
            };
            let mut guard = room.lock().await;
            match guard
                .join(proposed_id, request.clone(), self.config.max_peers_per_room)
                .await?
            {
                Ok(joined) => {
                    drop(guard);
                    return Ok(Ok((joined, room)));
                }
                // Lost a race with the last peer leaving; the room is
                // being removed from the map, open a fresh one.
                Err(JoinRejection::Closing) => {
                    drop(guard);
                    tokio::task::yield_now().await;
                }
                Err(reason) => return Ok(Err(reason.to_string())),
            }
        }
    }

    async fn get_or_open(&self, document_id: DocumentId) -> Result<RoomHandle, ServerError> {
        if let Some(room) = self.rooms.read().await.get(&document_id) {
            return Ok(room.clone());
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&document_id) {
            return Ok(room.clone());
        }
        let room = Room::open(
            document_id,
            self.storage.clone(),
            self.registry.clone(),
            self.config.broadcast_capacity,
            self.config.summary_interval_ops,
        )?;
        let room = Arc::new(Mutex::new(room));
        rooms.insert(document_id, room.clone());
        let count = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = count;
        Ok(room)
    }

    async fn leave(&self, m: Membership) -> Result<(), ServerError> {
        let mut room = m.room.lock().await;
        let remaining = room.leave(&m.client_id).await?;
        if remaining > 0 {
            return Ok(());
        }

        let summarized = match room.close() {
            Ok(summarized) => summarized,
            Err(e) => {
                log::error!("Failed to persist summary for doc {} on close: {e}", m.document_id);
                false
            }
        };
        let count = {
            let mut rooms = self.rooms.write().await;
            if rooms.get(&m.document_id).is_some_and(|r| Arc::ptr_eq(r, &m.room)) {
                rooms.remove(&m.document_id);
            }
            rooms.len()
        };
        drop(room);
        log::info!("Room {} removed (empty)", m.document_id);

        let mut s = self.stats.write().await;
        s.active_rooms = count;
        if summarized {
            s.summaries_written += 1;
        }
        Ok(())
    }
}
