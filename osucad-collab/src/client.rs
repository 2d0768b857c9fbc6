//! Sync client: one document runtime attached to the server over a
//! [`Transport`].
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect, gap resync)
//! - Flushing queued mutations and applying sequenced operations
//! - Presence (peers, signals) for the room
//! - Offline editing: mutations made while disconnected are kept pending
//!   by the runtime and resubmitted on the next attach
//!
//! The client is driven by its owner: edit through [`SyncClient::runtime_mut`],
//! call [`SyncClient::flush`], and pump [`SyncClient::next_event`].

use std::collections::VecDeque;
use std::time::Duration;

use uuid::Uuid;

use crate::codec::decode_operation;
use crate::object::registry::TypeRegistry;
use crate::op::{ClientId, DocumentId, Operation};
use crate::presence::{PresenceRoom, SignalThrottle, UserInfo};
use crate::protocol::{
    InitialState, JoinRequest, MessageType, ProtocolError, SignalMessage, SyncMessage,
    REJECT_DUPLICATE_CLIENT,
};
use crate::runtime::{DocumentRuntime, InitialDocument, ProcessOutcome, RuntimeConfig, RuntimeError};
use crate::transport::{Transport, TransportError};
use crate::value::Value;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_name: String,
    /// How long to wait for `InitialState` after sending a join.
    pub join_timeout_ms: u64,
    /// Pause between flushes while settling.
    pub flush_interval_ms: u64,
    pub max_queued_mutations: usize,
    /// Attempts after a duplicate-client rejection.
    pub join_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_name: "Anonymous".to_string(),
            join_timeout_ms: 5000,
            flush_interval_ms: 50,
            max_queued_mutations: 10_000,
            join_retries: 5,
        }
    }
}

impl ClientConfig {
    pub fn named(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            ..Self::default()
        }
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Attached to the document
    Connected { sequence_number: u64 },
    /// Connection lost; local edits keep queueing
    Disconnected,
    /// A batch of sequenced operations was processed
    OperationsApplied { count: usize, last_sequence: u64 },
    PeerJoined(UserInfo),
    PeerLeft(ClientId),
    Signal { from: ClientId, signal: SignalMessage },
    /// A sequence gap forced a rejoin
    Resynced { sequence_number: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("join rejected: {0}")]
    JoinRejected(String),
    #[error("timed out waiting for the server")]
    Timeout,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// The sync client.
pub struct SyncClient<T: Transport> {
    transport: T,
    runtime: DocumentRuntime,
    config: ClientConfig,
    state: ConnectionState,
    presence: PresenceRoom,
    throttle: SignalThrottle,
    events: VecDeque<ClientEvent>,
    /// Whether the runtime holds state from an earlier attach.
    joined_before: bool,
}

impl<T: Transport> SyncClient<T> {
    pub fn new(transport: T, document_id: DocumentId, registry: TypeRegistry, config: ClientConfig) -> Self {
        let runtime_config = RuntimeConfig {
            max_queued_mutations: config.max_queued_mutations,
            ..RuntimeConfig::default()
        };
        let runtime = DocumentRuntime::new(document_id, Uuid::new_v4(), registry, runtime_config);
        Self::with_runtime(transport, runtime, config)
    }

    /// Attach an existing runtime, e.g. one built with a custom
    /// `RuntimeConfig`.
    pub fn with_runtime(transport: T, runtime: DocumentRuntime, config: ClientConfig) -> Self {
        Self {
            transport,
            runtime,
            config,
            state: ConnectionState::Disconnected,
            presence: PresenceRoom::new(),
            throttle: SignalThrottle::default(),
            events: VecDeque::new(),
            joined_before: false,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.runtime.client_id()
    }

    pub fn document_id(&self) -> DocumentId {
        self.runtime.document_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn runtime(&self) -> &DocumentRuntime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut DocumentRuntime {
        &mut self.runtime
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.config.join_timeout_ms)
    }

    /// Connect and attach: join, install the initial state, resubmit
    /// everything pending.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
        }
        match self.attach().await {
            Ok(sequence_number) => {
                self.events.push_back(ClientEvent::Connected { sequence_number });
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                self.transport.disconnect().await;
                Err(e)
            }
        }
    }

    async fn attach(&mut self) -> Result<u64, ClientError> {
        self.transport.connect().await?;
        self.runtime.begin_attach()?;

        let request = JoinRequest {
            user_name: self.config.user_name.clone(),
            last_sequence: self
                .joined_before
                .then(|| self.runtime.last_applied_sequence()),
        };
        let join = SyncMessage::join(self.client_id(), self.document_id(), &request)?;

        let mut attempt = 0;
        let state = loop {
            self.transport.send(&join).await?;
            match self.await_initial_state().await? {
                Ok(state) => break state,
                Err(reason) if reason.starts_with(REJECT_DUPLICATE_CLIENT) && attempt < self.config.join_retries => {
                    attempt += 1;
                    log::debug!("Join retry {attempt}: {reason}");
                    tokio::time::sleep(Duration::from_millis(self.config.flush_interval_ms * u64::from(attempt))).await;
                }
                Err(reason) => return Err(ClientError::JoinRejected(reason)),
            }
        };

        let operations = decode_all(&state.ops);
        self.runtime.complete_attach(InitialDocument {
            summary: state.summary,
            operations,
        })?;
        self.presence.reset(state.user, state.connected_users);
        self.state = ConnectionState::Connected;
        self.joined_before = true;
        self.flush().await?;
        Ok(self.runtime.last_applied_sequence())
    }

    async fn await_initial_state(&mut self) -> Result<Result<InitialState, String>, ClientError> {
        let timeout = self.join_timeout();
        tokio::time::timeout(timeout, read_join_reply(&mut self.transport))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Send everything the runtime queued. Returns the number sent; zero
    /// while not connected.
    pub async fn flush(&mut self) -> Result<usize, ClientError> {
        if self.state != ConnectionState::Connected {
            return Ok(0);
        }
        let batch = self.runtime.take_outbound();
        if batch.is_empty() {
            return Ok(0);
        }
        let msg = SyncMessage::submit_ops(self.client_id(), self.document_id(), &batch)?;
        if let Err(e) = self.transport.send(&msg).await {
            // Still pending in the runtime; resent on the next attach.
            self.lost_connection();
            return Err(e.into());
        }
        log::trace!("Flushed {} mutations", batch.len());
        Ok(batch.len())
    }

    /// Next event, waiting for the server if none is queued.
    pub async fn next_event(&mut self) -> Result<ClientEvent, ClientError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            if self.state != ConnectionState::Connected {
                return Err(ClientError::Transport(TransportError::Closed));
            }
            self.receive().await?;
        }
    }

    /// Queued events without waiting.
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    /// Process one message from the server, queueing its event.
    async fn receive(&mut self) -> Result<(), ClientError> {
        let Some(msg) = self.transport.recv().await else {
            self.lost_connection();
            return Ok(());
        };
        match msg.msg_type {
            MessageType::Sequenced => {
                let ops = decode_all(&msg.sequenced_ops()?);
                let count = ops.len();
                let mut resync = false;
                for op in ops {
                    match self.runtime.process_operation(op)? {
                        ProcessOutcome::ResyncRequired => resync = true,
                        outcome => log::trace!("Processed op: {outcome:?}"),
                    }
                }
                self.events.push_back(ClientEvent::OperationsApplied {
                    count,
                    last_sequence: self.runtime.last_applied_sequence(),
                });
                if resync {
                    self.resync().await?;
                }
            }
            MessageType::PeerJoined => {
                let user = msg.user_info()?;
                if user.client_id != self.client_id() {
                    self.presence.handle_joined(user.clone());
                    self.events.push_back(ClientEvent::PeerJoined(user));
                }
            }
            MessageType::PeerLeft => {
                self.presence.handle_left(&msg.client_id);
                self.events.push_back(ClientEvent::PeerLeft(msg.client_id));
            }
            MessageType::Signal => {
                let signal = msg.signal_payload()?;
                if self.presence.handle_signal(&msg.client_id, &signal) {
                    self.events.push_back(ClientEvent::Signal {
                        from: msg.client_id,
                        signal,
                    });
                }
            }
            MessageType::Pong => {}
            other => log::debug!("Unexpected {other:?} from server"),
        }
        Ok(())
    }

    /// Rejoin from the last applied sequence after a gap.
    async fn resync(&mut self) -> Result<(), ClientError> {
        log::info!(
            "Resyncing document {} from sequence {}",
            self.document_id(),
            self.runtime.last_applied_sequence()
        );
        self.transport.disconnect().await;
        self.runtime.connection_lost();
        self.state = ConnectionState::Reconnecting;
        match self.attach().await {
            Ok(sequence_number) => {
                self.events.push_back(ClientEvent::Resynced { sequence_number });
                Ok(())
            }
            Err(e) => {
                self.lost_connection();
                Err(e)
            }
        }
    }

    fn lost_connection(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        log::info!("Lost connection to document {}", self.document_id());
        self.runtime.connection_lost();
        self.presence.clear();
        self.state = ConnectionState::Disconnected;
        self.events.push_back(ClientEvent::Disconnected);
    }

    /// Drop the connection and attach again.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        self.transport.disconnect().await;
        self.runtime.connection_lost();
        self.state = ConnectionState::Reconnecting;
        self.connect().await
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
        self.lost_connection();
    }

    /// Broadcast an ephemeral signal such as a cursor position. Returns
    /// false when it was throttled or there is no connection.
    pub async fn send_signal(&mut self, name: &str, content: impl Into<Value>) -> Result<bool, ClientError> {
        if self.state != ConnectionState::Connected || !self.throttle.admit(name) {
            return Ok(false);
        }
        let signal = SignalMessage {
            name: name.to_string(),
            content: content.into(),
        };
        let msg = SyncMessage::signal(self.client_id(), self.document_id(), &signal)?;
        self.transport.send(&msg).await?;
        Ok(true)
    }

    /// Flush and keep processing until every local mutation is confirmed.
    pub async fn settle(&mut self) -> Result<(), ClientError> {
        let deadline = tokio::time::Instant::now() + self.join_timeout();
        let interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        loop {
            self.flush().await?;
            if self.runtime.pending_len() == 0 {
                return Ok(());
            }
            self.pump_until(deadline, interval).await?;
        }
    }

    /// Process messages until the runtime applied `sequence`.
    pub async fn wait_for_sequence(&mut self, sequence: u64) -> Result<(), ClientError> {
        let deadline = tokio::time::Instant::now() + self.join_timeout();
        let interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        while self.runtime.last_applied_sequence() < sequence {
            self.pump_until(deadline, interval).await?;
        }
        Ok(())
    }

    /// Receive for at most `interval`, failing once `deadline` passed.
    async fn pump_until(&mut self, deadline: tokio::time::Instant, interval: Duration) -> Result<(), ClientError> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::Transport(TransportError::Closed));
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(ClientError::Timeout);
        }
        let wait = interval.min(deadline - now);
        match tokio::time::timeout(wait, self.receive()).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    /// Disconnect and release the document state.
    pub async fn close(mut self) {
        self.transport.disconnect().await;
        self.runtime.dispose();
    }
}

async fn read_join_reply<T: Transport>(transport: &mut T) -> Result<Result<InitialState, String>, ClientError> {
    loop {
        let Some(msg) = transport.recv().await else {
            return Err(ClientError::Transport(TransportError::Closed));
        };
        match msg.msg_type {
            MessageType::InitialState => return Ok(Ok(msg.initial_state_payload()?)),
            MessageType::JoinRejected => return Ok(Err(msg.rejection_reason()?)),
            other => log::debug!("Ignoring {other:?} while joining"),
        }
    }
}

fn decode_all(encoded: &[Vec<u8>]) -> Vec<Operation> {
    encoded
        .iter()
        .filter_map(|bytes| match decode_operation(bytes) {
            Ok(op) => Some(op),
            Err(e) => {
                log::warn!("Dropping undecodable operation: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beatmap;
    use crate::object::ObjectId;
    use crate::server::{ServerConfig, SyncServer};
    use crate::transport::LocalTransport;
    use osucad_core::Beatmap;

    fn setup() -> (SyncServer, DocumentId) {
        let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
        let id = Uuid::new_v4();
        server.import_beatmap(id, &Beatmap::default()).unwrap();
        (server, id)
    }

    fn client(server: &SyncServer, doc: DocumentId, name: &str) -> SyncClient<LocalTransport> {
        SyncClient::new(server.connect_local(), doc, beatmap::registry(), ClientConfig::named(name))
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.join_timeout_ms, 5000);
        assert_eq!(config.flush_interval_ms, 50);
        assert_eq!(config.max_queued_mutations, 10_000);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let (server, doc) = setup();
        let client = client(&server, doc, "Alice");
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.document_id(), doc);
        assert_eq!(client.runtime().object_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_loads_document() {
        let (server, doc) = setup();
        let mut alice = client(&server, doc, "Alice");
        alice.connect().await.unwrap();

        assert_eq!(alice.state(), ConnectionState::Connected);
        assert!(alice.runtime().contains(&ObjectId::new(beatmap::METADATA)));
        assert_eq!(
            alice.next_event().await.unwrap(),
            ClientEvent::Connected { sequence_number: 0 }
        );
        assert_eq!(alice.presence().local_user().unwrap().name, "Alice");
    }

    #[tokio::test]
    async fn test_unknown_document_rejected() {
        let (server, _) = setup();
        let mut alice = client(&server, Uuid::new_v4(), "Alice");
        assert!(matches!(alice.connect().await, Err(ClientError::JoinRejected(_))));
        assert_eq!(alice.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_offline_edits_flush_on_connect() {
        let (server, doc) = setup();
        let mut alice = client(&server, doc, "Alice");
        alice.connect().await.unwrap();
        alice.disconnect().await;
        assert_eq!(alice.state(), ConnectionState::Disconnected);

        beatmap::set_metadata(alice.runtime_mut(), "title", "offline").unwrap();
        assert_eq!(alice.flush().await.unwrap(), 0);
        assert_eq!(alice.runtime().pending_len(), 1);

        alice.connect().await.unwrap();
        alice.settle().await.unwrap();
        assert_eq!(alice.runtime().pending_len(), 0);
        assert_eq!(server.export_beatmap(doc).await.unwrap().metadata.title, "offline");
    }

    #[tokio::test]
    async fn test_signal_reaches_peer() {
        let (server, doc) = setup();
        let mut alice = client(&server, doc, "Alice");
        let mut bob = client(&server, doc, "Bob");
        alice.connect().await.unwrap();
        bob.connect().await.unwrap();

        // Alice hears about Bob.
        loop {
            if let ClientEvent::PeerJoined(user) = alice.next_event().await.unwrap() {
                assert_eq!(user.name, "Bob");
                break;
            }
        }
        assert!(alice.send_signal("selection", "h1").await.unwrap());

        loop {
            if let ClientEvent::Signal { from, signal } = bob.next_event().await.unwrap() {
                assert_eq!(from, alice.client_id());
                assert_eq!(signal.content, Value::from("h1"));
                break;
            }
        }
        let peer = bob.presence().peer(&alice.client_id()).unwrap();
        assert_eq!(peer.signal("selection"), Some(&Value::from("h1")));
    }

    #[tokio::test]
    async fn test_signal_throttled() {
        let (server, doc) = setup();
        let mut alice = client(&server, doc, "Alice");
        assert!(!alice.send_signal(crate::presence::CURSOR_SIGNAL, 1.0).await.unwrap());
        alice.connect().await.unwrap();
        assert!(alice.send_signal(crate::presence::CURSOR_SIGNAL, 1.0).await.unwrap());
        assert!(!alice.send_signal(crate::presence::CURSOR_SIGNAL, 2.0).await.unwrap());
    }
}
