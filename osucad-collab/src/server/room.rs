//! One open document: sequencer, server replica, op history since the
//! last summary, and the broadcast group of its peers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::broadcast::{BroadcastFrame, BroadcastGroup};
use crate::codec::encode_operations;
use crate::object::registry::TypeRegistry;
use crate::op::{ClientId, DocumentId, Operation, OutboundMutation};
use crate::presence::{pick_color, UserInfo};
use crate::protocol::{InitialState, JoinRequest, SyncMessage, REJECT_DUPLICATE_CLIENT};
use crate::runtime::{DocumentRuntime, InitialDocument, ProcessOutcome, RuntimeConfig};
use crate::storage::{Commit, StorageBackend};
use crate::summary::SummaryTree;

use super::ServerError;

/// Assigns consecutive sequence numbers and drops resubmissions.
///
/// A client resends its whole pending queue after reconnecting, so the
/// sequencer remembers the highest local sequence it accepted from each
/// client and ignores anything at or below it.
#[derive(Debug, Default)]
pub struct Sequencer {
    last: u64,
    watermarks: HashMap<ClientId, u64>,
}

impl Sequencer {
    pub fn new(last: u64) -> Self {
        Self {
            last,
            watermarks: HashMap::new(),
        }
    }

    /// Resume after `last`, remembering what each client already had
    /// sequenced.
    pub fn with_watermarks(last: u64, watermarks: impl IntoIterator<Item = (ClientId, u64)>) -> Self {
        Self {
            last,
            watermarks: watermarks.into_iter().collect(),
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last
    }

    pub fn sequence(&mut self, outbound: OutboundMutation) -> Option<Operation> {
        let client = outbound.mutation.client_id;
        let local = outbound.mutation.local_sequence;
        let watermark = self.watermarks.entry(client).or_insert(0);
        if local <= *watermark {
            return None;
        }
        *watermark = local;
        self.last += 1;
        Some(Operation::sequenced(outbound, self.last))
    }

    fn checkpoint(&self, client: &ClientId) -> Checkpoint {
        Checkpoint {
            last: self.last,
            watermark: self.watermarks.get(client).copied(),
        }
    }

    /// Undo everything sequenced for `client` since `checkpoint`.
    fn rewind(&mut self, client: ClientId, checkpoint: Checkpoint) {
        self.last = checkpoint.last;
        match checkpoint.watermark {
            Some(watermark) => self.watermarks.insert(client, watermark),
            None => self.watermarks.remove(&client),
        };
    }
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    last: u64,
    watermark: Option<u64>,
}

/// Why a join was refused. Sent to the client as `JoinRejected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRejection {
    RoomFull(usize),
    DuplicateClient(ClientId),
    Closing,
}

impl std::fmt::Display for JoinRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinRejection::RoomFull(max) => write!(f, "room is full ({max} peers)"),
            JoinRejection::DuplicateClient(id) => {
                write!(f, "{REJECT_DUPLICATE_CLIENT}: {id} is already connected")
            }
            JoinRejection::Closing => write!(f, "room is closing"),
        }
    }
}

pub struct Joined {
    pub user: UserInfo,
    pub receiver: broadcast::Receiver<BroadcastFrame>,
    pub reply: SyncMessage,
}

pub struct Room {
    document_id: DocumentId,
    runtime: DocumentRuntime,
    sequencer: Sequencer,
    broadcast: Arc<BroadcastGroup>,
    storage: Arc<dyn StorageBackend>,
    /// Full summary at `summary_sequence`, handed to joining clients.
    summary: SummaryTree,
    summary_sequence: u64,
    /// Everything sequenced after `summary_sequence`.
    ops: Vec<Operation>,
    summary_interval: u64,
    closed: bool,
}

impl Room {
    /// Load the latest version plus the op log tail from storage.
    pub fn open(
        document_id: DocumentId,
        storage: Arc<dyn StorageBackend>,
        registry: TypeRegistry,
        broadcast_capacity: usize,
        summary_interval: u64,
    ) -> Result<Self, ServerError> {
        let (runtime, commit, ops) = load(document_id, storage.as_ref(), registry)?;

        let sequencer = Sequencer::with_watermarks(
            runtime.last_applied_sequence(),
            runtime.client_sequences().iter().map(|(client, local)| (*client, *local)),
        );
        log::info!(
            "Opened document {document_id} at sequence {} ({} ops since summary)",
            sequencer.last_sequence(),
            ops.len()
        );

        Ok(Self {
            document_id,
            runtime,
            sequencer,
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            storage,
            summary: commit.tree,
            summary_sequence: commit.info.sequence_number,
            ops,
            summary_interval: summary_interval.max(1),
            closed: false,
        })
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn runtime(&self) -> &DocumentRuntime {
        &self.runtime
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequencer.last_sequence()
    }

    pub fn summary_sequence(&self) -> u64 {
        self.summary_sequence
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Admit a peer. Subscribing and building the reply happen under the
    /// room lock, so the reply plus the broadcast stream miss nothing.
    pub async fn join(
        &mut self,
        proposed_id: ClientId,
        request: JoinRequest,
        max_peers: usize,
    ) -> Result<Result<Joined, JoinRejection>, ServerError> {
        if self.closed {
            return Ok(Err(JoinRejection::Closing));
        }
        let mut peers = self.broadcast.peers().await;
        if peers.len() >= max_peers {
            return Ok(Err(JoinRejection::RoomFull(max_peers)));
        }
        let client_id = if proposed_id.is_nil() {
            Uuid::new_v4()
        } else {
            proposed_id
        };
        if peers.iter().any(|p| p.client_id == client_id) {
            return Ok(Err(JoinRejection::DuplicateClient(client_id)));
        }

        let user = UserInfo {
            client_id,
            name: request.user_name.clone(),
            color: pick_color(peers.iter().map(|p| p.color)),
        };
        let state = self.initial_state(&user, &peers, request.last_sequence)?;
        let reply = SyncMessage::initial_state(self.document_id, &state)?;

        let receiver = self.broadcast.add_peer(user.clone()).await;
        self.broadcast.broadcast(
            client_id,
            &SyncMessage::peer_joined(self.document_id, &user)?,
            false,
        )?;
        peers.push(user.clone());
        log::info!(
            "{} ({client_id}) joined document {} [{} peers]",
            user.name,
            self.document_id,
            peers.len()
        );
        Ok(Ok(Joined {
            user,
            receiver,
            reply,
        }))
    }

    fn initial_state(
        &self,
        user: &UserInfo,
        peers: &[UserInfo],
        last_sequence: Option<u64>,
    ) -> Result<InitialState, ServerError> {
        let current = self.sequencer.last_sequence();
        let (summary, ops): (Option<SummaryTree>, Vec<Operation>) = match last_sequence {
            // Catch up from ops alone.
            Some(last) if last >= self.summary_sequence && last <= current => (
                None,
                self.ops
                    .iter()
                    .filter(|op| op.sequence_number > last)
                    .cloned()
                    .collect(),
            ),
            _ => (Some(self.summary.clone()), self.ops.clone()),
        };

        let mut connected_users = peers.to_vec();
        connected_users.push(user.clone());
        Ok(InitialState {
            client_id: user.client_id,
            user: user.clone(),
            connected_users,
            summary,
            summary_sequence: self.summary_sequence,
            ops: encode_operations(&ops)?,
            sequence_number: current,
        })
    }

    /// Sequence a client's batch, persist it, apply it to the replica and
    /// broadcast it. Returns the number of new operations.
    ///
    /// Nothing becomes visible unless the batch was stored. On a storage
    /// error the sequencer is rewound, so the client's resubmission after
    /// reconnecting is sequenced again.
    pub fn submit(&mut self, client_id: ClientId, batch: Vec<OutboundMutation>) -> Result<usize, ServerError> {
        let checkpoint = self.sequencer.checkpoint(&client_id);
        let mut sequenced = Vec::with_capacity(batch.len());
        for outbound in batch {
            if outbound.mutation.client_id != client_id {
                log::warn!(
                    "Dropping mutation from {client_id} claiming to be {}",
                    outbound.mutation.client_id
                );
                continue;
            }
            if let Some(op) = self.sequencer.sequence(outbound) {
                sequenced.push(op);
            }
        }

        let Some(last) = sequenced.last().map(|op| op.sequence_number) else {
            return Ok(0);
        };
        if let Err(e) = self.storage.append_operations(self.document_id, &sequenced) {
            log::error!(
                "Failed to persist {} ops for document {}: {e}",
                sequenced.len(),
                self.document_id
            );
            self.sequencer.rewind(client_id, checkpoint);
            return Err(e.into());
        }

        for op in &sequenced {
            match self.runtime.process_operation(op.clone()) {
                Ok(ProcessOutcome::Dropped) => log::debug!(
                    "Operation {} on {} does not apply to the replica",
                    op.sequence_number,
                    op.target()
                ),
                Ok(_) => {}
                Err(e) => log::warn!("Replica failed on operation {}: {e}", op.sequence_number),
            }
        }

        let encoded = encode_operations(&sequenced)?;
        self.broadcast.broadcast(
            client_id,
            &SyncMessage::sequenced(self.document_id, last, &encoded)?,
            true,
        )?;

        let count = sequenced.len();
        self.ops.extend(sequenced);
        if self.ops.len() as u64 >= self.summary_interval {
            self.summarize()?;
        }
        Ok(count)
    }

    /// Write a new version covering everything sequenced so far. Returns
    /// false when there was nothing new.
    pub fn summarize(&mut self) -> Result<bool, ServerError> {
        let sequence = self.sequencer.last_sequence();
        if sequence == self.summary_sequence {
            return Ok(false);
        }
        let incremental = self.runtime.summarize_incremental()?;
        let info = self
            .storage
            .create_version(self.document_id, &incremental, sequence)?;
        self.runtime.mark_summarized();
        self.summary = self.runtime.summarize()?;
        self.summary_sequence = sequence;
        self.ops.clear();
        log::info!(
            "Summarized document {} at sequence {sequence} ({})",
            self.document_id,
            &info.sha[..12.min(info.sha.len())]
        );
        Ok(true)
    }

    /// Remove a peer and tell the others. Returns how many remain.
    pub async fn leave(&mut self, client_id: &ClientId) -> Result<usize, ServerError> {
        if let Some(user) = self.broadcast.remove_peer(client_id).await {
            log::info!("{} ({client_id}) left document {}", user.name, self.document_id);
            self.broadcast.broadcast(
                *client_id,
                &SyncMessage::peer_left(*client_id, self.document_id),
                false,
            )?;
        }
        Ok(self.broadcast.peer_count().await)
    }

    /// Summarize pending ops and refuse further joins.
    pub fn close(&mut self) -> Result<bool, ServerError> {
        self.closed = true;
        self.summarize()
    }
}

/// Server-side replica of a stored document: latest version plus op tail.
pub fn load_replica(
    document_id: DocumentId,
    storage: &dyn StorageBackend,
    registry: TypeRegistry,
) -> Result<DocumentRuntime, ServerError> {
    Ok(load(document_id, storage, registry)?.0)
}

fn load(
    document_id: DocumentId,
    storage: &dyn StorageBackend,
    registry: TypeRegistry,
) -> Result<(DocumentRuntime, Commit, Vec<Operation>), ServerError> {
    let commit = storage
        .get_latest_version(document_id)?
        .ok_or(ServerError::NotFound(document_id))?;
    let operations = storage.operations_since(document_id, commit.info.sequence_number)?;

    let mut runtime = DocumentRuntime::new(
        document_id,
        Uuid::nil(),
        registry,
        RuntimeConfig::default(),
    );
    runtime.begin_attach()?;
    runtime.complete_attach(InitialDocument {
        summary: Some(commit.tree.clone()),
        operations: operations.clone(),
    })?;
    Ok((runtime, commit, operations))
}
