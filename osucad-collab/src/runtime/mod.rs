//! Per-document runtime.
//!
//! Owns every shared object of one document and is the only place where
//! mutations are applied. Local edits are applied optimistically, kept as
//! pending until the server echoes them back, and queued for the
//! transport. Sequenced operations are applied strictly in sequence order.
//!
//! ```text
//!   set()/insert_item()/...          process_operation(op)
//!          │                                   │
//!          ▼                                   ▼
//!   apply (Local) ──► pending ◄── confirm ── own op?
//!          │                                   │ no
//!          ▼                                   ▼
//!   outbound queue ──► take_outbound()   superseded by pending? ──► skip
//!                                              │ no
//!                                              ▼
//!                                        apply (Remote)
//! ```
//!
//! Superseding keeps replicas convergent: a remote write to a key this
//! client has an unconfirmed write for is older than ours in the total
//! order, so ours wins once it is sequenced and the remote value must not
//! be shown in between.

pub mod queue;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, trace, warn};
use tokio::sync::mpsc;

use crate::history::{Transaction, TransactionHandle, UndoStack};
use crate::object::{
    Applied, ChangeEvent, ChangeOrigin, ChangedProperty, MutationPayload, ObjectError, ObjectId,
    ObjectSnapshot, SharedMap, SharedObject, SharedSortedList, TypeRegistry,
};
use crate::op::{ClientId, DocumentId, Mutation, Operation, OutboundMutation};
use crate::summary::{DocumentAttributes, DocumentSummary, ObjectRecord, SummaryError, SummaryTree};
use crate::value::Value;

pub use queue::{Enqueued, MutationQueue};

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// A sequence gap wider than this asks the client to resync.
    pub resync_gap_threshold: u64,
    /// Out-of-order operations held before giving up and resyncing.
    pub max_reorder_buffer: usize,
    /// Committed transactions kept on the undo stack.
    pub max_undo_depth: usize,
    /// Replace an unsent set/delete on the same key instead of queueing both.
    pub coalesce_outbound: bool,
    pub max_queued_mutations: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            resync_gap_threshold: 256,
            max_reorder_buffer: 1024,
            max_undo_depth: 50,
            coalesce_outbound: true,
            max_queued_mutations: 10_000,
        }
    }
}

impl RuntimeConfig {
    pub fn for_testing() -> Self {
        Self {
            resync_gap_threshold: 16,
            max_reorder_buffer: 64,
            max_undo_depth: 50,
            coalesce_outbound: false,
            max_queued_mutations: 1_000,
        }
    }
}

/// Connection lifecycle as seen by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    /// Not connected yet. Local edits are applied and queued.
    Detached,
    /// Waiting for the initial state. Remote operations are buffered.
    Attaching,
    Attached,
    Disposed,
}

/// What happened to one sequenced operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied,
    /// Our own pending mutation came back.
    Confirmed,
    /// Already applied (sequence number not above the last one).
    Duplicate,
    /// Arrived early; held until the gap is filled.
    Buffered,
    /// Skipped because a pending local mutation on the same slot wins.
    Superseded,
    /// Could not be applied (unknown target, structural mismatch).
    Dropped,
    /// The gap is too large to wait out. The caller should rejoin.
    ResyncRequired,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("document runtime is disposed")]
    Disposed,
    #[error("operation not allowed while {0:?}")]
    InvalidState(AttachState),
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),
    #[error("object {0} already exists")]
    DuplicateObject(ObjectId),
    #[error("{0} is not a {1}")]
    WrongType(ObjectId, &'static str),
    #[error("outbound queue is full ({0} mutations)")]
    QueueFull(usize),
    #[error("no open transaction with this handle")]
    NoTransaction,
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Summary(#[from] SummaryError),
}

/// State handed over by the server on (re)join.
#[derive(Debug, Clone, Default)]
pub struct InitialDocument {
    pub summary: Option<SummaryTree>,
    /// Operations after the summary (or after the client's last sequence).
    pub operations: Vec<Operation>,
}

#[derive(Debug)]
struct OpenTransaction {
    handle: TransactionHandle,
    depth: u32,
    transaction: Transaction,
}

pub struct DocumentRuntime {
    document_id: DocumentId,
    client_id: ClientId,
    registry: TypeRegistry,
    config: RuntimeConfig,
    state: AttachState,
    ever_attached: bool,

    objects: HashMap<ObjectId, Box<dyn SharedObject>>,
    /// child → owning sorted list
    parents: HashMap<ObjectId, ObjectId>,
    root: Option<ObjectId>,
    create_time: u64,

    last_applied: u64,
    reorder: BTreeMap<u64, Operation>,
    /// Highest local sequence seen in a sequenced op, per client.
    client_sequences: BTreeMap<ClientId, u64>,

    next_local_sequence: u64,
    pending: VecDeque<Mutation>,
    pending_slots: HashMap<(ObjectId, String), usize>,
    pending_whole: HashMap<ObjectId, usize>,
    /// Pending local inserts that lost to a remote insert of the same id.
    lost_inserts: HashSet<ObjectId>,
    /// Pending local inserts whose item took remote edits meanwhile.
    stale_inserts: HashSet<ObjectId>,
    outbound: MutationQueue,

    history: UndoStack,
    open: Option<OpenTransaction>,
    next_transaction: u64,
    replaying: bool,

    /// Objects changed since the last summary.
    dirty: HashSet<ObjectId>,
    has_summary_base: bool,

    listeners: Vec<mpsc::UnboundedSender<ChangeEvent>>,
}

impl std::fmt::Debug for DocumentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRuntime")
            .field("document_id", &self.document_id)
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("objects", &self.objects.len())
            .field("last_applied", &self.last_applied)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl DocumentRuntime {
    pub fn new(
        document_id: DocumentId,
        client_id: ClientId,
        registry: TypeRegistry,
        config: RuntimeConfig,
    ) -> Self {
        let outbound = MutationQueue::new(config.max_queued_mutations, config.coalesce_outbound);
        let history = UndoStack::new(config.max_undo_depth);
        Self {
            document_id,
            client_id,
            registry,
            config,
            state: AttachState::Detached,
            ever_attached: false,
            objects: HashMap::new(),
            parents: HashMap::new(),
            root: None,
            create_time: unix_now(),
            last_applied: 0,
            reorder: BTreeMap::new(),
            client_sequences: BTreeMap::new(),
            next_local_sequence: 1,
            pending: VecDeque::new(),
            pending_slots: HashMap::new(),
            pending_whole: HashMap::new(),
            lost_inserts: HashSet::new(),
            stale_inserts: HashSet::new(),
            outbound,
            history,
            open: None,
            next_transaction: 1,
            replaying: false,
            dirty: HashSet::new(),
            has_summary_base: false,
            listeners: Vec::new(),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn last_applied_sequence(&self) -> u64 {
        self.last_applied
    }

    pub fn client_sequences(&self) -> &BTreeMap<ClientId, u64> {
        &self.client_sequences
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_mutations(&self) -> impl Iterator<Item = &Mutation> {
        self.pending.iter()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn buffered_len(&self) -> usize {
        self.reorder.len()
    }

    pub fn root(&self) -> Option<&ObjectId> {
        self.root.as_ref()
    }

    pub fn set_root(&mut self, id: ObjectId) {
        self.root = Some(id);
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn object(&self, id: &ObjectId) -> Option<&dyn SharedObject> {
        self.objects.get(id).map(|o| o.as_ref())
    }

    pub fn map(&self, id: &ObjectId) -> Option<&SharedMap> {
        self.objects.get(id)?.as_any().downcast_ref()
    }

    pub fn sorted_list(&self, id: &ObjectId) -> Option<&SharedSortedList> {
        self.objects.get(id)?.as_any().downcast_ref()
    }

    /// Owning list of a child object.
    pub fn parent_of(&self, id: &ObjectId) -> Option<&ObjectId> {
        self.parents.get(id)
    }

    /// Snapshots of every object, ordered by id.
    pub fn snapshot(&self) -> Vec<ObjectSnapshot> {
        let mut snapshots: Vec<_> = self.objects.values().map(|o| o.create_snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Receive a [`ChangeEvent`] for every change applied from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    fn ensure_live(&self) -> Result<(), RuntimeError> {
        if self.state == AttachState::Disposed {
            return Err(RuntimeError::Disposed);
        }
        Ok(())
    }

    fn ensure_creating(&self) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        if self.state != AttachState::Detached || self.ever_attached {
            return Err(RuntimeError::InvalidState(self.state));
        }
        Ok(())
    }

    /// Create a top-level object in a brand new document. The first object
    /// created becomes the root.
    pub fn create_object(&mut self, id: ObjectId, type_name: &str) -> Result<(), RuntimeError> {
        self.ensure_creating()?;
        if self.objects.contains_key(&id) {
            return Err(RuntimeError::DuplicateObject(id));
        }
        let mut object = self.registry.create(type_name, id.clone())?;
        object.initialize_first_time();
        self.objects.insert(id.clone(), object);
        self.dirty.insert(id.clone());
        if self.root.is_none() {
            self.root = Some(id);
        }
        Ok(())
    }

    /// Apply a mutation as part of building a new document. Nothing is
    /// recorded, queued or sent: the result becomes the first summary.
    pub fn seed(&mut self, target: &ObjectId, payload: MutationPayload) -> Result<(), RuntimeError> {
        self.ensure_creating()?;
        self.apply(target, &payload.normalized(), ChangeOrigin::Local)?;
        Ok(())
    }

    /// Apply a local mutation optimistically and queue it for the server.
    pub fn submit_local(
        &mut self,
        target: &ObjectId,
        payload: MutationPayload,
    ) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        if self.outbound.is_full() && !self.coalesces_with_tail(target, &payload) {
            return Err(RuntimeError::QueueFull(self.outbound.len()));
        }

        let payload = payload.normalized();
        let applied = self.apply(target, &payload, ChangeOrigin::Local)?;

        if !self.replaying {
            if let Some(inverse) = applied.inverse {
                match self.open.as_mut() {
                    Some(open) => open.transaction.record(target, payload.clone(), inverse),
                    None => {
                        let mut transaction = Transaction::new();
                        transaction.record(target, payload.clone(), inverse);
                        self.history.commit(transaction);
                    }
                }
            }
        }

        self.enqueue_local(target.clone(), payload);
        Ok(())
    }

    fn coalesces_with_tail(&self, target: &ObjectId, payload: &MutationPayload) -> bool {
        if !self.config.coalesce_outbound {
            return false;
        }
        let Some(tail) = self.pending.back() else {
            return false;
        };
        &tail.target == target
            && matches!(
                (&tail.payload, payload),
                (
                    MutationPayload::MapSet { key: a, .. } | MutationPayload::MapDelete { key: a },
                    MutationPayload::MapSet { key: b, .. } | MutationPayload::MapDelete { key: b },
                ) if a == b
            )
    }

    fn enqueue_local(&mut self, target: ObjectId, payload: MutationPayload) {
        let mutation = Mutation {
            target,
            payload,
            client_id: self.client_id,
            local_sequence: self.next_local_sequence,
        };
        self.next_local_sequence += 1;

        let outbound = OutboundMutation {
            mutation: mutation.clone(),
            reference_sequence_number: self.last_applied,
        };
        match self.outbound.enqueue(outbound) {
            Enqueued::Coalesced(replaced) => {
                if let Some(index) = self.pending.iter().rposition(|m| m.local_sequence == replaced) {
                    if let Some(old) = self.pending.remove(index) {
                        self.untrack(&old);
                    }
                }
            }
            Enqueued::Queued => {}
            Enqueued::Full => {
                // Checked before applying; only reachable when coalescing was
                // expected but the tail had already been drained.
                self.outbound.push(OutboundMutation {
                    mutation: mutation.clone(),
                    reference_sequence_number: self.last_applied,
                });
            }
        }
        self.track(&mutation);
        self.pending.push_back(mutation);
    }

    pub fn set(
        &mut self,
        target: &ObjectId,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), RuntimeError> {
        self.submit_local(target, MutationPayload::set(key, value))
    }

    pub fn delete(&mut self, target: &ObjectId, key: impl Into<String>) -> Result<(), RuntimeError> {
        self.submit_local(target, MutationPayload::delete(key))
    }

    pub fn clear(&mut self, target: &ObjectId) -> Result<(), RuntimeError> {
        self.submit_local(target, MutationPayload::MapClear)
    }

    /// Insert a new child map into a sorted list.
    pub fn insert_item(
        &mut self,
        list: &ObjectId,
        item: ObjectSnapshot,
    ) -> Result<ObjectId, RuntimeError> {
        let id = item.id.clone();
        self.submit_local(list, MutationPayload::ListInsert { item })?;
        Ok(id)
    }

    pub fn remove_item(&mut self, list: &ObjectId, id: &ObjectId) -> Result<(), RuntimeError> {
        self.submit_local(list, MutationPayload::ListRemove { id: id.clone() })
    }

    /// Hand queued mutations to the transport. Empty unless attached.
    pub fn take_outbound(&mut self) -> Vec<OutboundMutation> {
        if self.state != AttachState::Attached {
            return Vec::new();
        }
        self.outbound.drain()
    }

    fn apply(
        &mut self,
        target: &ObjectId,
        payload: &MutationPayload,
        origin: ChangeOrigin,
    ) -> Result<Applied, RuntimeError> {
        let child = match payload {
            MutationPayload::ListInsert { item } => {
                if self.objects.contains_key(&item.id) {
                    return Err(ObjectError::mismatch(target, format!("object {} already exists", item.id)).into());
                }
                let mut child = self.registry.create(&item.type_name, item.id.clone())?;
                child.load_snapshot(item.content.clone())?;
                Some(child)
            }
            _ => None,
        };
        let removed = match payload {
            MutationPayload::ListRemove { id } => self.objects.get(id).map(|o| o.create_snapshot()),
            _ => None,
        };

        let object = self
            .objects
            .get_mut(target)
            .ok_or_else(|| RuntimeError::UnknownObject(target.clone()))?;
        let mut applied = object.apply_mutation(payload)?;

        if let (Some(item), Some(child)) = (&applied.attached, child) {
            self.objects.insert(item.id.clone(), child);
            self.parents.insert(item.id.clone(), target.clone());
            self.dirty.insert(item.id.clone());
        }
        if let Some(id) = &applied.detached {
            self.objects.remove(id);
            self.parents.remove(id);
            self.dirty.remove(id);
            applied.inverse = removed.map(|item| MutationPayload::ListInsert { item });
        }
        self.dirty.insert(target.clone());

        for property in &applied.changes {
            self.emit(ChangeEvent {
                object: target.clone(),
                property: property.clone(),
                origin,
            });
        }

        if let Some(parent) = self.parents.get(target).cloned() {
            self.reposition_child(&parent, target, payload, origin);
        }
        Ok(applied)
    }

    /// Keep a child at the right place in its sorted list after its sort
    /// key changed.
    fn reposition_child(
        &mut self,
        parent: &ObjectId,
        child: &ObjectId,
        payload: &MutationPayload,
        origin: ChangeOrigin,
    ) {
        let Some(sort_by) = self.sorted_list(parent).map(|l| l.sort_by().to_string()) else {
            return;
        };
        if let Some(key) = payload.slot() {
            if key != sort_by {
                return;
            }
        }
        let value = self
            .map(child)
            .and_then(|m| m.get_f64(&sort_by))
            .unwrap_or(0.0);
        let moved = self
            .objects
            .get_mut(parent)
            .and_then(|o| o.as_any_mut().downcast_mut::<SharedSortedList>())
            .map(|list| list.reposition(child, value))
            .unwrap_or(false);
        if moved {
            self.dirty.insert(parent.clone());
            self.emit(ChangeEvent {
                object: parent.clone(),
                property: ChangedProperty::ItemMoved(child.clone()),
                origin,
            });
        }
    }

    fn emit(&mut self, event: ChangeEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn track(&mut self, mutation: &Mutation) {
        match mutation.payload.slot() {
            Some(slot) => {
                *self
                    .pending_slots
                    .entry((mutation.target.clone(), slot.to_string()))
                    .or_insert(0) += 1;
            }
            None => *self.pending_whole.entry(mutation.target.clone()).or_insert(0) += 1,
        }
    }

    fn untrack(&mut self, mutation: &Mutation) {
        match mutation.payload.slot() {
            Some(slot) => {
                let key = (mutation.target.clone(), slot.to_string());
                if let Some(count) = self.pending_slots.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        self.pending_slots.remove(&key);
                    }
                }
            }
            None => {
                if let Some(count) = self.pending_whole.get_mut(&mutation.target) {
                    *count -= 1;
                    if *count == 0 {
                        self.pending_whole.remove(&mutation.target);
                    }
                }
            }
        }
    }

    fn has_pending_slot(&self, target: &ObjectId, slot: &str) -> bool {
        self.pending_slots
            .contains_key(&(target.clone(), slot.to_string()))
    }

    fn superseded(&self, mutation: &Mutation) -> bool {
        let target = &mutation.target;
        match &mutation.payload {
            MutationPayload::MapSet { key, .. } | MutationPayload::MapDelete { key } => {
                self.has_pending_slot(target, key) || self.pending_whole.contains_key(target)
            }
            MutationPayload::ListRemove { id } => self.has_pending_slot(target, id.as_str()),
            MutationPayload::ListInsert { item } => {
                self.has_pending_slot(target, item.id.as_str()) && !self.objects.contains_key(&item.id)
            }
            MutationPayload::MapClear | MutationPayload::MapReplace { .. } => false,
        }
    }

    /// Re-apply pending local mutations whose target matches, after a
    /// remote change overwrote them.
    fn reapply_pending(&mut self, target: &ObjectId) {
        let replay: Vec<Mutation> = self
            .pending
            .iter()
            .filter(|m| &m.target == target)
            .cloned()
            .collect();
        for mutation in replay {
            if let Err(e) = self.apply(&mutation.target, &mutation.payload, ChangeOrigin::Local) {
                debug!("Pending mutation on {} no longer applies: {}", mutation.target, e);
            }
        }
    }

    /// Forget pending mutations the loaded summary already contains. They
    /// were sequenced while this client was away, so no echo will come.
    fn drop_summarized_pending(&mut self) {
        let Some(&watermark) = self.client_sequences.get(&self.client_id) else {
            return;
        };
        let (sequenced, pending): (VecDeque<Mutation>, VecDeque<Mutation>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|m| m.local_sequence <= watermark);
        self.pending = pending;
        for mutation in &sequenced {
            self.untrack(mutation);
            if let MutationPayload::ListInsert { item } = &mutation.payload {
                self.stale_inserts.remove(&item.id);
                self.lost_inserts.remove(&item.id);
            }
        }
        if !sequenced.is_empty() {
            info!(
                "{} pending mutations were sequenced before summary {}",
                sequenced.len(),
                self.last_applied
            );
        }
    }

    fn rebase_all_pending(&mut self) {
        let replay: Vec<Mutation> = self.pending.iter().cloned().collect();
        for mutation in replay {
            if let Err(e) = self.apply(&mutation.target, &mutation.payload, ChangeOrigin::Local) {
                debug!("Pending mutation on {} no longer applies: {}", mutation.target, e);
            }
        }
    }

    pub fn process_operation(&mut self, op: Operation) -> Result<ProcessOutcome, RuntimeError> {
        self.ensure_live()?;
        let seq = op.sequence_number;
        if seq <= self.last_applied {
            trace!("Duplicate op {} (last applied {})", seq, self.last_applied);
            return Ok(ProcessOutcome::Duplicate);
        }

        match self.state {
            AttachState::Detached => return Err(RuntimeError::InvalidState(self.state)),
            AttachState::Attaching => {
                self.reorder.insert(seq, op);
                return Ok(ProcessOutcome::Buffered);
            }
            _ => {}
        }

        if seq > self.last_applied + 1 {
            self.reorder.insert(seq, op);
            let gap = seq - self.last_applied;
            if gap > self.config.resync_gap_threshold
                || self.reorder.len() > self.config.max_reorder_buffer
            {
                warn!(
                    "Sequence gap after {} (received {}, {} buffered), resync required",
                    self.last_applied,
                    seq,
                    self.reorder.len()
                );
                return Ok(ProcessOutcome::ResyncRequired);
            }
            return Ok(ProcessOutcome::Buffered);
        }

        let outcome = self.apply_sequenced(op);
        self.drain_reorder();
        Ok(outcome)
    }

    fn drain_reorder(&mut self) {
        let stale = self.reorder.split_off(&(self.last_applied + 1));
        let dropped = std::mem::replace(&mut self.reorder, stale).len();
        if dropped > 0 {
            trace!("Discarded {} already-applied buffered ops", dropped);
        }
        while let Some(op) = self.reorder.remove(&(self.last_applied + 1)) {
            self.apply_sequenced(op);
        }
    }

    fn apply_sequenced(&mut self, op: Operation) -> ProcessOutcome {
        let seq = op.sequence_number;
        self.last_applied = seq;
        let mutation = op.mutation;
        let watermark = self.client_sequences.entry(mutation.client_id).or_insert(0);
        *watermark = (*watermark).max(mutation.local_sequence);

        if mutation.client_id == self.client_id {
            if let Some(index) = self
                .pending
                .iter()
                .position(|m| m.local_sequence == mutation.local_sequence)
            {
                if let Some(confirmed) = self.pending.remove(index) {
                    self.untrack(&confirmed);
                    if let MutationPayload::ListInsert { item } = &confirmed.payload {
                        self.confirm_insert(&confirmed.target, item);
                    }
                }
                return ProcessOutcome::Confirmed;
            }
        }

        if self.superseded(&mutation) {
            debug!(
                "Op {} ({} on {}) superseded by a pending local mutation",
                seq,
                mutation.payload.kind(),
                mutation.target
            );
            return ProcessOutcome::Superseded;
        }

        // Both sides inserted the same item id: the remote insert wins the
        // list slot, local edits to the item are layered back on top.
        let conflicting_insert = match &mutation.payload {
            MutationPayload::ListInsert { item } => {
                self.has_pending_slot(&mutation.target, item.id.as_str())
                    && self.objects.contains_key(&item.id)
            }
            _ => false,
        };
        if conflicting_insert {
            if let MutationPayload::ListInsert { item } = &mutation.payload {
                self.lost_inserts.insert(item.id.clone());
                let remove = MutationPayload::ListRemove { id: item.id.clone() };
                if let Err(e) = self.apply(&mutation.target, &remove, ChangeOrigin::Remote) {
                    debug!("Could not replace local item {}: {}", item.id, e);
                }
            }
        }

        match self.apply(&mutation.target, &mutation.payload, ChangeOrigin::Remote) {
            Ok(_) => {
                if self
                    .parents
                    .get(&mutation.target)
                    .is_some_and(|list| self.has_pending_slot(list, mutation.target.as_str()))
                {
                    self.stale_inserts.insert(mutation.target.clone());
                }
                if mutation.payload.is_whole_object() {
                    self.reapply_pending(&mutation.target);
                }
                if let MutationPayload::ListInsert { item } = &mutation.payload {
                    self.reapply_pending(&item.id);
                }
                ProcessOutcome::Applied
            }
            Err(e) => {
                warn!("Dropping op {} on {}: {}", seq, mutation.target, e);
                ProcessOutcome::Dropped
            }
        }
    }

    /// Every other replica now holds `item` exactly as inserted, without
    /// remote edits this replica applied while the insert was pending.
    fn confirm_insert(&mut self, list: &ObjectId, item: &ObjectSnapshot) {
        let stale = self.stale_inserts.remove(&item.id);
        if self.lost_inserts.remove(&item.id) || !stale {
            return;
        }
        let remove = MutationPayload::ListRemove { id: item.id.clone() };
        let insert = MutationPayload::ListInsert { item: item.clone() };
        for payload in [remove, insert] {
            if let Err(e) = self.apply(list, &payload, ChangeOrigin::Remote) {
                debug!("Could not reset inserted item {}: {}", item.id, e);
                return;
            }
        }
        self.reapply_pending(&item.id);
    }

    /// Start (re)joining. Remote operations are buffered until
    /// [`complete_attach`](Self::complete_attach).
    pub fn begin_attach(&mut self) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        self.state = AttachState::Attaching;
        Ok(())
    }

    /// Install the server's initial state, replay buffered operations and
    /// resubmit everything still pending. Returns the number of operations
    /// applied.
    pub fn complete_attach(&mut self, initial: InitialDocument) -> Result<usize, RuntimeError> {
        self.ensure_live()?;
        if self.state != AttachState::Attaching {
            return Err(RuntimeError::InvalidState(self.state));
        }

        if let Some(tree) = &initial.summary {
            let summary = DocumentSummary::from_tree(tree)?;
            if summary.attributes.sequence_number > self.last_applied || self.objects.is_empty() {
                self.load_summary(summary)?;
            } else {
                debug!(
                    "Ignoring summary at {} (already at {})",
                    summary.attributes.sequence_number, self.last_applied
                );
            }
        }

        self.state = AttachState::Attached;
        self.ever_attached = true;

        let before = self.last_applied;
        let mut operations = initial.operations;
        operations.sort_by_key(|op| op.sequence_number);
        for op in operations {
            if op.sequence_number > self.last_applied + 1 {
                self.reorder.insert(op.sequence_number, op);
                continue;
            }
            if op.sequence_number == self.last_applied + 1 {
                self.apply_sequenced(op);
            }
        }
        self.drain_reorder();

        self.requeue_pending();
        let applied = (self.last_applied - before) as usize;
        info!(
            "Attached to document {} at sequence {} ({} ops applied, {} pending resubmitted)",
            self.document_id,
            self.last_applied,
            applied,
            self.pending.len()
        );
        Ok(applied)
    }

    /// Resend every pending mutation with a fresh reference sequence.
    fn requeue_pending(&mut self) {
        self.outbound.clear();
        for mutation in &self.pending {
            self.outbound.push(OutboundMutation {
                mutation: mutation.clone(),
                reference_sequence_number: self.last_applied,
            });
        }
    }

    /// The transport dropped. Local edits keep working and are resent on
    /// the next attach.
    pub fn connection_lost(&mut self) {
        if self.state == AttachState::Attached {
            info!("Document {} detached at sequence {}", self.document_id, self.last_applied);
            self.state = AttachState::Attaching;
        }
    }

    pub fn dispose(&mut self) {
        if self.state == AttachState::Disposed {
            return;
        }
        self.state = AttachState::Disposed;
        self.objects.clear();
        self.parents.clear();
        self.pending.clear();
        self.pending_slots.clear();
        self.pending_whole.clear();
        self.lost_inserts.clear();
        self.stale_inserts.clear();
        self.outbound.clear();
        self.reorder.clear();
        self.client_sequences.clear();
        self.history.clear();
        self.open = None;
        self.listeners.clear();
        debug!("Disposed runtime for document {}", self.document_id);
    }

    /// Open a transaction, or nest into the open one.
    pub fn begin_transaction(&mut self) -> Result<TransactionHandle, RuntimeError> {
        self.ensure_live()?;
        if let Some(open) = self.open.as_mut() {
            open.depth += 1;
            return Ok(open.handle);
        }
        let handle = TransactionHandle(self.next_transaction);
        self.next_transaction += 1;
        self.open = Some(OpenTransaction {
            handle,
            depth: 1,
            transaction: Transaction::new(),
        });
        Ok(handle)
    }

    /// Close one nesting level. The outermost commit pushes the
    /// transaction onto the undo stack; returns whether it did.
    pub fn commit_transaction(&mut self, handle: TransactionHandle) -> Result<bool, RuntimeError> {
        let open = self
            .open
            .as_mut()
            .filter(|open| open.handle == handle)
            .ok_or(RuntimeError::NoTransaction)?;
        open.depth -= 1;
        if open.depth > 0 {
            return Ok(false);
        }
        match self.open.take() {
            Some(open) => Ok(self.history.commit(open.transaction)),
            None => Ok(false),
        }
    }

    /// Run `f` inside a transaction. Mutations applied before an error are
    /// kept and committed.
    pub fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let handle = self.begin_transaction()?;
        let result = f(self);
        self.commit_transaction(handle)?;
        result
    }

    pub fn can_undo(&self) -> bool {
        self.open.as_ref().is_some_and(|o| !o.transaction.is_empty()) || self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Revert the open transaction if it has changes, otherwise the last
    /// committed one. Returns `false` when there was nothing to undo.
    pub fn undo(&mut self) -> Result<bool, RuntimeError> {
        self.ensure_live()?;
        if let Some(open) = self.open.take() {
            if !open.transaction.is_empty() {
                self.replay(open.transaction.undo_mutations());
                return Ok(true);
            }
            self.open = Some(open);
        }
        let Some(transaction) = self.history.pop_undo() else {
            return Ok(false);
        };
        self.replay(transaction.undo_mutations());
        self.history.push_redo(transaction);
        Ok(true)
    }

    pub fn redo(&mut self) -> Result<bool, RuntimeError> {
        self.ensure_live()?;
        let Some(transaction) = self.history.pop_redo() else {
            return Ok(false);
        };
        self.replay(transaction.redo_mutations());
        self.history.push_undo(transaction);
        Ok(true)
    }

    fn replay(&mut self, mutations: Vec<(ObjectId, MutationPayload)>) {
        self.replaying = true;
        for (target, payload) in mutations {
            if let Err(e) = self.submit_local(&target, payload) {
                warn!("Skipping history entry on {}: {}", target, e);
            }
        }
        self.replaying = false;
    }

    fn document_summary(&self) -> DocumentSummary {
        let mut objects: Vec<ObjectRecord> = self
            .objects
            .values()
            .map(|object| ObjectRecord {
                snapshot: object.create_snapshot(),
                parent: self.parents.get(object.id()).cloned(),
            })
            .collect();
        objects.sort_by(|a, b| a.snapshot.id.cmp(&b.snapshot.id));
        DocumentSummary {
            attributes: DocumentAttributes {
                document_id: self.document_id,
                sequence_number: self.last_applied,
                create_time: self.create_time,
                root: self.root.clone(),
                client_sequences: self.client_sequences.clone(),
            },
            objects,
        }
    }

    /// Full summary of the current state.
    pub fn summarize(&self) -> Result<SummaryTree, RuntimeError> {
        Ok(self.document_summary().to_tree(|_| false)?)
    }

    /// Summary where objects unchanged since the last
    /// [`mark_summarized`](Self::mark_summarized) are handles.
    pub fn summarize_incremental(&self) -> Result<SummaryTree, RuntimeError> {
        let base = self.has_summary_base;
        Ok(self
            .document_summary()
            .to_tree(|id| base && !self.dirty.contains(id))?)
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// The last summary was stored; start tracking changes from here.
    pub fn mark_summarized(&mut self) {
        self.dirty.clear();
        self.has_summary_base = true;
    }

    /// Replace all objects with the contents of a summary, then re-apply
    /// pending local mutations on top.
    pub fn load_summary(&mut self, summary: DocumentSummary) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        let attributes = summary.attributes;
        if attributes.document_id != self.document_id {
            return Err(SummaryError::Attributes(format!(
                "summary belongs to document {}, expected {}",
                attributes.document_id, self.document_id
            ))
            .into());
        }

        let mut objects = HashMap::with_capacity(summary.objects.len());
        let mut parents = HashMap::new();
        for record in summary.objects {
            let ObjectSnapshot {
                id,
                type_name,
                content,
            } = record.snapshot;
            let mut object = self.registry.create(&type_name, id.clone())?;
            object.load_snapshot(content)?;
            if let Some(parent) = record.parent {
                parents.insert(id.clone(), parent);
            }
            objects.insert(id, object);
        }

        self.objects = objects;
        self.parents = parents;
        self.root = attributes.root;
        self.create_time = attributes.create_time;
        self.last_applied = attributes.sequence_number;
        self.client_sequences = attributes.client_sequences;
        self.dirty.clear();
        self.has_summary_base = true;

        let mut loaded: Vec<ObjectId> = self.objects.keys().cloned().collect();
        loaded.sort();
        for id in loaded {
            self.emit(ChangeEvent {
                object: id,
                property: ChangedProperty::Loaded,
                origin: ChangeOrigin::Remote,
            });
        }

        self.drop_summarized_pending();
        self.rebase_all_pending();
        debug!(
            "Loaded summary for {} at sequence {} ({} objects)",
            self.document_id,
            self.last_applied,
            self.objects.len()
        );
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
