//! # osucad-collab: Multiplayer document synchronization for osucad
//!
//! Lets many clients edit one beatmap document concurrently. Every change
//! is a mutation on a shared object; a single server assigns each one a
//! sequence number, and every replica applies the same sequence to reach
//! the same state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    Transport     ┌──────────────────┐
//! │ SyncClient       │ ◄──────────────► │ SyncServer       │
//! │  DocumentRuntime │   Binary Proto   │  Room            │
//! │  (optimistic)    │                  │   Sequencer      │
//! └──────────────────┘                  │   DocumentRuntime│
//!                                       │   (replica)      │
//!                                       └────────┬─────────┘
//!                                  ┌─────────────┴────────────┐
//!                                  ▼                          ▼
//!                          ┌───────────────┐         ┌────────────────┐
//!                          │ BroadcastGroup│         │ StorageBackend │
//!                          │ (fan-out)     │         │ versions + ops │
//!                          └───────────────┘         └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`value`]: Dynamic values carried by mutations
//! - [`object`]: Shared object model: maps, sorted lists, type registry
//! - [`op`] / [`codec`]: Mutations, sequenced operations, binary encoding
//! - [`runtime`]: Per-document state machine: pending local edits,
//!   confirmation, dedup, reordering, attach and resync
//! - [`history`]: Transactions and undo/redo
//! - [`summary`]: Snapshot trees with incremental handles
//! - [`beatmap`]: Beatmap document schema
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`transport`]: WebSocket and in-process transports
//! - [`broadcast`]: Room-based fan-out with backpressure
//! - [`presence`]: Users, colors, signals
//! - [`server`]: Ordering service and rooms
//! - [`client`]: Sync client
//! - [`storage`]: Versioned document storage (RocksDB, in-memory)

pub mod beatmap;
pub mod broadcast;
pub mod client;
pub mod codec;
pub mod history;
pub mod object;
pub mod op;
pub mod presence;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod summary;
pub mod transport;
pub mod value;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ClientConfig, ClientError, ClientEvent, ConnectionState, SyncClient};
pub use codec::CodecError;
pub use history::{Transaction, TransactionHandle, UndoStack};
pub use object::registry::TypeRegistry;
pub use object::{
    ChangeEvent, ChangeOrigin, ChangedProperty, MutationPayload, ObjectError, ObjectId,
    ObjectSnapshot, SharedMap, SharedObject, SharedSortedList,
};
pub use op::{ClientId, DocumentId, Mutation, Operation, OutboundMutation};
pub use presence::{PresenceRoom, SignalThrottle, UserInfo};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use runtime::{AttachState, DocumentRuntime, InitialDocument, ProcessOutcome, RuntimeConfig, RuntimeError};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{MemoryStorage, RocksStorage, StorageBackend, StoreConfig, StoreError};
pub use summary::{SummaryObject, SummaryTree};
pub use transport::{LocalTransport, Transport, TransportError, WebSocketTransport};
pub use value::Value;
