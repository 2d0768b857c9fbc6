//! Message channel between a client and the sync server.
//!
//! The runtime needs per-connection ordering and at-least-once delivery;
//! deduplication happens in the runtime by sequence number. Two
//! implementations:
//!
//! - [`WebSocketTransport`]: binary WebSocket frames (tokio-tungstenite).
//! - [`LocalTransport`]: in-process byte channels into a `SyncServer`,
//!   running the same session loop as a socket connection.

pub mod local;
pub mod websocket;

use std::future::Future;

use crate::protocol::{ProtocolError, SyncMessage};

pub use local::LocalTransport;
pub use websocket::WebSocketTransport;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport is not connected")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub trait Transport: Send {
    /// Open the channel. Calling it again after a drop reconnects.
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send(&mut self, msg: &SyncMessage) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next message from the server. `None` once the channel closed.
    /// Undecodable frames are logged and skipped. Cancel safe.
    fn recv(&mut self) -> impl Future<Output = Option<SyncMessage>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;
}
