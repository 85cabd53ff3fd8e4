//! Network transport for collaborative sessions.
//!
//! A [`Provider`] carries framed Y-sync and awareness messages for one room.
//! Providers never touch the replica: network I/O happens wherever the
//! provider likes (a tokio runtime for [`WebSocketProvider`]), and inbound
//! traffic is queued until the owning session drains it with
//! [`ReplicatedDocumentSession::poll`](crate::crdt::ReplicatedDocumentSession::poll).

use std::sync::Arc;

use crate::error::Result;

mod memory;
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
mod websocket;

pub use memory::{MemoryHub, MemoryProvider};
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub use websocket::{WebSocketProvider, WebSocketTransport};

/// Something that happened on a provider's connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// The connection is established; the session should start the handshake.
    Connected,
    /// The connection was closed on request.
    Disconnected,
    /// A framed message arrived.
    Message(Vec<u8>),
    /// The connection failed or dropped. Providers do not reconnect on their own.
    ConnectionError(String),
}

/// Connection to the peers of a single room.
pub trait Provider: Send + Sync {
    /// Room this provider is bound to.
    fn room(&self) -> &str;

    /// Open the connection. Completion is reported as [`ProviderEvent::Connected`]
    /// or [`ProviderEvent::ConnectionError`].
    fn connect(&self) -> Result<()>;

    /// Close the connection.
    fn disconnect(&self);

    /// Whether the connection is currently open.
    fn is_connected(&self) -> bool;

    /// Send a framed message to the other peers of the room.
    fn send(&self, message: Vec<u8>) -> Result<()>;

    /// Take all events queued since the last call.
    fn drain_events(&self) -> Vec<ProviderEvent>;
}

/// Allocates providers for rooms.
pub trait Transport: Send + Sync {
    /// Create a (disconnected) provider for `room`.
    fn provider(&self, room: &str) -> Result<Arc<dyn Provider>>;
}
