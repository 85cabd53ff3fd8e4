#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// The active canvas and its element array
pub mod canvas;

/// Configuration options
pub mod config;

/// Replication (sessions, bindings, canvas replication, versions)
pub mod crdt;

/// Error (common error types)
pub mod error;

/// Session and presence event callbacks
pub mod events;

/// Persisted entities (files, canvases, elements, versions)
pub mod model;

/// Peer presence (awareness)
pub mod presence;

/// Network transport for collaborative sessions
pub mod transport;

/// Sidebar hierarchy ordering
pub mod tree;

#[cfg(test)]
pub mod test_utils;
