//! Transport layer for extending a bus across process boundaries.
//!
//! Supports:
//! - Peer mesh: Unix domain sockets in a shared directory (`mesh`)
//! - Mock: in-memory transport for tests (`mock`)
//!
//! A bus treats its transport as a symmetric peer: it hands the transport a
//! channel for inbound messages at attach time, and pushes every locally
//! emitted message to it for outward delivery.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::TRANSPORT_FORWARD_PATTERN;
use crate::message::{Message, MessageError};

pub mod mesh;
pub mod mock;

pub use mesh::{MeshConfig, PeerMeshTransport};
pub use mock::MockTransport;

/// Control event announcing a peer endpoint. Payload: the endpoint path.
pub const PEER_ONLINE_EVENT: &str = "$peerbus.mesh.online";

/// Control event announcing a departing peer. Payload: the endpoint path.
pub const PEER_OFFLINE_EVENT: &str = "$peerbus.mesh.offline";

/// Returns true for event names only the bus and its transport may send:
/// the forwarding marker and the mesh control events.
pub fn is_reserved_event(event: &str) -> bool {
    matches!(
        event,
        TRANSPORT_FORWARD_PATTERN | PEER_ONLINE_EVENT | PEER_OFFLINE_EVENT
    )
}

/// Errors that can occur in a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to create socket directory '{}': {source}", .path.display())]
    CreateRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read socket directory '{}': {source}", .path.display())]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to listen on unix socket '{}': {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Transport is already listening")]
    AlreadyListening,

    #[error("Transport is closed")]
    Closed,

    #[error("Listener task failed: {0}")]
    ListenerTask(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] MessageError),

    #[error("Failed to remove socket '{}': {source}", .path.display())]
    RemoveSocket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove root directory '{}': {source}", .path.display())]
    RemoveRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Close failed: {}", join_errors(.0))]
    Close(Vec<TransportError>),

    #[error("{0}")]
    Other(String),
}

fn join_errors(errors: &[TransportError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl TransportError {
    /// Collapse the failures of a multi-step operation into one result.
    pub(crate) fn from_failures(mut failures: Vec<TransportError>) -> Result<(), TransportError> {
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(TransportError::Close(failures)),
        }
    }
}

/// Interface a bus requires from an attached transport.
///
/// Implementations:
/// - `PeerMeshTransport`: Unix domain socket mesh
/// - `MockTransport`: in-memory mock for testing
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Register the channel that receives messages arriving from peers.
    ///
    /// Called once by the bus when the transport is attached.
    fn subscribe(&self, inbound: mpsc::Sender<Message>);

    /// Deliver a message to every known peer.
    ///
    /// Fire-and-forget: delivery failures are handled by the transport.
    async fn push(&self, msg: Message);

    /// Release all transport resources. Calling it again is a no-op.
    async fn close(&self) -> Result<(), TransportError>;
}
