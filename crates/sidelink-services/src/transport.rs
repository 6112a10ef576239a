//! Transport contract — what a physical link reports to the session layer.
//!
//! Links are addressed by a [`PeerId`], an opaque transport identifier such
//! as a socket address or a radio device address. The same participant may
//! appear under different identifiers over time; the mapping to a
//! [`sidelink_core::Peer`] happens once its identity message arrives.
//!
//! A link takes chunks from the [`crate::ChunkQueue`], declares its MTU there
//! when it comes up, and reports everything else as a [`TransportEvent`].

use std::fmt;
use std::io;

use bytes::Bytes;

/// Transport-level identifier of the remote end of a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<std::net::SocketAddr> for PeerId {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("write to {peer} failed: {source}")]
    Io {
        peer: PeerId,
        #[source]
        source: io::Error,
    },
}

/// Link activity, delivered to the session manager over one channel so all
/// bookkeeping happens in a single context.
#[derive(Debug)]
pub enum TransportEvent {
    DataReceived {
        peer: PeerId,
        bytes: Bytes,
    },
    /// A whole enqueued payload reached the link.
    DataSent {
        peer: PeerId,
        len: usize,
    },
    /// The head chunk could not be written; it stays queued for retry.
    SendFailed {
        peer: PeerId,
        error: TransportError,
    },
    StatusChanged {
        peer: PeerId,
        status: ConnectionStatus,
        is_host: bool,
    },
}
