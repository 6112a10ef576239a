//! Peer identity — who is on the other end of a session.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;

/// Immutable public-key bytes identifying a remote participant.
///
/// Equality and hashing are by content, so two keys decoded from different
/// messages compare equal when the bytes match.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(Bytes);

impl PublicKey {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Standard base64, as carried in the identity header.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Option<Self> {
        // Some encoders wrap long keys; the decoder does not accept whitespace.
        let compact: String = encoded.split_whitespace().collect();
        STANDARD.decode(compact).ok().map(Self::new)
    }

    /// First 8 bytes as hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(8)])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// A remote (or the local) participant.
#[derive(Debug, Clone)]
pub struct Peer {
    pub public_key: PublicKey,
    pub alias: String,
    pub last_seen: SystemTime,
    /// Received signal strength hint from the radio link, when it reports one.
    pub signal_strength: Option<i32>,
    /// Bitmask of supported transport codes (see `wire::transport_codes`).
    pub transports: u32,
}

impl Peer {
    pub fn new(public_key: PublicKey, alias: impl Into<String>, transports: u32) -> Self {
        Self {
            public_key,
            alias: alias.into(),
            last_seen: SystemTime::now(),
            signal_strength: None,
            transports,
        }
    }

    pub fn supports_transport(&self, transport_code: u32) -> bool {
        transport_code != 0 && self.transports & transport_code == transport_code
    }
}

// Peers are the same participant when their keys match, whatever the alias.
impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.public_key.hash(state);
    }
}
