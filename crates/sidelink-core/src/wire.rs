//! Sidelink wire format — the byte layout of one session message.
//!
//! ```text
//! [version: 1 byte][header-length: 4 bytes LE][header: UTF-8 JSON][body: body-length bytes]
//! ```
//!
//! `header-length` and the header's `body-length` are authoritative. The body
//! follows the header with no delimiter and is omitted when `body-length` is 0.
//! Every implementation exchanging messages must agree on this layout bit for bit.

// ── Layout ────────────────────────────────────────────────────────────────────

/// The only wire version this implementation reads or writes.
/// A stream starting with any other version byte is abandoned.
pub const CURRENT_VERSION: u8 = 0x01;

/// Size of the version field.
pub const VERSION_BYTES: usize = 1;

/// Size of the little-endian header length field.
pub const HEADER_LENGTH_BYTES: usize = 4;

/// Version byte plus header length.
pub const PREFIX_BYTES: usize = VERSION_BYTES + HEADER_LENGTH_BYTES;

/// Largest header accepted from a remote peer. Headers are always buffered
/// in memory, so a larger declared length is fatal to the stream.
pub const MAX_HEADER_BYTES: usize = 1024 * 1024;

/// Bodies longer than this are streamed to an overflow sink instead of memory.
pub const BODY_SIZE_CUTOFF_BYTES: u64 = 2_000_000;

/// Upper bound on a single serializer chunk, whatever the caller asks for.
pub const MAX_CHUNK_BYTES: usize = 500 * 1024;

// ── Header keys ───────────────────────────────────────────────────────────────

pub const HEADER_ID: &str = "id";
pub const HEADER_TYPE: &str = "type";
pub const HEADER_BODY_LENGTH: &str = "body-length";

pub const HEADER_ALIAS: &str = "alias";
pub const HEADER_PUBKEY: &str = "pubkey";
pub const HEADER_TRANSPORTS: &str = "transports";
pub const HEADER_EXTRA: &str = "extra";
pub const HEADER_TRANSPORT_CODE: &str = "transport-code";

// ── Transport codes ───────────────────────────────────────────────────────────

/// Transport codes are bit flags so a peer can advertise several at once.
pub mod transport_codes {
    /// Short-range radio (GATT) link. Small MTU, always available.
    pub const BLE: u32 = 0x01;
    /// Socket link over a local wireless network. Higher bandwidth.
    pub const WIFI: u32 = 0x02;
}

// ── Prefix helpers ────────────────────────────────────────────────────────────

/// Encode the version byte and header length that start every message.
pub fn encode_prefix(header_len: u32) -> [u8; PREFIX_BYTES] {
    let mut prefix = [0u8; PREFIX_BYTES];
    prefix[0] = CURRENT_VERSION;
    prefix[VERSION_BYTES..].copy_from_slice(&header_len.to_le_bytes());
    prefix
}

/// Decode the header length field. `bytes` must hold exactly the 4 length bytes.
pub fn decode_header_length(bytes: [u8; HEADER_LENGTH_BYTES]) -> u32 {
    u32::from_le_bytes(bytes)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting or producing a message header.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("header is not valid JSON: {0}")]
    MalformedHeader(#[from] serde_json::Error),

    #[error("header is not a JSON object")]
    HeaderNotObject,

    #[error("header is missing required key '{0}'")]
    MissingField(&'static str),

    #[error("header key '{key}' has an invalid value")]
    InvalidField { key: &'static str },

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("body of message {0} is neither in memory nor at a known location")]
    BodyNotInMemory(String),

    #[error("body of message {id} could not be read: {source}")]
    BodyUnreadable {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("body already set on message {0}")]
    BodyAlreadySet(String),

    #[error("body length {actual} does not match declared body-length {declared}")]
    BodyLengthMismatch { declared: u64, actual: u64 },

    #[error("header of {0} bytes exceeds the 4-byte length field")]
    HeaderTooLarge(usize),
}

impl WireError {
    /// The message this error belongs to, when it concerns one body.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::BodyNotInMemory(id) | Self::BodyAlreadySet(id) => Some(id),
            Self::BodyUnreadable { id, .. } => Some(id),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
