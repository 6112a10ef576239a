//! Session messages — the typed view of one wire message.
//!
//! A message is a header (flat JSON object) plus an optional body. The
//! `type` header selects the variant; each variant owns a small header
//! schema decoded through [`DECODERS`].

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::peer::{Peer, PublicKey};
use crate::wire::{self, WireError};

/// Ordered header map. Keys keep insertion order on the wire.
pub type Headers = serde_json::Map<String, Value>;

// ── Kinds ─────────────────────────────────────────────────────────────────────

/// Message type discriminator, carried as the `type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Identity,
    DataTransfer,
    TransportUpgrade,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::DataTransfer => "datatransfer",
            Self::TransportUpgrade => "transport-upgrade",
        }
    }
}

/// Variant-specific content decoded from the header.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Announces the sender. Never has a body.
    Identity { peer: Peer },
    /// Application data. The body is the payload; `extra` carries
    /// application-defined headers.
    DataTransfer { extra: Option<Headers> },
    /// Asks the receiver to bring up the transport with this code.
    TransportUpgrade { transport_code: u32 },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Identity { .. } => MessageKind::Identity,
            Self::DataTransfer { .. } => MessageKind::DataTransfer,
            Self::TransportUpgrade { .. } => MessageKind::TransportUpgrade,
        }
    }
}

type Decoder = fn(&Headers) -> Result<Payload, WireError>;

/// Type dispatch table. Headers whose `type` is not listed here are dropped
/// by the deserializer.
pub const DECODERS: &[(&str, Decoder)] = &[
    ("identity", decode_identity),
    ("datatransfer", decode_data_transfer),
    ("transport-upgrade", decode_transport_upgrade),
];

fn decode_identity(headers: &Headers) -> Result<Payload, WireError> {
    let pubkey = headers
        .get(wire::HEADER_PUBKEY)
        .ok_or(WireError::MissingField(wire::HEADER_PUBKEY))?
        .as_str()
        .and_then(PublicKey::from_base64)
        .ok_or(WireError::InvalidField { key: wire::HEADER_PUBKEY })?;
    let alias = headers
        .get(wire::HEADER_ALIAS)
        .and_then(Value::as_str)
        .unwrap_or_default();
    let transports = match headers.get(wire::HEADER_TRANSPORTS) {
        None | Some(Value::Null) => 0,
        Some(v) => v
            .as_u64()
            .and_then(|t| u32::try_from(t).ok())
            .ok_or(WireError::InvalidField { key: wire::HEADER_TRANSPORTS })?,
    };
    Ok(Payload::Identity {
        peer: Peer::new(pubkey, alias, transports),
    })
}

fn decode_data_transfer(headers: &Headers) -> Result<Payload, WireError> {
    let extra = match headers.get(wire::HEADER_EXTRA) {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map.clone()),
        Some(_) => return Err(WireError::InvalidField { key: wire::HEADER_EXTRA }),
    };
    Ok(Payload::DataTransfer { extra })
}

fn decode_transport_upgrade(headers: &Headers) -> Result<Payload, WireError> {
    let code = headers
        .get(wire::HEADER_TRANSPORT_CODE)
        .ok_or(WireError::MissingField(wire::HEADER_TRANSPORT_CODE))?
        .as_u64()
        .and_then(|c| u32::try_from(c).ok())
        .ok_or(WireError::InvalidField { key: wire::HEADER_TRANSPORT_CODE })?;
    Ok(Payload::TransportUpgrade { transport_code: code })
}

// ── Body ──────────────────────────────────────────────────────────────────────

/// Where a message body lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Memory(Bytes),
    /// Streamed to an overflow sink because it exceeded the in-memory cutoff.
    /// `location` is whatever the sink reported, typically a file path.
    Overflow { length: u64, location: Option<PathBuf> },
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(b) => b.len() as u64,
            Self::Overflow { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Memory(b) => Some(b),
            Self::Overflow { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Header decoded, body still arriving.
    HeaderOnly,
    /// Header and full body present.
    Complete,
}

// ── Message ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    id: String,
    payload: Payload,
    headers: Headers,
    /// Serialized header JSON, cached so chunking never re-encodes.
    header_bytes: Bytes,
    body_length: u64,
    body: Option<Body>,
    status: Status,
}

/// 128 random bits as lowercase hex.
pub fn generate_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Parse a raw header (the JSON bytes between prefix and body) into its map.
pub fn parse_headers(raw: &[u8]) -> Result<Headers, WireError> {
    match serde_json::from_slice::<Value>(raw)? {
        Value::Object(headers) => Ok(headers),
        _ => Err(WireError::HeaderNotObject),
    }
}

impl SessionMessage {
    /// Our own identity, sent first on every new connection.
    pub fn identity(peer: &Peer) -> Self {
        Self::outgoing(generate_id(), Payload::Identity { peer: peer.clone() }, None)
    }

    /// Application data with optional extra headers.
    pub fn data_transfer(data: impl Into<Bytes>, extra: Option<Headers>) -> Self {
        Self::data_transfer_body(Body::Memory(data.into()), extra)
    }

    /// Application data whose body may live on disk. Overflow bodies are
    /// read from their location as chunks are cut.
    pub fn data_transfer_body(body: Body, extra: Option<Headers>) -> Self {
        Self::outgoing(generate_id(), Payload::DataTransfer { extra }, Some(body))
    }

    pub fn transport_upgrade(transport_code: u32) -> Self {
        Self::outgoing(generate_id(), Payload::TransportUpgrade { transport_code }, None)
    }

    /// Replace the generated id. Only meaningful before the message is queued.
    pub fn with_id(self, id: impl Into<String>) -> Self {
        Self::outgoing(id.into(), self.payload, self.body)
    }

    fn outgoing(id: String, payload: Payload, body: Option<Body>) -> Self {
        let body_length = body.as_ref().map(Body::len).unwrap_or(0);
        let mut headers = Headers::new();
        headers.insert(wire::HEADER_ID.into(), Value::from(id.clone()));
        headers.insert(wire::HEADER_TYPE.into(), Value::from(payload.kind().as_str()));
        headers.insert(wire::HEADER_BODY_LENGTH.into(), Value::from(body_length));
        match &payload {
            Payload::Identity { peer } => {
                headers.insert(wire::HEADER_ALIAS.into(), Value::from(peer.alias.clone()));
                headers.insert(wire::HEADER_PUBKEY.into(), Value::from(peer.public_key.to_base64()));
                headers.insert(wire::HEADER_TRANSPORTS.into(), Value::from(peer.transports));
            }
            Payload::DataTransfer { extra } => {
                if let Some(extra) = extra {
                    headers.insert(wire::HEADER_EXTRA.into(), Value::Object(extra.clone()));
                }
            }
            Payload::TransportUpgrade { transport_code } => {
                headers.insert(wire::HEADER_TRANSPORT_CODE.into(), Value::from(*transport_code));
            }
        }
        let header_bytes = encode_headers(&headers);
        Self {
            id,
            payload,
            headers,
            header_bytes,
            body_length,
            body,
            status: Status::Complete,
        }
    }

    /// Build a message from a decoded header, as received from a peer.
    /// The body, if any, is attached later with [`SessionMessage::set_body`].
    pub fn from_headers(headers: Headers) -> Result<Self, WireError> {
        let kind = headers
            .get(wire::HEADER_TYPE)
            .ok_or(WireError::MissingField(wire::HEADER_TYPE))?
            .as_str()
            .ok_or(WireError::InvalidField { key: wire::HEADER_TYPE })?;
        let body_length = headers
            .get(wire::HEADER_BODY_LENGTH)
            .ok_or(WireError::MissingField(wire::HEADER_BODY_LENGTH))?
            .as_u64()
            .ok_or(WireError::InvalidField { key: wire::HEADER_BODY_LENGTH })?;
        let decode = DECODERS
            .iter()
            .find(|(name, _)| *name == kind)
            .map(|(_, decode)| *decode)
            .ok_or_else(|| WireError::UnknownType(kind.to_string()))?;
        let payload = decode(&headers)?;

        let id = match headers.get(wire::HEADER_ID).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => generate_id(),
        };

        let header_bytes = encode_headers(&headers);
        Ok(Self {
            id,
            payload,
            headers,
            header_bytes,
            body_length,
            body: None,
            status: if body_length == 0 {
                Status::Complete
            } else {
                Status::HeaderOnly
            },
        })
    }

    /// Attach the received body. The length must match `body-length`.
    pub fn set_body(&mut self, body: Body) -> Result<(), WireError> {
        if self.body.is_some() {
            return Err(WireError::BodyAlreadySet(self.id.clone()));
        }
        if body.len() != self.body_length {
            return Err(WireError::BodyLengthMismatch {
                declared: self.body_length,
                actual: body.len(),
            });
        }
        self.body = Some(body);
        self.status = Status::Complete;
        Ok(())
    }

    /// Mark a body-less variant complete after its (ignored) body bytes were consumed.
    pub(crate) fn complete_without_body(&mut self) {
        self.status = Status::Complete;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn body_length(&self) -> u64 {
        self.body_length
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn header_len(&self) -> usize {
        self.header_bytes.len()
    }

    /// Total serialized size: prefix + header + body.
    pub fn total_length(&self) -> u64 {
        (wire::PREFIX_BYTES + self.header_bytes.len()) as u64 + self.body_length
    }

    /// Serialize up to `len` bytes of this message starting at `offset`.
    ///
    /// Returns `Ok(None)` once `offset` reaches the end of the message. The
    /// range may span prefix, header, and body in a single slice.
    pub fn serialize_range(&self, offset: u64, len: usize) -> Result<Option<Bytes>, WireError> {
        let total = self.total_length();
        if offset >= total || len == 0 {
            return Ok(None);
        }
        let header_len = u32::try_from(self.header_bytes.len())
            .map_err(|_| WireError::HeaderTooLarge(self.header_bytes.len()))?;
        let end = total.min(offset + len as u64);
        let mut out = BytesMut::with_capacity((end - offset) as usize);

        let prefix = wire::encode_prefix(header_len);
        let header_start = wire::PREFIX_BYTES as u64;
        let body_start = header_start + self.header_bytes.len() as u64;

        copy_overlap(&mut out, 0, &prefix, offset, end);
        copy_overlap(&mut out, header_start, &self.header_bytes, offset, end);

        if end > body_start {
            match &self.body {
                Some(Body::Memory(b)) => copy_overlap(&mut out, body_start, b, offset, end),
                Some(Body::Overflow { location: Some(path), .. }) => {
                    let from = offset.max(body_start) - body_start;
                    read_file_range(path, from, end - body_start, &mut out).map_err(|source| {
                        WireError::BodyUnreadable {
                            id: self.id.clone(),
                            source,
                        }
                    })?;
                }
                _ => return Err(WireError::BodyNotInMemory(self.id.clone())),
            }
        }

        Ok(Some(out.freeze()))
    }

    /// Serialize the whole message in one buffer.
    pub fn to_bytes(&self) -> Result<Bytes, WireError> {
        let total = usize::try_from(self.total_length()).unwrap_or(usize::MAX);
        Ok(self.serialize_range(0, total)?.unwrap_or_default())
    }
}

/// Append the part of `segment` (which starts at `segment_start` in the
/// message) that falls inside `[from, to)`.
fn copy_overlap(out: &mut BytesMut, segment_start: u64, segment: &[u8], from: u64, to: u64) {
    let segment_end = segment_start + segment.len() as u64;
    let lo = from.max(segment_start);
    let hi = to.min(segment_end);
    if lo < hi {
        out.extend_from_slice(&segment[(lo - segment_start) as usize..(hi - segment_start) as usize]);
    }
}

fn read_file_range(path: &Path, from: u64, to: u64, out: &mut BytesMut) -> io::Result<()> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    let start = out.len();
    out.resize(start + (to - from) as usize, 0);
    file.read_exact(&mut out[start..])
}

fn encode_headers(headers: &Headers) -> Bytes {
    Bytes::from(Value::Object(headers.clone()).to_string())
}

// ── Data transfer view ────────────────────────────────────────────────────────

/// A message statically known to be a DataTransfer.
///
/// Transfers only ever wrap this type, so handing any other variant to the
/// transfer layer is rejected at the conversion rather than at runtime later.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTransferMessage(SessionMessage);

impl TryFrom<SessionMessage> for DataTransferMessage {
    type Error = SessionMessage;

    fn try_from(message: SessionMessage) -> Result<Self, Self::Error> {
        match message.kind() {
            MessageKind::DataTransfer => Ok(Self(message)),
            _ => Err(message),
        }
    }
}

impl DataTransferMessage {
    pub fn new(data: impl Into<Bytes>, extra: Option<Headers>) -> Self {
        Self(SessionMessage::data_transfer(data, extra))
    }

    /// Send the file at `path` without loading it. The file must stay in
    /// place, unchanged, until the transfer completes.
    pub fn from_file(path: impl Into<PathBuf>, extra: Option<Headers>) -> io::Result<Self> {
        let path = path.into();
        let length = std::fs::metadata(&path)?.len();
        let body = Body::Overflow {
            length,
            location: Some(path),
        };
        Ok(Self(SessionMessage::data_transfer_body(body, extra)))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn body(&self) -> Option<&Body> {
        self.0.body()
    }

    pub fn extra(&self) -> Option<&Headers> {
        match self.0.payload() {
            Payload::DataTransfer { extra } => extra.as_ref(),
            _ => None,
        }
    }

    pub fn message(&self) -> &SessionMessage {
        &self.0
    }

    pub fn into_message(self) -> SessionMessage {
        self.0
    }
}
