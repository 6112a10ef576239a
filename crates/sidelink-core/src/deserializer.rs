//! Incoming side of a session: rebuilds messages from an in-order byte stream.
//!
//! Bytes may arrive in any fragmentation, from single bytes to bursts holding
//! several messages. Parsing walks a fixed sequence of states:
//!
//! ```text
//! AwaitingVersion → AwaitingHeaderLength → AwaitingHeader
//!     → AwaitingBodyBoundary → AwaitingBody → Complete
//! ```
//!
//! The typed message is announced as soon as its header is parsed, before
//! any body byte. Bodies above [`BODY_SIZE_CUTOFF_BYTES`] bypass memory and
//! go straight to an overflow sink.
//!
//! A stream that starts with an unknown version is abandoned until
//! `reset(true)`. Malformed or unknown headers only cost the one message.

use std::io;

use bytes::BytesMut;
use serde_json::Value;

use crate::message::{self, Body, MessageKind, SessionMessage};
use crate::sink::{FileSinkFactory, OverflowSink, OverflowSinkFactory};
use crate::wire::{
    self, WireError, BODY_SIZE_CUTOFF_BYTES, CURRENT_VERSION, HEADER_LENGTH_BYTES, MAX_HEADER_BYTES,
};

const INITIAL_BUFFER_BYTES: usize = 5 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeserializerState {
    AwaitingVersion,
    AwaitingHeaderLength,
    AwaitingHeader,
    AwaitingBodyBoundary,
    AwaitingBody,
    /// A message was just delivered; the next byte starts a new one.
    Complete,
    /// Unrecoverable stream error. Input is ignored until `reset(true)`.
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("unsupported session message version {0}")]
    UnsupportedVersion(u8),

    #[error("declared header length {0} exceeds the {MAX_HEADER_BYTES} byte limit")]
    HeaderTooLarge(usize),

    #[error("overflow sink failed for message {message_id}: {source}")]
    Sink {
        message_id: String,
        #[source]
        source: io::Error,
    },
}

impl DeserializeError {
    /// True when the whole stream is abandoned rather than one message.
    pub fn is_fatal_to_stream(&self) -> bool {
        !matches!(self, Self::Sink { .. })
    }
}

/// Receives deserialization events. Passed to each `data_received` call so
/// the deserializer never holds on to application callbacks.
pub trait DeserializerListener {
    fn on_header_ready(&mut self, _message: &SessionMessage) {}

    fn on_body_progress(&mut self, _message: &SessionMessage, _progress: f32) {}

    fn on_complete(&mut self, result: Result<SessionMessage, DeserializeError>);
}

/// Owned form of the listener callbacks.
#[derive(Debug)]
pub enum DeserializerEvent {
    HeaderReady(SessionMessage),
    BodyProgress { message_id: String, progress: f32 },
    Complete(Result<SessionMessage, DeserializeError>),
}

impl DeserializerListener for Vec<DeserializerEvent> {
    fn on_header_ready(&mut self, message: &SessionMessage) {
        self.push(DeserializerEvent::HeaderReady(message.clone()));
    }

    fn on_body_progress(&mut self, message: &SessionMessage, progress: f32) {
        self.push(DeserializerEvent::BodyProgress {
            message_id: message.id().to_string(),
            progress,
        });
    }

    fn on_complete(&mut self, result: Result<SessionMessage, DeserializeError>) {
        self.push(DeserializerEvent::Complete(result));
    }
}

pub struct SessionMessageDeserializer {
    /// Bytes of the structural unit being assembled: the header length,
    /// the header, or an in-memory body.
    buffer: BytesMut,
    state: DeserializerState,
    header_len: usize,
    body_len: u64,
    body_received: u64,
    /// `None` while skipping the body of a dropped message.
    message: Option<SessionMessage>,
    sink: Option<Box<dyn OverflowSink>>,
    sinks: Box<dyn OverflowSinkFactory>,
    /// Body bytes arrived since the last progress event.
    progress_pending: bool,
}

impl std::fmt::Debug for SessionMessageDeserializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMessageDeserializer")
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("header_len", &self.header_len)
            .field("body_len", &self.body_len)
            .field("body_received", &self.body_received)
            .finish()
    }
}

impl SessionMessageDeserializer {
    pub fn new(sinks: impl OverflowSinkFactory + 'static) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_BYTES),
            state: DeserializerState::AwaitingVersion,
            header_len: 0,
            body_len: 0,
            body_received: 0,
            message: None,
            sink: None,
            sinks: Box::new(sinks),
            progress_pending: false,
        }
    }

    /// Overflow bodies land in `dir`.
    pub fn with_overflow_dir(dir: impl Into<std::path::PathBuf>) -> Self {
        Self::new(FileSinkFactory::new(dir))
    }

    pub fn state(&self) -> DeserializerState {
        self.state
    }

    /// Bytes currently held in memory for the message being assembled.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Prepare for a new message.
    ///
    /// `clear = true` drops everything, including a half-received message and
    /// a stream failure; use it when the byte stream is known to be broken.
    /// `clear = false` only resets per-message parsing state.
    pub fn reset(&mut self, clear: bool) {
        self.header_len = 0;
        self.body_len = 0;
        self.body_received = 0;
        self.message = None;
        self.progress_pending = false;

        if clear {
            self.buffer.clear();
            if let Some(mut sink) = self.sink.take() {
                if let Err(e) = sink.finish() {
                    tracing::debug!(error = %e, "closing abandoned overflow sink failed");
                }
            }
            self.state = DeserializerState::AwaitingVersion;
        } else if self.state != DeserializerState::Failed {
            self.state = DeserializerState::AwaitingVersion;
        }
    }

    /// Feed the next bytes of the stream.
    pub fn data_received(&mut self, mut data: &[u8], listener: &mut dyn DeserializerListener) {
        if self.state == DeserializerState::Failed {
            tracing::trace!(bytes = data.len(), "ignoring input on failed stream");
            return;
        }
        tracing::trace!(bytes = data.len(), state = ?self.state, "data received");

        loop {
            // Advance through every state that needs no more input.
            match self.state {
                DeserializerState::Failed => return,
                DeserializerState::AwaitingHeader if self.buffer.len() >= self.header_len => {
                    self.parse_header(listener);
                    continue;
                }
                DeserializerState::AwaitingBodyBoundary => {
                    self.enter_body(listener);
                    continue;
                }
                DeserializerState::AwaitingBody if self.body_received == self.body_len => {
                    self.finish_message(listener);
                    continue;
                }
                _ => {}
            }

            if data.is_empty() {
                break;
            }

            match self.state {
                DeserializerState::AwaitingVersion | DeserializerState::Complete => {
                    let version = data[0];
                    data = &data[1..];
                    if version != CURRENT_VERSION {
                        tracing::warn!(version, "unsupported session message version, abandoning stream");
                        self.fail(DeserializeError::UnsupportedVersion(version), listener);
                        return;
                    }
                    self.state = DeserializerState::AwaitingHeaderLength;
                }
                DeserializerState::AwaitingHeaderLength => {
                    self.fill(&mut data, HEADER_LENGTH_BYTES);
                    if self.buffer.len() == HEADER_LENGTH_BYTES {
                        let mut raw = [0u8; HEADER_LENGTH_BYTES];
                        raw.copy_from_slice(&self.buffer);
                        self.buffer.clear();
                        let header_len = wire::decode_header_length(raw) as usize;
                        if header_len > MAX_HEADER_BYTES {
                            tracing::warn!(header_len, "declared header too large, abandoning stream");
                            self.fail(DeserializeError::HeaderTooLarge(header_len), listener);
                            return;
                        }
                        self.header_len = header_len;
                        self.state = DeserializerState::AwaitingHeader;
                    }
                }
                DeserializerState::AwaitingHeader => {
                    self.fill(&mut data, self.header_len);
                }
                DeserializerState::AwaitingBody => {
                    let remaining = self.body_len - self.body_received;
                    let n = (remaining.min(data.len() as u64)) as usize;
                    let (body, rest) = data.split_at(n);
                    data = rest;
                    self.consume_body(body, listener);
                }
                DeserializerState::AwaitingBodyBoundary | DeserializerState::Failed => {}
            }
        }

        if self.progress_pending && self.state == DeserializerState::AwaitingBody {
            self.progress_pending = false;
            if let Some(message) = &self.message {
                let progress = self.body_received as f32 / self.body_len as f32;
                listener.on_body_progress(message, progress);
            }
            if self.body_received < self.body_len {
                tracing::debug!(
                    received = self.body_received,
                    total = self.body_len,
                    "body bytes received"
                );
            }
        }
    }

    /// Move up to `target - buffered` bytes from `data` into the buffer.
    fn fill(&mut self, data: &mut &[u8], target: usize) {
        let n = target.saturating_sub(self.buffer.len()).min(data.len());
        self.ensure_capacity(n);
        self.buffer.extend_from_slice(&data[..n]);
        *data = &data[n..];
    }

    /// Grow by at least half the current capacity when `additional` does not fit.
    fn ensure_capacity(&mut self, additional: usize) {
        let free = self.buffer.capacity() - self.buffer.len();
        if additional <= free {
            return;
        }
        let old = self.buffer.capacity();
        let target = (self.buffer.len() + additional).max(old + old / 2);
        self.buffer.reserve(target - self.buffer.len());
        tracing::trace!(from = old, to = self.buffer.capacity(), "deserializer buffer grown");
    }

    fn parse_header(&mut self, listener: &mut dyn DeserializerListener) {
        let raw = self.buffer.split_to(self.header_len);
        self.buffer.clear();

        let headers = match message::parse_headers(&raw) {
            Ok(headers) => headers,
            Err(e) => {
                tracing::warn!(error = %e, header_len = self.header_len, "unreadable header, message dropped");
                self.reset(false);
                return;
            }
        };
        let declared = headers.get(wire::HEADER_BODY_LENGTH).and_then(Value::as_u64);

        match SessionMessage::from_headers(headers) {
            Ok(message) => {
                tracing::debug!(
                    message_id = message.id(),
                    kind = message.kind().as_str(),
                    body_length = message.body_length(),
                    "header deserialized"
                );
                self.body_len = message.body_length();
                listener.on_header_ready(&message);
                self.message = Some(message);
            }
            Err(e) => {
                match &e {
                    WireError::UnknownType(kind) => {
                        tracing::debug!(kind = kind.as_str(), "unknown message type, skipping");
                    }
                    _ => tracing::warn!(error = %e, "invalid header, message dropped"),
                }
                match declared {
                    // Skip the body so the next message lines up.
                    Some(len) => self.body_len = len,
                    None => {
                        self.reset(false);
                        return;
                    }
                }
            }
        }

        self.state = DeserializerState::AwaitingBodyBoundary;
    }

    /// Decide where the body goes, once per message.
    fn enter_body(&mut self, listener: &mut dyn DeserializerListener) {
        self.state = DeserializerState::AwaitingBody;
        let Some(message) = &self.message else {
            return;
        };
        if self.body_len == 0 {
            return;
        }

        if self.body_len > BODY_SIZE_CUTOFF_BYTES {
            match self.sinks.open(message) {
                Ok(sink) => self.sink = Some(sink),
                Err(source) => {
                    let message_id = message.id().to_string();
                    tracing::warn!(message_id = %message_id, error = %source, "failed to open overflow sink");
                    self.message = None;
                    listener.on_complete(Err(DeserializeError::Sink { message_id, source }));
                }
            }
        } else {
            self.ensure_capacity(self.body_len as usize);
        }
    }

    fn consume_body(&mut self, bytes: &[u8], listener: &mut dyn DeserializerListener) {
        self.body_received += bytes.len() as u64;
        let Some(message) = &self.message else {
            return;
        };
        let message_id = message.id().to_string();
        self.progress_pending = true;

        let written = match &mut self.sink {
            Some(sink) => sink.write_all(bytes),
            None => {
                self.buffer.extend_from_slice(bytes);
                Ok(())
            }
        };
        if let Err(source) = written {
            tracing::warn!(message_id = %message_id, error = %source, "overflow sink write failed");
            self.sink = None;
            self.message = None;
            self.progress_pending = false;
            listener.on_complete(Err(DeserializeError::Sink { message_id, source }));
        }
    }

    fn finish_message(&mut self, listener: &mut dyn DeserializerListener) {
        if let Some(mut message) = self.message.take() {
            if self.progress_pending {
                listener.on_body_progress(&message, 1.0);
            }

            let body = match self.sink.take() {
                Some(mut sink) => match sink.finish() {
                    Ok(()) => Some(Body::Overflow {
                        length: self.body_len,
                        location: sink.location(),
                    }),
                    Err(source) => {
                        let message_id = message.id().to_string();
                        tracing::warn!(message_id = %message_id, error = %source, "overflow sink flush failed");
                        listener.on_complete(Err(DeserializeError::Sink { message_id, source }));
                        self.complete_reset();
                        return;
                    }
                },
                None if self.body_len > 0 => {
                    Some(Body::Memory(self.buffer.split_to(self.body_len as usize).freeze()))
                }
                None => None,
            };

            match (message.kind(), body) {
                (MessageKind::DataTransfer, Some(body)) => {
                    if let Err(e) = message.set_body(body) {
                        tracing::warn!(message_id = message.id(), error = %e, "body rejected, message dropped");
                        self.complete_reset();
                        return;
                    }
                }
                // Other variants carry no body; anything declared was consumed and ignored.
                _ => message.complete_without_body(),
            }

            tracing::debug!(
                message_id = message.id(),
                kind = message.kind().as_str(),
                body_length = self.body_len,
                "message complete"
            );
            listener.on_complete(Ok(message));
        }
        self.complete_reset();
    }

    fn complete_reset(&mut self) {
        self.buffer.clear();
        self.reset(false);
        self.state = DeserializerState::Complete;
    }

    fn fail(&mut self, error: DeserializeError, listener: &mut dyn DeserializerListener) {
        self.reset(true);
        self.state = DeserializerState::Failed;
        listener.on_complete(Err(error));
    }
}
