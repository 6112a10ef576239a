//! Outgoing side of a session: turns queued messages into a chunk stream.
//!
//! Exactly one chunk is outstanding at a time. [`SessionMessageSerializer::get_next_chunk`]
//! keeps returning the same bytes until [`SessionMessageSerializer::ack_chunk_delivery`]
//! is called, so a failed transmission can simply be retried.
//!
//! Acks must arrive once per delivered chunk, in delivery order. An
//! out-of-order ack desynchronizes progress reporting; it is not corrected.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::message::SessionMessage;
use crate::wire::{WireError, MAX_CHUNK_BYTES};

/// A fully serialized message, tagged with the range of chunk sequence
/// numbers (1-based, over the whole stream) that carried it.
#[derive(Debug)]
struct CompletedMessage {
    message: SessionMessage,
    first_seq: u64,
    last_seq: u64,
}

/// Result of acknowledging one chunk.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryProgress<'a> {
    pub message: &'a SessionMessage,
    /// Fraction of `message` acknowledged so far, in `[0, 1]`. Exactly 1
    /// only when `complete` is set.
    pub progress: f32,
    /// Every byte of `message` has been acknowledged.
    pub complete: bool,
}

impl DeliveryProgress<'_> {
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Largest f32 below 1. Large messages round to 1 before their last ack.
const ALMOST_DONE: f32 = 1.0 - f32::EPSILON / 2.0;

#[derive(Debug, Default)]
pub struct SessionMessageSerializer {
    pending: VecDeque<SessionMessage>,
    completed: Vec<CompletedMessage>,
    /// Chunk handed out and not yet acknowledged.
    last_chunk: Option<Bytes>,
    /// Byte offset into the current message.
    marker: u64,
    /// Sequence number of the current message's first chunk.
    current_first_seq: u64,
    serialize_count: u64,
    ack_count: u64,
}

impl SessionMessageSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: impl IntoIterator<Item = SessionMessage>) -> Self {
        Self {
            pending: messages.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Append to the pending queue. Never interrupts the message in flight.
    pub fn queue_message(&mut self, message: SessionMessage) {
        self.pending.push_back(message);
    }

    pub fn current_message(&self) -> Option<&SessionMessage> {
        self.pending.front()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_outstanding_chunk(&self) -> bool {
        self.last_chunk.is_some()
    }

    /// Up to `max_len` bytes of the current message (0 = the 500 KiB cap).
    ///
    /// Returns `Ok(None)` when nothing is queued. A message whose body cannot
    /// be serialized is removed from the queue and reported as an error.
    pub fn get_next_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, WireError> {
        if let Some(chunk) = &self.last_chunk {
            return Ok(Some(chunk.clone()));
        }

        let len = match max_len {
            0 => MAX_CHUNK_BYTES,
            n => n.min(MAX_CHUNK_BYTES),
        };

        loop {
            let Some(message) = self.pending.front() else {
                return Ok(None);
            };

            let chunk = match message.serialize_range(self.marker, len) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(message_id = message.id(), error = %e, "dropping unserializable message");
                    self.pending.pop_front();
                    self.marker = 0;
                    return Err(e);
                }
            };

            match chunk {
                Some(chunk) => {
                    if self.marker == 0 {
                        self.current_first_seq = self.serialize_count + 1;
                    }
                    self.marker += chunk.len() as u64;
                    self.serialize_count += 1;
                    self.last_chunk = Some(chunk.clone());
                    return Ok(Some(chunk));
                }
                None => {
                    let total = message.total_length();
                    if let Some(message) = self.pending.pop_front() {
                        tracing::debug!(
                            message_id = message.id(),
                            kind = message.kind().as_str(),
                            bytes = total,
                            "message fully serialized"
                        );
                        self.completed.push(CompletedMessage {
                            message,
                            first_seq: self.current_first_seq,
                            last_seq: self.serialize_count,
                        });
                    }
                    self.marker = 0;
                }
            }
        }
    }

    /// Record delivery of the outstanding chunk and report which message it
    /// belonged to and how far that message has been acknowledged.
    ///
    /// Returns `None` when no chunk is outstanding; that is a caller bug.
    pub fn ack_chunk_delivery(&mut self) -> Option<DeliveryProgress<'_>> {
        if self.last_chunk.is_none() {
            tracing::warn!(
                acked = self.ack_count,
                serialized = self.serialize_count,
                "chunk ack with no outstanding chunk"
            );
            return None;
        }
        self.ack_count += 1;
        self.last_chunk = None;

        let ack = self.ack_count;
        // Nothing at or before an earlier ack can be referenced again.
        self.completed.retain(|c| c.last_seq >= ack);

        if let Some(done) = self.completed.iter().find(|c| c.last_seq >= ack) {
            let chunks = done.last_seq + 1 - done.first_seq;
            let acked = (ack + 1).saturating_sub(done.first_seq);
            return Some(delivery(&done.message, acked as f32 / chunks as f32, acked == chunks));
        }

        let progress = self.current_message_progress();
        let marker = self.marker;
        self.pending
            .front()
            .map(|message| delivery(message, progress, marker == message.total_length()))
    }

    /// Every message not yet fully delivered, in queue order. The one in
    /// flight is returned whole and must be sent again from its first byte.
    pub fn into_pending(self) -> Vec<SessionMessage> {
        self.pending.into()
    }

    /// `marker / total` for the current message, or 1 when idle.
    pub fn current_message_progress(&self) -> f32 {
        match self.pending.front() {
            Some(message) => self.marker as f32 / message.total_length() as f32,
            None => 1.0,
        }
    }
}

fn delivery(message: &SessionMessage, progress: f32, complete: bool) -> DeliveryProgress<'_> {
    let progress = if complete { 1.0 } else { progress.min(ALMOST_DONE) };
    DeliveryProgress {
        message,
        progress,
        complete,
    }
}
