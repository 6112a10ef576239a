//! Per-peer outgoing chunk queues with MTU segmentation and stop-and-wait
//! flow control.
//!
//! Every payload handed to [`ChunkQueue::enqueue`] is cut into MTU-sized
//! pieces. A link takes the head piece with [`ChunkQueue::next_to_send`] and
//! must confirm or fail it before the queue hands out another one for that
//! peer. Queued pieces outlive the connection: a peer that drops and comes
//! back under the same identifier resumes exactly where it stopped.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::transport::{ConnectionStatus, PeerId};

#[derive(Debug)]
struct QueuedChunk {
    bytes: Bytes,
    /// Set on the last piece of a payload: the payload's full length.
    payload_len: Option<usize>,
}

#[derive(Debug)]
struct PeerQueue {
    chunks: VecDeque<QueuedChunk>,
    mtu: usize,
    status: ConnectionStatus,
    in_flight: bool,
    notify: Arc<Notify>,
}

impl PeerQueue {
    fn new(mtu: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            mtu,
            status: ConnectionStatus::Disconnected,
            in_flight: false,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// A chunk the link confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub len: usize,
    /// Present when this chunk finished a payload.
    pub payload_len: Option<usize>,
}

/// Shared between the control context (enqueue) and link tasks (dequeue).
#[derive(Debug, Clone)]
pub struct ChunkQueue {
    peers: Arc<DashMap<PeerId, PeerQueue>>,
    default_mtu: usize,
}

impl ChunkQueue {
    pub fn new(default_mtu: usize) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            default_mtu: default_mtu.max(1),
        }
    }

    /// Segment `payload` to the peer's MTU and append the pieces.
    /// Works in any connection state. Returns the number of pieces queued.
    pub fn enqueue(&self, peer: &PeerId, payload: Bytes) -> usize {
        let mut queue = self
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerQueue::new(self.default_mtu));

        let total = payload.len();
        let mtu = queue.mtu;
        let mut offset = 0;
        let mut pieces = 0;
        while offset < total {
            let end = (offset + mtu).min(total);
            queue.chunks.push_back(QueuedChunk {
                bytes: payload.slice(offset..end),
                payload_len: (end == total).then_some(total),
            });
            offset = end;
            pieces += 1;
        }

        tracing::trace!(%peer, bytes = total, pieces, queued = queue.chunks.len(), "payload enqueued");
        if pieces > 0 {
            queue.notify.notify_one();
        }
        pieces
    }

    /// MTU used for future `enqueue` calls. Already queued pieces keep their size.
    pub fn set_mtu(&self, peer: &PeerId, mtu: usize) {
        let mut queue = self
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerQueue::new(self.default_mtu));
        queue.mtu = mtu.max(1);
    }

    pub fn mtu(&self, peer: &PeerId) -> usize {
        self.peers
            .get(peer)
            .map(|q| q.mtu)
            .unwrap_or(self.default_mtu)
    }

    /// Track the link state. Going down forgets the in-flight marker so the
    /// unconfirmed head piece is sent again after reconnecting.
    pub fn set_status(&self, peer: &PeerId, status: ConnectionStatus) {
        let mut queue = self
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerQueue::new(self.default_mtu));
        queue.status = status;
        match status {
            ConnectionStatus::Connected => queue.notify.notify_one(),
            ConnectionStatus::Disconnected => {
                queue.in_flight = false;
                if !queue.chunks.is_empty() {
                    tracing::debug!(%peer, retained = queue.chunks.len(), "peer disconnected with queued chunks");
                }
            }
            ConnectionStatus::Connecting => {}
        }
    }

    pub fn status(&self, peer: &PeerId) -> ConnectionStatus {
        self.peers
            .get(peer)
            .map(|q| q.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Pieces waiting for `peer`, including one in flight.
    pub fn pending(&self, peer: &PeerId) -> usize {
        self.peers.get(peer).map(|q| q.chunks.len()).unwrap_or(0)
    }

    /// The head piece, if the peer is connected and nothing is in flight.
    pub fn next_to_send(&self, peer: &PeerId) -> Option<Bytes> {
        let mut queue = self.peers.get_mut(peer)?;
        if queue.status != ConnectionStatus::Connected || queue.in_flight {
            return None;
        }
        let bytes = queue.chunks.front()?.bytes.clone();
        queue.in_flight = true;
        Some(bytes)
    }

    /// The in-flight piece reached the link; drop it and allow the next one.
    pub fn confirm_delivered(&self, peer: &PeerId) -> Option<Delivered> {
        let mut queue = self.peers.get_mut(peer)?;
        if !queue.in_flight {
            tracing::warn!(%peer, "delivery confirmed with no chunk in flight");
            return None;
        }
        queue.in_flight = false;
        let chunk = queue.chunks.pop_front()?;
        if !queue.chunks.is_empty() {
            queue.notify.notify_one();
        }
        Some(Delivered {
            len: chunk.bytes.len(),
            payload_len: chunk.payload_len,
        })
    }

    /// The in-flight piece could not be written. It stays at the head.
    pub fn send_failed(&self, peer: &PeerId) {
        if let Some(mut queue) = self.peers.get_mut(peer) {
            queue.in_flight = false;
        }
    }

    /// Drop everything queued for a link whose stream is gone for good.
    /// The entry itself goes too unless a new link already came up under the
    /// same identifier. Returns the number of pieces dropped.
    pub fn discard(&self, peer: &PeerId) -> usize {
        let dropped = self
            .peers
            .get_mut(peer)
            .map(|mut queue| {
                queue.in_flight = false;
                let dropped = queue.chunks.len();
                queue.chunks.clear();
                dropped
            })
            .unwrap_or(0);
        self.peers
            .remove_if(peer, |_, queue| queue.status == ConnectionStatus::Disconnected);
        if dropped > 0 {
            tracing::debug!(%peer, dropped, "queued chunks discarded");
        }
        dropped
    }

    /// Wakes the peer's link whenever there may be something to send.
    pub fn notifier(&self, peer: &PeerId) -> Arc<Notify> {
        self.peers
            .entry(peer.clone())
            .or_insert_with(|| PeerQueue::new(self.default_mtu))
            .notify
            .clone()
    }
}
