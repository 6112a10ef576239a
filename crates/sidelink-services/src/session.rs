//! Session manager — the single control context for every link.
//!
//! Owns one serializer and one deserializer per transport identifier, the
//! peer registry, and the transfer registry. Links report through
//! [`TransportEvent`]s; the application talks to it through a
//! [`SessionHandle`] and hears back through [`SessionEvent`]s. Nothing here
//! is shared with link tasks except the [`ChunkQueue`].
//!
//! Each link carries at most one serializer chunk in the queue at a time.
//! The next one is cut only after the link reports the previous payload
//! delivered, so acknowledgments reach the serializer in send order.
//!
//! A link that goes down is forgotten along with its queued chunks. Messages
//! it had not delivered go back to the peer they were addressed to and are
//! sent again, from the start, on whichever link that peer identifies on
//! next.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use sidelink_core::wire::WireError;
use sidelink_core::{
    DataTransferMessage, DeserializeError, DeserializerEvent, Headers,
    MessageKind, Payload, Peer, PublicKey, SessionMessage, SessionMessageDeserializer,
    SessionMessageSerializer,
};

use crate::chunk_queue::ChunkQueue;
use crate::peer::{self, PeerRegistry};
use crate::transfer::{IncomingTransfer, MessageScheduler, OutgoingTransfer, TransferRegistry};
use crate::transport::{ConnectionStatus, PeerId, TransportError, TransportEvent};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no link to peer {0}")]
    UnknownPeer(PublicKey),

    #[error("peer {peer} does not support transport {transport_code}")]
    TransportUnsupported { peer: PublicKey, transport_code: u32 },

    #[error("message could not be serialized: {0}")]
    Serialize(#[from] WireError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session manager stopped")]
    Closed,
}

// ── Events & commands ─────────────────────────────────────────────────────────

/// What the application hears about.
#[derive(Debug)]
pub enum SessionEvent {
    /// `Connected` is only reported once the peer's identity has arrived.
    PeerStatus {
        peer: Peer,
        status: ConnectionStatus,
        is_host: bool,
    },
    DataReceived(IncomingTransfer),
    DataSent(OutgoingTransfer),
    SendProgress {
        transfer_id: String,
        recipient: Peer,
        progress: f32,
    },
    ReceiveProgress {
        transfer_id: String,
        sender: Option<Peer>,
        progress: f32,
    },
    ReceiveFailed {
        sender: Option<Peer>,
        error: DeserializeError,
    },
    SendFailed {
        transfer_id: Option<String>,
        recipient: Option<Peer>,
        error: SessionError,
    },
    TransportUpgradeRequested {
        peer: Peer,
        transport_code: u32,
    },
}

#[derive(Debug)]
enum Command {
    Send {
        recipient: PublicKey,
        message: DataTransferMessage,
    },
    RequestTransportUpgrade {
        recipient: PublicKey,
        transport_code: u32,
    },
}

/// Cloneable application handle. Failures after a command is accepted are
/// reported as [`SessionEvent::SendFailed`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    peers: PeerRegistry,
    local: Peer,
}

impl SessionHandle {
    /// Queue `data` for `recipient`. Returns the transfer id.
    pub async fn send(
        &self,
        recipient: &PublicKey,
        data: impl Into<Bytes>,
        extra: Option<Headers>,
    ) -> Result<String, SessionError> {
        self.send_message(recipient, DataTransferMessage::new(data, extra))
            .await
    }

    /// Queue a prepared transfer, e.g. one built with
    /// [`DataTransferMessage::from_file`]. Returns the transfer id.
    pub async fn send_message(
        &self,
        recipient: &PublicKey,
        message: DataTransferMessage,
    ) -> Result<String, SessionError> {
        let id = message.id().to_string();
        self.commands
            .send(Command::Send {
                recipient: recipient.clone(),
                message,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(id)
    }

    /// Ask `recipient` to bring up the transport with `transport_code`.
    pub async fn request_transport_upgrade(
        &self,
        recipient: &PublicKey,
        transport_code: u32,
    ) -> Result<(), SessionError> {
        self.commands
            .send(Command::RequestTransportUpgrade {
                recipient: recipient.clone(),
                transport_code,
            })
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Identified peers with a live link.
    pub fn peers(&self) -> Vec<Peer> {
        peer::connected(&self.peers)
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }
}

// ── Per-link state ────────────────────────────────────────────────────────────

struct LinkSession {
    serializer: SessionMessageSerializer,
    deserializer: SessionMessageDeserializer,
    /// Set once the remote identity message arrives.
    remote: Option<Peer>,
    identity_sent: bool,
    is_host: bool,
    /// Transfer whose body is being read.
    receiving: Option<String>,
}

impl LinkSession {
    fn new(overflow_dir: &Path) -> Self {
        Self {
            serializer: SessionMessageSerializer::new(),
            deserializer: SessionMessageDeserializer::with_overflow_dir(overflow_dir),
            remote: None,
            identity_sent: false,
            is_host: false,
            receiving: None,
        }
    }
}

/// Link sessions plus the queue their serializers feed.
struct Links {
    sessions: HashMap<PeerId, LinkSession>,
    queue: ChunkQueue,
    peers: PeerRegistry,
    overflow_dir: PathBuf,
    /// Undelivered messages for peers without a live link.
    parked: HashMap<PublicKey, Vec<SessionMessage>>,
}

impl Links {
    fn session(&mut self, link: &PeerId) -> &mut LinkSession {
        let overflow_dir = &self.overflow_dir;
        self.sessions
            .entry(link.clone())
            .or_insert_with(|| LinkSession::new(overflow_dir))
    }

    fn remote(&self, link: &PeerId) -> Option<Peer> {
        self.sessions.get(link).and_then(|s| s.remote.clone())
    }

    /// Queue `message` on the recipient's live link, or park it until the
    /// recipient identifies again. Returns the link it was queued on.
    fn queue_for(&mut self, recipient: &PublicKey, message: SessionMessage) -> Option<PeerId> {
        match peer::connected_link(&self.peers, recipient) {
            Some(link) => {
                self.session(&link).serializer.queue_message(message);
                Some(link)
            }
            None => {
                tracing::debug!(peer = %recipient.short(), message_id = message.id(), "no live link, message parked");
                self.parked.entry(recipient.clone()).or_default().push(message);
                None
            }
        }
    }

    /// Cut the next serializer chunk into the queue unless one is still out.
    /// Returns messages dropped because they could not be serialized.
    fn pump(&mut self, link: &PeerId) -> Vec<(Option<String>, WireError)> {
        let mut failures = Vec::new();
        let Some(session) = self.sessions.get_mut(link) else {
            return failures;
        };
        if session.serializer.has_outstanding_chunk() {
            return failures;
        }

        let mtu = self.queue.mtu(link);
        loop {
            match session.serializer.get_next_chunk(mtu) {
                Ok(Some(chunk)) => {
                    self.queue.enqueue(link, chunk);
                    break;
                }
                Ok(None) => break,
                Err(e) => {
                    let id = e.message_id().map(str::to_string);
                    failures.push((id, e));
                }
            }
        }
        failures
    }
}

impl MessageScheduler for Links {
    type Error = SessionError;

    fn schedule(&mut self, message: SessionMessage, recipient: &Peer) -> Result<(), SessionError> {
        if peer::link_for(&self.peers, &recipient.public_key).is_none() {
            return Err(SessionError::UnknownPeer(recipient.public_key.clone()));
        }
        self.queue_for(&recipient.public_key, message);
        Ok(())
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct SessionManager {
    local: Peer,
    links: Links,
    transfers: TransferRegistry,
    events: mpsc::Sender<SessionEvent>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    shutdown: broadcast::Receiver<()>,
}

impl SessionManager {
    pub fn new(
        local: Peer,
        queue: ChunkQueue,
        overflow_dir: impl Into<PathBuf>,
        transport_rx: mpsc::Receiver<TransportEvent>,
        events: mpsc::Sender<SessionEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let peers = peer::new_registry();
        let handle = SessionHandle {
            commands: command_tx,
            peers: peers.clone(),
            local: local.clone(),
        };
        let manager = Self {
            local,
            links: Links {
                sessions: HashMap::new(),
                queue,
                peers,
                overflow_dir: overflow_dir.into(),
                parked: HashMap::new(),
            },
            transfers: TransferRegistry::new(),
            events,
            transport_rx,
            commands: command_rx,
            shutdown,
        };
        (manager, handle)
    }

    /// Register transfer listeners before starting the manager.
    pub fn transfers_mut(&mut self) -> &mut TransferRegistry {
        &mut self.transfers
    }

    pub fn peers(&self) -> PeerRegistry {
        self.links.peers.clone()
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            alias = %self.local.alias,
            key = %self.local.public_key.short(),
            "session manager started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("session manager shutting down");
                    return Ok(());
                }

                event = self.transport_rx.recv() => {
                    let Some(event) = event else {
                        tracing::info!("transport channel closed, session manager exiting");
                        return Ok(());
                    };
                    self.handle_transport(event).await;
                }

                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StatusChanged { peer: link, status, is_host } => {
                self.link_status(&link, status, is_host).await
            }
            TransportEvent::DataReceived { peer: link, bytes } => self.data_received(&link, &bytes).await,
            TransportEvent::DataSent { peer: link, len } => self.data_sent(&link, len).await,
            TransportEvent::SendFailed { peer: link, error } => {
                tracing::warn!(link = %link, error = %error, "link send failed, chunk kept for retry");
                let transfer_id = self
                    .links
                    .sessions
                    .get(&link)
                    .and_then(|s| s.serializer.current_message())
                    .filter(|m| m.kind() == MessageKind::DataTransfer)
                    .map(|m| m.id().to_string());
                let recipient = self.links.remote(&link);
                self.emit(SessionEvent::SendFailed {
                    transfer_id,
                    recipient,
                    error: SessionError::Transport(error),
                })
                .await;
            }
        }
    }

    async fn link_status(&mut self, link: &PeerId, status: ConnectionStatus, is_host: bool) {
        match status {
            ConnectionStatus::Connected => {
                let session = self.links.session(link);
                session.is_host = is_host;
                if !session.identity_sent {
                    session.serializer.queue_message(SessionMessage::identity(&self.local));
                    session.identity_sent = true;
                    tracing::debug!(link = %link, "identity queued");
                }
                let remote = session.remote.clone();

                if let Some(remote) = remote {
                    peer::identify(&self.links.peers, remote.clone(), link.clone());
                    self.emit(SessionEvent::PeerStatus {
                        peer: remote,
                        status,
                        is_host,
                    })
                    .await;
                }
                self.pump(link).await;
            }
            ConnectionStatus::Disconnected => {
                let peer = peer::set_link_status(&self.links.peers, link, status);
                self.close(link).await;
                if let Some(peer) = peer {
                    tracing::info!(link = %link, peer = %peer.public_key.short(), "peer disconnected");
                    self.emit(SessionEvent::PeerStatus {
                        peer,
                        status,
                        is_host,
                    })
                    .await;
                }
            }
            ConnectionStatus::Connecting => {
                tracing::debug!(link = %link, "link connecting");
            }
        }
    }

    /// Drop a link whose stream ended. A new stream never continues a
    /// half-sent message, so undelivered messages are handed back to their
    /// peer and sent again in full.
    async fn close(&mut self, link: &PeerId) {
        let dropped_chunks = self.links.queue.discard(link);
        let Some(session) = self.links.sessions.remove(link) else {
            return;
        };
        let undelivered: Vec<SessionMessage> = session
            .serializer
            .into_pending()
            .into_iter()
            .filter(|m| m.kind() != MessageKind::Identity)
            .collect();

        let Some(remote) = session.remote else {
            tracing::debug!(link = %link, dropped_chunks, "unidentified link closed");
            return;
        };
        let key = remote.public_key;
        let carried = undelivered.len();
        let mut resume_on = None;
        for message in undelivered {
            resume_on = self.links.queue_for(&key, message);
        }
        tracing::info!(
            link = %link,
            peer = %key.short(),
            carried,
            outstanding_transfers = self.transfers.outgoing_for(&key).len(),
            dropped_chunks,
            "link closed"
        );
        if let Some(other) = resume_on {
            self.pump(&other).await;
        }
    }

    async fn data_received(&mut self, link: &PeerId, bytes: &[u8]) {
        let mut decoded: Vec<DeserializerEvent> = Vec::new();
        self.links
            .session(link)
            .deserializer
            .data_received(bytes, &mut decoded);

        for event in decoded {
            match event {
                DeserializerEvent::HeaderReady(message) => {
                    let receiving =
                        (message.kind() == MessageKind::DataTransfer).then(|| message.id().to_string());
                    if receiving.is_some() {
                        tracing::debug!(
                            link = %link,
                            transfer_id = message.id(),
                            body_length = message.body_length(),
                            "incoming transfer started"
                        );
                    }
                    self.links.session(link).receiving = receiving;
                }
                DeserializerEvent::BodyProgress { message_id, progress } => {
                    let is_transfer = self
                        .links
                        .sessions
                        .get(link)
                        .and_then(|s| s.receiving.as_deref())
                        == Some(message_id.as_str());
                    if !is_transfer {
                        continue;
                    }
                    let sender = self.links.remote(link);
                    self.emit(SessionEvent::ReceiveProgress {
                        transfer_id: message_id,
                        sender,
                        progress,
                    })
                    .await;
                }
                DeserializerEvent::Complete(Ok(message)) => {
                    self.links.session(link).receiving = None;
                    self.message_complete(link, message).await
                }
                DeserializerEvent::Complete(Err(error)) => {
                    self.links.session(link).receiving = None;
                    if error.is_fatal_to_stream() {
                        tracing::warn!(link = %link, error = %error, "incoming stream abandoned");
                    } else {
                        tracing::warn!(link = %link, error = %error, "incoming message failed");
                    }
                    let sender = self.links.remote(link);
                    self.emit(SessionEvent::ReceiveFailed { sender, error }).await;
                }
            }
        }
    }

    async fn message_complete(&mut self, link: &PeerId, message: SessionMessage) {
        match message.payload() {
            Payload::Identity { peer: remote } => {
                let remote = remote.clone();
                let first = peer::identify(&self.links.peers, remote.clone(), link.clone());
                let session = self.links.session(link);
                session.remote = Some(remote.clone());
                let is_host = session.is_host;
                tracing::info!(
                    link = %link,
                    peer = %remote.public_key.short(),
                    alias = %remote.alias,
                    first_contact = first,
                    "peer identified"
                );
                let key = remote.public_key.clone();
                self.emit(SessionEvent::PeerStatus {
                    peer: remote,
                    status: ConnectionStatus::Connected,
                    is_host,
                })
                .await;

                if let Some(parked) = self.links.parked.remove(&key) {
                    tracing::info!(link = %link, peer = %key.short(), messages = parked.len(), "resending undelivered messages");
                    let session = self.links.session(link);
                    for message in parked {
                        session.serializer.queue_message(message);
                    }
                    self.pump(link).await;
                }
            }
            Payload::DataTransfer { .. } => {
                let Some(sender) = self.links.remote(link) else {
                    tracing::warn!(link = %link, message_id = message.id(), "data from unidentified link dropped");
                    return;
                };
                match self.transfers.message_received(&sender, message) {
                    Ok(transfer) => self.emit(SessionEvent::DataReceived(transfer)).await,
                    Err(message) => {
                        tracing::debug!(message_id = message.id(), "message is not a transfer");
                    }
                }
            }
            Payload::TransportUpgrade { transport_code } => {
                let transport_code = *transport_code;
                let Some(peer) = self.links.remote(link) else {
                    tracing::warn!(link = %link, transport_code, "upgrade request from unidentified link dropped");
                    return;
                };
                tracing::info!(peer = %peer.public_key.short(), transport_code, "transport upgrade requested");
                self.emit(SessionEvent::TransportUpgradeRequested { peer, transport_code })
                    .await;
            }
        }
    }

    async fn data_sent(&mut self, link: &PeerId, len: usize) {
        let Some(session) = self.links.sessions.get_mut(link) else {
            tracing::warn!(link = %link, "delivery reported for unknown link");
            return;
        };
        let Some(delivery) = session.serializer.ack_chunk_delivery() else {
            return;
        };
        let message_id = delivery.message.id().to_string();
        let kind = delivery.message.kind();
        let progress = delivery.progress;
        let complete = delivery.is_complete();
        tracing::trace!(link = %link, bytes = len, message_id = %message_id, progress, "chunk acknowledged");

        if kind == MessageKind::DataTransfer {
            if let Some(transfer) = self.transfers.send_progress(&message_id, progress) {
                let recipient = transfer.recipient().clone();
                self.emit(SessionEvent::SendProgress {
                    transfer_id: message_id.clone(),
                    recipient,
                    progress,
                })
                .await;
            }
            if complete {
                if let Some(transfer) = self.transfers.message_delivered(&message_id) {
                    self.emit(SessionEvent::DataSent(transfer)).await;
                }
            }
        } else if complete {
            tracing::debug!(link = %link, kind = kind.as_str(), "control message delivered");
        }

        self.pump(link).await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { recipient, message } => {
                let transfer_id = message.id().to_string();
                let known = self.links.peers.get(&recipient).map(|e| e.peer.clone());
                let Some(peer) = known else {
                    tracing::warn!(peer = %recipient.short(), transfer_id = %transfer_id, "send to unknown peer");
                    self.emit(SessionEvent::SendFailed {
                        transfer_id: Some(transfer_id),
                        recipient: None,
                        error: SessionError::UnknownPeer(recipient),
                    })
                    .await;
                    return;
                };

                if let Err(error) = self.transfers.send(&peer, message, &mut self.links) {
                    tracing::warn!(transfer_id = %transfer_id, error = %error, "transfer not scheduled");
                    self.emit(SessionEvent::SendFailed {
                        transfer_id: Some(transfer_id),
                        recipient: Some(peer),
                        error,
                    })
                    .await;
                    return;
                }
                if let Some(link) = peer::connected_link(&self.links.peers, &recipient) {
                    self.pump(&link).await;
                }
            }
            Command::RequestTransportUpgrade { recipient, transport_code } => {
                let known = self.links.peers.get(&recipient).map(|e| e.peer.clone());
                let Some(peer) = known else {
                    self.emit(SessionEvent::SendFailed {
                        transfer_id: None,
                        recipient: None,
                        error: SessionError::UnknownPeer(recipient),
                    })
                    .await;
                    return;
                };
                if !peer.supports_transport(transport_code) {
                    tracing::warn!(peer = %recipient.short(), transport_code, "peer does not advertise transport");
                    self.emit(SessionEvent::SendFailed {
                        transfer_id: None,
                        recipient: Some(peer),
                        error: SessionError::TransportUnsupported {
                            peer: recipient,
                            transport_code,
                        },
                    })
                    .await;
                    return;
                }

                let queued_on = self
                    .links
                    .queue_for(&recipient, SessionMessage::transport_upgrade(transport_code));
                tracing::info!(peer = %recipient.short(), transport_code, "transport upgrade request queued");
                if let Some(link) = queued_on {
                    self.pump(&link).await;
                }
            }
        }
    }

    async fn pump(&mut self, link: &PeerId) {
        for (message_id, error) in self.links.pump(link) {
            let transfer = message_id
                .as_deref()
                .and_then(|id| self.transfers.fail_outgoing(id));
            tracing::warn!(link = %link, error = %error, "outgoing message dropped");
            self.emit(SessionEvent::SendFailed {
                transfer_id: message_id,
                recipient: transfer.map(|t| t.recipient().clone()),
                error: SessionError::Serialize(error),
            })
            .await;
        }
    }

    async fn emit(&mut self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("application event dropped, receiver gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidelink_core::wire::transport_codes;
    use std::time::Duration;

    struct Harness {
        queue: ChunkQueue,
        link: PeerId,
        transport_tx: mpsc::Sender<TransportEvent>,
        events: mpsc::Receiver<SessionEvent>,
        handle: SessionHandle,
        _shutdown: broadcast::Sender<()>,
    }

    fn start(local: Peer) -> Harness {
        let queue = ChunkQueue::new(1024);
        let (transport_tx, transport_rx) = mpsc::channel(64);
        let (event_tx, events) = mpsc::channel(64);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let overflow = std::env::temp_dir().join(format!("sidelink-session-test-{}", std::process::id()));
        let (manager, handle) =
            SessionManager::new(local, queue.clone(), overflow, transport_rx, event_tx, shutdown_rx);
        tokio::spawn(manager.run());
        Harness {
            queue,
            link: PeerId::from("link-1"),
            transport_tx,
            events,
            handle,
            _shutdown: shutdown,
        }
    }

    fn peer(byte: u8, alias: &str, transports: u32) -> Peer {
        Peer::new(PublicKey::new(vec![byte; 32]), alias, transports)
    }

    impl Harness {
        async fn connect(&self) {
            self.set_status(&self.link, ConnectionStatus::Connected).await;
        }

        async fn set_status(&self, link: &PeerId, status: ConnectionStatus) {
            self.queue.set_status(link, status);
            self.transport_tx
                .send(TransportEvent::StatusChanged {
                    peer: link.clone(),
                    status,
                    is_host: true,
                })
                .await
                .unwrap();
        }

        async fn receive(&self, message: &SessionMessage) {
            self.receive_on(&self.link, message).await;
        }

        async fn receive_on(&self, link: &PeerId, message: &SessionMessage) {
            self.transport_tx
                .send(TransportEvent::DataReceived {
                    peer: link.clone(),
                    bytes: message.to_bytes().unwrap(),
                })
                .await
                .unwrap();
        }

        /// Take the next chunk the manager queues on `link`, without
        /// confirming it.
        async fn next_chunk(&self, link: &PeerId) -> Bytes {
            let notify = self.queue.notifier(link);
            loop {
                if let Some(chunk) = self.queue.next_to_send(link) {
                    return chunk;
                }
                tokio::time::timeout(Duration::from_secs(5), notify.notified())
                    .await
                    .expect("manager queued nothing");
            }
        }

        async fn drain_messages(&self, count: usize) -> Vec<SessionMessage> {
            self.drain_on(&self.link, count).await
        }

        /// Act as the link: write out everything the manager queues and
        /// decode it, until `count` messages came out.
        async fn drain_on(&self, link: &PeerId, count: usize) -> Vec<SessionMessage> {
            let notify = self.queue.notifier(link);
            let mut deserializer = SessionMessageDeserializer::with_overflow_dir(std::env::temp_dir());
            let mut out = Vec::new();
            while out.len() < count {
                while let Some(chunk) = self.queue.next_to_send(link) {
                    let mut decoded = Vec::new();
                    deserializer.data_received(&chunk, &mut decoded);
                    for event in decoded {
                        if let DeserializerEvent::Complete(Ok(m)) = event {
                            out.push(m);
                        }
                    }
                    if let Some(d) = self.queue.confirm_delivered(link) {
                        if let Some(len) = d.payload_len {
                            self.transport_tx
                                .send(TransportEvent::DataSent { peer: link.clone(), len })
                                .await
                                .unwrap();
                        }
                    }
                }
                if out.len() < count {
                    tokio::time::timeout(Duration::from_secs(5), notify.notified())
                        .await
                        .expect("manager queued nothing");
                }
            }
            out
        }

        async fn next_event(&mut self) -> SessionEvent {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("no session event")
                .expect("event channel closed")
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn manager_future_is_send() {
        let (_transport_tx, transport_rx) = mpsc::channel(1);
        let (event_tx, _events) = mpsc::channel(1);
        let (_shutdown, shutdown_rx) = broadcast::channel(1);
        let (manager, _handle) = SessionManager::new(
            peer(1, "alice", 0),
            ChunkQueue::new(64),
            std::env::temp_dir(),
            transport_rx,
            event_tx,
            shutdown_rx,
        );
        let run = manager.run();
        assert_send(&run);
    }

    #[tokio::test]
    async fn identity_sent_on_connect_and_peer_reported_after_its_identity() {
        let alice = peer(1, "alice", transport_codes::BLE);
        let bob = peer(2, "bob", transport_codes::BLE);
        let mut h = start(alice.clone());

        h.connect().await;
        let sent = h.drain_messages(1).await;
        assert!(matches!(sent[0].payload(), Payload::Identity { peer } if *peer == alice));
        assert!(h.handle.peers().is_empty());

        h.receive(&SessionMessage::identity(&bob)).await;
        match h.next_event().await {
            SessionEvent::PeerStatus { peer, status, is_host } => {
                assert_eq!(peer, bob);
                assert_eq!(status, ConnectionStatus::Connected);
                assert!(is_host);
            }
            other => panic!("expected peer status, got {other:?}"),
        }
        assert_eq!(h.handle.peers(), vec![bob]);
    }

    #[tokio::test]
    async fn send_completes_transfer_after_delivery() {
        let alice = peer(1, "alice", transport_codes::BLE);
        let bob = peer(2, "bob", transport_codes::BLE);
        let mut h = start(alice);
        h.connect().await;
        h.receive(&SessionMessage::identity(&bob)).await;
        h.next_event().await;
        h.drain_messages(1).await;

        let id = h
            .handle
            .send(&bob.public_key, vec![0x42u8; 3000], None)
            .await
            .unwrap();
        let sent = h.drain_messages(1).await;
        assert_eq!(sent[0].id(), id);
        assert_eq!(sent[0].body_length(), 3000);

        let mut last_progress = 0.0;
        loop {
            match h.next_event().await {
                SessionEvent::SendProgress { transfer_id, progress, .. } => {
                    assert_eq!(transfer_id, id);
                    assert!(progress >= last_progress);
                    last_progress = progress;
                }
                SessionEvent::DataSent(transfer) => {
                    assert_eq!(transfer.id(), id);
                    assert!(transfer.is_complete());
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(last_progress, 1.0);
    }

    #[tokio::test]
    async fn data_before_identity_is_dropped() {
        let mut h = start(peer(1, "alice", 0));
        h.connect().await;
        h.receive(&SessionMessage::data_transfer(b"who?".to_vec(), None)).await;
        h.receive(&SessionMessage::identity(&peer(2, "bob", 0))).await;
        loop {
            match h.next_event().await {
                SessionEvent::ReceiveProgress { sender, .. } => assert!(sender.is_none()),
                SessionEvent::PeerStatus { .. } => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let mut h = start(peer(1, "alice", 0));
        let stranger = PublicKey::new(vec![9u8; 32]);
        let id = h.handle.send(&stranger, b"hi".to_vec(), None).await.unwrap();
        match h.next_event().await {
            SessionEvent::SendFailed { transfer_id, error, .. } => {
                assert_eq!(transfer_id, Some(id));
                assert!(matches!(error, SessionError::UnknownPeer(k) if k == stranger));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upgrade_requires_advertised_transport() {
        let bob = peer(2, "bob", transport_codes::BLE);
        let mut h = start(peer(1, "alice", transport_codes::BLE | transport_codes::WIFI));
        h.connect().await;
        h.receive(&SessionMessage::identity(&bob)).await;
        h.next_event().await;
        h.drain_messages(1).await;

        h.handle
            .request_transport_upgrade(&bob.public_key, transport_codes::WIFI)
            .await
            .unwrap();
        assert!(matches!(
            h.next_event().await,
            SessionEvent::SendFailed { error: SessionError::TransportUnsupported { .. }, .. }
        ));

        h.handle
            .request_transport_upgrade(&bob.public_key, transport_codes::BLE)
            .await
            .unwrap();
        let sent = h.drain_messages(1).await;
        assert_eq!(
            sent[0].payload(),
            &Payload::TransportUpgrade { transport_code: transport_codes::BLE }
        );
    }

    #[tokio::test]
    async fn incoming_upgrade_request_is_reported() {
        let bob = peer(2, "bob", transport_codes::WIFI);
        let mut h = start(peer(1, "alice", transport_codes::WIFI));
        h.connect().await;
        h.receive(&SessionMessage::identity(&bob)).await;
        h.next_event().await;

        h.receive(&SessionMessage::transport_upgrade(transport_codes::WIFI)).await;
        match h.next_event().await {
            SessionEvent::TransportUpgradeRequested { peer, transport_code } => {
                assert_eq!(peer, bob);
                assert_eq!(transport_code, transport_codes::WIFI);
            }
            other => panic!("expected upgrade request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_stream_reports_receive_failure() {
        let mut h = start(peer(1, "alice", 0));
        h.connect().await;
        h.transport_tx
            .send(TransportEvent::DataReceived {
                peer: h.link.clone(),
                bytes: Bytes::from_static(&[0x09, 0, 0, 0, 0]),
            })
            .await
            .unwrap();
        assert!(matches!(
            h.next_event().await,
            SessionEvent::ReceiveFailed { error: DeserializeError::UnsupportedVersion(9), .. }
        ));
    }

    #[tokio::test]
    async fn control_message_body_is_not_reported_as_transfer() {
        let mut h = start(peer(1, "alice", 0));
        h.connect().await;

        let identity = SessionMessage::identity(&peer(2, "bob", 0));
        let mut headers = identity.headers().clone();
        headers.insert(sidelink_core::wire::HEADER_BODY_LENGTH.into(), 6u64.into());
        let mut with_body = SessionMessage::from_headers(headers).unwrap();
        with_body
            .set_body(sidelink_core::Body::Memory(Bytes::from_static(b"extras")))
            .unwrap();
        h.receive(&with_body).await;

        match h.next_event().await {
            SessionEvent::PeerStatus { peer, .. } => assert_eq!(peer.alias, "bob"),
            other => panic!("expected peer status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undelivered_transfer_is_resent_when_peer_returns_on_new_link() {
        let alice = peer(1, "alice", 0);
        let bob = peer(2, "bob", 0);
        let mut h = start(alice.clone());
        let first = h.link.clone();
        h.connect().await;
        h.receive(&SessionMessage::identity(&bob)).await;
        h.next_event().await;
        h.drain_messages(1).await;

        let id = h
            .handle
            .send(&bob.public_key, vec![0x42u8; 3000], None)
            .await
            .unwrap();

        // One chunk gets through, then the link drops.
        let chunk = h.next_chunk(&first).await;
        assert_eq!(chunk.len(), 1024);
        let delivered = h.queue.confirm_delivered(&first).unwrap();
        h.transport_tx
            .send(TransportEvent::DataSent {
                peer: first.clone(),
                len: delivered.payload_len.unwrap(),
            })
            .await
            .unwrap();
        match h.next_event().await {
            SessionEvent::SendProgress { transfer_id, progress, .. } => {
                assert_eq!(transfer_id, id);
                assert!(progress < 1.0);
            }
            other => panic!("expected progress, got {other:?}"),
        }

        h.set_status(&first, ConnectionStatus::Disconnected).await;
        assert!(matches!(
            h.next_event().await,
            SessionEvent::PeerStatus { status: ConnectionStatus::Disconnected, .. }
        ));
        assert_eq!(h.queue.pending(&first), 0);
        assert!(h.handle.peers().is_empty());

        // Bob comes back under a different transport identifier.
        let second = PeerId::from("link-2");
        h.set_status(&second, ConnectionStatus::Connected).await;
        h.receive_on(&second, &SessionMessage::identity(&bob)).await;
        assert!(matches!(
            h.next_event().await,
            SessionEvent::PeerStatus { status: ConnectionStatus::Connected, .. }
        ));

        let sent = h.drain_on(&second, 2).await;
        assert!(matches!(sent[0].payload(), Payload::Identity { peer } if *peer == alice));
        assert_eq!(sent[1].id(), id);
        assert_eq!(sent[1].body().unwrap().len(), 3000);

        loop {
            match h.next_event().await {
                SessionEvent::SendProgress { transfer_id, .. } => assert_eq!(transfer_id, id),
                SessionEvent::DataSent(transfer) => {
                    assert_eq!(transfer.id(), id);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(h.queue.pending(&first), 0);
    }
}
