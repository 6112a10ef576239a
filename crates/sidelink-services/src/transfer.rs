//! Transfer tracking — application-level records built on DataTransfer messages.
//!
//! Transfers are keyed by the id of the message that carries them. An
//! outgoing transfer completes when the serializer reports that very message
//! fully acknowledged; an incoming transfer is complete the moment its
//! message is. Listeners observe both and unsubscribe either by returning
//! [`ListenerControl::Remove`] or through the [`SubscriptionId`] they got at
//! registration.

use std::collections::HashMap;

use sidelink_core::{Body, DataTransferMessage, Headers, Peer, PublicKey, SessionMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    AwaitingDataAck,
    Complete,
}

#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    message: DataTransferMessage,
    recipient: Peer,
    state: OutgoingState,
    progress: f32,
}

impl OutgoingTransfer {
    pub fn id(&self) -> &str {
        self.message.id()
    }

    pub fn recipient(&self) -> &Peer {
        &self.recipient
    }

    pub fn state(&self) -> OutgoingState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == OutgoingState::Complete
    }

    /// Fraction of the message acknowledged by the link.
    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn message(&self) -> &DataTransferMessage {
        &self.message
    }
}

/// A fully received DataTransfer. There is no incomplete incoming state.
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    message: DataTransferMessage,
    sender: Peer,
}

impl IncomingTransfer {
    pub fn id(&self) -> &str {
        self.message.id()
    }

    pub fn sender(&self) -> &Peer {
        &self.sender
    }

    pub fn body(&self) -> Option<&Body> {
        self.message.body()
    }

    pub fn extra(&self) -> Option<&Headers> {
        self.message.extra()
    }

    pub fn message(&self) -> &DataTransferMessage {
        &self.message
    }
}

// ── Listeners ─────────────────────────────────────────────────────────────────

/// Returned by listeners to stay registered or drop out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    Continue,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ReceivedListener = Box<dyn FnMut(&IncomingTransfer) -> ListenerControl + Send>;
type DeliveredListener = Box<dyn FnMut(&OutgoingTransfer) -> ListenerControl + Send>;

/// Hands an outgoing message to whatever serializes it for `recipient`.
pub trait MessageScheduler {
    type Error;

    fn schedule(&mut self, message: SessionMessage, recipient: &Peer) -> Result<(), Self::Error>;
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct TransferRegistry {
    outgoing: HashMap<String, OutgoingTransfer>,
    /// Outgoing transfer ids per recipient, in send order.
    by_peer: HashMap<PublicKey, Vec<String>>,
    received_listeners: Vec<(SubscriptionId, ReceivedListener)>,
    delivered_listeners: Vec<(SubscriptionId, DeliveredListener)>,
    next_subscription: u64,
}

impl std::fmt::Debug for TransferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRegistry")
            .field("outgoing", &self.outgoing.len())
            .field("received_listeners", &self.received_listeners.len())
            .field("delivered_listeners", &self.delivered_listeners.len())
            .finish()
    }
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an outgoing transfer: schedule the message and track it until
    /// the scheduler's side reports it delivered.
    pub fn send<S: MessageScheduler>(
        &mut self,
        recipient: &Peer,
        message: DataTransferMessage,
        scheduler: &mut S,
    ) -> Result<&OutgoingTransfer, S::Error> {
        scheduler.schedule(message.message().clone(), recipient)?;

        let id = message.id().to_string();
        tracing::debug!(transfer_id = %id, peer = %recipient.public_key.short(), "outgoing transfer started");
        self.by_peer
            .entry(recipient.public_key.clone())
            .or_default()
            .push(id.clone());
        let transfer = self.outgoing.entry(id).or_insert(OutgoingTransfer {
            message,
            recipient: recipient.clone(),
            state: OutgoingState::AwaitingDataAck,
            progress: 0.0,
        });
        Ok(transfer)
    }

    pub fn outgoing(&self, id: &str) -> Option<&OutgoingTransfer> {
        self.outgoing.get(id)
    }

    /// Outgoing transfers still awaiting acknowledgment by `peer`.
    pub fn outgoing_for(&self, peer: &PublicKey) -> Vec<&OutgoingTransfer> {
        self.by_peer
            .get(peer)
            .into_iter()
            .flatten()
            .filter_map(|id| self.outgoing.get(id))
            .collect()
    }

    /// Record partial acknowledgment. Ignores ids that are not transfers.
    pub fn send_progress(&mut self, message_id: &str, progress: f32) -> Option<&OutgoingTransfer> {
        let transfer = self.outgoing.get_mut(message_id)?;
        transfer.progress = progress;
        Some(transfer)
    }

    /// The serializer reported `message_id` fully acknowledged. Completes and
    /// releases the matching transfer, notifying delivery listeners.
    pub fn message_delivered(&mut self, message_id: &str) -> Option<OutgoingTransfer> {
        let mut transfer = self.outgoing.remove(message_id)?;
        self.forget(&transfer);
        transfer.state = OutgoingState::Complete;
        transfer.progress = 1.0;
        tracing::info!(
            transfer_id = message_id,
            peer = %transfer.recipient.public_key.short(),
            "transfer sent"
        );

        self.delivered_listeners
            .retain_mut(|(_, listener)| listener(&transfer) == ListenerControl::Continue);
        Some(transfer)
    }

    /// A complete message arrived from `sender`. Only DataTransfer messages
    /// become transfers; anything else is handed back.
    pub fn message_received(
        &mut self,
        sender: &Peer,
        message: SessionMessage,
    ) -> Result<IncomingTransfer, SessionMessage> {
        let message = DataTransferMessage::try_from(message)?;
        let transfer = IncomingTransfer {
            message,
            sender: sender.clone(),
        };
        tracing::info!(
            transfer_id = transfer.id(),
            peer = %sender.public_key.short(),
            bytes = transfer.body().map(Body::len).unwrap_or(0),
            "transfer received"
        );

        self.received_listeners
            .retain_mut(|(_, listener)| listener(&transfer) == ListenerControl::Continue);
        Ok(transfer)
    }

    /// Drop an outgoing transfer whose message could not be sent.
    pub fn fail_outgoing(&mut self, message_id: &str) -> Option<OutgoingTransfer> {
        let transfer = self.outgoing.remove(message_id)?;
        self.forget(&transfer);
        Some(transfer)
    }

    fn forget(&mut self, transfer: &OutgoingTransfer) {
        let key = &transfer.recipient.public_key;
        if let Some(ids) = self.by_peer.get_mut(key) {
            ids.retain(|id| id != transfer.id());
            if ids.is_empty() {
                self.by_peer.remove(key);
            }
        }
    }

    pub fn on_message_received(
        &mut self,
        listener: impl FnMut(&IncomingTransfer) -> ListenerControl + Send + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.received_listeners.push((id, Box::new(listener)));
        id
    }

    pub fn on_message_delivered(
        &mut self,
        listener: impl FnMut(&OutgoingTransfer) -> ListenerControl + Send + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.delivered_listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.received_listeners.len() + self.delivered_listeners.len();
        self.received_listeners.retain(|(sub, _)| *sub != id);
        self.delivered_listeners.retain(|(sub, _)| *sub != id);
        before != self.received_listeners.len() + self.delivered_listeners.len()
    }

    fn next_id(&mut self) -> SubscriptionId {
        self.next_subscription += 1;
        SubscriptionId(self.next_subscription)
    }
}
