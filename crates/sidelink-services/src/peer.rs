//! Peer registry — identified peers and the link each one is reachable on.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use sidelink_core::{Peer, PublicKey};

use crate::transport::{ConnectionStatus, PeerId};

/// Tracked state for an identified peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer: Peer,
    /// Transport identifier of the most recent link that carried its identity.
    pub link: Option<PeerId>,
    pub status: ConnectionStatus,
}

/// Shared between the session manager and application handles.
/// Keyed on public key.
pub type PeerRegistry = Arc<DashMap<PublicKey, PeerEntry>>;

/// Create a new empty peer registry.
pub fn new_registry() -> PeerRegistry {
    Arc::new(DashMap::new())
}

/// Record a peer whose identity just arrived on `link`. Returns true the
/// first time this key is seen.
pub fn identify(registry: &PeerRegistry, mut peer: Peer, link: PeerId) -> bool {
    peer.last_seen = SystemTime::now();
    let key = peer.public_key.clone();
    let entry = PeerEntry {
        peer,
        link: Some(link),
        status: ConnectionStatus::Connected,
    };
    registry.insert(key, entry).is_none()
}

/// Link to reach `key` on, if it is identified.
pub fn link_for(registry: &PeerRegistry, key: &PublicKey) -> Option<PeerId> {
    registry.get(key).and_then(|e| e.link.clone())
}

/// Like [`link_for`], but only while that link is up.
pub fn connected_link(registry: &PeerRegistry, key: &PublicKey) -> Option<PeerId> {
    registry
        .get(key)
        .filter(|e| e.status == ConnectionStatus::Connected)
        .and_then(|e| e.link.clone())
}

/// Update the status of whichever peer is bound to `link`.
pub fn set_link_status(registry: &PeerRegistry, link: &PeerId, status: ConnectionStatus) -> Option<Peer> {
    let mut entry = registry
        .iter_mut()
        .find(|e| e.value().link.as_ref() == Some(link))?;
    entry.status = status;
    if status == ConnectionStatus::Connected {
        entry.peer.last_seen = SystemTime::now();
    }
    Some(entry.peer.clone())
}

/// Peers with a live link.
pub fn connected(registry: &PeerRegistry) -> Vec<Peer> {
    registry
        .iter()
        .filter(|e| e.value().status == ConnectionStatus::Connected)
        .map(|e| e.value().peer.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidelink_core::wire::transport_codes;

    fn peer(byte: u8, alias: &str) -> Peer {
        Peer::new(PublicKey::new(vec![byte; 32]), alias, transport_codes::BLE)
    }

    #[test]
    fn new_registry_creates_empty() {
        let registry = new_registry();
        assert!(registry.is_empty());
    }

    #[test]
    fn identify_binds_link() {
        let registry = new_registry();
        assert!(identify(&registry, peer(1, "a"), PeerId::from("link-1")));
        assert!(!identify(&registry, peer(1, "a-renamed"), PeerId::from("link-2")));

        let key = PublicKey::new(vec![1u8; 32]);
        assert_eq!(link_for(&registry, &key), Some(PeerId::from("link-2")));
        assert_eq!(registry.get(&key).map(|e| e.peer.alias.clone()), Some("a-renamed".to_string()));

        // The old link no longer speaks for this peer.
        assert!(set_link_status(&registry, &PeerId::from("link-1"), ConnectionStatus::Disconnected).is_none());
        assert_eq!(connected_link(&registry, &key), Some(PeerId::from("link-2")));
    }

    #[test]
    fn link_status_tracks_connection() {
        let registry = new_registry();
        identify(&registry, peer(1, "a"), PeerId::from("l1"));
        identify(&registry, peer(2, "b"), PeerId::from("l2"));
        assert_eq!(connected(&registry).len(), 2);

        let dropped = set_link_status(&registry, &PeerId::from("l1"), ConnectionStatus::Disconnected);
        assert_eq!(dropped.map(|p| p.alias), Some("a".to_string()));
        let still: Vec<String> = connected(&registry).into_iter().map(|p| p.alias).collect();
        assert_eq!(still, ["b"]);

        assert!(set_link_status(&registry, &PeerId::from("unknown"), ConnectionStatus::Connected).is_none());

        let a = PublicKey::new(vec![1u8; 32]);
        assert_eq!(link_for(&registry, &a), Some(PeerId::from("l1")));
        assert_eq!(connected_link(&registry, &a), None);
    }
}
