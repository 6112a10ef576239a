//! Sidelink integration test harness.
//!
//! Each test runs two complete nodes in-process: a session manager per
//! node, joined by a pair of stream links over an in-memory duplex pipe.
//! Nothing touches the network; overflow bodies go to per-node temp dirs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use sidelink_core::{Peer, PublicKey};
use sidelink_services::{
    ChunkQueue, ConnectionStatus, LinkConfig, PeerId, SessionEvent, SessionHandle, SessionManager,
    StreamLink, TransportEvent,
};

mod sessions;
mod transfers;

// ── Harness ───────────────────────────────────────────────────────────────────

const EVENT_TIMEOUT: Duration = Duration::from_secs(20);
const PIPE_CAPACITY: usize = 64 * 1024;

static NODE_COUNTER: AtomicUsize = AtomicUsize::new(0);
static LINK_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// One in-process node.
pub struct Node {
    pub local: Peer,
    pub handle: SessionHandle,
    pub queue: ChunkQueue,
    pub overflow_dir: PathBuf,
    events: mpsc::Receiver<SessionEvent>,
    transport_tx: mpsc::Sender<TransportEvent>,
    shutdown: broadcast::Sender<()>,
}

pub fn spawn_node(alias: &str, key_byte: u8, transports: u32, mtu: usize) -> Node {
    spawn_node_with(alias, key_byte, transports, mtu, |_| {})
}

/// `setup` runs against the manager before it starts, for registering
/// transfer listeners.
pub fn spawn_node_with(
    alias: &str,
    key_byte: u8,
    transports: u32,
    mtu: usize,
    setup: impl FnOnce(&mut SessionManager),
) -> Node {
    let local = Peer::new(PublicKey::new(vec![key_byte; 32]), alias, transports);
    let overflow_dir = std::env::temp_dir().join(format!(
        "sidelink-it-{}-{}-{}",
        std::process::id(),
        alias,
        NODE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let queue = ChunkQueue::new(mtu);
    let (transport_tx, transport_rx) = mpsc::channel(1024);
    let (event_tx, events) = mpsc::channel(4096);
    let (shutdown, _) = broadcast::channel(1);

    let (mut manager, handle) = SessionManager::new(
        local.clone(),
        queue.clone(),
        overflow_dir.clone(),
        transport_rx,
        event_tx,
        shutdown.subscribe(),
    );
    setup(&mut manager);
    tokio::spawn(manager.run());

    Node {
        local,
        handle,
        queue,
        overflow_dir,
        events,
        transport_tx,
        shutdown,
    }
}

impl Node {
    pub fn key(&self) -> &PublicKey {
        &self.local.public_key
    }

    /// Stop the manager and every link of this node.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Skip events until `pick` accepts one.
    pub async fn wait_for<T>(&mut self, mut pick: impl FnMut(SessionEvent) -> Option<T>) -> Result<T> {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .with_context(|| format!("{}: timed out waiting for event", self.local.alias))?
                .with_context(|| format!("{}: event channel closed", self.local.alias))?;
            if let Some(found) = pick(event) {
                return Ok(found);
            }
        }
    }

    pub async fn wait_for_status(&mut self, status: ConnectionStatus) -> Result<(Peer, bool)> {
        self.wait_for(|event| match event {
            SessionEvent::PeerStatus { peer, status: s, is_host } if s == status => Some((peer, is_host)),
            _ => None,
        })
        .await
    }

    /// The link stops when the node shuts down or `cut` fires.
    fn spawn_link(
        &self,
        link: PeerId,
        is_host: bool,
        stream: tokio::io::DuplexStream,
        cut: &broadcast::Sender<()>,
    ) {
        let (stop, stop_rx) = broadcast::channel(1);
        let mut node_stop = self.shutdown.subscribe();
        let mut pipe_stop = cut.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = node_stop.recv() => {}
                Ok(()) = pipe_stop.recv() => {}
            }
            let _ = stop.send(());
        });

        let link = StreamLink::new(
            link,
            is_host,
            self.queue.clone(),
            self.transport_tx.clone(),
            LinkConfig {
                read_timeout: Duration::from_millis(20),
                ..LinkConfig::default()
            },
            stop_rx,
        );
        tokio::spawn(link.run(stream));
    }

    pub fn overflow_dir_cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.overflow_dir);
    }
}

/// One duplex pipe between two nodes.
pub struct Pipe {
    cut: broadcast::Sender<()>,
}

impl Pipe {
    /// Stop the links on both ends; the nodes keep running.
    pub fn cut(&self) {
        let _ = self.cut.send(());
    }
}

/// Join `host` and `guest` with a fresh pipe. `host` plays the accepting
/// side. Every pipe gets new transport identifiers on both ends.
pub fn link(host: &Node, guest: &Node) -> Pipe {
    let (host_end, guest_end) = tokio::io::duplex(PIPE_CAPACITY);
    let (cut, _) = broadcast::channel(1);
    let n = LINK_COUNTER.fetch_add(1, Ordering::Relaxed);
    host.spawn_link(PeerId::new(format!("to-{}-{n}", guest.local.alias)), true, host_end, &cut);
    guest.spawn_link(PeerId::new(format!("to-{}-{n}", host.local.alias)), false, guest_end, &cut);
    Pipe { cut }
}

/// Link the two nodes and wait until each has identified the other.
pub async fn connect(host: &mut Node, guest: &mut Node) -> Result<Pipe> {
    let pipe = link(host, guest);
    let (seen_by_host, host_is_host) = host.wait_for_status(ConnectionStatus::Connected).await?;
    let (seen_by_guest, guest_is_host) = guest.wait_for_status(ConnectionStatus::Connected).await?;
    assert_eq!(seen_by_host, guest.local);
    assert_eq!(seen_by_guest, host.local);
    assert!(host_is_host);
    assert!(!guest_is_host);
    Ok(pipe)
}
