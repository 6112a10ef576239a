//! sidelinkd — Sidelink session daemon.
//!
//! Usage: `sidelinkd [peer-addr [file]]`
//!
//! Accepts socket links on `network.listen_addr`. With `peer-addr` it also
//! dials that peer; with `file` it sends the file to the dialed peer once
//! the peer has identified itself. Every received transfer is written to
//! `storage.received_dir`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use sidelink_core::config::SidelinkConfig;
use sidelink_core::wire::transport_codes;
use sidelink_core::{Body, DataTransferMessage, Headers, Peer};
use sidelink_services::{
    ChunkQueue, ConnectionStatus, LinkConfig, PeerId, SessionEvent, SessionHandle, SessionManager,
    StreamLink, TransportEvent,
};

mod received;

use received::ReceivedStore;

const TRANSPORT_CHANNEL_CAPACITY: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SidelinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SidelinkConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SidelinkConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let peer_addr = args.next();
    let outgoing_file = args.next().map(PathBuf::from);

    let public_key = config.public_key().context("invalid identity key")?;
    let local = Peer::new(public_key, config.identity.alias.clone(), transport_codes::WIFI);
    tracing::info!(
        alias = %local.alias,
        public_key = %local.public_key,
        mtu = config.network.mtu,
        "sidelinkd starting"
    );

    // Shared state
    let queue = ChunkQueue::new(config.network.mtu);
    let (transport_tx, transport_rx) = mpsc::channel::<TransportEvent>(TRANSPORT_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(EVENT_CHANNEL_CAPACITY);
    let link_config = LinkConfig {
        read_timeout: Duration::from_millis(config.network.read_timeout_ms),
        read_buffer: config.network.mtu.max(4096),
        mtu: Some(config.network.mtu),
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let (manager, handle) = SessionManager::new(
        local,
        queue.clone(),
        config.storage.overflow_dir.clone(),
        transport_rx,
        event_tx,
        shutdown_tx.subscribe(),
    );
    let manager_task = tokio::spawn(manager.run());

    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening for links");

    let accept_task = tokio::spawn(accept_loop(
        listener,
        queue.clone(),
        transport_tx.clone(),
        link_config.clone(),
        shutdown_tx.clone(),
    ));

    if let Some(addr) = &peer_addr {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let peer = PeerId::from(stream.peer_addr()?);
        tracing::info!(peer = %peer, "outbound link");
        spawn_link(stream, peer, false, &queue, &transport_tx, &link_config, &shutdown_tx);
    }

    let store = ReceivedStore::new(config.storage.received_dir.clone());
    tracing::info!(path = %config.storage.received_dir.display(), "received transfer directory");
    let app_task = tokio::spawn(application_loop(event_rx, handle, outgoing_file, store));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = manager_task       => tracing::error!("session manager exited: {:?}", r),
        r = accept_task        => tracing::error!("accept loop exited: {:?}", r),
        r = app_task           => tracing::error!("application loop exited: {:?}", r),
    }

    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    queue: ChunkQueue,
    transport_tx: mpsc::Sender<TransportEvent>,
    config: LinkConfig,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let mut shutdown = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("accept loop shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, addr) = accepted.context("accept failed")?;
                tracing::info!(peer = %addr, "inbound link");
                spawn_link(stream, PeerId::from(addr), true, &queue, &transport_tx, &config, &shutdown_tx);
            }
        }
    }
}

fn spawn_link(
    stream: TcpStream,
    peer: PeerId,
    is_host: bool,
    queue: &ChunkQueue,
    transport_tx: &mpsc::Sender<TransportEvent>,
    config: &LinkConfig,
    shutdown_tx: &broadcast::Sender<()>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "failed to disable nagle");
    }
    let link = StreamLink::new(
        peer,
        is_host,
        queue.clone(),
        transport_tx.clone(),
        config.clone(),
        shutdown_tx.subscribe(),
    );
    tokio::spawn(async move {
        // Failures are logged by the link itself.
        let _ = link.run(stream).await;
    });
}

/// Reacts to session events: sends the requested file to the dialed peer and
/// stores everything received.
async fn application_loop(
    mut events: mpsc::Receiver<SessionEvent>,
    handle: SessionHandle,
    mut outgoing_file: Option<PathBuf>,
    store: ReceivedStore,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::PeerStatus { peer, status, is_host } => {
                tracing::info!(
                    peer = %peer.public_key.short(),
                    alias = %peer.alias,
                    ?status,
                    is_host,
                    "peer status"
                );
                // The dialed link is the one we are not hosting.
                if status == ConnectionStatus::Connected && !is_host {
                    if let Some(path) = outgoing_file.take() {
                        send_file(&handle, &peer, &path).await?;
                    }
                }
            }
            SessionEvent::DataReceived(transfer) => match store.save(&transfer).await {
                Ok(path) => tracing::info!(
                    transfer_id = transfer.id(),
                    from = %transfer.sender().alias,
                    path = %path.display(),
                    "transfer stored"
                ),
                Err(e) => tracing::warn!(transfer_id = transfer.id(), error = %e, "failed to store transfer"),
            },
            SessionEvent::DataSent(transfer) => {
                tracing::info!(
                    transfer_id = transfer.id(),
                    to = %transfer.recipient().alias,
                    "transfer delivered"
                );
            }
            SessionEvent::SendProgress { transfer_id, progress, .. } => {
                tracing::debug!(transfer_id = %transfer_id, progress, "send progress");
            }
            SessionEvent::ReceiveProgress { transfer_id, progress, .. } => {
                tracing::debug!(transfer_id = %transfer_id, progress, "receive progress");
            }
            SessionEvent::ReceiveFailed { sender, error } => {
                tracing::warn!(
                    peer = ?sender.map(|p| p.alias),
                    error = %error,
                    "receive failed"
                );
            }
            SessionEvent::SendFailed { transfer_id, error, .. } => {
                tracing::warn!(transfer_id = ?transfer_id, error = %error, "send failed");
            }
            SessionEvent::TransportUpgradeRequested { peer, transport_code } => {
                // Sockets are the only transport this daemon runs.
                tracing::info!(
                    peer = %peer.public_key.short(),
                    transport_code,
                    "transport upgrade requested, ignoring"
                );
            }
        }
    }
    Ok(())
}

async fn send_file(handle: &SessionHandle, peer: &Peer, path: &Path) -> Result<()> {
    let mut extra = Headers::new();
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        extra.insert("filename".into(), name.into());
    }
    let message = DataTransferMessage::from_file(path, Some(extra))
        .with_context(|| format!("failed to open {}", path.display()))?;
    let bytes = message.body().map(Body::len).unwrap_or(0);
    let id = handle.send_message(&peer.public_key, message).await?;
    tracing::info!(transfer_id = %id, to = %peer.alias, bytes, "file queued");
    Ok(())
}
