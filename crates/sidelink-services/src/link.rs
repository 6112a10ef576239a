//! Stream link — drives one connection over any byte stream.
//!
//! A single loop per connection alternates between draining the peer's
//! chunk queue and reading with a short timeout, so outgoing chunks are
//! written even while the remote is silent. Dropping out of the loop, for
//! any reason, marks the peer disconnected. Whatever is still queued stays
//! there until the session manager decides what to do with it.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};

use crate::chunk_queue::ChunkQueue;
use crate::transport::{ConnectionStatus, PeerId, TransportError, TransportEvent};

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub read_timeout: Duration,
    pub read_buffer: usize,
    /// Largest chunk this link writes at once. Declared on the chunk queue
    /// when the link comes up; `None` keeps the queue default.
    pub mtu: Option<usize>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(50),
            read_buffer: 4096,
            mtu: None,
        }
    }
}

pub struct StreamLink {
    peer: PeerId,
    is_host: bool,
    queue: ChunkQueue,
    events: mpsc::Sender<TransportEvent>,
    config: LinkConfig,
    shutdown: broadcast::Receiver<()>,
}

impl StreamLink {
    pub fn new(
        peer: PeerId,
        is_host: bool,
        queue: ChunkQueue,
        events: mpsc::Sender<TransportEvent>,
        config: LinkConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            peer,
            is_host,
            queue,
            events,
            config,
            shutdown,
        }
    }

    pub async fn run<S>(mut self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(mtu) = self.config.mtu {
            self.queue.set_mtu(&self.peer, mtu);
        }
        self.queue.set_status(&self.peer, ConnectionStatus::Connected);
        self.status(ConnectionStatus::Connected).await;
        tracing::info!(
            peer = %self.peer,
            is_host = self.is_host,
            mtu = self.queue.mtu(&self.peer),
            "link up"
        );

        let result = self.drive(stream).await;

        self.queue.set_status(&self.peer, ConnectionStatus::Disconnected);
        self.status(ConnectionStatus::Disconnected).await;
        match &result {
            Ok(()) => tracing::info!(peer = %self.peer, "link down"),
            Err(e) => tracing::warn!(peer = %self.peer, error = %e, "link failed"),
        }
        result
    }

    async fn drive<S>(&mut self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let notify = self.queue.notifier(&self.peer);
        let mut buf = vec![0u8; self.config.read_buffer.max(1)];

        loop {
            while let Some(chunk) = self.queue.next_to_send(&self.peer) {
                let written = match writer.write_all(&chunk).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(source) = written {
                    self.queue.send_failed(&self.peer);
                    let error = TransportError::Io {
                        peer: self.peer.clone(),
                        source,
                    };
                    tracing::warn!(peer = %self.peer, error = %error, "chunk send failed, will retry");
                    let message = error.to_string();
                    self.emit(TransportEvent::SendFailed {
                        peer: self.peer.clone(),
                        error,
                    })
                    .await?;
                    anyhow::bail!(message);
                }
                if let Some(delivered) = self.queue.confirm_delivered(&self.peer) {
                    tracing::trace!(peer = %self.peer, bytes = delivered.len, "chunk written");
                    if let Some(len) = delivered.payload_len {
                        self.emit(TransportEvent::DataSent {
                            peer: self.peer.clone(),
                            len,
                        })
                        .await?;
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(peer = %self.peer, "link shutting down");
                    return Ok(());
                }

                _ = notify.notified() => {}

                read = tokio::time::timeout(self.config.read_timeout, reader.read(&mut buf)) => {
                    match read {
                        Err(_elapsed) => {}
                        Ok(Ok(0)) => {
                            tracing::debug!(peer = %self.peer, "remote closed the stream");
                            return Ok(());
                        }
                        Ok(Ok(n)) => {
                            self.emit(TransportEvent::DataReceived {
                                peer: self.peer.clone(),
                                bytes: Bytes::copy_from_slice(&buf[..n]),
                            })
                            .await?;
                        }
                        Ok(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    async fn emit(&self, event: TransportEvent) -> anyhow::Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("session manager is gone"))
    }

    async fn status(&self, status: ConnectionStatus) {
        let event = TransportEvent::StatusChanged {
            peer: self.peer.clone(),
            status,
            is_host: self.is_host,
        };
        if self.events.send(event).await.is_err() {
            tracing::debug!(peer = %self.peer, ?status, "status change not delivered, session manager is gone");
        }
    }
}
