//! Received transfer storage — one file per incoming transfer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sidelink_core::message::generate_id;
use sidelink_core::Body;
use sidelink_services::IncomingTransfer;

/// Writes each transfer body to `<dir>/<transfer-id>`, with any extra
/// headers next to it as `<transfer-id>.json`.
#[derive(Debug, Clone)]
pub struct ReceivedStore {
    dir: PathBuf,
}

impl ReceivedStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn save(&self, transfer: &IncomingTransfer) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let name = file_name_for(transfer.id());
        let path = self.dir.join(&name);
        match transfer.body() {
            Some(Body::Memory(bytes)) => tokio::fs::write(&path, bytes).await?,
            Some(Body::Overflow { location: Some(src), .. }) => move_file(src, &path).await?,
            Some(Body::Overflow { location: None, .. }) => {
                anyhow::bail!("overflow body of {} has no location", transfer.id())
            }
            None => tokio::fs::write(&path, b"").await?,
        }

        if let Some(extra) = transfer.extra() {
            let meta = self.dir.join(format!("{name}.json"));
            tokio::fs::write(&meta, serde_json::to_vec_pretty(extra)?).await?;
        }
        Ok(path)
    }
}

/// Remote ids become file names, so anything but a plain token is replaced.
fn file_name_for(id: &str) -> String {
    let plain = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        id.to_string()
    } else {
        tracing::warn!(transfer_id = id, "transfer id is not a safe file name, renaming");
        generate_id()
    }
}

async fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if tokio::fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }
    // Overflow and received directories may sit on different filesystems.
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    tokio::fs::remove_file(src).await?;
    Ok(())
}
