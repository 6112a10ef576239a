//! Overflow sinks — append-only destinations for bodies too large for memory.
//!
//! The deserializer opens one sink per oversized body through a caller
//! supplied [`OverflowSinkFactory`]. Where sinks live and when they are
//! cleaned up is the caller's business.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use crate::message::SessionMessage;

pub trait OverflowSink: Send {
    /// Append body bytes in stream order.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Called once after the last body byte.
    fn finish(&mut self) -> io::Result<()>;

    /// Where the bytes ended up, if the sink has a meaningful location.
    fn location(&self) -> Option<PathBuf> {
        None
    }
}

pub trait OverflowSinkFactory: Send {
    fn open(&mut self, message: &SessionMessage) -> io::Result<Box<dyn OverflowSink>>;
}

/// Writes each body to a uniquely named `<hex>.body` file in `dir`.
#[derive(Debug, Clone)]
pub struct FileSinkFactory {
    dir: PathBuf,
}

impl FileSinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl OverflowSinkFactory for FileSinkFactory {
    fn open(&mut self, message: &SessionMessage) -> io::Result<Box<dyn OverflowSink>> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("{}.body", hex::encode(rand::random::<[u8; 16]>())));
        let file = File::create(&path)?;
        tracing::debug!(
            message_id = message.id(),
            body_length = message.body_length(),
            path = %path.display(),
            "overflow body file opened"
        );
        Ok(Box::new(FileSink {
            writer: BufWriter::new(file),
            path,
        }))
    }
}

struct FileSink {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl OverflowSink for FileSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    fn location(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}
