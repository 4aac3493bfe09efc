//! Append-only session recording.
//!
//! A recording is a flat stream of framed entries, one per observed wire
//! message: u64 milliseconds since the recorder was opened, a one-byte leg
//! tag, a u32 length, then the original wire-form message including its type
//! byte. Entries from both legs interleave in arrival order; end of file
//! means the session closed.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::{BufMut, BytesMut};
use log::info;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;

use crate::error::{ProxyError, Result};
use crate::protocol::MAX_BLOB_LEN;

/// Direction of a recorded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LegTag {
    /// Message observed on the inbound leg, client to server.
    ClientToServer = 0,
    /// Message observed on the outbound leg, server to client.
    ServerToClient = 1,
}

impl LegTag {
    fn from_byte(byte: u8) -> Result<LegTag> {
        match byte {
            0 => Ok(LegTag::ClientToServer),
            1 => Ok(LegTag::ServerToClient),
            other => Err(ProxyError::Protocol(format!(
                "invalid recording leg tag {other}"
            ))),
        }
    }
}

/// Writes the framed recording stream for one session.
///
/// One recorder is registered as a sink on both legs, so its entries carry
/// the real-time interleaving of the session. Writes are buffered; the
/// orchestrator flushes on teardown.
pub struct Recorder {
    file: Mutex<BufWriter<File>>,
    start: Instant,
    path: PathBuf,
}

impl Recorder {
    /// Creates the recording file, truncating any previous content.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Sink`] when the file cannot be created.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path).await.map_err(|e| {
            ProxyError::Sink(format!("cannot create recording {}: {e}", path.display()))
        })?;
        info!("recording session to {}", path.display());
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
            start: Instant::now(),
            path,
        })
    }

    /// Appends one wire message observed on the given leg.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Sink`] on write failure, which tears down the
    /// publishing leg.
    pub async fn record(&self, leg: LegTag, message: &[u8]) -> Result<()> {
        let mut entry = BytesMut::with_capacity(13 + message.len());
        entry.put_u64(self.start.elapsed().as_millis() as u64);
        entry.put_u8(leg as u8);
        entry.put_u32(message.len() as u32);
        entry.put_slice(message);

        let mut file = self.file.lock().await;
        file.write_all(&entry)
            .await
            .map_err(|e| ProxyError::Sink(format!("recording write failed: {e}")))
    }

    /// Flushes buffered entries to disk.
    pub async fn close(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush()
            .await
            .map_err(|e| ProxyError::Sink(format!("recording flush failed: {e}")))
    }

    /// Location of the recording file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One entry read back from a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEntry {
    /// Milliseconds since the start of the recording.
    pub timestamp_ms: u64,
    /// Which leg the message was observed on.
    pub leg: LegTag,
    /// The original wire-form message, type byte included.
    pub message: Vec<u8>,
}

/// Sequential reader for the recording format.
pub struct RecordingReader {
    file: BufReader<File>,
}

impl RecordingReader {
    /// Opens a recording for replay.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            file: BufReader::new(file),
        })
    }

    /// Reads the next entry, or `None` at a clean end of file.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] for corrupt entries and
    /// [`ProxyError::Io`] when the file ends mid-entry.
    pub async fn next_entry(&mut self) -> Result<Option<RecordedEntry>> {
        let timestamp_ms = match self.file.read_u64().await {
            Ok(value) => value,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let leg = LegTag::from_byte(self.file.read_u8().await?)?;
        let length = self.file.read_u32().await? as usize;
        if length > MAX_BLOB_LEN {
            return Err(ProxyError::Protocol(format!(
                "recording entry length {length} exceeds limit"
            )));
        }
        let mut message = vec![0u8; length];
        self.file.read_exact(&mut message).await?;
        Ok(Some(RecordedEntry {
            timestamp_ms,
            leg,
            message,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rustvncproxy-{}-{name}.rbs", std::process::id()))
    }

    #[tokio::test]
    async fn test_recording_roundtrip() {
        let path = scratch_path("roundtrip");
        let recorder = Recorder::create(&path).await.unwrap();
        recorder
            .record(LegTag::ClientToServer, &[4, 1, 0, 0, 0, 0, 0, 0x41])
            .await
            .unwrap();
        recorder
            .record(LegTag::ServerToClient, &[2])
            .await
            .unwrap();
        recorder.close().await.unwrap();

        let mut reader = RecordingReader::open(&path).await.unwrap();
        let first = reader.next_entry().await.unwrap().unwrap();
        let second = reader.next_entry().await.unwrap().unwrap();
        assert!(reader.next_entry().await.unwrap().is_none());

        assert_eq!(first.leg, LegTag::ClientToServer);
        assert_eq!(first.message, vec![4, 1, 0, 0, 0, 0, 0, 0x41]);
        assert_eq!(second.leg, LegTag::ServerToClient);
        assert_eq!(second.message, vec![2]);
        assert!(second.timestamp_ms >= first.timestamp_ms);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_recording_reads_as_closed() {
        let path = scratch_path("empty");
        let recorder = Recorder::create(&path).await.unwrap();
        recorder.close().await.unwrap();

        let mut reader = RecordingReader::open(&path).await.unwrap();
        assert!(reader.next_entry().await.unwrap().is_none());

        tokio::fs::remove_file(&path).await.unwrap();
    }
}
