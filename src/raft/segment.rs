//! Durable append-only log segment with streaming tails.
//!
//! A segment holds a contiguous run of entries starting at
//! `base_index`. Appends go to an in-memory buffer and are mirrored to
//! the backing file; every registered tail receives the newly written
//! frame in append order. Sealing is terminal: a sealed segment admits
//! no appends, truncations, or new tails.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;

use super::entry::{self, LogEntry};
use super::error::{Error, Result};

/// Frames buffered per tail before a slow consumer is considered
/// lagged and dropped.
const TAIL_CHANNEL_CAPACITY: usize = 128;

/// Storage contract between the replica and its active segment. The
/// replica only speaks this interface, so a rotation policy can slot
/// in behind it later.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Durably append one entry and fan its frame out to live tails.
    /// Entries must arrive in index order.
    fn append(&self, entry: &LogEntry) -> Result<()>;

    /// Remove every entry with index >= `index`.
    fn truncate(&self, index: u64) -> Result<()>;

    /// Stream entries from `from_index` through the current tail to
    /// `writer`, then keep forwarding appends until the segment seals
    /// or closes (normal return) or the writer fails.
    async fn write_to(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        from_index: u64,
    ) -> Result<()>;

    /// Mark the segment immutable and release every tail. Idempotent.
    fn seal(&self);

    /// Release all tails without sealing.
    fn close(&self);

    fn base_index(&self) -> u64;

    /// Index of the last entry, or `None` while empty.
    fn last_index(&self) -> Option<u64>;

    /// Term of the entry at `index`, if present.
    fn term_of(&self, index: u64) -> Option<u64>;

    /// Decode the entry at `index`.
    fn entry(&self, index: u64) -> Result<LogEntry>;

    fn is_sealed(&self) -> bool;
}

/// The active on-disk segment.
pub struct Segment {
    inner: Mutex<Inner>,
}

struct Inner {
    path: PathBuf,
    base_index: u64,
    offsets: Vec<u64>,
    buf: Vec<u8>,
    file: File,
    sealed: bool,
    closed: bool,
    // Dropped on seal/close so every tail receiver ends cleanly.
    tail_tx: Option<broadcast::Sender<Bytes>>,
}

impl Segment {
    /// Open the segment at `path`, replaying any existing records to
    /// rebuild the offset index. A trailing partial record from a
    /// crashed writer is discarded.
    pub fn open(path: impl AsRef<Path>, base_index: u64) -> Result<Segment> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut offsets = Vec::new();
        let mut cursor = &buf[..];
        let mut pos = 0u64;
        loop {
            match entry::decode_from(&mut cursor) {
                Ok(Some(e)) => {
                    let expect = base_index + offsets.len() as u64;
                    if e.index != expect {
                        log::warn!(
                            "segment {}: record index {} where {} expected, discarding tail",
                            path.display(),
                            e.index,
                            expect
                        );
                        break;
                    }
                    offsets.push(pos);
                    pos += e.encoded_len() as u64;
                }
                Ok(None) => break,
                Err(Error::Truncated) => {
                    log::warn!(
                        "segment {}: partial record at offset {}, discarding",
                        path.display(),
                        pos
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if pos < buf.len() as u64 {
            buf.truncate(pos as usize);
            file.set_len(pos)?;
        }
        file.seek(SeekFrom::Start(pos))?;

        let (tail_tx, _) = broadcast::channel(TAIL_CHANNEL_CAPACITY);
        Ok(Segment {
            inner: Mutex::new(Inner {
                path,
                base_index,
                offsets,
                buf,
                file,
                sealed: false,
                closed: false,
                tail_tx: Some(tail_tx),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn next_index(&self) -> u64 {
        self.base_index + self.offsets.len() as u64
    }

    fn offset_of(&self, index: u64) -> Result<u64> {
        if index < self.base_index || index > self.next_index() {
            return Err(Error::OutOfRange);
        }
        if index == self.next_index() {
            // One past the tail: a valid empty catch-up point.
            return Ok(self.buf.len() as u64);
        }
        Ok(self.offsets[(index - self.base_index) as usize])
    }

    fn frame_of(&self, index: u64) -> Result<&[u8]> {
        if index < self.base_index || index >= self.next_index() {
            return Err(Error::OutOfRange);
        }
        let pos = (index - self.base_index) as usize;
        let start = self.offsets[pos] as usize;
        let end = if pos + 1 < self.offsets.len() {
            self.offsets[pos + 1] as usize
        } else {
            self.buf.len()
        };
        Ok(&self.buf[start..end])
    }
}

#[async_trait]
impl SegmentStore for Segment {
    fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut inner = self.lock();
        if inner.sealed {
            return Err(Error::Sealed);
        }
        if inner.closed {
            return Err(Error::Closed);
        }
        assert!(
            entry.index == inner.next_index(),
            "segment append out of order: index {} where {} expected",
            entry.index,
            inner.next_index()
        );

        let frame = Bytes::from(entry.encode());
        let offset = inner.buf.len() as u64;
        inner.file.write_all(&frame)?;
        inner.file.flush()?;
        inner.buf.extend_from_slice(&frame);
        inner.offsets.push(offset);

        // Fan out after the bytes are durable. Send only fails with no
        // live receivers; lag is handled receiver-side.
        if let Some(tx) = &inner.tail_tx {
            let _ = tx.send(frame);
        }
        Ok(())
    }

    fn truncate(&self, index: u64) -> Result<()> {
        let mut inner = self.lock();
        if inner.sealed {
            return Err(Error::Sealed);
        }
        if index < inner.base_index {
            return Err(Error::OutOfRange);
        }
        if index >= inner.next_index() {
            return Ok(());
        }
        let pos = (index - inner.base_index) as usize;
        let cut = inner.offsets[pos];
        inner.buf.truncate(cut as usize);
        inner.offsets.truncate(pos);
        inner.file.set_len(cut)?;
        inner.file.seek(SeekFrom::Start(cut))?;
        Ok(())
    }

    async fn write_to(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        from_index: u64,
    ) -> Result<()> {
        // Snapshot the catch-up range and subscribe under one lock so
        // no append can slip between the prefix and the tail.
        let (snapshot, mut tail_rx) = {
            let inner = self.lock();
            let offset = inner.offset_of(from_index)?;
            let snapshot = Bytes::copy_from_slice(&inner.buf[offset as usize..]);
            let rx = inner.tail_tx.as_ref().map(|tx| tx.subscribe());
            (snapshot, rx)
        };

        if !snapshot.is_empty() {
            writer.write_all(&snapshot).await?;
            writer.flush().await?;
        }

        let mut rx = match tail_rx.take() {
            Some(rx) => rx,
            // Already sealed or closed: the prefix is all there is.
            None => return Ok(()),
        };

        loop {
            match rx.recv().await {
                Ok(frame) => {
                    writer.write_all(&frame).await?;
                    writer.flush().await?;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("tail writer lagged by {} frames, dropping", skipped);
                    return Err(Error::StreamLagged);
                }
            }
        }
    }

    fn seal(&self) {
        let mut inner = self.lock();
        inner.sealed = true;
        inner.tail_tx = None;
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.tail_tx = None;
    }

    fn base_index(&self) -> u64 {
        self.lock().base_index
    }

    fn last_index(&self) -> Option<u64> {
        let inner = self.lock();
        if inner.offsets.is_empty() {
            None
        } else {
            Some(inner.next_index() - 1)
        }
    }

    fn term_of(&self, index: u64) -> Option<u64> {
        let inner = self.lock();
        let frame = inner.frame_of(index).ok()?;
        Some(u64::from_be_bytes(frame[16..24].try_into().unwrap()))
    }

    fn entry(&self, index: u64) -> Result<LogEntry> {
        let inner = self.lock();
        let mut frame = inner.frame_of(index)?;
        match entry::decode_from(&mut frame)? {
            Some(e) => Ok(e),
            None => Err(Error::Truncated),
        }
    }

    fn is_sealed(&self) -> bool {
        self.lock().sealed
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Segment")
            .field("path", &inner.path)
            .field("base_index", &inner.base_index)
            .field("entries", &inner.offsets.len())
            .field("sealed", &inner.sealed)
            .finish()
    }
}
