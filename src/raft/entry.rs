//! Log entry representation and its framed codec.
//!
//! Every record, on disk and on the wire, is a 24-byte header followed
//! by the payload: `[kind:4|len:60][index:8][term:8]`, all big-endian.

use std::io::{self, Read};

use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::{Error, Result};

/// Size of the fixed record header: packed kind/length, index, term.
pub const ENTRY_HEADER_SIZE: usize = 8 + 8 + 8;

/// Upper bound on a single entry payload. Bounds allocations driven by
/// a corrupt or hostile header.
pub const MAX_ENTRY_DATA_LEN: u64 = 64 * 1024 * 1024;

const KIND_SHIFT: u32 = 60;
const LEN_MASK: u64 = (1 << KIND_SHIFT) - 1;

/// Kind of a log entry. Non-command kinds are handled by the log
/// itself and never reach the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Opaque client command, applied to the state machine.
    Command,
    /// No-op appended by a freshly elected leader.
    Nop,
    /// Serialized cluster membership; installed on commit.
    Config,
}

impl EntryKind {
    fn from_nibble(nibble: u8) -> Result<EntryKind> {
        match nibble {
            0 => Ok(EntryKind::Command),
            1 => Ok(EntryKind::Nop),
            2 => Ok(EntryKind::Config),
            // 0xF is reserved for the future snapshot stream marker.
            other => Err(Error::InvalidEntryKind(other)),
        }
    }

    fn nibble(self) -> u8 {
        match self {
            EntryKind::Command => 0,
            EntryKind::Nop => 1,
            EntryKind::Config => 2,
        }
    }
}

/// A single record in the replicated log. `(index, term)` uniquely
/// identifies an entry across the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: EntryKind,
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(kind: EntryKind, index: u64, term: u64, data: Vec<u8>) -> LogEntry {
        LogEntry {
            kind,
            index,
            term,
            data,
        }
    }

    /// Encoded header for this entry.
    pub fn encoded_header(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut b = [0u8; ENTRY_HEADER_SIZE];
        let packed = (u64::from(self.kind.nibble()) << KIND_SHIFT) | self.data.len() as u64;
        b[0..8].copy_from_slice(&packed.to_be_bytes());
        b[8..16].copy_from_slice(&self.index.to_be_bytes());
        b[16..24].copy_from_slice(&self.term.to_be_bytes());
        b
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.data.len()
    }

    /// Append the full frame to `buf`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.encoded_header());
        buf.extend_from_slice(&self.data);
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf
    }
}

fn unpack_header(header: &[u8; ENTRY_HEADER_SIZE]) -> Result<(EntryKind, u64, u64, u64)> {
    let packed = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let kind = EntryKind::from_nibble((packed >> KIND_SHIFT) as u8)?;
    let len = packed & LEN_MASK;
    if len > MAX_ENTRY_DATA_LEN {
        return Err(Error::Oversize);
    }
    let index = u64::from_be_bytes(header[8..16].try_into().unwrap());
    let term = u64::from_be_bytes(header[16..24].try_into().unwrap());
    Ok((kind, len, index, term))
}

/// Read a full header, distinguishing a clean EOF at a record
/// boundary (`None`) from a stream that ends mid-header.
fn read_header(r: &mut impl Read) -> Result<Option<[u8; ENTRY_HEADER_SIZE]>> {
    let mut header = [0u8; ENTRY_HEADER_SIZE];
    let mut filled = 0;
    while filled < ENTRY_HEADER_SIZE {
        match r.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(Error::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(header))
}

/// Decode one entry from a blocking reader. Returns `Ok(None)` on a
/// clean EOF at a record boundary; `Truncated` if the stream ends
/// mid-record.
pub fn decode_from(r: &mut impl Read) -> Result<Option<LogEntry>> {
    let header = match read_header(r)? {
        Some(h) => h,
        None => return Ok(None),
    };
    let (kind, len, index, term) = unpack_header(&header)?;
    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Truncated
        } else {
            e.into()
        }
    })?;
    Ok(Some(LogEntry {
        kind,
        index,
        term,
        data,
    }))
}

/// Decode one entry from an async reader, with the same EOF semantics
/// as [`decode_from`].
pub async fn decode_from_async<R>(r: &mut R) -> Result<Option<LogEntry>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; ENTRY_HEADER_SIZE];
    let mut filled = 0;
    while filled < ENTRY_HEADER_SIZE {
        match r.read(&mut header[filled..]).await {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(Error::Truncated),
            Ok(n) => filled += n,
            Err(e) => return Err(e.into()),
        }
    }
    let (kind, len, index, term) = unpack_header(&header)?;
    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Truncated
        } else {
            e.into()
        }
    })?;
    Ok(Some(LogEntry {
        kind,
        index,
        term,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trip() {
        let entry = LogEntry::new(EntryKind::Config, 42, 7, b"abc".to_vec());
        let encoded = entry.encode();
        assert_eq!(encoded.len(), ENTRY_HEADER_SIZE + 3);

        let decoded = decode_from(&mut Cursor::new(&encoded)).unwrap().unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn empty_payload_round_trip() {
        let entry = LogEntry::new(EntryKind::Nop, 1, 1, Vec::new());
        let decoded = decode_from(&mut Cursor::new(entry.encode()))
            .unwrap()
            .unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn clean_eof_yields_none() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(decode_from(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_payload_rejected() {
        let entry = LogEntry::new(EntryKind::Command, 3, 2, b"payload".to_vec());
        let mut encoded = entry.encode();
        encoded.truncate(encoded.len() - 2);
        match decode_from(&mut Cursor::new(encoded)) {
            Err(Error::Truncated) => {}
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn truncated_header_rejected() {
        let entry = LogEntry::new(EntryKind::Command, 3, 2, b"x".to_vec());
        let encoded = entry.encode();
        match decode_from(&mut Cursor::new(&encoded[..10])) {
            Err(Error::Truncated) => {}
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn oversize_rejected() {
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        let packed = MAX_ENTRY_DATA_LEN + 1; // kind nibble 0 = Command
        header[0..8].copy_from_slice(&packed.to_be_bytes());
        match decode_from(&mut Cursor::new(header.to_vec())) {
            Err(Error::Oversize) => {}
            other => panic!("expected Oversize, got {:?}", other),
        }
    }

    #[test]
    fn reserved_snapshot_marker_rejected() {
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        let packed = 0xFu64 << 60;
        header[0..8].copy_from_slice(&packed.to_be_bytes());
        match decode_from(&mut Cursor::new(header.to_vec())) {
            Err(Error::InvalidEntryKind(0xF)) => {}
            other => panic!("expected InvalidEntryKind, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn async_decode_matches_sync() {
        let entry = LogEntry::new(EntryKind::Command, 9, 4, b"hello".to_vec());
        let encoded = entry.encode();

        let (mut tx, mut rx) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &encoded)
            .await
            .unwrap();
        drop(tx);

        let decoded = decode_from_async(&mut rx).await.unwrap().unwrap();
        assert_eq!(decoded, entry);
        assert!(decode_from_async(&mut rx).await.unwrap().is_none());
    }
}
