use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use crate::demux::DemuxConfig;
use crate::error::ReplayError;
use crate::message::{Marker, MessageKind};

pub const FORMAT_VERSION: u16 = 2;

/// First record of every table file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableHeader {
    pub version: u16,
    pub kind: MessageKind,
    pub created_unix_ns: u128,
    pub peer: String,
    /// Arrival index of the capture's first message.
    pub first_seq: u64,
    /// Scanner settings the capture ran with; replay reuses them.
    pub demux: DemuxConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRow {
    pub arrival_seq: u64,
    pub payload: String,
    pub arrival_unix_ns: u128, // informational, never an ordering key
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryRow {
    pub arrival_seq: u64,
    pub marker: Marker,
    /// Start of this frame's bytes in the payload store.
    pub payload_offset: u64,
    pub declared_length: u64,
    pub received_length: u64,
    pub truncated: bool,
    pub arrival_unix_ns: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordFrame {
    Header(TableHeader),
    Text(TextRow),
    Binary(BinaryRow),
}

pub fn now_unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// RFC 3339 rendering of a stored arrival time.
pub fn format_unix_ns(ns: u128) -> String {
    i128::try_from(ns)
        .ok()
        .and_then(|ns| OffsetDateTime::from_unix_timestamp_nanos(ns).ok())
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| format!("{ns}ns"))
}

/// Encode a record as `[len: u32 LE][crc32: u32 LE][bincode payload]`.
pub fn encode_frame(frame: &RecordFrame) -> bincode::Result<Vec<u8>> {
    let payload = bincode::serialize(frame)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Sequential reader over a CRC-framed table file.
pub struct FrameReader<R> {
    inner: R,
    path: PathBuf,
    index: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, path: impl AsRef<Path>) -> Self {
        Self {
            inner,
            path: path.as_ref().to_path_buf(),
            index: 0,
        }
    }

    /// Next record, or `None` at end of file. A record cut off by an aborted
    /// capture also ends the table.
    pub fn next_frame(&mut self) -> Result<Option<RecordFrame>, ReplayError> {
        let mut head = [0u8; 8];
        match read_full(&mut self.inner, &mut head) {
            Ok(0) => return Ok(None),
            Ok(n) if n < head.len() => {
                warn!(path = ?self.path, record = self.index, "torn record header at end of table");
                return Ok(None);
            }
            Ok(_) => {}
            Err(e) => return Err(ReplayError::io(&self.path, e)),
        }
        let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let stored = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);

        let mut payload = vec![0u8; len];
        let got = read_full(&mut self.inner, &mut payload).map_err(|e| ReplayError::io(&self.path, e))?;
        if got < len {
            warn!(path = ?self.path, record = self.index, "torn record at end of table");
            return Ok(None);
        }

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let computed = hasher.finalize();
        if computed != stored {
            return Err(ReplayError::Crc {
                path: self.path.clone(),
                index: self.index,
                stored,
                computed,
            });
        }
        let frame = bincode::deserialize(&payload).map_err(|source| ReplayError::Decode {
            path: self.path.clone(),
            index: self.index,
            source,
        })?;
        self.index += 1;
        Ok(Some(frame))
    }
}

/// Like `read_exact`, but reports how much was read when EOF comes first.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(seq: u64) -> RecordFrame {
        RecordFrame::Text(TextRow {
            arrival_seq: seq,
            payload: "HELLO".into(),
            arrival_unix_ns: 0,
        })
    }

    #[test]
    fn reads_back_framed_records() {
        let mut buf = encode_frame(&text(0)).unwrap();
        buf.extend(encode_frame(&text(1)).unwrap());
        let mut r = FrameReader::new(buf.as_slice(), "mem");
        assert_eq!(r.next_frame().unwrap(), Some(text(0)));
        assert_eq!(r.next_frame().unwrap(), Some(text(1)));
        assert_eq!(r.next_frame().unwrap(), None);
    }

    #[test]
    fn crc_mismatch_detected() {
        let mut buf = encode_frame(&text(0)).unwrap();
        buf[4..8].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let mut r = FrameReader::new(buf.as_slice(), "bad");
        match r.next_frame() {
            Err(ReplayError::Crc { stored, index, .. }) => {
                assert_eq!(stored, 0xDEADBEEF);
                assert_eq!(index, 0);
            }
            other => panic!("expected CRC error, got {other:?}"),
        }
    }

    #[test]
    fn torn_tail_ends_table() {
        let mut buf = encode_frame(&text(0)).unwrap();
        let second = encode_frame(&text(1)).unwrap();
        buf.extend_from_slice(&second[..second.len() - 3]);
        let mut r = FrameReader::new(buf.as_slice(), "torn");
        assert!(r.next_frame().unwrap().is_some());
        assert_eq!(r.next_frame().unwrap(), None);
    }

    #[test]
    fn formats_arrival_time() {
        assert_eq!(format_unix_ns(0), "1970-01-01T00:00:00Z");
        assert!(format_unix_ns(86_400_000_000_000).starts_with("1970-01-02T00:00:00"));
    }
}
