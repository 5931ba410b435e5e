//! Capture directory: raw log, two message tables and the binary payload store.
//!
//! ```text
//! <dir>/raw.bin         byte-exact copy of the stream, no framing
//! <dir>/text.tbl        TableHeader, then TextRow records
//! <dir>/binary.tbl      TableHeader, then BinaryRow records
//! <dir>/binary.payload  concatenated binary payload bytes
//! ```
//!
//! The raw log is flushed ahead of every payload chunk and every row, so on
//! disk it is never behind what was derived from it.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::demux::DemuxConfig;
use crate::error::{PersistenceError, ReplayError};
use crate::message::MessageKind;
use crate::record::{
    BinaryRow, FORMAT_VERSION, FrameReader, RecordFrame, TableHeader, TextRow, encode_frame,
    now_unix_ns,
};

pub const RAW_FILE: &str = "raw.bin";
pub const TEXT_FILE: &str = "text.tbl";
pub const BINARY_FILE: &str = "binary.tbl";
pub const PAYLOAD_FILE: &str = "binary.payload";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureLayout {
    pub raw: PathBuf,
    pub text: PathBuf,
    pub binary: PathBuf,
    pub payload: PathBuf,
}

impl CaptureLayout {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            raw: dir.join(RAW_FILE),
            text: dir.join(TEXT_FILE),
            binary: dir.join(BINARY_FILE),
            payload: dir.join(PAYLOAD_FILE),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub raw_bytes: u64,
    pub text_rows: u64,
    pub binary_rows: u64,
    pub payload_bytes: u64,
}

struct Output {
    path: PathBuf,
    w: BufWriter<File>,
}

impl Output {
    fn create(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| PersistenceError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            w: BufWriter::with_capacity(1 << 20, file),
        })
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.w
            .write_all(bytes)
            .map_err(|e| PersistenceError::io(&self.path, e))
    }

    fn flush(&mut self) -> Result<(), PersistenceError> {
        self.w.flush().map_err(|e| PersistenceError::io(&self.path, e))
    }

    fn sync(&mut self) -> Result<(), PersistenceError> {
        self.flush()?;
        self.w
            .get_ref()
            .sync_all()
            .map_err(|e| PersistenceError::io(&self.path, e))
    }
}

/// Append-only writer for one capture.
pub struct CaptureStore {
    raw: Output,
    text: Output,
    binary: Output,
    payload: Output,
    raw_dirty: bool,
    first_seq: u64,
    summary: CaptureSummary,
}

impl CaptureStore {
    /// Create (or truncate) the capture files and write both table headers.
    pub fn create(
        layout: &CaptureLayout,
        peer: &str,
        demux: DemuxConfig,
    ) -> Result<Self, PersistenceError> {
        Self::create_from(layout, peer, demux, 0)
    }

    /// Like [`CaptureStore::create`] for a sequencer that starts at `first_seq`.
    pub fn create_from(
        layout: &CaptureLayout,
        peer: &str,
        demux: DemuxConfig,
        first_seq: u64,
    ) -> Result<Self, PersistenceError> {
        let mut store = Self {
            raw: Output::create(&layout.raw)?,
            text: Output::create(&layout.text)?,
            binary: Output::create(&layout.binary)?,
            payload: Output::create(&layout.payload)?,
            raw_dirty: false,
            first_seq,
            summary: CaptureSummary::default(),
        };
        let created_unix_ns = now_unix_ns();
        for (kind, out) in [
            (MessageKind::Text, &mut store.text),
            (MessageKind::Binary, &mut store.binary),
        ] {
            let header = RecordFrame::Header(TableHeader {
                version: FORMAT_VERSION,
                kind,
                created_unix_ns,
                peer: peer.to_string(),
                first_seq,
                demux,
            });
            out.write(&encode_frame(&header)?)?;
        }
        Ok(store)
    }

    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.raw.write(bytes)?;
        self.raw_dirty |= !bytes.is_empty();
        self.summary.raw_bytes += bytes.len() as u64;
        Ok(())
    }

    pub fn append_payload(&mut self, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.flush_raw()?;
        self.payload.write(bytes)?;
        self.summary.payload_bytes += bytes.len() as u64;
        Ok(())
    }

    pub fn write_text(&mut self, row: &TextRow) -> Result<(), PersistenceError> {
        self.flush_raw()?;
        let frame = encode_frame(&RecordFrame::Text(row.clone()))?;
        self.text.write(&frame)?;
        self.summary.text_rows += 1;
        Ok(())
    }

    pub fn write_binary(&mut self, row: &BinaryRow) -> Result<(), PersistenceError> {
        let end = row.payload_offset + row.received_length;
        if end > self.summary.payload_bytes {
            return Err(PersistenceError::PayloadUnderrun {
                claimed: end,
                available: self.summary.payload_bytes,
            });
        }
        self.flush_raw()?;
        let frame = encode_frame(&RecordFrame::Binary(row.clone()))?;
        self.binary.write(&frame)?;
        self.summary.binary_rows += 1;
        Ok(())
    }

    /// Total payload bytes streamed so far; the next frame's payload starts here.
    pub fn payload_len(&self) -> u64 {
        self.summary.payload_bytes
    }

    /// First arrival index recorded in the table headers.
    pub fn first_seq(&self) -> u64 {
        self.first_seq
    }

    pub fn summary(&self) -> CaptureSummary {
        self.summary
    }

    /// Flush and fsync every file, raw log first.
    pub fn finish(mut self) -> Result<CaptureSummary, PersistenceError> {
        self.raw.sync()?;
        self.payload.sync()?;
        self.text.sync()?;
        self.binary.sync()?;
        Ok(self.summary)
    }

    fn flush_raw(&mut self) -> Result<(), PersistenceError> {
        if self.raw_dirty {
            self.raw.flush()?;
            self.raw_dirty = false;
        }
        Ok(())
    }
}

/// Rows read back from a capture directory.
#[derive(Debug, Clone)]
pub struct Tables {
    pub text_header: TableHeader,
    pub binary_header: TableHeader,
    pub text: Vec<TextRow>,
    pub binary: Vec<BinaryRow>,
}

impl Tables {
    pub fn load(layout: &CaptureLayout) -> Result<Self, ReplayError> {
        let (text_header, text) = read_text_table(&layout.text)?;
        let (binary_header, binary) = read_binary_table(&layout.binary)?;
        Ok(Self {
            text_header,
            binary_header,
            text,
            binary,
        })
    }
}

pub fn read_text_table(path: &Path) -> Result<(TableHeader, Vec<TextRow>), ReplayError> {
    read_table(path, MessageKind::Text, |frame| match frame {
        RecordFrame::Text(row) => Some(row),
        _ => None,
    })
}

pub fn read_binary_table(path: &Path) -> Result<(TableHeader, Vec<BinaryRow>), ReplayError> {
    read_table(path, MessageKind::Binary, |frame| match frame {
        RecordFrame::Binary(row) => Some(row),
        _ => None,
    })
}

fn read_table<T>(
    path: &Path,
    kind: MessageKind,
    pick: impl Fn(RecordFrame) -> Option<T>,
) -> Result<(TableHeader, Vec<T>), ReplayError> {
    let expected = match kind {
        MessageKind::Text => "text",
        MessageKind::Binary => "binary",
    };
    let file = File::open(path).map_err(|e| ReplayError::io(path, e))?;
    let mut rdr = FrameReader::new(BufReader::new(file), path);

    let header = match rdr.next_frame()? {
        Some(RecordFrame::Header(h)) if h.kind == kind => h,
        _ => {
            return Err(ReplayError::BadHeader {
                path: path.to_path_buf(),
                expected,
            });
        }
    };
    if header.version != FORMAT_VERSION {
        return Err(ReplayError::Version {
            path: path.to_path_buf(),
            found: header.version,
            expected: FORMAT_VERSION,
        });
    }

    let mut rows = Vec::new();
    while let Some(frame) = rdr.next_frame()? {
        let row = pick(frame).ok_or_else(|| ReplayError::UnexpectedRecord {
            path: path.to_path_buf(),
            index: rows.len() + 1,
            expected,
        })?;
        rows.push(row);
    }
    Ok((header, rows))
}

/// Random access to the binary payload store.
pub struct PayloadStore {
    path: PathBuf,
    file: File,
    len: u64,
}

impl PayloadStore {
    pub fn open(path: &Path) -> Result<Self, ReplayError> {
        let file = File::open(path).map_err(|e| ReplayError::io(path, e))?;
        let len = file.metadata().map_err(|e| ReplayError::io(path, e))?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes referenced by `row`.
    pub fn read(&mut self, row: &BinaryRow) -> Result<Vec<u8>, ReplayError> {
        let end = row.payload_offset.saturating_add(row.received_length);
        if end > self.len {
            return Err(ReplayError::PayloadOutOfRange {
                arrival_seq: row.arrival_seq,
                offset: row.payload_offset,
                end,
                len: self.len,
            });
        }
        self.read_at(row.payload_offset, row.received_length)
    }

    /// Up to `len` bytes starting at `offset`; fewer when the store ends first.
    pub fn read_at(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, ReplayError> {
        let end = offset.saturating_add(len).min(self.len);
        let size = usize::try_from(end.saturating_sub(offset)).map_err(|_| {
            ReplayError::io(&self.path, io::Error::from(io::ErrorKind::InvalidInput))
        })?;
        let mut buf = vec![0u8; size];
        if size > 0 {
            self.file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| self.file.read_exact(&mut buf))
                .map_err(|e| ReplayError::io(&self.path, e))?;
        }
        Ok(buf)
    }
}
