//! Error types for capture and replay.
//!
//! Only storage failures are errors during capture. Malformed frames,
//! oversized lengths and truncation are reported as frame events instead.
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A durable write failed. The capture session must abort.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("write to {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("record encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    #[error("failed to start capture writer: {0}")]
    Spawn(#[source] io::Error),

    #[error("capture writer stopped before the session finished")]
    WriterGone,

    #[error("capture writer panicked")]
    WriterPanicked,

    #[error("sequencer starts at {sequencer} but the tables record {recorded}")]
    SequenceStart { recorded: u64, sequencer: u64 },

    #[error("issued {issued} arrival indices but committed {committed} rows")]
    SequenceGap { issued: u64, committed: u64 },

    #[error("binary row claims {claimed} payload bytes but only {available} were streamed")]
    PayloadUnderrun { claimed: u64, available: u64 },
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures that keep the validator from reading its inputs. Disagreement
/// between replay and tables is never an error; it goes in the report.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("reading {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CRC mismatch in {path:?} at record {index}: file={stored:#010x}, calc={computed:#010x}")]
    Crc {
        path: PathBuf,
        index: usize,
        stored: u32,
        computed: u32,
    },

    #[error("undecodable record {index} in {path:?}: {source}")]
    Decode {
        path: PathBuf,
        index: usize,
        #[source]
        source: bincode::Error,
    },

    #[error("{path:?} does not start with a {expected} table header")]
    BadHeader { path: PathBuf, expected: &'static str },

    #[error("{path:?} uses format version {found}, expected {expected}")]
    Version {
        path: PathBuf,
        found: u16,
        expected: u16,
    },

    #[error("record {index} in {path:?} is not a {expected} row")]
    UnexpectedRecord {
        path: PathBuf,
        index: usize,
        expected: &'static str,
    },

    #[error("row {arrival_seq} references payload bytes {offset}..{end} beyond the store ({len} bytes)")]
    PayloadOutOfRange {
        arrival_seq: u64,
        offset: u64,
        end: u64,
        len: u64,
    },
}

impl ReplayError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ReplayError::Io {
            path: path.into(),
            source,
        }
    }
}
