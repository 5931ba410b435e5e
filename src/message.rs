//! Message types shared by the demultiplexer, the capture sink and replay.
//!
//! Two self-delimiting formats share one byte stream:
//! - text frames `$<payload>;` with a printable ASCII payload of at least
//!   [`MIN_TEXT_LEN`] bytes
//! - binary frames `[marker][len: 5 bytes BE][payload]` where the marker is
//!   `0xAA` or `0xBB`
use serde::{Deserialize, Serialize};
use std::fmt;

/// Start marker of a text frame.
pub const TEXT_START: u8 = b'$';
/// End marker of a text frame.
pub const TEXT_END: u8 = b';';
/// Shortest accepted text payload.
pub const MIN_TEXT_LEN: usize = 5;
/// Width of the big-endian length field following a binary marker.
pub const BINARY_LEN_BYTES: usize = 5;
/// Largest value representable in the 40-bit length field.
pub const MAX_DECLARED_LEN: u64 = (1 << 40) - 1;

/// Leading byte of a binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Marker {
    /// `0xAA`
    A,
    /// `0xBB`
    B,
}

impl Marker {
    pub const A_BYTE: u8 = 0xAA;
    pub const B_BYTE: u8 = 0xBB;

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            Self::A_BYTE => Some(Marker::A),
            Self::B_BYTE => Some(Marker::B),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Marker::A => Self::A_BYTE,
            Marker::B => Self::B_BYTE,
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X}", self.byte())
    }
}

/// True for bytes accepted inside a text payload (0x20..=0x7E).
#[inline]
pub fn is_printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub arrival_seq: u64,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMessage {
    pub arrival_seq: u64,
    pub marker: Marker,
    /// 0 when the stream ended inside the length field.
    pub declared_length: u64,
    pub received_length: u64,
    pub payload: Vec<u8>,
    pub truncated: bool,
}

/// A finalized message of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(TextMessage),
    Binary(BinaryMessage),
}

impl Message {
    pub fn arrival_seq(&self) -> u64 {
        match self {
            Message::Text(t) => t.arrival_seq,
            Message::Binary(b) => b.arrival_seq,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Text(_) => MessageKind::Text,
            Message::Binary(_) => MessageKind::Binary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Binary,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Text => f.write_str("text"),
            MessageKind::Binary => f.write_str("binary"),
        }
    }
}

/// Why the scanner dropped bytes and went back to seeking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncReason {
    /// Text payload shorter than [`MIN_TEXT_LEN`].
    TooShort { len: u64 },
    /// Text payload contained a byte outside 0x20..=0x7E.
    NonPrintable { len: u64 },
    /// Text payload grew past the configured buffer limit.
    TextTooLong { len: u64 },
    /// A run of bytes seen while seeking that started no frame.
    Noise { bytes: u64 },
}

/// Diagnostic, non-fatal scanner event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resync {
    /// Stream offset of the byte that triggered the resync.
    pub offset: u64,
    pub reason: ResyncReason,
}

impl fmt::Display for Resync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            ResyncReason::TooShort { len } => {
                write!(f, "text frame too short ({len} bytes) at offset {}", self.offset)
            }
            ResyncReason::NonPrintable { len } => {
                write!(f, "non-printable text frame ({len} bytes) at offset {}", self.offset)
            }
            ResyncReason::TextTooLong { len } => {
                write!(f, "oversized text frame ({len} bytes) at offset {}", self.offset)
            }
            ResyncReason::Noise { bytes } => {
                write!(f, "skipped {bytes} noise bytes before offset {}", self.offset)
            }
        }
    }
}
