//! Resumable frame demultiplexer.
//!
//! [`Demultiplexer`] consumes the byte stream in whatever chunks the transport
//! delivers and reports frame boundaries through [`FrameEvent`]s. All scanning
//! state lives in one [`ScannerState`] owned by the instance, so two fresh
//! instances fed the same bytes emit the same events no matter how the bytes
//! were chunked. Replay depends on that.
//!
//! Binary payloads are never buffered: each fed chunk yields at most one
//! [`FrameEvent::BinaryPayload`] slice borrowed from the input, followed by
//! [`FrameEvent::Binary`] once the frame is finalized.
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::message::{
    BINARY_LEN_BYTES, MAX_DECLARED_LEN, MIN_TEXT_LEN, Marker, Resync, ResyncReason, TEXT_END,
    TEXT_START, is_printable,
};

/// What to do with bytes seen while seeking that start no frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NoisePolicy {
    /// Drop them silently; they only show up in [`DemuxStats::noise_bytes`].
    #[default]
    Discard,
    /// Emit one [`ResyncReason::Noise`] per run of noise bytes.
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemuxConfig {
    /// Binary frames declaring more than this are finalized as truncated
    /// without consuming their payload.
    pub max_binary_len: u64,
    /// Text payload bytes buffered before a frame is marked too long.
    pub max_text_len: usize,
    pub noise: NoisePolicy,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            max_binary_len: 16 << 20,
            max_text_len: 1 << 20,
            noise: NoisePolicy::Discard,
        }
    }
}

/// Length fields of a finalized binary frame. The payload itself was already
/// delivered through [`FrameEvent::BinaryPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHeader {
    pub marker: Marker,
    pub declared_length: u64,
    pub received_length: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent<'a> {
    /// A complete, valid text frame.
    Text(String),
    /// Payload bytes of the binary frame currently being read.
    BinaryPayload(&'a [u8]),
    /// A binary frame was finalized, complete or truncated.
    Binary(BinaryHeader),
    Resync(Resync),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFault {
    NonPrintable,
    TooLong,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextFrame {
    /// Buffered payload; emptied once a fault is recorded.
    pub buf: Vec<u8>,
    /// Payload bytes seen so far, buffered or not.
    pub len: u64,
    pub fault: Option<TextFault>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScannerState {
    #[default]
    Seeking,
    TextAccumulating(TextFrame),
    BinaryReadingLength {
        marker: Marker,
        buf: [u8; BINARY_LEN_BYTES],
        filled: usize,
    },
    BinaryReadingPayload {
        marker: Marker,
        declared: u64,
        received: u64,
    },
}

impl ScannerState {
    /// Bytes the current frame has accumulated.
    pub fn bytes_accumulated(&self) -> u64 {
        match self {
            ScannerState::Seeking => 0,
            ScannerState::TextAccumulating(t) => t.len,
            ScannerState::BinaryReadingLength { filled, .. } => *filled as u64,
            ScannerState::BinaryReadingPayload { received, .. } => *received,
        }
    }

    /// Bytes still needed to finish the current field, when known.
    pub fn bytes_required(&self) -> Option<u64> {
        match self {
            ScannerState::Seeking | ScannerState::TextAccumulating(_) => None,
            ScannerState::BinaryReadingLength { filled, .. } => {
                Some((BINARY_LEN_BYTES - filled) as u64)
            }
            ScannerState::BinaryReadingPayload { declared, received, .. } => {
                Some(declared - received)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub bytes_consumed: u64,
    pub text_frames: u64,
    pub binary_frames: u64,
    pub truncated_frames: u64,
    pub oversized_frames: u64,
    pub resyncs: u64,
    pub noise_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Demultiplexer {
    config: DemuxConfig,
    state: ScannerState,
    offset: u64,
    noise_run: u64,
    stats: DemuxStats,
}

impl Demultiplexer {
    pub fn new(config: DemuxConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &DemuxConfig {
        &self.config
    }

    pub fn state(&self) -> &ScannerState {
        &self.state
    }

    /// Stream offset of the next byte to be fed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn stats(&self) -> DemuxStats {
        DemuxStats {
            bytes_consumed: self.offset,
            ..self.stats
        }
    }

    /// Consume one chunk of the stream, passing every event to `emit` in
    /// stream order. Frames concatenated within `bytes` are all reported
    /// before this returns. An error from `emit` stops scanning; the scanner
    /// must not be fed again after that.
    pub fn feed<'a, E, F>(&mut self, bytes: &'a [u8], mut emit: F) -> Result<(), E>
    where
        F: FnMut(FrameEvent<'a>) -> Result<(), E>,
    {
        let mut rest = bytes;
        while !rest.is_empty() {
            let used = self.step(rest, &mut emit)?;
            rest = &rest[used..];
        }
        Ok(())
    }

    /// Close the stream. Returns the event for a frame cut short by the end
    /// of input, if any, and leaves the scanner seeking.
    pub fn finalize_at_eof(&mut self) -> Option<FrameEvent<'static>> {
        match std::mem::take(&mut self.state) {
            ScannerState::Seeking => {
                let run = std::mem::take(&mut self.noise_run);
                (run > 0 && self.config.noise == NoisePolicy::Report).then(|| {
                    FrameEvent::Resync(self.note_resync(ResyncReason::Noise { bytes: run }))
                })
            }
            ScannerState::TextAccumulating(text) => {
                debug!(len = text.len, offset = self.offset, "discarding unterminated text frame");
                None
            }
            ScannerState::BinaryReadingLength { marker, filled, .. } => {
                warn!(%marker, filled, "stream ended inside binary length field");
                Some(FrameEvent::Binary(self.finish_binary(marker, 0, 0, true)))
            }
            ScannerState::BinaryReadingPayload { marker, declared, received } => {
                warn!(%marker, declared, received, "stream ended inside binary payload");
                Some(FrameEvent::Binary(self.finish_binary(marker, declared, received, true)))
            }
        }
    }

    fn step<'a, E, F>(&mut self, input: &'a [u8], emit: &mut F) -> Result<usize, E>
    where
        F: FnMut(FrameEvent<'a>) -> Result<(), E>,
    {
        match std::mem::take(&mut self.state) {
            ScannerState::Seeking => self.seek(input, emit),
            ScannerState::TextAccumulating(text) => self.accumulate_text(text, input, emit),
            ScannerState::BinaryReadingLength { marker, buf, filled } => {
                self.read_length(marker, buf, filled, input, emit)
            }
            ScannerState::BinaryReadingPayload { marker, declared, received } => {
                self.read_payload(marker, declared, received, input, emit)
            }
        }
    }

    fn seek<'a, E, F>(&mut self, input: &'a [u8], emit: &mut F) -> Result<usize, E>
    where
        F: FnMut(FrameEvent<'a>) -> Result<(), E>,
    {
        let start = input
            .iter()
            .position(|&b| b == TEXT_START || Marker::from_byte(b).is_some());
        let skipped = start.unwrap_or(input.len());
        self.noise_run += skipped as u64;
        self.stats.noise_bytes += skipped as u64;
        self.offset += skipped as u64;

        let Some(pos) = start else {
            return Ok(input.len());
        };

        let run = std::mem::take(&mut self.noise_run);
        if run > 0 && self.config.noise == NoisePolicy::Report {
            let resync = self.note_resync(ResyncReason::Noise { bytes: run });
            emit(FrameEvent::Resync(resync))?;
        }

        self.state = match Marker::from_byte(input[pos]) {
            Some(marker) => ScannerState::BinaryReadingLength {
                marker,
                buf: [0; BINARY_LEN_BYTES],
                filled: 0,
            },
            None => ScannerState::TextAccumulating(TextFrame::default()),
        };
        self.offset += 1;
        Ok(pos + 1)
    }

    fn accumulate_text<'a, E, F>(
        &mut self,
        mut text: TextFrame,
        input: &'a [u8],
        emit: &mut F,
    ) -> Result<usize, E>
    where
        F: FnMut(FrameEvent<'a>) -> Result<(), E>,
    {
        let end = input.iter().position(|&b| b == TEXT_END);
        let body = &input[..end.unwrap_or(input.len())];

        if text.fault.is_none() {
            if !body.iter().all(|&b| is_printable(b)) {
                text.fault = Some(TextFault::NonPrintable);
                text.buf = Vec::new();
            } else if text.buf.len() + body.len() > self.config.max_text_len {
                text.fault = Some(TextFault::TooLong);
                text.buf = Vec::new();
            } else {
                text.buf.extend_from_slice(body);
            }
        }
        text.len += body.len() as u64;
        self.offset += body.len() as u64;

        let Some(end) = end else {
            self.state = ScannerState::TextAccumulating(text);
            return Ok(input.len());
        };

        let reason = match text.fault {
            Some(TextFault::NonPrintable) => Some(ResyncReason::NonPrintable { len: text.len }),
            Some(TextFault::TooLong) => Some(ResyncReason::TextTooLong { len: text.len }),
            None if text.buf.len() < MIN_TEXT_LEN => Some(ResyncReason::TooShort { len: text.len }),
            None => None,
        };
        let event = match reason {
            Some(reason) => FrameEvent::Resync(self.note_resync(reason)),
            None => {
                self.stats.text_frames += 1;
                // Every buffered byte is printable ASCII.
                FrameEvent::Text(text.buf.iter().map(|&b| char::from(b)).collect())
            }
        };
        self.offset += 1;
        emit(event)?;
        Ok(end + 1)
    }

    fn read_length<'a, E, F>(
        &mut self,
        marker: Marker,
        mut buf: [u8; BINARY_LEN_BYTES],
        filled: usize,
        input: &'a [u8],
        emit: &mut F,
    ) -> Result<usize, E>
    where
        F: FnMut(FrameEvent<'a>) -> Result<(), E>,
    {
        let take = (BINARY_LEN_BYTES - filled).min(input.len());
        buf[filled..filled + take].copy_from_slice(&input[..take]);
        let filled = filled + take;
        self.offset += take as u64;

        if filled < BINARY_LEN_BYTES {
            self.state = ScannerState::BinaryReadingLength { marker, buf, filled };
            return Ok(take);
        }

        let mut wide = [0u8; 8];
        wide[8 - BINARY_LEN_BYTES..].copy_from_slice(&buf);
        let declared = u64::from_be_bytes(wide);
        debug_assert!(declared <= MAX_DECLARED_LEN);

        if declared > self.config.max_binary_len {
            self.stats.oversized_frames += 1;
            warn!(
                %marker,
                declared,
                cap = self.config.max_binary_len,
                offset = self.offset,
                "binary frame exceeds payload cap"
            );
            emit(FrameEvent::Binary(self.finish_binary(marker, declared, 0, true)))?;
        } else if declared == 0 {
            emit(FrameEvent::Binary(self.finish_binary(marker, 0, 0, false)))?;
        } else {
            self.state = ScannerState::BinaryReadingPayload {
                marker,
                declared,
                received: 0,
            };
        }
        Ok(take)
    }

    fn read_payload<'a, E, F>(
        &mut self,
        marker: Marker,
        declared: u64,
        received: u64,
        input: &'a [u8],
        emit: &mut F,
    ) -> Result<usize, E>
    where
        F: FnMut(FrameEvent<'a>) -> Result<(), E>,
    {
        let remaining = declared - received;
        let take = usize::try_from(remaining).map_or(input.len(), |r| r.min(input.len()));
        let received = received + take as u64;
        self.offset += take as u64;
        emit(FrameEvent::BinaryPayload(&input[..take]))?;

        if received == declared {
            emit(FrameEvent::Binary(self.finish_binary(marker, declared, received, false)))?;
        } else {
            self.state = ScannerState::BinaryReadingPayload {
                marker,
                declared,
                received,
            };
        }
        Ok(take)
    }

    fn finish_binary(
        &mut self,
        marker: Marker,
        declared: u64,
        received: u64,
        truncated: bool,
    ) -> BinaryHeader {
        self.stats.binary_frames += 1;
        if truncated {
            self.stats.truncated_frames += 1;
        }
        BinaryHeader {
            marker,
            declared_length: declared,
            received_length: received,
            truncated,
        }
    }

    fn note_resync(&mut self, reason: ResyncReason) -> Resync {
        self.stats.resyncs += 1;
        let resync = Resync {
            offset: self.offset,
            reason,
        };
        debug!(%resync, "scanner resync");
        resync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[derive(Debug, PartialEq)]
    enum Ev {
        Text(String),
        Payload(Vec<u8>),
        Binary(BinaryHeader),
        Resync(ResyncReason),
    }

    fn own(ev: FrameEvent<'_>) -> Ev {
        match ev {
            FrameEvent::Text(s) => Ev::Text(s),
            FrameEvent::BinaryPayload(p) => Ev::Payload(p.to_vec()),
            FrameEvent::Binary(h) => Ev::Binary(h),
            FrameEvent::Resync(r) => Ev::Resync(r.reason),
        }
    }

    fn run_with(config: DemuxConfig, chunks: &[&[u8]]) -> Vec<Ev> {
        let mut demux = Demultiplexer::new(config);
        let mut out = Vec::new();
        for chunk in chunks {
            let Ok(()) = demux.feed(chunk, |ev| {
                out.push(own(ev));
                Ok::<(), Infallible>(())
            });
        }
        out.extend(demux.finalize_at_eof().map(own));
        out
    }

    fn run(chunks: &[&[u8]]) -> Vec<Ev> {
        run_with(DemuxConfig::default(), chunks)
    }

    fn header(marker: Marker, declared: u64, received: u64, truncated: bool) -> BinaryHeader {
        BinaryHeader {
            marker,
            declared_length: declared,
            received_length: received,
            truncated,
        }
    }

    #[test]
    fn single_text_frame() {
        assert_eq!(run(&[b"$HELLO;"]), vec![Ev::Text("HELLO".into())]);
    }

    #[test]
    fn short_text_frame_resyncs() {
        assert_eq!(run(&[b"$AB;"]), vec![Ev::Resync(ResyncReason::TooShort { len: 2 })]);
    }

    #[test]
    fn complete_binary_frame() {
        let input = [0xAA, 0, 0, 0, 0, 3, b'x', b'y', b'z'];
        assert_eq!(
            run(&[&input]),
            vec![
                Ev::Payload(b"xyz".to_vec()),
                Ev::Binary(header(Marker::A, 3, 3, false)),
            ]
        );
    }

    #[test]
    fn binary_payload_cut_by_eof() {
        let input = [0xBB, 0, 0, 0, 0, 5, b'a', b'b'];
        assert_eq!(
            run(&[&input]),
            vec![
                Ev::Payload(b"ab".to_vec()),
                Ev::Binary(header(Marker::B, 5, 2, true)),
            ]
        );
    }

    #[test]
    fn concatenated_text_frames_in_one_chunk() {
        // "FOO" is under the minimum length
        assert_eq!(
            run(&[b"$FOO;$BARBAZ;"]),
            vec![
                Ev::Resync(ResyncReason::TooShort { len: 3 }),
                Ev::Text("BARBAZ".into()),
            ]
        );
        assert_eq!(
            run(&[b"$FOOBAR;$BARBAZ;"]),
            vec![Ev::Text("FOOBAR".into()), Ev::Text("BARBAZ".into())]
        );
    }

    #[test]
    fn unterminated_text_is_discarded() {
        assert!(run(&[b"$AB"]).is_empty());
        assert!(run(&[b"$ABCDEFGH"]).is_empty());
    }

    #[test]
    fn second_dollar_is_payload() {
        assert_eq!(run(&[b"$AB$CD;"]), vec![Ev::Text("AB$CD".into())]);
    }

    #[test]
    fn non_printable_text_resyncs_at_terminator() {
        let out = run(&[b"$HEL\x01LO;$WORLD;"]);
        assert_eq!(
            out,
            vec![
                Ev::Resync(ResyncReason::NonPrintable { len: 6 }),
                Ev::Text("WORLD".into()),
            ]
        );
    }

    #[test]
    fn marker_byte_inside_text_does_not_start_binary() {
        let out = run(&[b"$HELLO", &[0xAA, 0, 0, 0, 0, 1, b'z'], b";"]);
        assert_eq!(out, vec![Ev::Resync(ResyncReason::NonPrintable { len: 12 })]);
    }

    #[test]
    fn text_over_limit_consumed_to_terminator() {
        let config = DemuxConfig {
            max_text_len: 8,
            ..DemuxConfig::default()
        };
        let out = run_with(config, &[b"$ABCDEF", b"GHIJKL;", b"$SHORTER;"]);
        assert_eq!(
            out,
            vec![
                Ev::Resync(ResyncReason::TextTooLong { len: 12 }),
                Ev::Text("SHORTER".into()),
            ]
        );
    }

    #[test]
    fn fragmented_frames_across_chunks() {
        let out = run(&[b"$HE", b"L", b"LO", b";", &[0xAA, 0, 0], &[0, 0, 4, b'a'], b"bc", b"d"]);
        assert_eq!(
            out,
            vec![
                Ev::Text("HELLO".into()),
                Ev::Payload(b"a".to_vec()),
                Ev::Payload(b"bc".to_vec()),
                Ev::Payload(b"d".to_vec()),
                Ev::Binary(header(Marker::A, 4, 4, false)),
            ]
        );
    }

    #[test]
    fn eof_inside_length_field() {
        let out = run(&[&[0xBB, 0, 0]]);
        assert_eq!(out, vec![Ev::Binary(header(Marker::B, 0, 0, true))]);
    }

    #[test]
    fn zero_length_binary_completes_without_more_input() {
        let mut demux = Demultiplexer::default();
        let mut out = Vec::new();
        let Ok(()) = demux.feed(&[0xAA, 0, 0, 0, 0, 0], |ev| {
            out.push(own(ev));
            Ok::<(), Infallible>(())
        });
        assert_eq!(out, vec![Ev::Binary(header(Marker::A, 0, 0, false))]);
        assert_eq!(demux.state(), &ScannerState::Seeking);
        assert!(demux.finalize_at_eof().is_none());
    }

    #[test]
    fn oversized_binary_frame_skips_payload() {
        let config = DemuxConfig {
            max_binary_len: 4,
            ..DemuxConfig::default()
        };
        let mut input = vec![0xAA, 0, 0, 0, 0, 9];
        input.extend_from_slice(b"$ABCDEF;");
        let out = run_with(config, &[&input]);
        // the payload bytes are scanned as fresh input
        assert_eq!(
            out,
            vec![
                Ev::Binary(header(Marker::A, 9, 0, true)),
                Ev::Text("ABCDEF".into()),
            ]
        );
    }

    #[test]
    fn forty_bit_length_is_big_endian() {
        let config = DemuxConfig {
            max_binary_len: u64::MAX,
            ..DemuxConfig::default()
        };
        let out = run_with(config, &[&[0xBB, 0x01, 0x02, 0x03, 0x04, 0x05]]);
        assert_eq!(out, vec![Ev::Binary(header(Marker::B, 0x01_0203_0405, 0, true))]);
    }

    #[test]
    fn widest_length_field_decodes_to_the_40_bit_maximum() {
        let config = DemuxConfig {
            max_binary_len: u64::MAX,
            ..DemuxConfig::default()
        };
        let out = run_with(config, &[&[0xAA, 0xFF, 0xFF], &[0xFF, 0xFF, 0xFF, b'x']]);
        assert_eq!(
            out,
            vec![
                Ev::Payload(b"x".to_vec()),
                Ev::Binary(header(Marker::A, MAX_DECLARED_LEN, 1, true)),
            ]
        );
    }

    #[test]
    fn noise_discarded_by_default() {
        let mut demux = Demultiplexer::default();
        let Ok(()) = demux.feed(b"xx\n$HELLO;zz", |_| Ok::<(), Infallible>(()));
        assert!(demux.finalize_at_eof().is_none());
        let stats = demux.stats();
        assert_eq!(stats.noise_bytes, 5);
        assert_eq!(stats.text_frames, 1);
        assert_eq!(stats.bytes_consumed, 12);
    }

    #[test]
    fn noise_reported_once_per_run_regardless_of_chunking() {
        let config = DemuxConfig {
            noise: NoisePolicy::Report,
            ..DemuxConfig::default()
        };
        let whole = run_with(config, &[b"abc$HELLO;de"]);
        let split = run_with(config, &[b"a", b"b", b"c$HEL", b"LO;d", b"e"]);
        let expected = vec![
            Ev::Resync(ResyncReason::Noise { bytes: 3 }),
            Ev::Text("HELLO".into()),
            Ev::Resync(ResyncReason::Noise { bytes: 2 }),
        ];
        assert_eq!(whole, expected);
        assert_eq!(split, expected);
    }

    #[test]
    fn resync_offsets_point_at_terminator() {
        let mut demux = Demultiplexer::default();
        let mut offsets = Vec::new();
        let Ok(()) = demux.feed(b"$AB;$CD;", |ev| {
            if let FrameEvent::Resync(r) = ev {
                offsets.push(r.offset);
            }
            Ok::<(), Infallible>(())
        });
        assert_eq!(offsets, vec![3, 7]);
    }

    #[test]
    fn scanner_state_reports_progress() {
        let mut demux = Demultiplexer::default();
        let Ok(()) = demux.feed(&[0xAA, 0, 0], |_| Ok::<(), Infallible>(()));
        assert_eq!(demux.state().bytes_accumulated(), 2);
        assert_eq!(demux.state().bytes_required(), Some(3));

        let Ok(()) = demux.feed(&[0, 0, 10, 1, 2, 3], |_| Ok::<(), Infallible>(()));
        assert_eq!(demux.state().bytes_accumulated(), 3);
        assert_eq!(demux.state().bytes_required(), Some(7));
    }

    #[test]
    fn emit_error_stops_scanning() {
        let mut demux = Demultiplexer::default();
        let mut seen = 0;
        let res = demux.feed(b"$HELLO;$WORLD;", |_| {
            seen += 1;
            Err("sink down")
        });
        assert_eq!(res, Err("sink down"));
        assert_eq!(seen, 1);
    }
}
