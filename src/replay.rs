//! Replay validation: re-scan the raw log and diff against the tables.
//!
//! The raw log is streamed through a fresh [`Demultiplexer`] in fixed-size
//! reads (chunking differs from the live session on purpose), finalized at
//! EOF like a closed connection, and every replayed message is compared with
//! the row holding the same arrival index. Numbering starts at the index the
//! table headers record. Binary payloads are compared chunk by chunk against
//! the payload store, so replay never holds a whole frame in memory. Nothing
//! stops at the first disagreement; the report lists all of them.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::mem;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::demux::{BinaryHeader, DemuxConfig, Demultiplexer, FrameEvent, NoisePolicy};
use crate::error::ReplayError;
use crate::message::{MessageKind, Resync};
use crate::record::{BinaryRow, TextRow};
use crate::sequencer::Sequencer;
use crate::store::{CaptureLayout, PayloadStore, Tables};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowRef {
    pub arrival_seq: u64,
    pub kind: MessageKind,
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.kind, self.arrival_seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Payload,
    Marker,
    DeclaredLength,
    ReceivedLength,
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMismatch {
    pub row: RowRef,
    pub field: Field,
    pub persisted: String,
    pub replayed: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingViolation {
    /// Replayed indices did not strictly increase.
    Replay { previous: u64, next: u64 },
    /// A table's rows are not in strictly increasing index order.
    Table { kind: MessageKind, previous: u64, next: u64 },
    /// The same index appears in both tables.
    SharedIndex { arrival_seq: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub text: usize,
    pub binary: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub replayed: Counts,
    pub persisted: Counts,
    pub resyncs: u64,
    pub raw_bytes: u64,
    /// In a table but not produced by replay.
    pub missing: Vec<RowRef>,
    /// Produced by replay but absent from the tables.
    pub extra: Vec<RowRef>,
    pub mismatches: Vec<FieldMismatch>,
    pub ordering: Vec<OrderingViolation>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.missing.is_empty()
            && self.extra.is_empty()
            && self.mismatches.is_empty()
            && self.ordering.is_empty()
    }

    pub fn counts_match(&self) -> bool {
        self.replayed == self.persisted
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "raw bytes: {}  resyncs: {}",
            self.raw_bytes, self.resyncs
        )?;
        writeln!(
            f,
            "text:   replayed {:>8}  persisted {:>8}",
            self.replayed.text, self.persisted.text
        )?;
        writeln!(
            f,
            "binary: replayed {:>8}  persisted {:>8}",
            self.replayed.binary, self.persisted.binary
        )?;
        for row in &self.missing {
            writeln!(f, "missing from replay: {row}")?;
        }
        for row in &self.extra {
            writeln!(f, "not in tables: {row}")?;
        }
        for m in &self.mismatches {
            writeln!(
                f,
                "mismatch {} {:?}: persisted={} replayed={}",
                m.row, m.field, m.persisted, m.replayed
            )?;
        }
        for v in &self.ordering {
            match v {
                OrderingViolation::Replay { previous, next } => {
                    writeln!(f, "replay order: #{next} after #{previous}")?
                }
                OrderingViolation::Table { kind, previous, next } => {
                    writeln!(f, "{kind} table order: #{next} after #{previous}")?
                }
                OrderingViolation::SharedIndex { arrival_seq } => {
                    writeln!(f, "index #{arrival_seq} present in both tables")?
                }
            }
        }
        write!(f, "{}", if self.passed() { "PASS" } else { "FAIL" })
    }
}

/// Scanner settings that replay changes relative to the recorded ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    pub max_binary_len: Option<u64>,
    pub noise: Option<NoisePolicy>,
}

impl ReplayOptions {
    pub fn apply(&self, recorded: DemuxConfig) -> DemuxConfig {
        DemuxConfig {
            max_binary_len: self.max_binary_len.unwrap_or(recorded.max_binary_len),
            noise: self.noise.unwrap_or(recorded.noise),
            ..recorded
        }
    }
}

/// What replay produced, in stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayEvent<'a> {
    Text {
        arrival_seq: u64,
        payload: &'a str,
        /// Arrival time of the matching row, if there is one.
        recorded_at: Option<u128>,
    },
    /// Payload bytes of the binary frame that will take `arrival_seq`,
    /// `offset` bytes into that frame's payload. Chunks precede their frame's
    /// `Binary` event.
    PayloadChunk {
        arrival_seq: u64,
        offset: u64,
        bytes: &'a [u8],
    },
    Binary {
        arrival_seq: u64,
        header: BinaryHeader,
        recorded_at: Option<u128>,
    },
    Resync(Resync),
}

/// Validate a capture directory, using the scanner settings recorded in its
/// table headers with `options` applied on top.
pub fn validate_capture(
    layout: &CaptureLayout,
    options: &ReplayOptions,
    observe: impl FnMut(ReplayEvent<'_>),
) -> Result<ValidationReport, ReplayError> {
    let tables = Tables::load(layout)?;
    if tables.text_header.demux != tables.binary_header.demux
        || tables.text_header.first_seq != tables.binary_header.first_seq
    {
        warn!("table headers disagree; using the text table's settings");
    }
    let config = options.apply(tables.text_header.demux);
    let mut payloads = PayloadStore::open(&layout.payload)?;
    let raw = File::open(&layout.raw).map_err(|e| ReplayError::io(&layout.raw, e))?;
    let report = validate(
        BufReader::new(raw),
        &layout.raw,
        &tables,
        &mut payloads,
        config,
        observe,
    )?;
    info!(passed = report.passed(), "replay validation finished");
    Ok(report)
}

pub fn validate<R: Read>(
    mut raw: R,
    raw_path: &Path,
    tables: &Tables,
    payloads: &mut PayloadStore,
    config: DemuxConfig,
    observe: impl FnMut(ReplayEvent<'_>),
) -> Result<ValidationReport, ReplayError> {
    let mut diff = Differ::new(tables, payloads, observe);
    let mut demux = Demultiplexer::new(config);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match raw.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReplayError::io(raw_path, e)),
        };
        diff.report.raw_bytes += n as u64;
        demux.feed(&buf[..n], |ev| diff.event(ev))?;
    }
    if let Some(ev) = demux.finalize_at_eof() {
        diff.event(ev)?;
    }
    Ok(diff.finish())
}

/// Binary frame whose payload is still streaming.
#[derive(Debug, Default)]
struct PendingPayload {
    received: u64,
    first_diff: Option<u64>,
}

struct Differ<'t, 'p, F> {
    text: HashMap<u64, &'t TextRow>,
    binary: HashMap<u64, &'t BinaryRow>,
    payloads: &'p mut PayloadStore,
    observe: F,
    sequencer: Sequencer,
    pending: PendingPayload,
    matched: HashSet<RowRef>,
    last_seq: Option<u64>,
    report: ValidationReport,
}

impl<'t, 'p, F: FnMut(ReplayEvent<'_>)> Differ<'t, 'p, F> {
    fn new(tables: &'t Tables, payloads: &'p mut PayloadStore, observe: F) -> Self {
        let mut report = ValidationReport {
            persisted: Counts {
                text: tables.text.len(),
                binary: tables.binary.len(),
            },
            ..ValidationReport::default()
        };
        check_table_order(MessageKind::Text, tables.text.iter().map(|r| r.arrival_seq), &mut report);
        check_table_order(MessageKind::Binary, tables.binary.iter().map(|r| r.arrival_seq), &mut report);

        let text: HashMap<_, _> = tables.text.iter().map(|r| (r.arrival_seq, r)).collect();
        let binary: HashMap<_, _> = tables.binary.iter().map(|r| (r.arrival_seq, r)).collect();
        let mut shared: Vec<u64> = text.keys().filter(|s| binary.contains_key(s)).copied().collect();
        shared.sort_unstable();
        report
            .ordering
            .extend(shared.into_iter().map(|arrival_seq| OrderingViolation::SharedIndex { arrival_seq }));

        Self {
            text,
            binary,
            payloads,
            observe,
            sequencer: Sequencer::starting_at(tables.text_header.first_seq),
            pending: PendingPayload::default(),
            matched: HashSet::new(),
            last_seq: None,
            report,
        }
    }

    fn event(&mut self, ev: FrameEvent<'_>) -> Result<(), ReplayError> {
        match ev {
            FrameEvent::Text(payload) => {
                let seq = self.sequencer.next();
                let stored = self.text.get(&seq).copied();
                (self.observe)(ReplayEvent::Text {
                    arrival_seq: seq,
                    payload: &payload,
                    recorded_at: stored.map(|r| r.arrival_unix_ns),
                });
                self.check_order(seq);
                self.report.replayed.text += 1;
                let row = RowRef {
                    arrival_seq: seq,
                    kind: MessageKind::Text,
                };
                match stored {
                    Some(stored) => {
                        self.matched.insert(row);
                        if stored.payload != payload {
                            self.mismatch(row, Field::Payload, &stored.payload, &payload);
                        }
                    }
                    None => self.report.extra.push(row),
                }
            }
            FrameEvent::BinaryPayload(chunk) => {
                let seq = self.sequencer.peek();
                (self.observe)(ReplayEvent::PayloadChunk {
                    arrival_seq: seq,
                    offset: self.pending.received,
                    bytes: chunk,
                });
                self.compare_chunk(seq, chunk)?;
            }
            FrameEvent::Binary(header) => {
                let seq = self.sequencer.next();
                let stored = self.binary.get(&seq).copied();
                (self.observe)(ReplayEvent::Binary {
                    arrival_seq: seq,
                    header,
                    recorded_at: stored.map(|r| r.arrival_unix_ns),
                });
                self.check_order(seq);
                self.report.replayed.binary += 1;
                let pending = mem::take(&mut self.pending);
                let row = RowRef {
                    arrival_seq: seq,
                    kind: MessageKind::Binary,
                };
                match stored {
                    Some(stored) => self.compare_binary(row, stored, header, pending),
                    None => self.report.extra.push(row),
                }
            }
            FrameEvent::Resync(r) => {
                self.report.resyncs += 1;
                (self.observe)(ReplayEvent::Resync(r));
            }
        }
        Ok(())
    }

    fn check_order(&mut self, seq: u64) {
        if let Some(previous) = self.last_seq.filter(|&p| seq <= p) {
            self.report
                .ordering
                .push(OrderingViolation::Replay { previous, next: seq });
        }
        self.last_seq = Some(seq);
    }

    /// Compare one streamed chunk with the stored bytes at the same position.
    fn compare_chunk(&mut self, seq: u64, chunk: &[u8]) -> Result<(), ReplayError> {
        let at = self.pending.received;
        self.pending.received += chunk.len() as u64;
        if self.pending.first_diff.is_some() {
            return Ok(());
        }
        let Some(row) = self.binary.get(&seq).copied() else {
            return Ok(());
        };
        let want = row.received_length.saturating_sub(at).min(chunk.len() as u64);
        let stored = self.payloads.read_at(row.payload_offset.saturating_add(at), want)?;
        if let Some(i) = first_difference(&stored, chunk) {
            self.pending.first_diff = Some(at + i as u64);
        }
        Ok(())
    }

    fn compare_binary(
        &mut self,
        row: RowRef,
        stored: &BinaryRow,
        replayed: BinaryHeader,
        pending: PendingPayload,
    ) {
        self.matched.insert(row);
        if stored.marker != replayed.marker {
            self.mismatch(row, Field::Marker, stored.marker, replayed.marker);
        }
        if stored.declared_length != replayed.declared_length {
            self.mismatch(row, Field::DeclaredLength, stored.declared_length, replayed.declared_length);
        }
        if stored.received_length != replayed.received_length {
            self.mismatch(row, Field::ReceivedLength, stored.received_length, replayed.received_length);
        }
        if stored.truncated != replayed.truncated {
            self.mismatch(row, Field::Truncated, stored.truncated, replayed.truncated);
        }

        let end = stored.payload_offset.saturating_add(stored.received_length);
        if end > self.payloads.len() {
            let unreadable = ReplayError::PayloadOutOfRange {
                arrival_seq: stored.arrival_seq,
                offset: stored.payload_offset,
                end,
                len: self.payloads.len(),
            };
            debug!("unreadable payload: {unreadable}");
            self.mismatch(row, Field::Payload, unreadable, format!("{} bytes", pending.received));
            return;
        }
        // a longer stored payload differs where the replayed one ran out
        let differs_at = pending.first_diff.or_else(|| {
            (stored.received_length != pending.received)
                .then(|| pending.received.min(stored.received_length))
        });
        if let Some(at) = differs_at {
            self.mismatch(
                row,
                Field::Payload,
                format!("{} bytes", stored.received_length),
                format!("{} bytes, first difference at byte {at}", pending.received),
            );
        }
    }

    fn mismatch(&mut self, row: RowRef, field: Field, persisted: impl fmt::Display, replayed: impl fmt::Display) {
        self.report.mismatches.push(FieldMismatch {
            row,
            field,
            persisted: persisted.to_string(),
            replayed: replayed.to_string(),
        });
    }

    fn finish(mut self) -> ValidationReport {
        let mut missing: Vec<RowRef> = self
            .text
            .keys()
            .map(|&arrival_seq| RowRef { arrival_seq, kind: MessageKind::Text })
            .chain(
                self.binary
                    .keys()
                    .map(|&arrival_seq| RowRef { arrival_seq, kind: MessageKind::Binary }),
            )
            .filter(|r| !self.matched.contains(r))
            .collect();
        missing.sort_unstable();
        self.report.missing = missing;
        self.report
    }
}

fn check_table_order(kind: MessageKind, seqs: impl Iterator<Item = u64>, report: &mut ValidationReport) {
    let mut previous: Option<u64> = None;
    for next in seqs {
        if let Some(previous) = previous.filter(|&p| next <= p) {
            report
                .ordering
                .push(OrderingViolation::Table { kind, previous, next });
        }
        previous = Some(next);
    }
}

/// Index of the first byte where the two payloads disagree, counting a
/// length difference as a disagreement at the shorter length.
fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter()
        .zip(b)
        .position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
}
