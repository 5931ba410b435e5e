//! Capture sink: where raw bytes, payload chunks and finalized messages go.
//!
//! Callers must append the raw bytes of a chunk before recording anything
//! derived from it. Both sinks number messages with the shared [`Sequencer`]
//! at the moment `record_*` is called.
//!
//! - [`DirectSink`] writes synchronously on the caller's thread.
//! - [`QueuedSink`] hands ordered [`WriteOp`]s to a writer thread over a
//!   bounded channel; when the writer falls behind, the caller blocks.
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error};

use crate::demux::BinaryHeader;
use crate::error::PersistenceError;
use crate::record::{BinaryRow, TextRow, now_unix_ns};
use crate::sequencer::Sequencer;
use crate::store::{CaptureStore, CaptureSummary};

pub trait CaptureSink {
    /// Append bytes exactly as received.
    fn append_raw(&mut self, bytes: &[u8]) -> Result<(), PersistenceError>;

    /// Append payload bytes of the binary frame in progress.
    fn append_payload(&mut self, chunk: &[u8]) -> Result<(), PersistenceError>;

    /// Commit a text row; returns its arrival index.
    fn record_text(&mut self, payload: String) -> Result<u64, PersistenceError>;

    /// Commit the row for the binary frame whose payload was just streamed.
    fn record_binary(&mut self, header: BinaryHeader) -> Result<u64, PersistenceError>;

    /// Flush everything to disk and report what was written.
    fn close(self) -> Result<CaptureSummary, PersistenceError>
    where
        Self: Sized;
}

fn binary_row(arrival_seq: u64, payload_end: u64, h: BinaryHeader) -> BinaryRow {
    BinaryRow {
        arrival_seq,
        marker: h.marker,
        payload_offset: payload_end.saturating_sub(h.received_length),
        declared_length: h.declared_length,
        received_length: h.received_length,
        truncated: h.truncated,
        arrival_unix_ns: now_unix_ns(),
    }
}

fn check_start(sequencer: &Sequencer, store: &CaptureStore) -> Result<(), PersistenceError> {
    if sequencer.first() != store.first_seq() {
        return Err(PersistenceError::SequenceStart {
            recorded: store.first_seq(),
            sequencer: sequencer.first(),
        });
    }
    Ok(())
}

fn check_committed(sequencer: &Sequencer, store: &CaptureStore) -> Result<(), PersistenceError> {
    check_start(sequencer, store)?;
    let summary = store.summary();
    let committed = summary.text_rows + summary.binary_rows;
    let issued = sequencer.issued();
    if issued != committed {
        return Err(PersistenceError::SequenceGap { issued, committed });
    }
    Ok(())
}

pub struct DirectSink {
    store: CaptureStore,
    sequencer: Arc<Sequencer>,
}

impl DirectSink {
    pub fn new(store: CaptureStore, sequencer: Arc<Sequencer>) -> Self {
        Self { store, sequencer }
    }
}

impl CaptureSink for DirectSink {
    fn append_raw(&mut self, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.store.append_raw(bytes)
    }

    fn append_payload(&mut self, chunk: &[u8]) -> Result<(), PersistenceError> {
        self.store.append_payload(chunk)
    }

    fn record_text(&mut self, payload: String) -> Result<u64, PersistenceError> {
        let arrival_seq = self.sequencer.next();
        self.store.write_text(&TextRow {
            arrival_seq,
            payload,
            arrival_unix_ns: now_unix_ns(),
        })?;
        Ok(arrival_seq)
    }

    fn record_binary(&mut self, header: BinaryHeader) -> Result<u64, PersistenceError> {
        let arrival_seq = self.sequencer.next();
        let row = binary_row(arrival_seq, self.store.payload_len(), header);
        self.store.write_binary(&row)?;
        Ok(arrival_seq)
    }

    fn close(self) -> Result<CaptureSummary, PersistenceError> {
        check_committed(&self.sequencer, &self.store)?;
        self.store.finish()
    }
}

/// One unit of work for the writer thread, applied in queue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Raw(Vec<u8>),
    Payload(Vec<u8>),
    Text(TextRow),
    Binary(BinaryRow),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Write operations buffered before the reader blocks.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

pub struct QueuedSink {
    tx: Option<Sender<WriteOp>>,
    writer: Option<JoinHandle<Result<CaptureSummary, PersistenceError>>>,
    sequencer: Arc<Sequencer>,
    payload_sent: u64,
}

impl QueuedSink {
    pub fn spawn(
        store: CaptureStore,
        sequencer: Arc<Sequencer>,
        config: QueueConfig,
    ) -> Result<Self, PersistenceError> {
        check_start(&sequencer, &store)?;
        let (tx, rx) = bounded::<WriteOp>(config.capacity);
        let payload_sent = store.payload_len();
        let shared = Arc::clone(&sequencer);
        let writer = std::thread::Builder::new()
            .name("capture-writer".into())
            .spawn(move || {
                let res = writer_thread(store, rx, &shared);
                if let Err(e) = &res {
                    error!("capture writer failed: {e}");
                }
                res
            })
            .map_err(PersistenceError::Spawn)?;
        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
            sequencer,
            payload_sent,
        })
    }

    fn send(&mut self, op: WriteOp) -> Result<(), PersistenceError> {
        let sent = match &self.tx {
            Some(tx) => tx.send(op).is_ok(),
            None => false,
        };
        if sent { Ok(()) } else { Err(self.writer_failure()) }
    }

    /// The writer hung up early; collect the reason it stopped.
    fn writer_failure(&mut self) -> PersistenceError {
        self.tx = None;
        match self.writer.take().map(JoinHandle::join) {
            Some(Ok(Err(e))) => e,
            Some(Err(_)) => PersistenceError::WriterPanicked,
            Some(Ok(Ok(_))) | None => PersistenceError::WriterGone,
        }
    }
}

impl CaptureSink for QueuedSink {
    fn append_raw(&mut self, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.send(WriteOp::Raw(bytes.to_vec()))
    }

    fn append_payload(&mut self, chunk: &[u8]) -> Result<(), PersistenceError> {
        self.send(WriteOp::Payload(chunk.to_vec()))?;
        self.payload_sent += chunk.len() as u64;
        Ok(())
    }

    fn record_text(&mut self, payload: String) -> Result<u64, PersistenceError> {
        let arrival_seq = self.sequencer.next();
        self.send(WriteOp::Text(TextRow {
            arrival_seq,
            payload,
            arrival_unix_ns: now_unix_ns(),
        }))?;
        Ok(arrival_seq)
    }

    fn record_binary(&mut self, header: BinaryHeader) -> Result<u64, PersistenceError> {
        let arrival_seq = self.sequencer.next();
        self.send(WriteOp::Binary(binary_row(arrival_seq, self.payload_sent, header)))?;
        Ok(arrival_seq)
    }

    fn close(mut self) -> Result<CaptureSummary, PersistenceError> {
        self.tx = None;
        match self.writer.take().map(JoinHandle::join) {
            Some(Ok(res)) => res,
            Some(Err(_)) => Err(PersistenceError::WriterPanicked),
            None => Err(PersistenceError::WriterGone),
        }
    }
}

impl Drop for QueuedSink {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

fn writer_thread(
    mut store: CaptureStore,
    rx: Receiver<WriteOp>,
    sequencer: &Sequencer,
) -> Result<CaptureSummary, PersistenceError> {
    debug!("capture writer started");
    for op in rx {
        match op {
            WriteOp::Raw(bytes) => store.append_raw(&bytes)?,
            WriteOp::Payload(chunk) => store.append_payload(&chunk)?,
            WriteOp::Text(row) => store.write_text(&row)?,
            WriteOp::Binary(row) => store.write_binary(&row)?,
        }
    }
    check_committed(sequencer, &store)?;
    let summary = store.finish()?;
    debug!(?summary, "capture writer finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::DemuxConfig;
    use crate::message::Marker;
    use crate::store::{CaptureLayout, Tables};

    fn header(declared: u64, received: u64) -> BinaryHeader {
        BinaryHeader {
            marker: Marker::B,
            declared_length: declared,
            received_length: received,
            truncated: received < declared,
        }
    }

    fn exercise<S: CaptureSink>(sink: &mut S) {
        sink.append_raw(b"$HELLO;").unwrap();
        assert_eq!(sink.record_text("HELLO".into()).unwrap(), 0);
        sink.append_raw(&[0xBB, 0, 0, 0, 0, 4, 1, 2]).unwrap();
        sink.append_payload(&[1, 2]).unwrap();
        sink.append_raw(&[3]).unwrap();
        sink.append_payload(&[3]).unwrap();
        assert_eq!(sink.record_binary(header(4, 3)).unwrap(), 1);
        sink.append_raw(&[0xAA, 0, 0, 0, 0, 1, 9]).unwrap();
        sink.append_payload(&[9]).unwrap();
        assert_eq!(sink.record_binary(header(1, 1)).unwrap(), 2);
    }

    fn check_tables(layout: &CaptureLayout) {
        let tables = Tables::load(layout).unwrap();
        assert_eq!(tables.text.len(), 1);
        let offsets: Vec<_> = tables.binary.iter().map(|r| (r.arrival_seq, r.payload_offset)).collect();
        assert_eq!(offsets, vec![(1, 0), (2, 3)]);
        assert!(tables.binary[0].truncated);
    }

    #[test]
    fn direct_sink_assigns_sequence_and_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CaptureLayout::in_dir(dir.path());
        let store = CaptureStore::create(&layout, "t", DemuxConfig::default()).unwrap();
        let mut sink = DirectSink::new(store, Arc::new(Sequencer::new()));
        exercise(&mut sink);
        let summary = sink.close().unwrap();
        assert_eq!(summary.payload_bytes, 4);
        assert_eq!(summary.raw_bytes, 23);
        check_tables(&layout);
    }

    #[test]
    fn queued_sink_matches_direct_sink() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CaptureLayout::in_dir(dir.path());
        let store = CaptureStore::create(&layout, "t", DemuxConfig::default()).unwrap();
        // capacity 1 forces the reader to wait on the writer
        let mut sink =
            QueuedSink::spawn(store, Arc::new(Sequencer::new()), QueueConfig { capacity: 1 })
                .unwrap();
        exercise(&mut sink);
        let summary = sink.close().unwrap();
        assert_eq!(summary.text_rows, 1);
        assert_eq!(summary.binary_rows, 2);
        check_tables(&layout);
    }

    #[test]
    fn sequence_value_without_row_is_a_gap() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CaptureLayout::in_dir(dir.path());
        let store = CaptureStore::create(&layout, "t", DemuxConfig::default()).unwrap();
        let sequencer = Arc::new(Sequencer::new());
        let mut sink = QueuedSink::spawn(store, Arc::clone(&sequencer), QueueConfig::default()).unwrap();
        sink.record_text("HELLO".into()).unwrap();
        sequencer.next();
        assert!(matches!(
            sink.close(),
            Err(PersistenceError::SequenceGap { issued: 2, committed: 1 })
        ));
    }

    #[test]
    fn sequencer_must_start_where_the_tables_say() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CaptureLayout::in_dir(dir.path());
        let store = CaptureStore::create_from(&layout, "t", DemuxConfig::default(), 9).unwrap();
        assert!(matches!(
            QueuedSink::spawn(store, Arc::new(Sequencer::new()), QueueConfig::default()),
            Err(PersistenceError::SequenceStart { recorded: 9, sequencer: 0 })
        ));

        let store = CaptureStore::create(&layout, "t", DemuxConfig::default()).unwrap();
        let mut sink = DirectSink::new(store, Arc::new(Sequencer::starting_at(3)));
        assert_eq!(sink.record_text("HELLO".into()).unwrap(), 3);
        assert!(matches!(
            sink.close(),
            Err(PersistenceError::SequenceStart { recorded: 0, sequencer: 3 })
        ));
    }

    #[test]
    fn writer_error_surfaces_on_next_send() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CaptureLayout::in_dir(dir.path());
        let store = CaptureStore::create(&layout, "t", DemuxConfig::default()).unwrap();
        let mut sink = QueuedSink::spawn(store, Arc::new(Sequencer::new()), QueueConfig { capacity: 1 })
            .unwrap();
        // a row that claims payload never streamed makes the writer bail out
        sink.record_binary(header(5, 5)).unwrap();
        let mut failure = None;
        for _ in 0..16 {
            if let Err(e) = sink.append_raw(b"x") {
                failure = Some(e);
                break;
            }
        }
        assert!(matches!(failure, Some(PersistenceError::PayloadUnderrun { .. })));
    }
}
