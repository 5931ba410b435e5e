//! Live capture: one reader feeding one demultiplexer into a capture sink.
//!
//! [`Recorder`] is the per-session pipeline (raw bytes first, then whatever
//! the scanner derives from them). [`run_session`] is the reader loop around
//! it: it reads until the peer closes, fires the stop hook once the message
//! threshold is reached or the stop flag is raised, then keeps draining until
//! EOF or the drain timeout. Either way the in-flight frame is finalized with
//! the ordinary end-of-stream rules.
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::demux::{DemuxConfig, DemuxStats, Demultiplexer, FrameEvent};
use crate::error::PersistenceError;
use crate::sink::CaptureSink;
use crate::store::CaptureSummary;

pub struct Recorder<S> {
    demux: Demultiplexer,
    sink: S,
    messages: u64,
}

impl<S: CaptureSink> Recorder<S> {
    pub fn new(config: DemuxConfig, sink: S) -> Self {
        Self {
            demux: Demultiplexer::new(config),
            sink,
            messages: 0,
        }
    }

    /// Persist one chunk of the stream and everything it completes.
    pub fn ingest(&mut self, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.sink.append_raw(bytes)?;
        let Self {
            demux,
            sink,
            messages,
        } = self;
        demux.feed(bytes, |ev| deliver(sink, messages, ev))
    }

    /// Finalized messages so far, both kinds.
    pub fn messages(&self) -> u64 {
        self.messages
    }

    pub fn demux_stats(&self) -> DemuxStats {
        self.demux.stats()
    }

    /// End of stream: finalize any partial frame and close the sink.
    pub fn finish(mut self) -> Result<(CaptureSummary, DemuxStats), PersistenceError> {
        if let Some(ev) = self.demux.finalize_at_eof() {
            deliver(&mut self.sink, &mut self.messages, ev)?;
        }
        let stats = self.demux.stats();
        let summary = self.sink.close()?;
        Ok((summary, stats))
    }
}

fn deliver<S: CaptureSink>(
    sink: &mut S,
    messages: &mut u64,
    ev: FrameEvent<'_>,
) -> Result<(), PersistenceError> {
    match ev {
        FrameEvent::Text(payload) => {
            let seq = sink.record_text(payload)?;
            trace!(seq, "text message");
            *messages += 1;
        }
        FrameEvent::BinaryPayload(chunk) => sink.append_payload(chunk)?,
        FrameEvent::Binary(header) => {
            let seq = sink.record_binary(header)?;
            if header.truncated {
                warn!(
                    seq,
                    marker = %header.marker,
                    declared = header.declared_length,
                    received = header.received_length,
                    "binary message recorded as truncated"
                );
            } else {
                trace!(seq, len = header.received_length, "binary message");
            }
            *messages += 1;
        }
        // already logged by the scanner
        FrameEvent::Resync(_) => {}
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bytes requested per read.
    pub read_size: usize,
    /// How long to keep reading after the stop hook has fired.
    pub drain_timeout: Duration,
    /// Fire the stop hook after this many finalized messages.
    pub stop_after: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_size: 8192,
            drain_timeout: Duration::from_secs(5),
            stop_after: None,
        }
    }
}

/// Why the reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    DrainTimeout,
    ReadFailed(io::ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub stopped: bool,
    pub capture: CaptureSummary,
    pub demux: DemuxStats,
}

/// Read `source` to the end of the session and close the capture.
///
/// `source` should time out its reads (`WouldBlock`/`TimedOut`) so the drain
/// deadline and `stop` flag are checked regularly. Only persistence failures
/// are errors; any other read failure ends the stream like a peer close.
pub fn run_session<R, S, H>(
    source: &mut R,
    mut recorder: Recorder<S>,
    config: &SessionConfig,
    stop: &AtomicBool,
    mut on_stop: H,
) -> Result<SessionReport, PersistenceError>
where
    R: Read,
    S: CaptureSink,
    H: FnMut() -> io::Result<()>,
{
    let mut buf = vec![0u8; config.read_size.max(1)];
    let mut drain_deadline: Option<Instant> = None;

    let end = loop {
        if drain_deadline.is_none() {
            let threshold = config.stop_after.is_some_and(|n| recorder.messages() >= n);
            if threshold || stop.load(Ordering::SeqCst) {
                info!(messages = recorder.messages(), threshold, "stopping; draining remaining data");
                if let Err(e) = on_stop() {
                    warn!("stop command failed: {e}");
                }
                drain_deadline = Some(Instant::now() + config.drain_timeout);
            }
        }
        if drain_deadline.is_some_and(|d| Instant::now() >= d) {
            info!("drain timeout elapsed");
            break SessionEnd::DrainTimeout;
        }

        match source.read(&mut buf) {
            Ok(0) => {
                info!("peer closed the connection");
                break SessionEnd::PeerClosed;
            }
            Ok(n) => recorder.ingest(&buf[..n])?,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                debug!("read timed out");
            }
            Err(e) => {
                warn!("read failed, treating as end of stream: {e}");
                break SessionEnd::ReadFailed(e.kind());
            }
        }
    };

    let (capture, demux) = recorder.finish()?;
    info!(?end, ?capture, "capture closed");
    Ok(SessionReport {
        end,
        stopped: drain_deadline.is_some(),
        capture,
        demux,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::Sequencer;
    use crate::sink::DirectSink;
    use crate::store::{CaptureLayout, CaptureStore, Tables};
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays a fixed list of read results, then reports EOF.
    struct Script(VecDeque<io::Result<Vec<u8>>>);

    impl Script {
        fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
            Self(steps.into())
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.0.push_front(Ok(bytes[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }
    }

    fn timeout() -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::TimedOut, "tick"))
    }

    fn recorder(layout: &CaptureLayout) -> Recorder<DirectSink> {
        let store = CaptureStore::create(layout, "script", DemuxConfig::default()).unwrap();
        Recorder::new(DemuxConfig::default(), DirectSink::new(store, Arc::new(Sequencer::new())))
    }

    #[test]
    fn reads_until_peer_closes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CaptureLayout::in_dir(dir.path());
        let mut src = Script::new(vec![
            Ok(b"$HEL".to_vec()),
            timeout(),
            Ok(b"LO;".to_vec()),
            Ok(vec![0xAA, 0, 0, 0, 0, 2, b'o', b'k']),
        ]);
        let config = SessionConfig { read_size: 3, ..SessionConfig::default() };
        let report = run_session(&mut src, recorder(&layout), &config, &AtomicBool::new(false), || {
            panic!("no stop expected")
        })
        .unwrap();
        assert_eq!(report.end, SessionEnd::PeerClosed);
        assert!(!report.stopped);
        assert_eq!(report.capture.text_rows, 1);
        assert_eq!(report.capture.binary_rows, 1);
        assert_eq!(std::fs::read(&layout.raw).unwrap().len(), 15);
    }

    #[test]
    fn threshold_fires_stop_then_drains_to_eof() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CaptureLayout::in_dir(dir.path());
        let mut src = Script::new(vec![
            Ok(b"$FIRST;".to_vec()),
            Ok(b"$SECOND;".to_vec()),
            timeout(),
            Ok(b"$THIRD;".to_vec()),
        ]);
        let mut stops = 0;
        let config = SessionConfig {
            stop_after: Some(1),
            drain_timeout: Duration::from_secs(60),
            ..SessionConfig::default()
        };
        let report = run_session(&mut src, recorder(&layout), &config, &AtomicBool::new(false), || {
            stops += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(stops, 1);
        assert!(report.stopped);
        assert_eq!(report.end, SessionEnd::PeerClosed);
        let tables = Tables::load(&layout).unwrap();
        let payloads: Vec<_> = tables.text.iter().map(|r| r.payload.as_str()).collect();
        assert_eq!(payloads, vec!["FIRST", "SECOND", "THIRD"]);
    }

    #[test]
    fn drain_timeout_finalizes_partial_frame() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CaptureLayout::in_dir(dir.path());
        let mut first = b"$HELLO;".to_vec();
        first.extend_from_slice(&[0xBB, 0, 0, 0, 0, 5, b'a', b'b']);
        let mut src = Script::new(vec![Ok(first), timeout(), Ok(b"cde".to_vec())]);
        let config = SessionConfig {
            stop_after: Some(1),
            drain_timeout: Duration::ZERO,
            ..SessionConfig::default()
        };
        let report = run_session(&mut src, recorder(&layout), &config, &AtomicBool::new(false), || {
            Ok(())
        })
        .unwrap();
        assert_eq!(report.end, SessionEnd::DrainTimeout);
        assert_eq!(report.demux.truncated_frames, 1);
        let tables = Tables::load(&layout).unwrap();
        assert_eq!(tables.binary.len(), 1);
        let row = &tables.binary[0];
        assert_eq!(row.arrival_seq, 1);
        assert_eq!((row.declared_length, row.received_length, row.truncated), (5, 2, true));
        assert_eq!(std::fs::read(&layout.raw).unwrap().len(), 15);
    }

    #[test]
    fn stop_flag_starts_drain() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CaptureLayout::in_dir(dir.path());
        let mut src = Script::new(vec![Ok(b"$HELLO;".to_vec())]);
        let config = SessionConfig { drain_timeout: Duration::ZERO, ..SessionConfig::default() };
        let report =
            run_session(&mut src, recorder(&layout), &config, &AtomicBool::new(true), || Ok(()))
                .unwrap();
        assert!(report.stopped);
        assert_eq!(report.end, SessionEnd::DrainTimeout);
        assert_eq!(report.capture.raw_bytes, 0);
    }

    #[test]
    fn read_failure_ends_stream() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CaptureLayout::in_dir(dir.path());
        let mut src = Script::new(vec![
            Ok(b"$HELLO;$PART".to_vec()),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let report = run_session(
            &mut src,
            recorder(&layout),
            &SessionConfig::default(),
            &AtomicBool::new(false),
            || Ok(()),
        )
        .unwrap();
        assert_eq!(report.end, SessionEnd::ReadFailed(io::ErrorKind::ConnectionReset));
        assert_eq!(report.capture.text_rows, 1);
    }
}
