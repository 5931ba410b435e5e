use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stream_capture::demux::{DemuxConfig, NoisePolicy};
use stream_capture::sequencer::Sequencer;
use stream_capture::session::{Recorder, SessionConfig, SessionEnd, run_session};
use stream_capture::sink::{QueueConfig, QueuedSink};
use stream_capture::store::{CaptureLayout, CaptureStore};

#[derive(Debug, Parser)]
#[command(version, about = "Capture a multiplexed text/binary stream to disk")]
struct Args {
    /// Remote host
    #[arg(long, env = "CAPTURE_HOST")]
    host: String,

    /// Remote port
    #[arg(long, env = "CAPTURE_PORT")]
    port: u16,

    /// Token sent as `AUTH <token>` right after connecting
    #[arg(long, env = "CAPTURE_TOKEN")]
    token: Option<String>,

    /// Capture directory; defaults to captures/HOST_PORT_YYYY_MM_DD_HHMMSS
    #[arg(long, env = "CAPTURE_OUT")]
    out: Option<PathBuf>,

    /// Send the stop command after this many messages
    #[arg(long)]
    limit: Option<u64>,

    /// Stop command; `\n` is unescaped
    #[arg(long, default_value = "STATUS\\n")]
    stop_cmd: String,

    /// Bytes per socket read
    #[arg(long, default_value_t = 8192)]
    read_size: usize,

    /// Socket read timeout, i.e. how often stop and drain are checked
    #[arg(long, default_value_t = 500)]
    read_timeout_ms: u64,

    /// How long to keep reading after the stop command
    #[arg(long, default_value_t = 5000)]
    drain_timeout_ms: u64,

    /// Write operations buffered ahead of the writer thread
    #[arg(long, default_value_t = 1024)]
    queue_capacity: usize,

    /// Binary frames declaring more than this many bytes are cut short
    #[arg(long, default_value_t = 16 << 20)]
    max_binary_len: u64,

    /// Report runs of unframed bytes instead of skipping them silently
    #[arg(long, default_value_t = false)]
    strict_noise: bool,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(long, short = 'v', default_value_t = false)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_out_dir(host: &str, port: u16) -> Result<PathBuf> {
    // local offset is only reliable before other threads exist
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = now
        .format(format_description!(
            "[year]_[month]_[day]_[hour][minute][second]"
        ))
        .context("format capture timestamp")?;
    let host: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    Ok(PathBuf::from("captures").join(format!("{host}_{port}_{stamp}")))
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    let args = Args::parse();
    let out = match args.out.clone() {
        Some(p) => p,
        None => default_out_dir(&args.host, args.port)?,
    };
    init_tracing(args.verbose);

    let peer = format!("{}:{}", args.host, args.port);
    let mut stream = TcpStream::connect((args.host.as_str(), args.port))
        .with_context(|| format!("connect to {peer}"))?;
    stream
        .set_read_timeout(Some(Duration::from_millis(args.read_timeout_ms.max(1))))
        .context("set read timeout")?;
    info!(%peer, out = %out.display(), "connected");

    if let Some(token) = &args.token {
        stream
            .write_all(format!("AUTH {token}\n").as_bytes())
            .context("send auth line")?;
        info!("auth line sent");
    }

    let demux = DemuxConfig {
        max_binary_len: args.max_binary_len,
        noise: if args.strict_noise {
            NoisePolicy::Report
        } else {
            NoisePolicy::Discard
        },
        ..DemuxConfig::default()
    };
    let layout = CaptureLayout::in_dir(&out);
    let store = CaptureStore::create(&layout, &peer, demux)
        .with_context(|| format!("create capture in {out:?}"))?;
    let sink = QueuedSink::spawn(
        store,
        Arc::new(Sequencer::new()),
        QueueConfig {
            capacity: args.queue_capacity.max(1),
        },
    )?;
    let recorder = Recorder::new(demux, sink);

    // Ctrl+C starts the same stop-and-drain sequence as --limit
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("install Ctrl-C handler")?;
    }

    let mut control = stream.try_clone().context("clone connection")?;
    let stop_cmd = args.stop_cmd.replace("\\n", "\n");
    let config = SessionConfig {
        read_size: args.read_size,
        drain_timeout: Duration::from_millis(args.drain_timeout_ms),
        stop_after: args.limit,
    };

    let report = run_session(&mut stream, recorder, &config, &stop, || {
        info!(cmd = stop_cmd.trim_end(), "sending stop command");
        control.write_all(stop_cmd.as_bytes())?;
        control.flush()
    })
    .context("capture failed")?;

    if let SessionEnd::ReadFailed(kind) = report.end {
        warn!(?kind, "connection ended with a read error");
    }
    let d = report.demux;
    info!(
        raw_bytes = report.capture.raw_bytes,
        text = report.capture.text_rows,
        binary = report.capture.binary_rows,
        payload_bytes = report.capture.payload_bytes,
        truncated = d.truncated_frames,
        oversized = d.oversized_frames,
        resyncs = d.resyncs,
        noise_bytes = d.noise_bytes,
        "capture written to {}",
        out.display()
    );
    Ok(())
}
