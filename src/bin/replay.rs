use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stream_capture::demux::NoisePolicy;
use stream_capture::record::format_unix_ns;
use stream_capture::replay::{ReplayEvent, ReplayOptions, validate_capture};
use stream_capture::store::CaptureLayout;

#[derive(Debug, Parser)]
#[command(about = "Replay a capture's raw log and check it against the recorded tables")]
struct Args {
    /// Capture directory written by stream-capture
    #[arg(required_unless_present_all = ["raw", "text", "binary", "payload"])]
    dir: Option<PathBuf>,

    /// Raw log path (overrides DIR/raw.bin)
    #[arg(long)]
    raw: Option<PathBuf>,

    /// Text table path
    #[arg(long)]
    text: Option<PathBuf>,

    /// Binary table path
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Binary payload store path
    #[arg(long)]
    payload: Option<PathBuf>,

    /// Print every replayed message
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Override the binary length cap recorded in the table header
    #[arg(long)]
    max_binary_len: Option<u64>,

    /// Report noise runs regardless of the recorded policy
    #[arg(long, default_value_t = false)]
    strict_noise: bool,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(long, short = 'v', default_value_t = false)]
    verbose: bool,
}

impl Args {
    fn layout(&self) -> CaptureLayout {
        let base = CaptureLayout::in_dir(self.dir.clone().unwrap_or_default());
        CaptureLayout {
            raw: self.raw.clone().unwrap_or(base.raw),
            text: self.text.clone().unwrap_or(base.text),
            binary: self.binary.clone().unwrap_or(base.binary),
            payload: self.payload.clone().unwrap_or(base.payload),
        }
    }
}

fn dump(ev: ReplayEvent<'_>) {
    let at = |ns: Option<u128>| ns.map(format_unix_ns).unwrap_or_else(|| "-".to_string());
    match ev {
        ReplayEvent::Text {
            arrival_seq,
            payload,
            recorded_at,
        } => println!("#{arrival_seq} text {} {payload}", at(recorded_at)),
        ReplayEvent::PayloadChunk { offset, bytes, .. } => {
            println!("    +{offset:<8} {}", hex::encode(bytes));
        }
        ReplayEvent::Binary {
            arrival_seq,
            header: h,
            recorded_at,
        } => println!(
            "#{arrival_seq} binary {} marker={} declared={} received={} truncated={}",
            at(recorded_at),
            h.marker,
            h.declared_length,
            h.received_length,
            h.truncated
        ),
        ReplayEvent::Resync(r) => println!("-- resync: {r}"),
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let default = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();

    let layout = args.layout();
    let options = ReplayOptions {
        max_binary_len: args.max_binary_len,
        noise: args.strict_noise.then_some(NoisePolicy::Report),
    };
    let report = validate_capture(&layout, &options, |ev| {
        if args.dump {
            dump(ev);
        }
    })
    .with_context(|| format!("validate capture at {:?}", layout.raw))?;

    println!("{report}");
    if !report.passed() {
        bail!("tables do not match the raw log");
    }
    Ok(())
}
