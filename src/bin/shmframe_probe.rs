//! shmframe-probe - run an ingestion session and report what it sees
//!
//! This tool:
//! 1. Loads configuration (file + environment) and applies CLI overrides
//! 2. Opens the configured transport and subscribes a session to the source
//! 3. Optionally drives a synthetic feed (memory transport only)
//! 4. Pulls frames at the render rate, optionally mirroring them to a destination
//! 5. Logs session stats and health until the duration elapses or Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shmframe::transport::{self, FeedHandle, SyntheticFeed, SyntheticFormat};
use shmframe::{ChromaAddressing, FrameWriter, IngestConfig, IngestSession, TransportKind};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "shmframe-probe",
    about = "Subscribe to a shared-memory video source and report ingestion stats"
)]
struct Args {
    /// Source identifier (socket path for the shm transport)
    #[arg(long)]
    source: Option<String>,

    /// Transport backend (memory|shm)
    #[arg(long)]
    transport: Option<TransportKind>,

    /// I420 chroma addressing (legacy|standard)
    #[arg(long)]
    chroma: Option<ChromaAddressing>,

    /// Re-publish converted frames to this destination ("auto" picks a scratch socket path)
    #[arg(long)]
    mirror: Option<String>,

    /// Consumer update rate
    #[arg(long)]
    render_fps: Option<u32>,

    /// Stop after this many seconds (0 = run until Ctrl-C)
    #[arg(long, default_value_t = 0)]
    duration_secs: u64,

    /// Synthetic feed format on the memory transport (rgb24|i420|none)
    #[arg(long, default_value = "rgb24", value_name = "FORMAT")]
    feed: String,

    #[arg(long, default_value_t = 640)]
    feed_width: u32,

    #[arg(long, default_value_t = 480)]
    feed_height: u32,

    #[arg(long, default_value_t = 30)]
    feed_fps: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = IngestConfig::load()?;
    if let Some(source) = args.source.clone() {
        cfg.source = source;
    }
    if let Some(kind) = args.transport {
        cfg.transport = kind;
    }
    if let Some(chroma) = args.chroma {
        cfg.chroma = chroma;
    }
    if let Some(mirror) = args.mirror.clone() {
        cfg.mirror = Some(mirror);
    }
    if let Some(fps) = args.render_fps {
        cfg.render_fps = fps;
    }

    if cfg.mirror.as_deref().map(str::trim) == Some("auto") {
        cfg.mirror = Some(transport::unique_socket_path());
    }
    cfg.validate().context("invalid command-line overrides")?;
    if let Some(mirror) = &cfg.mirror {
        log::info!("shmframe-probe: mirroring converted frames to {}", mirror);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = stop.clone();
    ctrlc::set_handler(move || {
        stop_signal.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;

    let opened = transport::open(cfg.transport)?;
    let mut session = IngestSession::new(opened.reader(), cfg.session_options())?;
    session.reconfigure(&cfg.source)?;
    log::info!(
        "shmframe-probe: {} via {:?} (chroma {:?}, render {} fps)",
        cfg.source,
        cfg.transport,
        cfg.chroma,
        cfg.render_fps
    );

    let feed = start_feed(&args, &cfg, &opened)?;
    let mut writer = cfg
        .mirror
        .as_deref()
        .map(|destination| FrameWriter::new(opened.writer(), destination));

    let deadline = (args.duration_secs > 0)
        .then(|| Instant::now() + Duration::from_secs(args.duration_secs));
    let interval = cfg.render_interval();
    let mut rendered = 0u64;
    let mut last_stats = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        if session.update() {
            rendered += 1;
            if let (Some(writer), Some(frame)) = (writer.as_mut(), session.current_frame()) {
                if let Err(err) = writer.write(frame) {
                    log::warn!("shmframe-probe: mirror write failed: {}", err);
                }
            }
        }
        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            if !session.is_healthy() {
                log::warn!("shmframe-probe: no frames from {} within grace", cfg.source);
            }
            log::info!("shmframe-probe: {:?}", session.stats());
        }
        std::thread::sleep(interval);
    }

    if let Some(feed) = feed {
        log::info!("shmframe-probe: synthetic feed produced {} frames", feed.stop());
    }
    if let Some(frame) = session.current_frame() {
        log::info!(
            "shmframe-probe: last frame {}x{} at {} ns",
            frame.width(),
            frame.height(),
            frame.timestamp()
        );
    }
    let stats = session.stats();
    session.close()?;
    log::info!("shmframe-probe: rendered {} frames", rendered);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn start_feed(
    args: &Args,
    cfg: &IngestConfig,
    opened: &transport::OpenedTransport,
) -> Result<Option<FeedHandle>> {
    if args.feed.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let Some(memory) = opened.memory() else {
        log::warn!("shmframe-probe: --feed only applies to the memory transport; ignoring");
        return Ok(None);
    };
    let format: SyntheticFormat = args.feed.parse().map_err(|e: String| anyhow!(e))?;
    let feed = SyntheticFeed::new(&cfg.source, args.feed_width, args.feed_height, format)?;
    Ok(Some(feed.spawn(memory.clone(), args.feed_fps)))
}
