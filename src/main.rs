//! distance-encoder: paced screen capture into a shared memory frame slot.
//!
//! Captures the desktop at a fixed rate, compresses each frame to JPEG, and
//! publishes it into a single shared memory slot that a consumer process
//! polls by sequence number.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use distance_encoder::capture;
use distance_encoder::config::EncoderConfig;
use distance_encoder::error::ResolveError;
use distance_encoder::pacer::{self, PacerConfig, SessionInfo, StopFlag};
use distance_encoder::shm::FrameSlot;

#[derive(Debug, Parser)]
#[command(name = "distance-encoder", version, about = "Screen capture encoder publishing JPEG frames to shared memory")]
struct Cli {
    /// JSON config file, overlaid on built-in defaults.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Capture width hint (backends report their native size).
    #[arg(short, long)]
    width: Option<u32>,

    /// Capture height hint.
    #[arg(long)]
    height: Option<u32>,

    /// Target frames per second.
    #[arg(short, long)]
    fps: Option<u32>,

    /// JPEG quality, 0-100.
    #[arg(short, long)]
    quality: Option<u32>,

    /// Monitor index, 0 = primary.
    #[arg(short, long)]
    monitor: Option<u32>,

    /// Capture backend name (see --list-backends).
    #[arg(short, long)]
    encoder: Option<String>,

    /// Codec name stamped into the slot header.
    #[arg(long)]
    codec: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Report frame time overruns instead of silently skipping sleeps.
    #[arg(long)]
    benchmark: bool,

    /// List compiled-in capture backends and exit.
    #[arg(long)]
    list_backends: bool,
}

impl Cli {
    /// CLI flags win over the config file, which wins over defaults.
    fn apply(&self, config: &mut EncoderConfig) {
        if let Some(v) = self.width {
            config.width = v;
        }
        if let Some(v) = self.height {
            config.height = v;
        }
        if let Some(v) = self.fps {
            config.fps = v;
        }
        if let Some(v) = self.quality {
            config.quality = v;
        }
        if let Some(v) = self.monitor {
            config.monitor = v;
        }
        if let Some(v) = &self.encoder {
            config.encoder = v.clone();
        }
        if let Some(v) = &self.codec {
            config.codec = v.clone();
        }
        if self.verbose {
            config.verbose = true;
        }
        if self.benchmark {
            config.benchmark = true;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "distance_encoder=debug,info"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.list_backends {
        println!("Available capture backends:");
        for (name, available) in capture::list() {
            let status = if available { "available" } else { "not available" };
            println!("  {name} ({status})");
        }
        return ExitCode::SUCCESS;
    }

    let mut config = EncoderConfig::default();
    if let Err(e) = config.load_file(&cli.config) {
        warn!("config file {} not used: {e}", cli.config.display());
    }
    cli.apply(&mut config);
    config.log_summary();

    let mut backend = match capture::resolve(&config.encoder, &config) {
        Ok(backend) => backend,
        Err(ResolveError::Unknown(name)) => {
            let known: Vec<&str> = capture::list().map(|(name, _)| name).collect();
            error!("unknown backend '{name}', compiled in: {}", known.join(", "));
            return ExitCode::FAILURE;
        }
        Err(ResolveError::Unavailable(name)) => {
            error!("backend '{name}' is not available on this system");
            return ExitCode::FAILURE;
        }
    };

    let (width, height) = match backend.initialize(config.monitor) {
        Ok(dims) => dims,
        Err(e) => {
            error!("backend initialization failed: {e}");
            backend.shutdown();
            return ExitCode::FAILURE;
        }
    };

    let mut slot = match FrameSlot::create(&config.shm_name, config.shm_size) {
        Ok(slot) => slot,
        Err(e) => {
            error!("shared memory slot creation failed: {e}");
            backend.shutdown();
            return ExitCode::FAILURE;
        }
    };
    info!("publishing to {}", slot.path().display());

    let stop = StopFlag::new();
    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("interrupt received, stopping");
        handler_stop.stop();
    }) {
        warn!("could not install the interrupt handler: {e}");
    }

    let session = SessionInfo {
        width,
        height,
        fps: config.fps,
        quality: config.quality,
        monitor: config.monitor,
    };
    let pacer = PacerConfig::from_config(&config);
    let report = pacer::run(backend.as_mut(), &mut slot, session, &pacer, &stop);

    info!(
        "done: {} frames published, {} errors, {} oversize drops",
        report.frames_published, report.errors, report.oversize_drops
    );
    ExitCode::SUCCESS
}
