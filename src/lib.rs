pub mod capture;
pub mod diagnostics;
pub mod driver;
pub mod pipeline;
pub mod preview;
pub mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use capture::session::CaptureSession;
use pipeline::simulated::SimulatedBackend;
use pipeline::types::FrameSize;
use preview::controller::PreviewTarget;
use settings::store::SettingsStore;

pub use capture::session::{BufferCapture, FileCapture};
pub use pipeline::error::{PipelineError, Result};

#[derive(Parser)]
#[command(name = "picapture")]
#[command(about = "Three-output still capture on a simulated camera pipeline")]
#[command(version)]
struct Cli {
    /// Settings file (JSON); defaults apply when missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the effective settings back to the settings file
    #[arg(long, requires = "config")]
    save_config: bool,

    /// Sensor frame width
    #[arg(long)]
    width: Option<u32>,

    /// Sensor frame height
    #[arg(long)]
    height: Option<u32>,

    /// Sensor framerate
    #[arg(short, long)]
    framerate: Option<u32>,

    /// Rounds per capture mode
    #[arg(short, long, default_value = "5")]
    rounds: u32,

    /// Directory for JPEGs and thumbnails
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Send preview to the null sink instead of the renderer
    #[arg(long)]
    headless: bool,

    /// Preview warm-up before capturing, in seconds
    #[arg(short, long)]
    warmup: Option<u64>,
}

/// Entry point for the demo binary.
pub fn run() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG to control log level, e.g. RUST_LOG=picapture_lib=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    let store = match &cli.config {
        Some(path) => Some(SettingsStore::open(path.clone())?),
        None => None,
    };
    let mut settings = store.as_ref().map(SettingsStore::get).unwrap_or_default();

    let size = settings.size;
    settings.size = FrameSize::new(
        cli.width.unwrap_or(size.width),
        cli.height.unwrap_or(size.height),
    );
    if let Some(framerate) = cli.framerate {
        settings.framerate = framerate;
    }
    if let Some(output) = cli.output {
        settings.output_dir = output;
    }
    if cli.headless {
        settings.preview_target = PreviewTarget::Null;
    }
    if let Some(warmup) = cli.warmup {
        settings.warmup_secs = warmup;
    }

    if let (Some(store), true) = (&store, cli.save_config) {
        let effective = settings.clone();
        store.update(|s| *s = effective);
        store.save()?;
        tracing::info!("saved settings to {}", store.path().display());
    }

    let backend = Arc::new(SimulatedBackend::new());
    let mut session = CaptureSession::from_settings(backend, &settings);
    let stats = driver::run_capture_loop(&mut session, &settings, cli.rounds)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
