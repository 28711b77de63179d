use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::capture::session::CaptureSession;
use crate::diagnostics::stats::RoundSnapshot;
use crate::pipeline::error::{PipelineError, Result};
use crate::preview::thumbnail::save_thumbnail;
use crate::settings::types::CaptureSettings;

/// Warm up on preview, then run `rounds` buffer captures followed by
/// `rounds` file captures, saving each thumbnail next to the JPEGs.
///
/// Timed-out rounds are logged and skipped; any other error stops the run.
pub fn run_capture_loop(
    session: &mut CaptureSession,
    settings: &CaptureSettings,
    rounds: u32,
) -> Result<RoundSnapshot> {
    let dir = settings.output_dir.as_path();
    std::fs::create_dir_all(dir)
        .map_err(|e| PipelineError::Settings(format!("{}: {e}", dir.display())))?;

    session.start_preview(settings.preview_target)?;
    info!("warming up for {}s", settings.warmup_secs);
    thread::sleep(Duration::from_secs(settings.warmup_secs));
    session.stop_preview()?;

    session.configure(settings.size, settings.framerate)?;
    session.connect()?;

    let started = Instant::now();
    for round in 1..=rounds {
        match session.capture_to_buffers() {
            Ok(out) => {
                let path = save_thumbnail(&out.thumbnail, session.thumbnail_size(), dir)?;
                info!("buffer round {round}/{rounds}: thumbnail {}", path.display());
            }
            Err(e) if e.timed_out_output().is_some() => warn!("buffer round {round}: {e}"),
            Err(e) => return Err(e),
        }
    }
    info!("{rounds} buffer rounds took {:?}", started.elapsed());

    let started = Instant::now();
    for round in 1..=rounds {
        match session.capture_to_files(dir) {
            Ok(out) => {
                let path = save_thumbnail(&out.thumbnail, session.thumbnail_size(), dir)?;
                info!(
                    "file round {round}/{rounds}: {}, {}, {}",
                    out.large_path.display(),
                    out.small_path.display(),
                    path.display()
                );
            }
            Err(e) if e.timed_out_output().is_some() => warn!("file round {round}: {e}"),
            Err(e) => return Err(e),
        }
    }
    info!("{rounds} file rounds took {:?}", started.elapsed());

    session.teardown()?;
    let stats = session.stats();
    info!(
        "{} rounds complete, {} timed out, mean {:.1}ms",
        stats.completed, stats.timed_out, stats.mean_round_ms
    );
    Ok(stats)
}
