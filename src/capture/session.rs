use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::capture::coordinator::{CaptureCoordinator, CaptureTimeouts, RoundOutputs, SinkSet};
use crate::capture::sink::{shared, FileSink, MemorySink, OutputSink};
use crate::diagnostics::stats::{RoundSnapshot, RoundStats};
use crate::pipeline::backend::MediaBackend;
use crate::pipeline::error::{PipelineError, Result};
use crate::pipeline::graph::{GraphConfig, GraphState, PipelineGraph};
use crate::pipeline::types::{FrameSize, Output, CAMERA_VIDEO_PORT};
use crate::preview::controller::{PreviewController, PreviewTarget};
use crate::settings::types::CaptureSettings;

const LARGE_FILE_PREFIX: &str = "enclarge";
const SMALL_FILE_PREFIX: &str = "encsmall";

/// One round captured entirely into memory.
#[derive(Debug, Clone)]
pub struct BufferCapture {
    pub large: Vec<u8>,
    pub small: Vec<u8>,
    /// Raw I420 frame at the thumbnail size, rows on the aligned stride.
    pub thumbnail: Vec<u8>,
    pub elapsed: Duration,
}

/// One round captured with the JPEGs written to disk.
#[derive(Debug, Clone)]
pub struct FileCapture {
    pub large_path: PathBuf,
    pub small_path: PathBuf,
    pub thumbnail: Vec<u8>,
    pub elapsed: Duration,
}

/// The capture pipeline, its coordinator and the preview path behind one API.
///
/// Every capture call returns its outputs directly; nothing about the last
/// round is retained apart from statistics.
pub struct CaptureSession {
    preview: PreviewController,
    graph: PipelineGraph,
    coordinator: CaptureCoordinator,
    buffers: SinkSet<MemorySink, MemorySink, MemorySink>,
    stats: RoundStats,
}

impl CaptureSession {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        config: GraphConfig,
        timeouts: CaptureTimeouts,
        framerate: u32,
    ) -> Self {
        Self {
            preview: PreviewController::new(Arc::clone(&backend), framerate),
            graph: PipelineGraph::new(Arc::clone(&backend), config),
            coordinator: CaptureCoordinator::new(backend, CAMERA_VIDEO_PORT, timeouts),
            buffers: SinkSet {
                large: shared(MemorySink::new()),
                small: shared(MemorySink::new()),
                thumbnail: shared(MemorySink::new()),
            },
            stats: RoundStats::new(),
        }
    }

    pub fn from_settings(backend: Arc<dyn MediaBackend>, settings: &CaptureSettings) -> Self {
        Self::new(
            backend,
            settings.graph_config(),
            settings.timeouts,
            settings.framerate,
        )
    }

    pub fn state(&self) -> GraphState {
        self.graph.state()
    }

    /// Size the resizer's thumbnail output is committed at.
    pub fn thumbnail_size(&self) -> FrameSize {
        self.graph.config().thumbnail_size
    }

    pub fn set_timeouts(&mut self, timeouts: CaptureTimeouts) {
        self.coordinator.set_timeouts(timeouts);
    }

    pub fn describe(&self) -> String {
        self.graph.describe()
    }

    pub fn stats(&self) -> RoundSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Commit every port for capturing at `size` and `framerate`. Later
    /// preview starts use the same framerate.
    pub fn configure(&mut self, size: FrameSize, framerate: u32) -> Result<()> {
        self.graph.configure(size, framerate)?;
        self.preview.set_framerate(framerate);
        Ok(())
    }

    pub fn connect(&mut self) -> Result<()> {
        self.graph.connect()
    }

    pub fn teardown(&mut self) -> Result<()> {
        self.graph.teardown()
    }

    /// Start the preview path. Stop it again before configuring the
    /// capture pipeline.
    pub fn start_preview(&mut self, target: PreviewTarget) -> Result<()> {
        self.preview.start(target)
    }

    pub fn stop_preview(&mut self) -> Result<()> {
        self.preview.stop()
    }

    pub fn preview_active(&self) -> bool {
        self.preview.active().is_some()
    }

    /// Capture one round with all three outputs kept in memory.
    pub fn capture_to_buffers(&mut self) -> Result<BufferCapture> {
        let sinks = self.buffers.clone();
        let out = self.run_round(&sinks)?;
        let bytes = out.large.len() + out.small.len() + out.thumbnail.len();
        self.stats.record_round(out.elapsed, bytes);
        info!(
            "buffer capture took {:?} (large {} B, small {} B, thumbnail {} B)",
            out.elapsed,
            out.large.len(),
            out.small.len(),
            out.thumbnail.len()
        );
        Ok(BufferCapture {
            large: out.large,
            small: out.small,
            thumbnail: out.thumbnail,
            elapsed: out.elapsed,
        })
    }

    /// Capture one round, writing both JPEGs as timestamp-named files in
    /// `dir`. The thumbnail comes back in memory.
    pub fn capture_to_files(&mut self, dir: &Path) -> Result<FileCapture> {
        std::fs::create_dir_all(dir).map_err(|source| PipelineError::Sink {
            output: Output::LargeJpeg,
            source,
        })?;
        let sinks = SinkSet {
            large: shared(FileSink::new(dir, LARGE_FILE_PREFIX)),
            small: shared(FileSink::new(dir, SMALL_FILE_PREFIX)),
            thumbnail: Arc::clone(&self.buffers.thumbnail),
        };
        let out = self.run_round(&sinks)?;
        let bytes = sinks.large.lock().bytes_accepted()
            + sinks.small.lock().bytes_accepted()
            + out.thumbnail.len();
        self.stats.record_round(out.elapsed, bytes);
        info!(
            "file capture took {:?} ({}, {})",
            out.elapsed,
            out.large.display(),
            out.small.display()
        );
        Ok(FileCapture {
            large_path: out.large,
            small_path: out.small,
            thumbnail: out.thumbnail,
            elapsed: out.elapsed,
        })
    }

    fn run_round<L, S, T>(
        &mut self,
        sinks: &SinkSet<L, S, T>,
    ) -> Result<RoundOutputs<L::Output, S::Output, T::Output>>
    where
        L: OutputSink + 'static,
        S: OutputSink + 'static,
        T: OutputSink + 'static,
    {
        if self.preview_active() {
            warn!("capturing with preview running; round timing may be unreliable");
        }
        let scope = self.graph.capture_scope()?;
        let result = self.coordinator.capture(sinks);
        drop(scope);
        if let Err(e) = &result {
            if let Some(output) = e.timed_out_output() {
                self.stats.record_timeout(output);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::simulated::{BackendEvent, ScriptedChunk, SimulatedBackend};
    use tempfile::TempDir;

    fn fast_timeouts() -> CaptureTimeouts {
        CaptureTimeouts {
            large: Duration::from_millis(500),
            small: Duration::from_millis(200),
            thumbnail: Duration::from_millis(200),
        }
    }

    fn session(backend: &SimulatedBackend) -> CaptureSession {
        CaptureSession::new(
            Arc::new(backend.clone()),
            GraphConfig::default(),
            fast_timeouts(),
            10,
        )
    }

    fn ready(backend: &SimulatedBackend) -> CaptureSession {
        let mut session = session(backend);
        session.configure(FrameSize::new(1296, 972), 10).unwrap();
        session.connect().unwrap();
        session
    }

    fn scripted_backend() -> SimulatedBackend {
        SimulatedBackend::new()
            .with_script(
                Output::LargeJpeg.port(),
                vec![
                    ScriptedChunk::new(vec![0xFF, 0xD8, 0x01], false),
                    ScriptedChunk::new(vec![0x02, 0xFF, 0xD9], true),
                ],
            )
            .with_script(
                Output::SmallJpeg.port(),
                vec![ScriptedChunk::new(vec![0xFF, 0xD8, 0xFF, 0xD9], true)],
            )
            .with_script(
                Output::Thumbnail.port(),
                vec![ScriptedChunk::new(vec![0x80; 128 * 80 * 3 / 2], true)],
            )
    }

    #[test]
    fn end_to_end_buffer_round() {
        let backend = scripted_backend();
        let mut session = session(&backend);
        session.configure(FrameSize::new(1296, 972), 10).unwrap();
        assert_eq!(
            backend.committed_format(CAMERA_VIDEO_PORT).unwrap().size,
            Some(FrameSize::new(1312, 976))
        );
        session.connect().unwrap();

        let out = session.capture_to_buffers().unwrap();
        assert_eq!(out.large, vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        assert_eq!(out.small, vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(out.thumbnail.len(), 128 * 80 * 3 / 2);
        assert!(out.elapsed < Duration::from_millis(900));
        assert_eq!(session.state(), GraphState::Connected);
    }

    #[test]
    fn repeated_buffer_rounds_succeed() {
        let backend = scripted_backend();
        let mut session = ready(&backend);
        let first = session.capture_to_buffers().unwrap();
        let second = session.capture_to_buffers().unwrap();
        assert_eq!(first.large, second.large);
        assert_eq!(second.small.len(), 4);
        assert_eq!(session.stats().completed, 2);
    }

    #[test]
    fn rounds_are_isolated() {
        let backend = scripted_backend();
        let mut session = ready(&backend);
        let first = session.capture_to_buffers().unwrap();
        let second = session.capture_to_buffers().unwrap();
        // A leaked previous round would double the accumulated length.
        assert_eq!(second.large.len(), first.large.len());
        assert_eq!(second.thumbnail.len(), first.thumbnail.len());
    }

    #[test]
    fn chunks_keep_delivery_order() {
        let backend = SimulatedBackend::new().with_script(
            Output::LargeJpeg.port(),
            vec![
                ScriptedChunk::new(vec![1], false),
                ScriptedChunk::new(vec![2], false),
                ScriptedChunk::new(vec![3], true),
            ],
        );
        let mut session = ready(&backend);
        assert_eq!(session.capture_to_buffers().unwrap().large, vec![1, 2, 3]);
    }

    #[test]
    fn timeout_leaves_trigger_cleared_and_outputs_disabled() {
        let backend = scripted_backend().with_silent_output(Output::SmallJpeg.port());
        let mut session = ready(&backend);

        let err = session.capture_to_buffers().unwrap_err();
        assert_eq!(err.timed_out_output(), Some(Output::SmallJpeg));
        assert!(!backend.is_capturing(CAMERA_VIDEO_PORT));
        assert!(backend.enabled_outputs().is_empty());
        assert_eq!(session.state(), GraphState::Connected);

        let stats = session.stats();
        assert_eq!(stats.small_timeouts, 1);
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn session_recovers_after_timeout() {
        let backend = scripted_backend().with_silent_output(Output::Thumbnail.port());
        let mut session = ready(&backend);
        assert!(session.capture_to_buffers().is_err());
        backend.unsilence(Output::Thumbnail.port());
        assert!(session.capture_to_buffers().is_ok());
    }

    #[test]
    fn capture_before_connect_is_rejected() {
        let backend = SimulatedBackend::new();
        let mut session = session(&backend);
        session.configure(FrameSize::new(640, 480), 10).unwrap();
        let err = session.capture_to_buffers().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
        assert!(backend
            .events()
            .iter()
            .all(|e| !matches!(e, BackendEvent::Capture { .. })));
    }

    #[test]
    fn file_round_writes_prefixed_jpegs() {
        let backend = scripted_backend();
        let mut session = ready(&backend);
        let dir = TempDir::new().unwrap();

        let out = session.capture_to_files(dir.path()).unwrap();
        let large_name = out.large_path.file_name().unwrap().to_string_lossy().to_string();
        let small_name = out.small_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(large_name.starts_with("enclarge_") && large_name.ends_with(".jpg"));
        assert!(small_name.starts_with("encsmall_") && small_name.ends_with(".jpg"));
        assert_eq!(
            std::fs::read(&out.large_path).unwrap(),
            vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]
        );
        assert_eq!(std::fs::read(&out.small_path).unwrap().len(), 4);
        assert_eq!(out.thumbnail.len(), 128 * 80 * 3 / 2);
        assert_eq!(session.stats().total_bytes, 6 + 4 + 128 * 80 * 3 / 2);
    }

    #[test]
    fn file_rounds_create_fresh_files() {
        let backend = scripted_backend();
        let mut session = ready(&backend);
        let dir = TempDir::new().unwrap();

        let first = session.capture_to_files(dir.path()).unwrap();
        let second = session.capture_to_files(dir.path()).unwrap();
        assert_ne!(first.large_path, second.large_path);
        assert!(first.large_path.exists() && second.large_path.exists());
    }

    #[test]
    fn file_capture_creates_output_dir() {
        let backend = SimulatedBackend::new();
        let mut session = ready(&backend);
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("shots").join("today");
        let out = session.capture_to_files(&nested).unwrap();
        assert!(out.large_path.starts_with(&nested));
    }

    #[test]
    fn configure_sets_preview_framerate() {
        let backend = SimulatedBackend::new();
        let mut session = session(&backend);
        session.configure(FrameSize::new(640, 480), 25).unwrap();
        session.start_preview(PreviewTarget::Null).unwrap();
        let format = backend
            .committed_format(crate::pipeline::types::CAMERA_PREVIEW_PORT)
            .unwrap();
        assert_eq!(format.framerate, Some(25));
        session.stop_preview().unwrap();
        assert!(!session.preview_active());
    }

    #[test]
    fn from_settings_applies_sizes_and_timeouts() {
        let backend = SimulatedBackend::new();
        let settings = CaptureSettings {
            thumbnail_size: FrameSize::new(64, 48),
            ..Default::default()
        };
        let session = CaptureSession::from_settings(Arc::new(backend), &settings);
        assert_eq!(session.thumbnail_size(), FrameSize::new(64, 48));
        assert_eq!(session.coordinator.timeouts(), CaptureTimeouts::default());
    }
}
