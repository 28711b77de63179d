use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::pipeline::backend::MediaBackend;
use crate::pipeline::error::{PipelineError, Result};
use crate::pipeline::types::{Encoding, NodeKind, PortFormat, PortId, CAMERA_PREVIEW_PORT};

/// Where preview frames go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewTarget {
    /// On-screen renderer.
    #[default]
    Renderer,
    /// Discards frames; keeps the sensor's exposure loop running headless.
    Null,
}

impl PreviewTarget {
    fn sink_port(self) -> PortId {
        match self {
            Self::Renderer => PortId::input(NodeKind::Renderer, 0),
            Self::Null => PortId::input(NodeKind::NullSink, 0),
        }
    }
}

/// Auxiliary camera preview path, independent of the capture pipeline.
///
/// On small boards, running preview alongside a high-framerate capture
/// pipeline gives unpredictable capture timing. Stop the preview before
/// configuring the capture pipeline; this type does not check.
pub struct PreviewController {
    backend: Arc<dyn MediaBackend>,
    framerate: u32,
    active: Option<PreviewTarget>,
}

impl PreviewController {
    pub fn new(backend: Arc<dyn MediaBackend>, framerate: u32) -> Self {
        Self {
            backend,
            framerate,
            active: None,
        }
    }

    /// The current preview target, if preview is running.
    pub fn active(&self) -> Option<PreviewTarget> {
        self.active
    }

    pub fn set_framerate(&mut self, framerate: u32) {
        self.framerate = framerate;
    }

    /// Commit the preview port at the configured framerate, then connect and
    /// enable it into `target`.
    pub fn start(&mut self, target: PreviewTarget) -> Result<()> {
        if let Some(current) = self.active {
            return Err(PipelineError::invalid_state(
                "start preview",
                format!("previewing to {current:?}"),
            ));
        }
        let sink = target.sink_port();
        let source_format = PortFormat::new(Encoding::Opaque).with_framerate(self.framerate);
        self.backend.set_format(CAMERA_PREVIEW_PORT, &source_format)?;
        self.backend.commit(CAMERA_PREVIEW_PORT)?;
        self.backend
            .set_format(sink, &PortFormat::new(Encoding::Opaque))?;
        self.backend.commit(sink)?;

        self.backend.connect(CAMERA_PREVIEW_PORT, sink)?;
        if let Err(e) = self.backend.enable_connection(sink) {
            if let Err(cleanup) = self.backend.disconnect(sink) {
                warn!("disconnecting failed preview left {sink} connected: {cleanup}");
            }
            return Err(e);
        }
        self.active = Some(target);
        info!("preview started ({target:?}, {}fps)", self.framerate);
        Ok(())
    }

    /// Disable and disconnect the preview. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        let Some(target) = self.active.take() else {
            debug!("preview already stopped");
            return Ok(());
        };
        let sink = target.sink_port();
        self.backend.disable_connection(sink)?;
        self.backend.disconnect(sink)?;
        info!("preview stopped");
        Ok(())
    }
}

impl Drop for PreviewController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("stopping preview on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::simulated::{BackendEvent, SimulatedBackend};

    fn controller(backend: &SimulatedBackend) -> PreviewController {
        PreviewController::new(Arc::new(backend.clone()), 10)
    }

    #[test]
    fn start_commits_framerate_and_connects_renderer() {
        let backend = SimulatedBackend::new();
        let mut preview = controller(&backend);
        preview.start(PreviewTarget::Renderer).unwrap();

        let format = backend.committed_format(CAMERA_PREVIEW_PORT).unwrap();
        assert_eq!(format.framerate, Some(10));
        assert_eq!(
            backend.connections(),
            vec![(CAMERA_PREVIEW_PORT, PortId::input(NodeKind::Renderer, 0), true)]
        );
        assert_eq!(preview.active(), Some(PreviewTarget::Renderer));
    }

    #[test]
    fn null_target_connects_null_sink() {
        let backend = SimulatedBackend::new();
        let mut preview = controller(&backend);
        preview.start(PreviewTarget::Null).unwrap();
        let (_, downstream, enabled) = backend.connections()[0];
        assert_eq!(downstream, PortId::input(NodeKind::NullSink, 0));
        assert!(enabled);
    }

    #[test]
    fn stop_disables_before_disconnecting() {
        let backend = SimulatedBackend::new();
        let mut preview = controller(&backend);
        preview.start(PreviewTarget::Renderer).unwrap();
        backend.clear_events();
        preview.stop().unwrap();

        let sink = PortId::input(NodeKind::Renderer, 0);
        assert_eq!(
            backend.events(),
            vec![
                BackendEvent::DisableConnection(sink),
                BackendEvent::Disconnect(sink),
            ]
        );
        assert!(backend.connections().is_empty());
        assert_eq!(preview.active(), None);
    }

    #[test]
    fn stop_is_idempotent() {
        let backend = SimulatedBackend::new();
        let mut preview = controller(&backend);
        preview.stop().unwrap();
        preview.start(PreviewTarget::Null).unwrap();
        preview.stop().unwrap();
        preview.stop().unwrap();
    }

    #[test]
    fn double_start_is_rejected() {
        let backend = SimulatedBackend::new();
        let mut preview = controller(&backend);
        preview.start(PreviewTarget::Renderer).unwrap();
        let err = preview.start(PreviewTarget::Null).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
    }

    #[test]
    fn preview_can_restart_after_stop() {
        let backend = SimulatedBackend::new();
        let mut preview = controller(&backend);
        preview.start(PreviewTarget::Renderer).unwrap();
        preview.stop().unwrap();
        preview.set_framerate(30);
        preview.start(PreviewTarget::Renderer).unwrap();
        let format = backend.committed_format(CAMERA_PREVIEW_PORT).unwrap();
        assert_eq!(format.framerate, Some(30));
    }

    #[test]
    fn failed_enable_leaves_nothing_connected() {
        let backend = SimulatedBackend::new().with_error("enable_connection", None, "busy");
        let mut preview = controller(&backend);
        assert!(preview.start(PreviewTarget::Renderer).is_err());
        assert!(backend.connections().is_empty());
        assert_eq!(preview.active(), None);
    }

    #[test]
    fn drop_stops_active_preview() {
        let backend = SimulatedBackend::new();
        {
            let mut preview = controller(&backend);
            preview.start(PreviewTarget::Renderer).unwrap();
        }
        assert!(backend.connections().is_empty());
    }
}
