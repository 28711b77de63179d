// Capture pipeline topology.
//
// camera.out[1] -> splitter -+-> encoder-large                  (large JPEG)
//                            +-> resizer -+-> encoder-small     (small JPEG)
//                                         +-> out[1]            (I420 thumbnail)

use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::pipeline::backend::MediaBackend;
use crate::pipeline::error::{PipelineError, Result};
use crate::pipeline::types::{
    Encoding, FrameSize, NodeKind, Output, PortFormat, PortId, CAMERA_VIDEO_PORT,
};

/// Lifecycle of the capture graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphState {
    Unconfigured,
    Configured,
    Connected,
    Capturing,
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Connected => "connected",
            Self::Capturing => "capturing",
        };
        f.write_str(s)
    }
}

/// Fixed parameters of the resizer branch and encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GraphConfig {
    /// Resizer output 0, encoded as the small JPEG.
    pub small_size: FrameSize,
    /// Resizer output 1, delivered raw as the thumbnail.
    pub thumbnail_size: FrameSize,
    pub jpeg_quality: u8,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            small_size: FrameSize::new(640, 480),
            thumbnail_size: FrameSize::new(128, 80),
            jpeg_quality: 15,
        }
    }
}

const SPLITTER_IN: PortId = PortId::input(NodeKind::Splitter, 0);
const SPLITTER_LARGE: PortId = PortId::output(NodeKind::Splitter, 0);
const SPLITTER_RESIZE: PortId = PortId::output(NodeKind::Splitter, 1);
const RESIZER_IN: PortId = PortId::input(NodeKind::Resizer, 0);
const RESIZER_SMALL: PortId = PortId::output(NodeKind::Resizer, 0);
const LARGE_ENCODER_IN: PortId = PortId::input(NodeKind::LargeEncoder, 0);
const SMALL_ENCODER_IN: PortId = PortId::input(NodeKind::SmallEncoder, 0);

/// Connections in creation order. Each downstream node is connected only
/// after its producer is connected and enabled.
const LINKS: [(PortId, PortId); 4] = [
    (CAMERA_VIDEO_PORT, SPLITTER_IN),
    (SPLITTER_LARGE, LARGE_ENCODER_IN),
    (SPLITTER_RESIZE, RESIZER_IN),
    (RESIZER_SMALL, SMALL_ENCODER_IN),
];

/// The five-node capture graph and its explicit lifecycle.
pub struct PipelineGraph {
    backend: Arc<dyn MediaBackend>,
    config: GraphConfig,
    state: GraphState,
    source_size: Option<FrameSize>,
    framerate: Option<u32>,
    formats: Vec<(PortId, PortFormat)>,
    connections: Vec<(PortId, PortId)>,
}

impl PipelineGraph {
    pub fn new(backend: Arc<dyn MediaBackend>, config: GraphConfig) -> Self {
        Self {
            backend,
            config,
            state: GraphState::Unconfigured,
            source_size: None,
            framerate: None,
            formats: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// The quantized size the source was committed at.
    pub fn source_size(&self) -> Option<FrameSize> {
        self.source_size
    }

    pub fn framerate(&self) -> Option<u32> {
        self.framerate
    }

    /// The format this graph committed on `port`, if any.
    pub fn format(&self, port: PortId) -> Option<PortFormat> {
        self.formats
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, format)| *format)
    }

    /// Live connections in creation order.
    pub fn connections(&self) -> &[(PortId, PortId)] {
        &self.connections
    }

    fn require(&self, operation: &'static str, allowed: &[GraphState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PipelineError::invalid_state(operation, self.state))
        }
    }

    /// Every port format, in commit order, for a capture at `size`.
    fn format_plan(&self, size: FrameSize, framerate: u32) -> Vec<(PortId, PortFormat)> {
        let opaque = PortFormat::new(Encoding::Opaque).with_size(size);
        let small = self.config.small_size.quantized();
        let thumbnail = self.config.thumbnail_size.quantized();
        let q = self.config.jpeg_quality;
        vec![
            (CAMERA_VIDEO_PORT, opaque.with_framerate(framerate)),
            (SPLITTER_IN, opaque),
            (SPLITTER_LARGE, opaque),
            (SPLITTER_RESIZE, opaque),
            (RESIZER_IN, opaque),
            (
                RESIZER_SMALL,
                PortFormat::new(Encoding::I420).with_size(small),
            ),
            (
                Output::Thumbnail.port(),
                PortFormat::new(Encoding::I420).with_size(thumbnail),
            ),
            (LARGE_ENCODER_IN, opaque),
            (
                Output::LargeJpeg.port(),
                PortFormat::new(Encoding::Jpeg).with_size(size).with_quality(q),
            ),
            (
                SMALL_ENCODER_IN,
                PortFormat::new(Encoding::I420).with_size(small),
            ),
            (
                Output::SmallJpeg.port(),
                PortFormat::new(Encoding::Jpeg).with_size(small).with_quality(q),
            ),
        ]
    }

    /// Set and commit every port format for capturing at `size` (rounded up
    /// to the hardware alignment) and `framerate`.
    ///
    /// Any rejected format aborts the build and leaves the graph unconfigured.
    pub fn configure(&mut self, size: FrameSize, framerate: u32) -> Result<()> {
        self.require(
            "configure",
            &[GraphState::Unconfigured, GraphState::Configured],
        )?;
        let size = size.quantized();
        info!("configuring capture pipeline at {size} @{framerate}fps");

        self.state = GraphState::Unconfigured;
        self.formats.clear();
        self.source_size = None;
        self.framerate = None;

        for (port, format) in self.format_plan(size, framerate) {
            let committed = self
                .backend
                .set_format(port, &format)
                .and_then(|()| self.backend.commit(port));
            if let Err(e) = committed {
                error!("pipeline configuration aborted at {port}: {e}");
                self.formats.clear();
                return Err(e);
            }
            debug!("{port}: {format}");
            self.formats.push((port, format));
        }

        self.source_size = Some(size);
        self.framerate = Some(framerate);
        self.state = GraphState::Configured;
        Ok(())
    }

    /// Make and enable every connection, source first.
    ///
    /// If any step fails, the connections already made are torn down again
    /// and the graph stays configured.
    pub fn connect(&mut self) -> Result<()> {
        self.require("connect", &[GraphState::Configured])?;
        for (upstream, downstream) in LINKS {
            if let Err(e) = self.backend.connect(upstream, downstream) {
                error!("connecting {upstream} -> {downstream} failed: {e}");
                self.rollback();
                return Err(e);
            }
            self.connections.push((upstream, downstream));
            if let Err(e) = self.backend.enable_connection(downstream) {
                error!("enabling {upstream} -> {downstream} failed: {e}");
                self.rollback();
                return Err(e);
            }
            debug!("connected {upstream} -> {downstream}");
        }
        self.state = GraphState::Connected;
        info!("capture pipeline connected\n{}", self.describe());
        Ok(())
    }

    /// Disable and disconnect every connection in reverse creation order.
    pub fn teardown(&mut self) -> Result<()> {
        self.require("teardown", &[GraphState::Connected])?;
        let result = self.unwind_connections();
        self.state = GraphState::Configured;
        info!("capture pipeline torn down");
        result
    }

    fn rollback(&mut self) {
        if let Err(e) = self.unwind_connections() {
            warn!("rolling back partial pipeline failed: {e}");
        }
    }

    fn unwind_connections(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some((upstream, downstream)) = self.connections.pop() {
            let step = self
                .backend
                .disable_connection(downstream)
                .and_then(|()| self.backend.disconnect(downstream));
            if let Err(e) = step {
                warn!("tearing down {upstream} -> {downstream} failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Mark a capture round as in flight. Only a connected graph can capture.
    pub fn begin_capture(&mut self) -> Result<()> {
        self.require("capture", &[GraphState::Connected])?;
        self.state = GraphState::Capturing;
        Ok(())
    }

    pub fn end_capture(&mut self) {
        if self.state == GraphState::Capturing {
            self.state = GraphState::Connected;
        }
    }

    /// `begin_capture`, ended again when the returned scope drops,
    /// including on unwind.
    pub fn capture_scope(&mut self) -> Result<CaptureScope<'_>> {
        self.begin_capture()?;
        Ok(CaptureScope { graph: self })
    }

    /// Human-readable listing of the committed formats and connections.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "pipeline ({})", self.state);
        for (upstream, downstream) in &self.connections {
            let fmt_of = |port: PortId| {
                self.format(port)
                    .map_or_else(|| "?".to_string(), |f| f.to_string())
            };
            let _ = writeln!(
                out,
                "  {upstream} [{}] -> {downstream} [{}]",
                fmt_of(*upstream),
                fmt_of(*downstream)
            );
        }
        for output in Output::ALL {
            if let Some(format) = self.format(output.port()) {
                let _ = writeln!(out, "  {} [{format}] => {output}", output.port());
            }
        }
        out
    }
}

/// Holds the graph in `Capturing` for one round.
pub struct CaptureScope<'a> {
    graph: &'a mut PipelineGraph,
}

impl Drop for CaptureScope<'_> {
    fn drop(&mut self) {
        self.graph.end_capture();
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        if !self.connections.is_empty() {
            self.rollback();
        }
    }
}
