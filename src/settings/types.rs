use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::capture::coordinator::CaptureTimeouts;
use crate::pipeline::graph::GraphConfig;
use crate::pipeline::types::FrameSize;
use crate::preview::controller::PreviewTarget;

/// Everything a capture session reads from its settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureSettings {
    /// Requested sensor frame size; quantized before use.
    pub size: FrameSize,
    pub framerate: u32,
    /// Resizer output 0, encoded as the small JPEG.
    pub small_size: FrameSize,
    pub thumbnail_size: FrameSize,
    pub jpeg_quality: u8,
    pub timeouts: CaptureTimeouts,
    pub output_dir: PathBuf,
    pub preview_target: PreviewTarget,
    /// Seconds of preview before the first capture, letting exposure settle.
    pub warmup_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        let graph = GraphConfig::default();
        Self {
            size: FrameSize::new(1296, 972),
            framerate: 10,
            small_size: graph.small_size,
            thumbnail_size: graph.thumbnail_size,
            jpeg_quality: graph.jpeg_quality,
            timeouts: CaptureTimeouts::default(),
            output_dir: PathBuf::from("."),
            preview_target: PreviewTarget::default(),
            warmup_secs: 2,
        }
    }
}

impl CaptureSettings {
    /// Resizer and encoder parameters for the capture graph.
    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            small_size: self.small_size,
            thumbnail_size: self.thumbnail_size,
            jpeg_quality: self.jpeg_quality,
        }
    }
}
