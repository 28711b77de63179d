use serde::{Deserialize, Serialize};
use std::fmt;

/// Hardware stride alignment for frame widths.
pub const WIDTH_ALIGN: u32 = 32;

/// Hardware alignment for frame heights.
pub const HEIGHT_ALIGN: u32 = 16;

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Round up to the buffer alignment the hardware requires.
    pub fn quantized(self) -> Self {
        let (width, height) = quantize(self.width, self.height);
        Self { width, height }
    }

    /// Whether both dimensions already sit on the hardware alignment.
    pub fn is_quantized(self) -> bool {
        self.width % WIDTH_ALIGN == 0 && self.height % HEIGHT_ALIGN == 0
    }

    pub fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Round a requested capture size up to a 32-wide, 16-high boundary.
///
/// Dimensions within one alignment step of `u32::MAX` saturate at the
/// largest aligned value; no sensor reports sizes anywhere near that.
pub fn quantize(width: u32, height: u32) -> (u32, u32) {
    (align_up(width, WIDTH_ALIGN), align_up(height, HEIGHT_ALIGN))
}

fn align_up(value: u32, align: u32) -> u32 {
    value
        .checked_next_multiple_of(align)
        .unwrap_or(u32::MAX - u32::MAX % align)
}

/// Pixel encoding carried on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Hardware-internal opaque handles; never touches CPU memory.
    Opaque,
    /// Planar YUV 4:2:0. The luma plane comes first.
    I420,
    /// Packed YUV 4:2:2.
    Yuyv,
    Jpeg,
}

impl Encoding {
    pub fn fourcc(self) -> &'static str {
        match self {
            Self::Opaque => "OPQV",
            Self::I420 => "I420",
            Self::Yuyv => "YUYV",
            Self::Jpeg => "JPEG",
        }
    }

    /// Whether the first plane of a buffer in this encoding is a full
    /// resolution luma plane that can be read as grayscale.
    pub fn has_luma_plane(self) -> bool {
        matches!(self, Self::I420)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fourcc())
    }
}

/// Requested configuration for one port.
///
/// `size` and `framerate` are optional so pass-through ports can inherit
/// what the upstream producer negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortFormat {
    pub encoding: Encoding,
    pub size: Option<FrameSize>,
    pub framerate: Option<u32>,
    pub quality: Option<u8>,
}

impl PortFormat {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            size: None,
            framerate: None,
            quality: None,
        }
    }

    pub fn with_size(mut self, size: FrameSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = Some(framerate);
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }
}

impl fmt::Display for PortFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encoding)?;
        if let Some(size) = self.size {
            write!(f, " {size}")?;
        }
        if let Some(fps) = self.framerate {
            write!(f, " @{fps}fps")?;
        }
        if let Some(q) = self.quality {
            write!(f, " q={q}")?;
        }
        Ok(())
    }
}

/// The processing stages the device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Camera,
    Splitter,
    Resizer,
    LargeEncoder,
    SmallEncoder,
    Renderer,
    NullSink,
}

impl NodeKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Splitter => "splitter",
            Self::Resizer => "resizer",
            Self::LargeEncoder => "encoder-large",
            Self::SmallEncoder => "encoder-small",
            Self::Renderer => "renderer",
            Self::NullSink => "null-sink",
        }
    }

    /// Number of (input, output) ports on this node.
    pub fn port_counts(self) -> (u8, u8) {
        match self {
            Self::Camera => (0, 3),
            Self::Splitter | Self::Resizer => (1, 2),
            Self::LargeEncoder | Self::SmallEncoder => (1, 1),
            Self::Renderer | Self::NullSink => (1, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// One typed attachment point on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortId {
    pub node: NodeKind,
    pub direction: PortDirection,
    pub index: u8,
}

impl PortId {
    pub const fn input(node: NodeKind, index: u8) -> Self {
        Self {
            node,
            direction: PortDirection::Input,
            index,
        }
    }

    pub const fn output(node: NodeKind, index: u8) -> Self {
        Self {
            node,
            direction: PortDirection::Output,
            index,
        }
    }

    pub fn is_output(self) -> bool {
        self.direction == PortDirection::Output
    }

    /// Whether the node actually has a port at this index.
    pub fn exists(self) -> bool {
        let (inputs, outputs) = self.node.port_counts();
        match self.direction {
            PortDirection::Input => self.index < inputs,
            PortDirection::Output => self.index < outputs,
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            PortDirection::Input => "in",
            PortDirection::Output => "out",
        };
        write!(f, "{}.{dir}[{}]", self.node.name(), self.index)
    }
}

/// Camera port feeding the preview path.
pub const CAMERA_PREVIEW_PORT: PortId = PortId::output(NodeKind::Camera, 0);

/// Camera video port feeding the capture pipeline. Faster per shot than the
/// still port on small boards.
pub const CAMERA_VIDEO_PORT: PortId = PortId::output(NodeKind::Camera, 1);

/// The three products of one capture round, in wait order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Output {
    LargeJpeg,
    SmallJpeg,
    Thumbnail,
}

impl Output {
    pub const ALL: [Output; 3] = [Output::LargeJpeg, Output::SmallJpeg, Output::Thumbnail];

    /// The output port whose deliveries feed this product.
    pub fn port(self) -> PortId {
        match self {
            Self::LargeJpeg => PortId::output(NodeKind::LargeEncoder, 0),
            Self::SmallJpeg => PortId::output(NodeKind::SmallEncoder, 0),
            Self::Thumbnail => PortId::output(NodeKind::Resizer, 1),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::LargeJpeg => "large JPEG",
            Self::SmallJpeg => "small JPEG",
            Self::Thumbnail => "thumbnail",
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_rounds_up_to_alignment() {
        assert_eq!(quantize(1296, 972), (1312, 976));
        assert_eq!(quantize(1, 1), (32, 16));
        assert_eq!(quantize(0, 0), (0, 0));
        assert_eq!(quantize(33, 17), (64, 32));
    }

    #[test]
    fn quantize_matches_ceiling_formula() {
        for w in (0..400).step_by(7) {
            for h in (0..300).step_by(5) {
                let (qw, qh) = quantize(w, h);
                assert_eq!(qw, w.div_ceil(32) * 32);
                assert_eq!(qh, h.div_ceil(16) * 16);
                assert!(qw >= w && qh >= h);
            }
        }
    }

    #[test]
    fn quantize_is_idempotent() {
        for (w, h) in [(1296, 972), (640, 480), (128, 80), (3280, 2464), (7, 3)] {
            let once = FrameSize::new(w, h).quantized();
            assert!(once.is_quantized());
            assert_eq!(once.quantized(), once);
        }
    }

    #[test]
    fn quantize_saturates_near_max() {
        let (w, h) = quantize(u32::MAX, u32::MAX);
        assert_eq!(w % WIDTH_ALIGN, 0);
        assert_eq!(h % HEIGHT_ALIGN, 0);
    }

    #[test]
    fn frame_size_display() {
        assert_eq!(FrameSize::new(1312, 976).to_string(), "1312x976");
    }

    #[test]
    fn port_format_display_lists_set_fields() {
        let fmt = PortFormat::new(Encoding::Jpeg)
            .with_size(FrameSize::new(640, 480))
            .with_quality(15);
        assert_eq!(fmt.to_string(), "JPEG 640x480 q=15");
        assert_eq!(PortFormat::new(Encoding::Opaque).to_string(), "OPQV");
    }

    #[test]
    fn port_display_names_node_and_index() {
        assert_eq!(CAMERA_VIDEO_PORT.to_string(), "camera.out[1]");
        assert_eq!(
            PortId::input(NodeKind::Resizer, 0).to_string(),
            "resizer.in[0]"
        );
    }

    #[test]
    fn port_exists_respects_node_layout() {
        assert!(PortId::output(NodeKind::Splitter, 1).exists());
        assert!(!PortId::output(NodeKind::Splitter, 2).exists());
        assert!(!PortId::input(NodeKind::Camera, 0).exists());
        assert!(!PortId::output(NodeKind::NullSink, 0).exists());
    }

    #[test]
    fn outputs_map_to_distinct_ports() {
        let ports: Vec<PortId> = Output::ALL.iter().map(|o| o.port()).collect();
        assert_eq!(ports[0], PortId::output(NodeKind::LargeEncoder, 0));
        assert_eq!(ports[1], PortId::output(NodeKind::SmallEncoder, 0));
        assert_eq!(ports[2], PortId::output(NodeKind::Resizer, 1));
    }

    #[test]
    fn only_i420_exposes_luma_plane() {
        assert!(Encoding::I420.has_luma_plane());
        assert!(!Encoding::Jpeg.has_luma_plane());
        assert!(!Encoding::Opaque.has_luma_plane());
    }

    #[test]
    fn output_serialises_snake_case() {
        let json = serde_json::to_value(Output::SmallJpeg).unwrap();
        assert_eq!(json, "small_jpeg");
    }
}
