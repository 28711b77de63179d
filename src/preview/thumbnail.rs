use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::GrayImage;

use crate::capture::sink::timestamped_path;
use crate::pipeline::error::{PipelineError, Result};
use crate::pipeline::types::FrameSize;

/// Quality used when saving thumbnails; they are only ever eyeballed.
pub const THUMBNAIL_JPEG_QUALITY: u8 = 75;

/// Read the luma plane of an I420 buffer as a grayscale image.
///
/// Rows in the buffer sit on the hardware's 32-byte stride; the returned
/// image is tightly packed at `size`.
pub fn luma_plane(buffer: &[u8], size: FrameSize) -> Result<GrayImage> {
    let stride = size.quantized().width as usize;
    let width = size.width as usize;
    let height = size.height as usize;
    if width == 0 || height == 0 {
        return Err(PipelineError::Thumbnail(format!("empty thumbnail size {size}")));
    }
    let needed = stride * (height - 1) + width;
    if buffer.len() < needed {
        return Err(PipelineError::Thumbnail(format!(
            "buffer holds {} bytes, {size} luma plane needs {needed}",
            buffer.len()
        )));
    }

    let mut pixels = Vec::with_capacity(width * height);
    for row in buffer.chunks(stride).take(height) {
        pixels.extend_from_slice(&row[..width]);
    }
    GrayImage::from_raw(size.width, size.height, pixels)
        .ok_or_else(|| PipelineError::Thumbnail("invalid buffer dimensions".to_string()))
}

/// Compress a grayscale image to JPEG at the given quality (1-100).
pub fn encode_jpeg(image: &GrayImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    image
        .write_with_encoder(encoder)
        .map_err(|e| PipelineError::Thumbnail(e.to_string()))?;
    Ok(buf)
}

/// Save the thumbnail's luma plane as `dir/xsmall_{timestamp}.jpg`.
pub fn save_thumbnail(buffer: &[u8], size: FrameSize, dir: &Path) -> Result<PathBuf> {
    let image = luma_plane(buffer, size)?;
    let jpeg = encode_jpeg(&image, THUMBNAIL_JPEG_QUALITY)?;
    let path = timestamped_path(dir, "xsmall", "jpg");
    std::fs::write(&path, jpeg)
        .map_err(|e| PipelineError::Thumbnail(format!("{}: {e}", path.display())))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// I420 frame: luma value = column index, chroma neutral.
    fn make_i420(size: FrameSize) -> Vec<u8> {
        let stride = size.quantized().width as usize;
        let mut data = Vec::new();
        for _ in 0..size.height {
            data.extend((0..stride).map(|x| x as u8));
        }
        let luma = data.len();
        data.resize(luma + luma / 2, 0x80);
        data
    }

    #[test]
    fn luma_plane_matches_requested_size() {
        let size = FrameSize::new(128, 80);
        let img = luma_plane(&make_i420(size), size).unwrap();
        assert_eq!(img.dimensions(), (128, 80));
        assert_eq!(img.get_pixel(5, 7).0[0], 5);
    }

    #[test]
    fn luma_plane_skips_stride_padding() {
        let size = FrameSize::new(100, 20);
        let img = luma_plane(&make_i420(size), size).unwrap();
        assert_eq!(img.dimensions(), (100, 20));
        // Each row restarts at column 0 rather than running into padding.
        assert_eq!(img.get_pixel(0, 1).0[0], 0);
        assert_eq!(img.get_pixel(99, 1).0[0], 99);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let size = FrameSize::new(128, 80);
        let err = luma_plane(&[0u8; 100], size).unwrap_err();
        assert!(matches!(err, PipelineError::Thumbnail(_)));
    }

    #[test]
    fn encode_produces_valid_jpeg() {
        let size = FrameSize::new(64, 32);
        let img = luma_plane(&make_i420(size), size).unwrap();
        let jpeg = encode_jpeg(&img, 75).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn save_writes_timestamped_file() {
        let dir = TempDir::new().unwrap();
        let size = FrameSize::new(128, 80);
        let path = save_thumbnail(&make_i420(size), size, dir.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("xsmall_"));
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
