//! JPEG compression collaborator.
//!
//! Backends feed raw packed pixels (with an explicit row stride, since GDI
//! rows are DWORD-aligned and DXGI surfaces have their own pitch) and get
//! back a borrowed slice of compressed bytes. Both scratch buffers are
//! reused across calls; the compressor is not safe for concurrent use,
//! matching the single-threaded capture loop.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageEncoder};

use crate::error::CaptureError;

/// Raw pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 24-bit BGR (GDI bitmaps).
    Bgr8,
    /// Packed 32-bit BGRA (DXGI surfaces, CoreGraphics images).
    Bgra8,
    /// Packed 24-bit RGB (X11 shell-out capture).
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Bgra8 => 4,
        }
    }
}

/// Reusable JPEG compressor with a fixed quality setting.
pub struct JpegCompressor {
    quality: u8,
    rgb: Vec<u8>,
    jpeg: Vec<u8>,
}

impl JpegCompressor {
    /// `quality` is clamped to 0-100.
    pub fn new(quality: u32) -> Self {
        Self {
            quality: quality.min(100) as u8,
            rgb: Vec::new(),
            jpeg: Vec::new(),
        }
    }

    pub fn quality(&self) -> u32 {
        u32::from(self.quality)
    }

    /// Compress one frame. `stride` is the byte distance between row starts;
    /// pass 0 for tightly packed rows. The returned slice is valid until the
    /// next call.
    pub fn compress(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        stride: usize,
        format: PixelFormat,
    ) -> Result<&[u8], CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::encode(format!(
                "cannot encode {width}x{height} frame"
            )));
        }

        let row_bytes = width as usize * format.bytes_per_pixel();
        let stride = if stride == 0 { row_bytes } else { stride };
        if stride < row_bytes {
            return Err(CaptureError::encode(format!(
                "stride {stride} smaller than row ({row_bytes} bytes)"
            )));
        }
        let needed = stride * (height as usize - 1) + row_bytes;
        if pixels.len() < needed {
            return Err(CaptureError::encode(format!(
                "pixel buffer too small: {} bytes, need {needed}",
                pixels.len()
            )));
        }

        self.rgb.clear();
        self.rgb.reserve(width as usize * height as usize * 3);
        for y in 0..height as usize {
            let row = &pixels[y * stride..y * stride + row_bytes];
            match format {
                PixelFormat::Rgb8 => self.rgb.extend_from_slice(row),
                PixelFormat::Bgr8 => {
                    for px in row.chunks_exact(3) {
                        self.rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                    }
                }
                PixelFormat::Bgra8 => {
                    for px in row.chunks_exact(4) {
                        self.rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                    }
                }
            }
        }

        self.jpeg.clear();
        JpegEncoder::new_with_quality(&mut self.jpeg, self.quality)
            .write_image(&self.rgb, width, height, ColorType::Rgb8)
            .map_err(|e| CaptureError::encode(format!("jpeg encode failed: {e}")))?;

        Ok(&self.jpeg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::SlotErrorCode;

    #[test]
    fn quality_is_clamped() {
        assert_eq!(JpegCompressor::new(500).quality(), 100);
        assert_eq!(JpegCompressor::new(75).quality(), 75);
    }

    #[test]
    fn compresses_packed_bgr_to_jpeg() {
        let mut compressor = JpegCompressor::new(75);
        let pixels = vec![0x40u8; 16 * 16 * 3];
        let jpeg = compressor.compress(&pixels, 16, 16, 0, PixelFormat::Bgr8).unwrap();
        assert!(jpeg.len() > 4);
        // JPEG SOI / EOI markers.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn honors_row_stride_padding() {
        // 2x2 BGRA frame with rows padded to 16 bytes.
        let mut pixels = vec![0u8; 16 + 8];
        for px in pixels.chunks_exact_mut(4).take(2) {
            px.copy_from_slice(&[255, 0, 0, 255]); // blue
        }
        let mut compressor = JpegCompressor::new(90);
        let jpeg = compressor
            .compress(&pixels, 2, 2, 16, PixelFormat::Bgra8)
            .unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn short_buffer_is_an_encode_failure() {
        let mut compressor = JpegCompressor::new(75);
        let err = compressor
            .compress(&[0u8; 8], 16, 16, 0, PixelFormat::Rgb8)
            .unwrap_err();
        assert_eq!(err.code, SlotErrorCode::EncodeFail);
    }

    #[test]
    fn scratch_buffers_are_reused_across_calls() {
        let mut compressor = JpegCompressor::new(60);
        let a = vec![0x10u8; 8 * 8 * 3];
        let b = vec![0xF0u8; 8 * 8 * 3];
        let first = compressor.compress(&a, 8, 8, 0, PixelFormat::Rgb8).unwrap().to_vec();
        let second = compressor.compress(&b, 8, 8, 0, PixelFormat::Rgb8).unwrap().to_vec();
        assert_ne!(first, second);
        assert_eq!(&second[..2], &[0xFF, 0xD8]);
    }
}
