//! X11 screen capture (Linux).
//!
//! Pull-synchronous: every call shells out to ImageMagick's `import` for a
//! raw RGB dump of the root window and compresses it in place. Screen size
//! is detected once with `xdpyinfo` at initialization.

use std::process::Command;

use tracing::{debug, info};

use crate::capture::{CaptureBackend, Captured};
use crate::codec::{JpegCompressor, PixelFormat};
use crate::config::EncoderConfig;
use crate::error::CaptureError;

pub struct X11Backend {
    width: u32,
    height: u32,
    compressor: JpegCompressor,
    raw: Vec<u8>,
    initialized: bool,
}

impl X11Backend {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            width: 0,
            height: 0,
            compressor: JpegCompressor::new(config.quality),
            raw: Vec::new(),
            initialized: false,
        }
    }

    /// Parse `dimensions: 1920x1080 pixels` out of xdpyinfo.
    fn detect_screen_size() -> Result<(u32, u32), CaptureError> {
        let output = Command::new("xdpyinfo")
            .output()
            .map_err(|e| CaptureError::no_display(format!("xdpyinfo failed to run: {e}")))?;
        if !output.status.success() {
            return Err(CaptureError::no_display("xdpyinfo exited with an error"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(rest) = line.trim_start().strip_prefix("dimensions:") {
                if let Some(dims) = rest.split_whitespace().next() {
                    if let Some((w, h)) = dims.split_once('x') {
                        if let (Ok(w), Ok(h)) = (w.parse(), h.parse()) {
                            return Ok((w, h));
                        }
                    }
                }
            }
        }
        Err(CaptureError::no_display(
            "could not parse display dimensions from xdpyinfo",
        ))
    }
}

impl CaptureBackend for X11Backend {
    fn name(&self) -> &'static str {
        "x11"
    }

    fn is_available(&self) -> bool {
        std::env::var_os("DISPLAY").is_some()
            && Command::new("xdpyinfo")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
    }

    fn initialize(&mut self, monitor: u32) -> Result<(u32, u32), CaptureError> {
        if monitor != 0 {
            return Err(CaptureError::no_display(format!(
                "x11 backend only supports the primary monitor (0), got {monitor}"
            )));
        }

        let (width, height) = Self::detect_screen_size()?;
        self.width = width;
        self.height = height;
        self.raw = Vec::with_capacity(width as usize * height as usize * 3);
        self.initialized = true;

        info!("x11 capture initialized: {width}x{height}");
        Ok((width, height))
    }

    fn capture(&mut self) -> Result<Captured<'_>, CaptureError> {
        if !self.initialized {
            return Err(CaptureError::backend("capture called before initialize"));
        }

        let output = Command::new("import")
            .args(["-window", "root", "-silent", "rgb:-"])
            .output()
            .map_err(|e| CaptureError::backend(format!("import failed to run: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::backend(format!(
                "import exited with an error: {}",
                stderr.trim()
            )));
        }

        let expected = self.width as usize * self.height as usize * 3;
        if output.stdout.len() != expected {
            return Err(CaptureError::backend(format!(
                "unexpected capture size: {} bytes, expected {expected}",
                output.stdout.len()
            )));
        }
        self.raw = output.stdout;

        debug!("captured {} raw bytes", self.raw.len());
        let jpeg = self
            .compressor
            .compress(&self.raw, self.width, self.height, 0, PixelFormat::Rgb8)?;
        Ok(Captured::Frame(jpeg))
    }

    fn shutdown(&mut self) {
        self.initialized = false;
        self.raw = Vec::new();
    }
}
