//! GDI screen capture (Windows).
//!
//! Pull-synchronous fallback: BitBlt the primary display into a compatible
//! bitmap, pull the bits out as 24-bit BGR, and compress. Always available
//! on Windows, slower than desktop duplication.

use std::ffi::c_void;

use tracing::info;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC, GetDIBits,
    ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, HBITMAP, HDC,
    SRCCOPY,
};
use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

use crate::capture::{CaptureBackend, Captured};
use crate::codec::{JpegCompressor, PixelFormat};
use crate::config::EncoderConfig;
use crate::error::CaptureError;

pub struct GdiBackend {
    width: u32,
    height: u32,
    /// GetDIBits rows are DWORD-aligned.
    stride: usize,
    compressor: JpegCompressor,
    raw: Vec<u8>,
    initialized: bool,
}

/// Per-capture GDI handles, released in reverse acquisition order.
struct BlitResources {
    screen_dc: HDC,
    mem_dc: HDC,
    bitmap: HBITMAP,
}

impl Drop for BlitResources {
    fn drop(&mut self) {
        unsafe {
            if !self.bitmap.is_invalid() {
                DeleteObject(self.bitmap);
            }
            if !self.mem_dc.is_invalid() {
                DeleteDC(self.mem_dc);
            }
            if !self.screen_dc.is_invalid() {
                ReleaseDC(HWND(0), self.screen_dc);
            }
        }
    }
}

impl GdiBackend {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            width: 0,
            height: 0,
            stride: 0,
            compressor: JpegCompressor::new(config.quality),
            raw: Vec::new(),
            initialized: false,
        }
    }

    fn blit_screen(&mut self) -> Result<(), CaptureError> {
        unsafe {
            let screen_dc = GetDC(HWND(0));
            let mem_dc = CreateCompatibleDC(screen_dc);
            let bitmap =
                CreateCompatibleBitmap(screen_dc, self.width as i32, self.height as i32);
            let resources = BlitResources {
                screen_dc,
                mem_dc,
                bitmap,
            };
            if resources.bitmap.is_invalid() {
                return Err(CaptureError::backend("CreateCompatibleBitmap failed"));
            }

            SelectObject(resources.mem_dc, resources.bitmap);
            BitBlt(
                resources.mem_dc,
                0,
                0,
                self.width as i32,
                self.height as i32,
                resources.screen_dc,
                0,
                0,
                SRCCOPY,
            )
            .map_err(|e| CaptureError::backend(format!("BitBlt failed: {e}")))?;

            let mut bmi = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: self.width as i32,
                    // Negative height = top-down rows.
                    biHeight: -(self.height as i32),
                    biPlanes: 1,
                    biBitCount: 24,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                ..Default::default()
            };

            let copied = GetDIBits(
                resources.mem_dc,
                resources.bitmap,
                0,
                self.height,
                Some(self.raw.as_mut_ptr() as *mut c_void),
                &mut bmi,
                DIB_RGB_COLORS,
            );
            if copied == 0 {
                return Err(CaptureError::backend("GetDIBits failed"));
            }
        }
        Ok(())
    }
}

impl CaptureBackend for GdiBackend {
    fn name(&self) -> &'static str {
        "gdi"
    }

    fn is_available(&self) -> bool {
        // GDI is part of every Windows install.
        true
    }

    fn initialize(&mut self, monitor: u32) -> Result<(u32, u32), CaptureError> {
        if monitor != 0 {
            return Err(CaptureError::no_display(format!(
                "gdi backend only supports the primary monitor (0), got {monitor}"
            )));
        }

        let (width, height) = unsafe {
            (
                GetSystemMetrics(SM_CXSCREEN),
                GetSystemMetrics(SM_CYSCREEN),
            )
        };
        if width <= 0 || height <= 0 {
            return Err(CaptureError::no_display("no display metrics available"));
        }

        self.width = width as u32;
        self.height = height as u32;
        self.stride = (self.width as usize * 3 + 3) & !3;
        self.raw = vec![0u8; self.stride * self.height as usize];
        self.initialized = true;

        info!("gdi capture initialized: {}x{}", self.width, self.height);
        Ok((self.width, self.height))
    }

    fn capture(&mut self) -> Result<Captured<'_>, CaptureError> {
        if !self.initialized {
            return Err(CaptureError::backend("capture called before initialize"));
        }

        self.blit_screen()?;
        let jpeg = self.compressor.compress(
            &self.raw,
            self.width,
            self.height,
            self.stride,
            PixelFormat::Bgr8,
        )?;
        Ok(Captured::Frame(jpeg))
    }

    fn shutdown(&mut self) {
        self.initialized = false;
        self.raw = Vec::new();
    }
}
