//! CoreGraphics screen capture (macOS).
//!
//! Push-model: a worker thread grabs and compresses display images at the
//! configured rate and pushes them into a bounded channel. `capture` drains
//! the channel and reports `NoFrameYet` when it is empty, so the pacer keeps
//! sole control of publishing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use core_graphics::display::CGDisplay;
use tracing::{debug, info, warn};

use crate::capture::{CaptureBackend, Captured};
use crate::codec::{JpegCompressor, PixelFormat};
use crate::config::EncoderConfig;
use crate::error::CaptureError;

pub struct MacosBackend {
    quality: u32,
    fps: u32,
    width: u32,
    height: u32,
    frames: Option<Receiver<Vec<u8>>>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    /// Most recently drained frame, handed out by reference.
    current: Vec<u8>,
}

impl MacosBackend {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            quality: config.quality,
            fps: config.fps.max(1),
            width: 0,
            height: 0,
            frames: None,
            worker: None,
            stop: Arc::new(AtomicBool::new(false)),
            current: Vec::new(),
        }
    }

    fn stop_worker(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.frames = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("capture worker panicked during shutdown");
            }
        }
    }
}

/// Worker loop: capture, compress, push. A full channel means the consumer
/// is behind; the frame is dropped rather than blocking the grab cadence.
fn capture_worker(
    display_id: u32,
    quality: u32,
    period: Duration,
    stop: Arc<AtomicBool>,
    tx: std::sync::mpsc::SyncSender<Vec<u8>>,
) {
    let display = CGDisplay::new(display_id);
    let mut compressor = JpegCompressor::new(quality);

    while !stop.load(Ordering::SeqCst) {
        if let Some(image) = display.image() {
            let width = image.width() as u32;
            let height = image.height() as u32;
            let stride = image.bytes_per_row();
            let data = image.data();
            match compressor.compress(data.bytes(), width, height, stride, PixelFormat::Bgra8) {
                Ok(jpeg) => {
                    if let Err(TrySendError::Full(_)) = tx.try_send(jpeg.to_vec()) {
                        debug!("consumer behind, dropping a captured frame");
                    }
                }
                Err(e) => warn!("frame compression failed in worker: {e}"),
            }
        }
        std::thread::sleep(period);
    }
}

impl CaptureBackend for MacosBackend {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn is_available(&self) -> bool {
        CGDisplay::active_displays()
            .map(|displays| !displays.is_empty())
            .unwrap_or(false)
    }

    fn initialize(&mut self, monitor: u32) -> Result<(u32, u32), CaptureError> {
        let displays = CGDisplay::active_displays()
            .map_err(|e| CaptureError::no_display(format!("display enumeration failed: {e}")))?;
        let display_id = *displays.get(monitor as usize).ok_or_else(|| {
            CaptureError::no_display(format!(
                "monitor {monitor} does not exist ({} active)",
                displays.len()
            ))
        })?;

        let display = CGDisplay::new(display_id);
        self.width = display.pixels_wide() as u32;
        self.height = display.pixels_high() as u32;
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::no_display("display reports zero dimensions"));
        }

        let (tx, rx) = sync_channel(1);
        self.stop = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&self.stop);
        let quality = self.quality;
        let period = Duration::from_secs_f64(1.0 / self.fps as f64);
        self.worker = Some(std::thread::spawn(move || {
            capture_worker(display_id, quality, period, stop, tx);
        }));
        self.frames = Some(rx);

        info!(
            "macos capture initialized: {}x{}, monitor {monitor}",
            self.width, self.height
        );
        Ok((self.width, self.height))
    }

    fn capture(&mut self) -> Result<Captured<'_>, CaptureError> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| CaptureError::backend("capture called before initialize"))?;

        match frames.try_recv() {
            Ok(jpeg) => {
                self.current = jpeg;
                Ok(Captured::Frame(&self.current))
            }
            Err(TryRecvError::Empty) => Ok(Captured::NoFrameYet),
            Err(TryRecvError::Disconnected) => {
                Err(CaptureError::backend("capture worker exited unexpectedly"))
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop_worker();
        self.current = Vec::new();
    }
}

impl Drop for MacosBackend {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
