//! Encoder configuration.
//!
//! Resolution order: built-in defaults, then the optional `config.json`
//! overlay, then CLI flags. All fields are immutable once the capture loop
//! starts.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;
use crate::shm::{DEFAULT_DATA_CAPACITY, HEADER_SIZE};

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub monitor: u32,
    /// JPEG quality, 0-100.
    pub quality: u32,
    /// Capture backend name (see `capture::list`).
    pub encoder: String,
    /// Codec name recorded in the slot header for consumers.
    pub codec: String,
    /// Shared memory slot name.
    pub shm_name: String,
    /// Total slot size in bytes, header included.
    pub shm_size: usize,
    pub verbose: bool,
    pub benchmark: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            monitor: 0,
            quality: 75,
            encoder: crate::capture::default_backend().to_string(),
            codec: "jpeg".to_string(),
            shm_name: "distance_video_0".to_string(),
            shm_size: HEADER_SIZE + DEFAULT_DATA_CAPACITY,
            verbose: false,
            benchmark: false,
        }
    }
}

// config.json sections, all optional:
// { "capture": {...}, "encoding": {...}, "shared_memory": {...}, "debug": {...} }

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    capture: CaptureSection,
    #[serde(default)]
    encoding: EncodingSection,
    #[serde(default)]
    shared_memory: ShmSection,
    #[serde(default)]
    debug: DebugSection,
}

#[derive(Debug, Default, Deserialize)]
struct CaptureSection {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    monitor: Option<u32>,
    encoder: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EncodingSection {
    quality: Option<u32>,
    codec: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ShmSection {
    name: Option<String>,
    size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct DebugSection {
    verbose: Option<bool>,
    benchmark: Option<bool>,
}

impl EncoderConfig {
    /// Overlay settings from a JSON config file. Fields missing from the
    /// file keep their current values.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let file: ConfigFile = serde_json::from_str(&text)?;

        if let Some(v) = file.capture.width {
            self.width = v;
        }
        if let Some(v) = file.capture.height {
            self.height = v;
        }
        if let Some(v) = file.capture.fps {
            self.fps = v;
        }
        if let Some(v) = file.capture.monitor {
            self.monitor = v;
        }
        if let Some(v) = file.capture.encoder {
            self.encoder = v;
        }
        if let Some(v) = file.encoding.quality {
            self.quality = v;
        }
        if let Some(v) = file.encoding.codec {
            self.codec = v;
        }
        if let Some(v) = file.shared_memory.name {
            self.shm_name = v;
        }
        if let Some(v) = file.shared_memory.size {
            if v > 0 {
                self.shm_size = v;
            }
        }
        if let Some(v) = file.debug.verbose {
            self.verbose = v;
        }
        if let Some(v) = file.debug.benchmark {
            self.benchmark = v;
        }

        info!("config loaded from {}", path.display());
        Ok(())
    }

    /// Log the resolved settings at startup.
    pub fn log_summary(&self) {
        info!("capture: {}x{} @ {} fps, monitor {}, backend {}", self.width, self.height, self.fps, self.monitor, self.encoder);
        info!("encoding: quality {}, codec {}", self.quality, self.codec);
        info!("shared memory: {} ({} MB)", self.shm_name, self.shm_size / (1024 * 1024));
        info!("debug: verbose={}, benchmark={}", self.verbose, self.benchmark);
    }
}
