//! Error taxonomy for the encoder.
//!
//! Fatal conditions (`ResolveError`, a failed `initialize`) abort the process
//! before the capture loop starts. `CaptureError` is transient: the loop
//! broadcasts it through the slot state and keeps retrying.

use thiserror::Error;

use crate::shm::SlotErrorCode;

/// Backend name lookup failure. "Unknown" and "unavailable" are distinct
/// conditions and are reported separately to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown capture backend: {0}")]
    Unknown(String),
    #[error("capture backend not available on this system: {0}")]
    Unavailable(String),
}

/// A single failed capture or compression attempt.
///
/// Carries the wire-level error code written into the slot header so an
/// external reader can classify the failure.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CaptureError {
    pub code: SlotErrorCode,
    pub message: String,
}

impl CaptureError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self {
            code: SlotErrorCode::BackendFail,
            message: message.into(),
        }
    }

    pub fn no_display(message: impl Into<String>) -> Self {
        Self {
            code: SlotErrorCode::NoDisplay,
            message: message.into(),
        }
    }

    pub fn encode(message: impl Into<String>) -> Self {
        Self {
            code: SlotErrorCode::EncodeFail,
            message: message.into(),
        }
    }
}

/// Frame slot creation or write failure.
#[derive(Debug, Error)]
pub enum SlotError {
    /// The frame exceeds the slot's data capacity. Nothing was copied.
    #[error("frame too large: {len} bytes (capacity {capacity})")]
    Oversize { len: usize, capacity: usize },
    #[error("refusing to publish an empty frame")]
    EmptyFrame,
    #[error("shared memory region too small: {0} bytes")]
    InvalidSize(usize),
    #[error("bad magic in shared memory region: 0x{0:08X}")]
    BadMagic(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Config file overlay failure. Non-fatal: the caller logs it and keeps the
/// defaults.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
