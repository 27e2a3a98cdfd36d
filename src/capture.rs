//! Capture backend abstraction and registry.
//!
//! Each backend encapsulates one platform capture strategy plus the embedded
//! JPEG compression step. Only the backends valid for the target platform
//! are compiled in; lookup is by exact name.

use tracing::debug;

use crate::config::EncoderConfig;
use crate::error::{CaptureError, ResolveError};

// Platform-specific implementations
#[cfg(target_os = "linux")]
pub mod x11;
#[cfg(target_os = "windows")]
pub mod gdi;
#[cfg(target_os = "windows")]
pub mod dxgi;
#[cfg(target_os = "macos")]
pub mod macos;

/// Outcome of one capture call. `NoFrameYet` is a normal condition for
/// timeout-based and push-model backends, never an error: the loop sleeps
/// briefly and retries.
#[derive(Debug)]
pub enum Captured<'a> {
    /// A compressed frame, borrowed from the backend's scratch buffer until
    /// the next `capture` call.
    Frame(&'a [u8]),
    NoFrameYet,
}

/// One platform capture strategy.
///
/// Lifecycle: `initialize` once, then any number of `capture` calls from a
/// single thread, then `shutdown` (idempotent, safe after a failed
/// `initialize`). `is_available` is a side-effect-free probe and may be
/// called at any time.
pub trait CaptureBackend {
    fn name(&self) -> &'static str;

    /// Can a minimal capture context be created on this system?
    fn is_available(&self) -> bool;

    /// Open the platform capture session for `monitor` and return the
    /// negotiated dimensions. Backends that only support the primary
    /// monitor must fail explicitly for other indices, not silently
    /// default.
    fn initialize(&mut self, monitor: u32) -> Result<(u32, u32), CaptureError>;

    /// Grab, convert, and compress one frame.
    fn capture(&mut self) -> Result<Captured<'_>, CaptureError>;

    /// Release all platform resources and scratch buffers.
    fn shutdown(&mut self);
}

struct BackendEntry {
    name: &'static str,
    ctor: fn(&EncoderConfig) -> Box<dyn CaptureBackend>,
}

// Constructors only allocate; no platform state is touched until
// `initialize`, so building a backend just to probe availability is cheap.
#[cfg(target_os = "linux")]
fn new_x11(config: &EncoderConfig) -> Box<dyn CaptureBackend> {
    Box::new(x11::X11Backend::new(config))
}

#[cfg(target_os = "windows")]
fn new_gdi(config: &EncoderConfig) -> Box<dyn CaptureBackend> {
    Box::new(gdi::GdiBackend::new(config))
}

#[cfg(target_os = "windows")]
fn new_dxgi(config: &EncoderConfig) -> Box<dyn CaptureBackend> {
    Box::new(dxgi::DxgiBackend::new(config))
}

#[cfg(target_os = "macos")]
fn new_macos(config: &EncoderConfig) -> Box<dyn CaptureBackend> {
    Box::new(macos::MacosBackend::new(config))
}

static BACKENDS: &[BackendEntry] = &[
    #[cfg(target_os = "linux")]
    BackendEntry { name: "x11", ctor: new_x11 },
    #[cfg(target_os = "windows")]
    BackendEntry { name: "gdi", ctor: new_gdi },
    #[cfg(target_os = "windows")]
    BackendEntry { name: "dxgi", ctor: new_dxgi },
    #[cfg(target_os = "macos")]
    BackendEntry { name: "macos", ctor: new_macos },
];

/// Default backend name for the build target.
pub fn default_backend() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "dxgi"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(target_os = "linux")]
    {
        "x11"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        "none"
    }
}

/// Resolve a backend by exact, case-sensitive name. A recognized name whose
/// availability probe fails is reported distinctly from an unknown name.
pub fn resolve(
    name: &str,
    config: &EncoderConfig,
) -> Result<Box<dyn CaptureBackend>, ResolveError> {
    for entry in BACKENDS {
        if entry.name == name {
            let backend = (entry.ctor)(config);
            if !backend.is_available() {
                debug!("backend '{name}' compiled in but not available");
                return Err(ResolveError::Unavailable(name.to_string()));
            }
            return Ok(backend);
        }
    }
    Err(ResolveError::Unknown(name.to_string()))
}

/// Enumerate compiled-in backends with their availability. Lazy, finite,
/// and restartable; probing never initializes a backend.
pub fn list() -> impl Iterator<Item = (&'static str, bool)> {
    let config = EncoderConfig::default();
    BACKENDS
        .iter()
        .map(move |entry| (entry.name, (entry.ctor)(&config).is_available()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_name_is_distinct_from_unavailable() {
        let config = EncoderConfig::default();
        let err = resolve("no-such-backend", &config).err().unwrap();
        assert_eq!(err, ResolveError::Unknown("no-such-backend".to_string()));
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let config = EncoderConfig::default();
        let name = default_backend().to_uppercase();
        if name != default_backend() {
            assert!(matches!(
                resolve(&name, &config),
                Err(ResolveError::Unknown(_))
            ));
        }
    }

    #[test]
    fn list_is_restartable_and_stable() {
        let first: Vec<_> = list().collect();
        let second: Vec<_> = list().collect();
        assert_eq!(first.len(), second.len());
        for ((a, _), (b, _)) in first.iter().zip(second.iter()) {
            assert_eq!(a, b);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_build_compiles_in_the_x11_backend() {
        assert!(list().any(|(name, _)| name == "x11"));
        assert_eq!(default_backend(), "x11");
    }
}
