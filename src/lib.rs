/*!
 * Distance Encoder Library
 *
 * Core modules for paced screen capture, JPEG compression, and single-slot
 * shared memory publishing.
 */

pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod pacer;
pub mod shm;

// Re-export commonly used types
pub use capture::{CaptureBackend, Captured};
pub use config::EncoderConfig;
pub use pacer::{PacerConfig, PacerReport, StopFlag};
pub use shm::{FrameSlot, SlotReader};
