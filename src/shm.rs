//! Shared-memory frame slot.
//!
//! A fixed-size region holding one compressed frame: a 256-byte header
//! followed by a fixed-capacity data area. The producer overwrites the slot
//! in place and publishes each frame by incrementing the sequence counter
//! last, with release semantics; a reader polls the sequence with acquire
//! semantics and copies the frame out. The mapping is a named file
//! (`/dev/shm` on Linux) so it can outlive the producer process.
//!
//! Header layout (little-endian, byte offsets):
//!
//! ```text
//! [0:4]   magic        0xDEADBEEF
//! [4:8]   sequence     incremented by exactly 1 per published frame
//! [8:12]  frame_size   valid bytes in the data area
//! [12:16] width        [16:20] height   [20:24] fps   [24:28] quality
//! [28:32] timestamp    f32 seconds since producer start
//! [32:36] monitor
//! [36:40] state        RUNNING=0x01 | PAUSED=0x02 | ERROR=0x04
//! [40:41] error_code   NONE=0x00 NO_DISPLAY=0x01 BACKEND_FAIL=0x02 ENCODE_FAIL=0x03
//! [41:256] reserved
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::{debug, info};

use crate::error::SlotError;

pub const MAGIC: u32 = 0xDEAD_BEEF;
pub const HEADER_SIZE: usize = 256;
/// Default data area capacity (10 MiB).
pub const DEFAULT_DATA_CAPACITY: usize = 10 * 1024 * 1024;

pub const STATE_RUNNING: u32 = 0x01;
pub const STATE_PAUSED: u32 = 0x02;
pub const STATE_ERROR: u32 = 0x04;

const OFF_MAGIC: usize = 0;
const OFF_SEQUENCE: usize = 4;
const OFF_FRAME_SIZE: usize = 8;
const OFF_WIDTH: usize = 12;
const OFF_HEIGHT: usize = 16;
const OFF_FPS: usize = 20;
const OFF_QUALITY: usize = 24;
const OFF_TIMESTAMP: usize = 28;
const OFF_MONITOR: usize = 32;
const OFF_STATE: usize = 36;
const OFF_ERROR_CODE: usize = 40;

/// Wire-level error code in the slot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotErrorCode {
    None = 0x00,
    NoDisplay = 0x01,
    BackendFail = 0x02,
    EncodeFail = 0x03,
}

impl SlotErrorCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::NoDisplay,
            0x02 => Self::BackendFail,
            0x03 => Self::EncodeFail,
            _ => Self::None,
        }
    }
}

/// Metadata written alongside every frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u32,
    /// Seconds since producer start.
    pub timestamp: f32,
    pub monitor: u32,
}

/// Filesystem path backing a named slot.
pub fn slot_path(name: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm").join(name)
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::env::temp_dir().join(name)
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_f32(buf: &[u8], off: usize) -> f32 {
    f32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Producer side of the slot. Single writer; readers must treat the region
/// as read-only.
pub struct FrameSlot {
    map: MmapMut,
    capacity: usize,
    sequence: u32,
    path: PathBuf,
}

impl FrameSlot {
    /// Create (or recreate) the named slot. `size` is the total region size
    /// including the header. Writes the magic once and marks the slot
    /// RUNNING with no error.
    pub fn create(name: &str, size: usize) -> Result<Self, SlotError> {
        if size <= HEADER_SIZE {
            return Err(SlotError::InvalidSize(size));
        }

        let path = slot_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;
        let map = unsafe { MmapOptions::new().map_mut(&file)? };

        let mut slot = Self {
            map,
            capacity: size - HEADER_SIZE,
            sequence: 0,
            path,
        };
        slot.put_u32(OFF_MAGIC, MAGIC);
        slot.put_u32(OFF_STATE, STATE_RUNNING);
        slot.map[OFF_ERROR_CODE] = SlotErrorCode::None as u8;

        info!("slot created: {} ({} bytes)", slot.path.display(), size);
        Ok(slot)
    }

    /// Publish one frame: reject oversize before any byte is copied, copy
    /// the data, write the metadata, then increment the sequence last with
    /// a release store. The sequence is the only new-frame signal readers
    /// may rely on.
    pub fn write_frame(&mut self, frame: &[u8], meta: &FrameMeta) -> Result<(), SlotError> {
        if frame.is_empty() {
            return Err(SlotError::EmptyFrame);
        }
        if frame.len() > self.capacity {
            return Err(SlotError::Oversize {
                len: frame.len(),
                capacity: self.capacity,
            });
        }

        self.map[HEADER_SIZE..HEADER_SIZE + frame.len()].copy_from_slice(frame);

        self.put_u32(OFF_FRAME_SIZE, frame.len() as u32);
        self.put_u32(OFF_WIDTH, meta.width);
        self.put_u32(OFF_HEIGHT, meta.height);
        self.put_u32(OFF_FPS, meta.fps);
        self.put_u32(OFF_QUALITY, meta.quality);
        self.put_f32(OFF_TIMESTAMP, meta.timestamp);
        self.put_u32(OFF_MONITOR, meta.monitor);

        self.sequence += 1;
        self.sequence_cell().store(self.sequence, Ordering::Release);
        Ok(())
    }

    /// Update producer health independently of the sequence counter. A state
    /// change never requires a new frame.
    pub fn set_state(&mut self, state: u32, error_code: SlotErrorCode) {
        self.put_u32(OFF_STATE, state);
        self.map[OFF_ERROR_CODE] = error_code as u8;
        debug!("slot state: 0x{state:02x} (error {error_code:?})");
    }

    /// Sequence of the most recently published frame.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Data area capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn put_u32(&mut self, off: usize, value: u32) {
        self.map[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_f32(&mut self, off: usize, value: f32) {
        self.map[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Sequence field viewed as an atomic. The mapping is page-aligned, so
    /// offset 4 satisfies the u32 alignment requirement.
    fn sequence_cell(&self) -> &AtomicU32 {
        unsafe { &*(self.map.as_ptr().add(OFF_SEQUENCE) as *const AtomicU32) }
    }
}

/// A frame copied out of the slot by a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedFrame {
    pub sequence: u32,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u32,
    pub timestamp: f32,
    pub monitor: u32,
}

/// Consumer side of the slot. Read-only mapping; used by the tests and
/// available to external pollers.
pub struct SlotReader {
    map: Mmap,
    capacity: usize,
}

impl SlotReader {
    /// Open an existing named slot and validate its magic.
    pub fn open(name: &str) -> Result<Self, SlotError> {
        let path = slot_path(name);
        let file = OpenOptions::new().read(true).open(&path)?;
        let map = unsafe { MmapOptions::new().map(&file)? };
        if map.len() <= HEADER_SIZE {
            return Err(SlotError::InvalidSize(map.len()));
        }
        let magic = read_u32(&map, OFF_MAGIC);
        if magic != MAGIC {
            return Err(SlotError::BadMagic(magic));
        }
        let capacity = map.len() - HEADER_SIZE;
        Ok(Self { map, capacity })
    }

    /// Current sequence counter (acquire load).
    pub fn sequence(&self) -> u32 {
        self.sequence_cell().load(Ordering::Acquire)
    }

    fn sequence_cell(&self) -> &AtomicU32 {
        unsafe { &*(self.map.as_ptr().add(OFF_SEQUENCE) as *const AtomicU32) }
    }

    /// Producer state bitmask and error code.
    pub fn state(&self) -> (u32, SlotErrorCode) {
        (
            read_u32(&self.map, OFF_STATE),
            SlotErrorCode::from_u8(self.map[OFF_ERROR_CODE]),
        )
    }

    /// Copy out the latest frame with a generation check: read the sequence,
    /// copy metadata and data, then re-read the sequence and retry if a
    /// concurrent write landed in between. Returns `None` when no frame has
    /// been published yet or the slot keeps changing under us.
    pub fn read_frame(&self) -> Option<PublishedFrame> {
        const MAX_RETRIES: usize = 8;

        for _ in 0..MAX_RETRIES {
            let before = self.sequence();
            if before == 0 {
                return None;
            }

            let len = read_u32(&self.map, OFF_FRAME_SIZE) as usize;
            if len == 0 || len > self.capacity {
                // Torn metadata; retry.
                continue;
            }

            let frame = PublishedFrame {
                sequence: before,
                data: self.map[HEADER_SIZE..HEADER_SIZE + len].to_vec(),
                width: read_u32(&self.map, OFF_WIDTH),
                height: read_u32(&self.map, OFF_HEIGHT),
                fps: read_u32(&self.map, OFF_FPS),
                quality: read_u32(&self.map, OFF_QUALITY),
                timestamp: read_f32(&self.map, OFF_TIMESTAMP),
                monitor: read_u32(&self.map, OFF_MONITOR),
            };

            if self.sequence() == before {
                return Some(frame);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;

    static NEXT_SLOT: Counter = Counter::new(0);

    fn unique_name(tag: &str) -> String {
        let n = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
        format!("distance-test-{}-{}-{}", std::process::id(), tag, n)
    }

    fn meta() -> FrameMeta {
        FrameMeta {
            width: 640,
            height: 480,
            fps: 30,
            quality: 75,
            timestamp: 1.5,
            monitor: 0,
        }
    }

    struct Cleanup(String);
    impl Drop for Cleanup {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(slot_path(&self.0));
        }
    }

    #[test]
    fn rejects_undersized_region() {
        let name = unique_name("tiny");
        let _guard = Cleanup(name.clone());
        assert!(matches!(
            FrameSlot::create(&name, HEADER_SIZE),
            Err(SlotError::InvalidSize(_))
        ));
    }

    #[test]
    fn write_then_read_roundtrip() {
        let name = unique_name("roundtrip");
        let _guard = Cleanup(name.clone());
        let mut slot = FrameSlot::create(&name, HEADER_SIZE + 4096).unwrap();

        let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        slot.write_frame(&payload, &meta()).unwrap();

        let reader = SlotReader::open(&name).unwrap();
        assert_eq!(reader.sequence(), 1);

        let frame = reader.read_frame().expect("frame published");
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.data, payload);
        assert_eq!(frame.width, 640);
        assert_eq!(frame.height, 480);
        assert_eq!(frame.fps, 30);
        assert_eq!(frame.quality, 75);
        assert_eq!(frame.monitor, 0);
        assert!((frame.timestamp - 1.5).abs() < f32::EPSILON);
    }

    #[test]
    fn sequence_increments_by_exactly_one() {
        let name = unique_name("seq");
        let _guard = Cleanup(name.clone());
        let mut slot = FrameSlot::create(&name, HEADER_SIZE + 4096).unwrap();

        for expected in 1..=5u32 {
            slot.write_frame(&[0xAB; 16], &meta()).unwrap();
            assert_eq!(slot.sequence(), expected);
        }

        let reader = SlotReader::open(&name).unwrap();
        assert_eq!(reader.sequence(), 5);
    }

    #[test]
    fn oversize_write_is_rejected_and_previous_frame_survives() {
        let name = unique_name("oversize");
        let _guard = Cleanup(name.clone());
        let mut slot = FrameSlot::create(&name, HEADER_SIZE + 128).unwrap();

        let first = vec![0x42u8; 100];
        slot.write_frame(&first, &meta()).unwrap();

        let err = slot.write_frame(&[0u8; 4096], &meta()).unwrap_err();
        assert!(matches!(err, SlotError::Oversize { len: 4096, capacity: 128 }));
        assert_eq!(slot.sequence(), 1);

        let reader = SlotReader::open(&name).unwrap();
        let frame = reader.read_frame().expect("previous frame readable");
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.data, first);
    }

    #[test]
    fn empty_frame_is_rejected() {
        let name = unique_name("empty");
        let _guard = Cleanup(name.clone());
        let mut slot = FrameSlot::create(&name, HEADER_SIZE + 128).unwrap();
        assert!(matches!(
            slot.write_frame(&[], &meta()),
            Err(SlotError::EmptyFrame)
        ));
        assert_eq!(slot.sequence(), 0);
    }

    #[test]
    fn state_changes_are_observable_without_a_new_sequence() {
        let name = unique_name("state");
        let _guard = Cleanup(name.clone());
        let mut slot = FrameSlot::create(&name, HEADER_SIZE + 128).unwrap();
        let reader = SlotReader::open(&name).unwrap();

        assert_eq!(reader.state(), (STATE_RUNNING, SlotErrorCode::None));

        slot.set_state(STATE_ERROR, SlotErrorCode::BackendFail);
        assert_eq!(reader.state(), (STATE_ERROR, SlotErrorCode::BackendFail));
        assert_eq!(reader.sequence(), 0);

        slot.set_state(STATE_RUNNING, SlotErrorCode::None);
        assert_eq!(reader.state(), (STATE_RUNNING, SlotErrorCode::None));
        assert_eq!(reader.sequence(), 0);
    }

    #[test]
    fn reader_rejects_bad_magic() {
        let name = unique_name("magic");
        let _guard = Cleanup(name.clone());
        std::fs::write(slot_path(&name), vec![0u8; HEADER_SIZE + 64]).unwrap();
        assert!(matches!(
            SlotReader::open(&name),
            Err(SlotError::BadMagic(0))
        ));
    }

    #[test]
    fn reader_before_first_frame_sees_nothing() {
        let name = unique_name("fresh");
        let _guard = Cleanup(name.clone());
        let _slot = FrameSlot::create(&name, HEADER_SIZE + 128).unwrap();
        let reader = SlotReader::open(&name).unwrap();
        assert_eq!(reader.sequence(), 0);
        assert!(reader.read_frame().is_none());
    }
}
