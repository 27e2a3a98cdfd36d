//! Capture loop / pacer.
//!
//! Drives one backend at the target frame rate on a single thread. Transient
//! capture failures are broadcast through the slot state and retried after a
//! backoff, indefinitely; only an external stop ends the loop. The stop flag
//! is checked once per iteration boundary, never mid-capture.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::capture::{CaptureBackend, Captured};
use crate::config::EncoderConfig;
use crate::error::SlotError;
use crate::shm::{FrameMeta, FrameSlot, SlotErrorCode, STATE_ERROR, STATE_RUNNING};

/// Sleep between retries when a backend reports no new frame yet.
pub const IDLE_SLEEP: Duration = Duration::from_millis(10);
/// Sleep after a failed capture, longer than the idle sleep.
pub const ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// Wall-clock interval between statistics emissions.
pub const STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Cooperative cancellation token shared with the signal handler.
#[derive(Clone, Debug, Default)]
pub struct StopFlag {
    inner: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// Loop timing parameters. Tests shrink the stats interval; production
/// values come from `from_config`.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    pub frame_period: Duration,
    pub idle_sleep: Duration,
    pub error_backoff: Duration,
    pub stats_interval: Duration,
    pub benchmark: bool,
}

impl PacerConfig {
    pub fn from_config(config: &EncoderConfig) -> Self {
        Self {
            frame_period: Duration::from_millis(1000 / u64::from(config.fps.max(1))),
            idle_sleep: IDLE_SLEEP,
            error_backoff: ERROR_BACKOFF,
            stats_interval: STATS_INTERVAL,
            benchmark: config.benchmark,
        }
    }
}

/// Metadata stamped into every published frame for this run.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u32,
    pub monitor: u32,
}

/// Counters accumulated over one loop run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacerReport {
    pub frames_published: u64,
    pub idle_waits: u64,
    pub errors: u64,
    pub oversize_drops: u64,
    pub stats_emissions: u64,
    pub overruns: u64,
}

/// Run the capture loop until `stop` is raised. On exit the slot state is
/// cleared (state 0) before the backend is shut down.
pub fn run(
    backend: &mut dyn CaptureBackend,
    slot: &mut FrameSlot,
    session: SessionInfo,
    pacer: &PacerConfig,
    stop: &StopFlag,
) -> PacerReport {
    let start = Instant::now();
    let mut report = PacerReport::default();
    let mut interval_frames: u64 = 0;
    let mut last_frame_len: usize = 0;
    let mut last_stats = Instant::now();
    let mut in_error = false;

    slot.set_state(STATE_RUNNING, SlotErrorCode::None);
    info!("capture loop started ({} fps target)", session.fps);

    while !stop.is_stopped() {
        let iteration_start = Instant::now();

        match backend.capture() {
            Err(err) => {
                warn!("capture failed: {err}");
                slot.set_state(STATE_ERROR, err.code);
                in_error = true;
                report.errors += 1;
                std::thread::sleep(pacer.error_backoff);
                continue;
            }
            Ok(Captured::NoFrameYet) => {
                // Timeout or push-model backend with nothing queued; not an
                // error, just retry after a short wait.
                report.idle_waits += 1;
                std::thread::sleep(pacer.idle_sleep);
                continue;
            }
            Ok(Captured::Frame(bytes)) => {
                let meta = FrameMeta {
                    width: session.width,
                    height: session.height,
                    fps: session.fps,
                    quality: session.quality,
                    timestamp: start.elapsed().as_secs_f32(),
                    monitor: session.monitor,
                };
                match slot.write_frame(bytes, &meta) {
                    Ok(()) => {
                        if in_error {
                            slot.set_state(STATE_RUNNING, SlotErrorCode::None);
                            in_error = false;
                        }
                        report.frames_published += 1;
                        interval_frames += 1;
                        last_frame_len = bytes.len();
                    }
                    Err(err @ SlotError::Oversize { .. }) => {
                        warn!("frame dropped: {err}");
                        report.oversize_drops += 1;
                    }
                    Err(err) => {
                        warn!("slot write failed: {err}");
                    }
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(last_stats) >= pacer.stats_interval {
            info!(
                "{} frames in the last {:.1?}, last frame {} bytes",
                interval_frames,
                now.duration_since(last_stats),
                last_frame_len
            );
            interval_frames = 0;
            last_stats = now;
            report.stats_emissions += 1;
        }

        let elapsed = iteration_start.elapsed();
        if elapsed < pacer.frame_period {
            std::thread::sleep(pacer.frame_period - elapsed);
        } else if pacer.benchmark {
            info!("frame took {:.1?} (target {:.1?})", elapsed, pacer.frame_period);
            report.overruns += 1;
        }
    }

    info!("capture loop stopping");
    slot.set_state(0, SlotErrorCode::None);
    backend.shutdown();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;
    use crate::shm::{slot_path, SlotReader, HEADER_SIZE};

    #[derive(Clone, Copy)]
    enum Step {
        Frame,
        Idle,
        Fail,
    }

    /// Scripted backend: plays its steps in order, then repeats the last one.
    /// Optionally raises the stop flag after N published frames.
    struct StubBackend {
        steps: Vec<Step>,
        pos: usize,
        payload: Vec<u8>,
        frames: u64,
        stop_after_frames: Option<(u64, StopFlag)>,
        shutdowns: u32,
        initialized: bool,
    }

    impl StubBackend {
        fn new(steps: Vec<Step>, payload_len: usize) -> Self {
            Self {
                steps,
                pos: 0,
                payload: vec![0x5A; payload_len],
                frames: 0,
                stop_after_frames: None,
                shutdowns: 0,
                initialized: false,
            }
        }

        fn stop_after(mut self, frames: u64, flag: StopFlag) -> Self {
            self.stop_after_frames = Some((frames, flag));
            self
        }
    }

    impl CaptureBackend for StubBackend {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn initialize(&mut self, _monitor: u32) -> Result<(u32, u32), CaptureError> {
            self.initialized = true;
            Ok((64, 64))
        }

        fn capture(&mut self) -> Result<Captured<'_>, CaptureError> {
            assert!(self.initialized, "capture before initialize");
            let step = self.steps[self.pos.min(self.steps.len() - 1)];
            self.pos += 1;
            match step {
                Step::Idle => Ok(Captured::NoFrameYet),
                Step::Fail => Err(CaptureError::backend("stub failure")),
                Step::Frame => {
                    self.frames += 1;
                    if let Some((limit, flag)) = &self.stop_after_frames {
                        if self.frames >= *limit {
                            flag.stop();
                        }
                    }
                    Ok(Captured::Frame(&self.payload))
                }
            }
        }

        fn shutdown(&mut self) {
            self.shutdowns += 1;
            self.initialized = false;
        }
    }

    fn test_slot(tag: &str) -> (FrameSlot, String) {
        use std::sync::atomic::AtomicU32;
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "distance-pacer-{}-{}-{}",
            std::process::id(),
            tag,
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        let slot = FrameSlot::create(&name, HEADER_SIZE + 64 * 1024).unwrap();
        (slot, name)
    }

    fn fast_pacer(fps: u32) -> PacerConfig {
        PacerConfig {
            frame_period: Duration::from_millis(1000 / u64::from(fps)),
            idle_sleep: Duration::from_millis(1),
            error_backoff: Duration::from_millis(5),
            stats_interval: Duration::from_millis(400),
            benchmark: false,
        }
    }

    fn session() -> SessionInfo {
        SessionInfo {
            width: 64,
            height: 64,
            fps: 10,
            quality: 75,
            monitor: 0,
        }
    }

    #[test]
    fn paces_a_steady_backend_at_the_target_rate() {
        let (mut slot, name) = test_slot("steady");
        let mut backend = StubBackend::new(vec![Step::Frame], 1000);
        let pacer = PacerConfig {
            stats_interval: Duration::from_millis(400),
            ..fast_pacer(10)
        };

        let stop = StopFlag::new();
        let deadline = stop.clone();
        let timer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(1));
            deadline.stop();
        });

        backend.initialize(0).unwrap();
        let report = run(&mut backend, &mut slot, session(), &pacer, &stop);
        timer.join().unwrap();

        // 10 fps over one second, with scheduling slack.
        assert!(
            (8..=11).contains(&report.frames_published),
            "published {} frames",
            report.frames_published
        );
        assert!(report.stats_emissions >= 2, "stats: {}", report.stats_emissions);
        assert_eq!(report.errors, 0);
        assert_eq!(backend.shutdowns, 1);

        // The last frame stays readable after the loop cleared the state.
        let reader = SlotReader::open(&name).unwrap();
        assert_eq!(reader.state().0, 0);
        let frame = reader.read_frame().expect("last frame readable");
        assert_eq!(frame.data.len(), 1000);
        assert_eq!(u64::from(frame.sequence), report.frames_published);
        std::fs::remove_file(slot_path(&name)).ok();
    }

    #[test]
    fn no_frame_yet_is_not_an_error_and_costs_one_idle_wait_each() {
        let (mut slot, name) = test_slot("idle");
        let stop = StopFlag::new();
        let mut backend =
            StubBackend::new(vec![Step::Idle, Step::Idle, Step::Idle, Step::Frame], 500)
                .stop_after(1, stop.clone());

        backend.initialize(0).unwrap();
        let report = run(&mut backend, &mut slot, session(), &fast_pacer(100), &stop);

        assert_eq!(report.idle_waits, 3);
        assert_eq!(report.frames_published, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(slot.sequence(), 1);
        std::fs::remove_file(slot_path(&name)).ok();
    }

    #[test]
    fn transient_failure_backs_off_and_recovers() {
        let (mut slot, name) = test_slot("recover");
        let stop = StopFlag::new();
        let mut backend = StubBackend::new(vec![Step::Fail, Step::Frame], 500)
            .stop_after(2, stop.clone());

        backend.initialize(0).unwrap();
        let report = run(&mut backend, &mut slot, session(), &fast_pacer(100), &stop);

        assert_eq!(report.errors, 1);
        assert_eq!(report.frames_published, 2);
        assert_eq!(slot.sequence(), 2);
        // The loop cleared the error once a frame went through, then cleared
        // the state entirely on stop.
        let reader = SlotReader::open(&name).unwrap();
        assert_eq!(reader.state(), (0, SlotErrorCode::None));
        std::fs::remove_file(slot_path(&name)).ok();
    }

    #[test]
    fn oversize_frames_are_dropped_without_stopping_the_loop() {
        let (mut slot, name) = test_slot("oversize");
        let stop = StopFlag::new();
        // Payload larger than the 64 KiB test slot.
        let mut backend =
            StubBackend::new(vec![Step::Frame], 128 * 1024).stop_after(3, stop.clone());

        backend.initialize(0).unwrap();
        let report = run(&mut backend, &mut slot, session(), &fast_pacer(100), &stop);

        assert_eq!(report.oversize_drops, 3);
        assert_eq!(report.frames_published, 0);
        assert_eq!(slot.sequence(), 0);
        std::fs::remove_file(slot_path(&name)).ok();
    }

    #[test]
    fn benchmark_mode_reports_overruns_instead_of_sleeping() {
        let (mut slot, name) = test_slot("bench");
        let stop = StopFlag::new();
        let mut backend = StubBackend::new(vec![Step::Frame], 100).stop_after(5, stop.clone());
        let pacer = PacerConfig {
            frame_period: Duration::ZERO,
            benchmark: true,
            ..fast_pacer(100)
        };

        backend.initialize(0).unwrap();
        let report = run(&mut backend, &mut slot, session(), &pacer, &stop);

        assert_eq!(report.frames_published, 5);
        assert_eq!(report.overruns, 5);
        std::fs::remove_file(slot_path(&name)).ok();
    }
}
