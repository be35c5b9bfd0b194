use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{FrameSource, SourceStats};
use crate::error::CameraError;
use crate::frame::Frame;

/// One scripted read result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceStep {
    Frame,
    Timeout,
    DeviceError,
}

/// Shared counters for observing a `ScriptedSource` after it has been moved into an
/// engine.
#[derive(Debug, Default)]
pub struct SourceTally {
    pub opens: AtomicU64,
    pub closes: AtomicU64,
    pub reads: AtomicU64,
    fail_open: AtomicBool,
}

impl SourceTally {
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Make subsequent `open` calls fail with a device error.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

/// Source that replays a fixed sequence of frames and failures.
///
/// Frames are solid grey at the configured size; pair with `ScriptedBackend` to control
/// what the detector "sees". When the script runs out the source keeps producing
/// frames, or fails every read if built with `then_fail`.
pub struct ScriptedSource {
    width: u32,
    height: u32,
    steps: VecDeque<SourceStep>,
    after: SourceStep,
    interval: Duration,
    timeline: Option<(DateTime<Local>, chrono::Duration)>,
    open: bool,
    sequence: u64,
    stats: SourceStats,
    tally: Arc<SourceTally>,
}

impl ScriptedSource {
    pub fn new(width: u32, height: u32, steps: Vec<SourceStep>) -> Self {
        Self {
            width,
            height,
            steps: steps.into(),
            after: SourceStep::Frame,
            interval: Duration::ZERO,
            timeline: None,
            open: false,
            sequence: 0,
            stats: SourceStats::default(),
            tally: Arc::new(SourceTally::default()),
        }
    }

    /// Endless stream of frames.
    pub fn frames(width: u32, height: u32) -> Self {
        Self::new(width, height, Vec::new())
    }

    /// Fail every read once the script is exhausted.
    pub fn then_fail(mut self) -> Self {
        self.after = SourceStep::DeviceError;
        self
    }

    /// Sleep this long in every read, like a camera's frame interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stamp frame `n` with `start + n * step` instead of the wall clock.
    pub fn with_timeline(mut self, start: DateTime<Local>, step: chrono::Duration) -> Self {
        self.timeline = Some((start, step));
        self
    }

    fn timestamp(&self) -> DateTime<Local> {
        match self.timeline {
            Some((start, step)) => start + step * self.sequence as i32,
            None => Local::now(),
        }
    }

    pub fn tally(&self) -> Arc<SourceTally> {
        self.tally.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        format!("scripted://{}x{}", self.width, self.height)
    }

    fn open(&mut self) -> Result<(), CameraError> {
        if self.tally.fail_open.load(Ordering::SeqCst) {
            return Err(CameraError::Device("scripted open failure".into()));
        }
        self.tally.opens.fetch_add(1, Ordering::SeqCst);
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, CameraError> {
        self.tally.reads.fetch_add(1, Ordering::SeqCst);
        if !self.open {
            self.stats.read_failures += 1;
            return Err(CameraError::Device("scripted source is not open".into()));
        }
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        let step = self.steps.pop_front().unwrap_or(self.after);
        match step {
            SourceStep::Frame => {
                self.sequence += 1;
                self.stats.frames_captured += 1;
                Ok(Frame::filled(
                    self.width,
                    self.height,
                    [128, 128, 128],
                    self.timestamp(),
                    self.sequence,
                ))
            }
            SourceStep::Timeout => {
                self.stats.read_failures += 1;
                Err(CameraError::CaptureTimeout(self.interval))
            }
            SourceStep::DeviceError => {
                self.stats.read_failures += 1;
                Err(CameraError::Device("scripted device failure".into()))
            }
        }
    }

    fn close(&mut self) {
        if self.open {
            self.tally.closes.fetch_add(1, Ordering::SeqCst);
        }
        self.open = false;
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}
