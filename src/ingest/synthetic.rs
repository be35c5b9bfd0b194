//! Synthetic sky source.
//!
//! Renders a vertical sky gradient and, for `pass_frames` out of every
//! `pass_frames + gap_frames` frames, a dark quadcopter silhouette crossing the view
//! from left to right. Output depends only on the configuration and the sequence
//! number, so runs are reproducible.

use chrono::Local;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::error::CameraError;
use crate::frame::Frame;

const SKY_TOP: [f32; 3] = [150.0, 190.0, 235.0];
const SKY_BOTTOM: [f32; 3] = [210.0, 225.0, 245.0];
const SILHOUETTE: [u8; 3] = [28, 30, 36];

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Frames per second the source paces itself to. 0 disables pacing.
    pub target_fps: u32,
    /// Frames the drone is in view per pass.
    pub pass_frames: u64,
    /// Empty-sky frames between passes.
    pub gap_frames: u64,
    /// Body width in pixels.
    pub drone_size: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://sky".to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
            pass_frames: 90,
            gap_frames: 60,
            drone_size: 24,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    background: Vec<u8>,
    open: bool,
    sequence: u64,
    next_due: Option<Instant>,
    stats: SourceStats,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let background = render_sky(config.width, config.height);
        Self {
            config,
            background,
            open: false,
            sequence: 0,
            next_due: None,
            stats: SourceStats::default(),
        }
    }

    /// Centre of the drone on frame `sequence`, if it is in view.
    pub fn drone_center(&self, sequence: u64) -> Option<(f32, f32)> {
        let cycle = self.config.pass_frames + self.config.gap_frames;
        if cycle == 0 || self.config.pass_frames == 0 {
            return None;
        }
        let phase = sequence.saturating_sub(1) % cycle;
        if phase >= self.config.pass_frames {
            return None;
        }
        let progress = (phase as f32 + 0.5) / self.config.pass_frames as f32;
        let margin = self.config.drone_size as f32;
        let cx = margin + progress * (self.config.width as f32 - 2.0 * margin);
        // gentle bob so consecutive boxes are not identical
        let cy = self.config.height as f32 / 3.0 + ((phase % 16) as f32 - 8.0).abs();
        Some((cx, cy))
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let mut pixels = self.background.clone();
        if let Some((cx, cy)) = self.drone_center(sequence) {
            let s = self.config.drone_size as f32;
            // body
            self.fill(&mut pixels, cx - s / 2.0, cy - s * 0.3, cx + s / 2.0, cy + s * 0.3);
            // rotor arms
            self.fill(&mut pixels, cx - s, cy - s * 0.3 - 3.0, cx + s, cy - s * 0.3 + 1.0);
        }
        pixels
    }

    fn fill(&self, pixels: &mut [u8], x1: f32, y1: f32, x2: f32, y2: f32) {
        let (w, h) = (self.config.width as i64, self.config.height as i64);
        let x1 = (x1.round() as i64).clamp(0, w);
        let x2 = (x2.round() as i64).clamp(0, w);
        let y1 = (y1.round() as i64).clamp(0, h);
        let y2 = (y2.round() as i64).clamp(0, h);
        for y in y1..y2 {
            for x in x1..x2 {
                let idx = ((y * w + x) * 3) as usize;
                pixels[idx..idx + 3].copy_from_slice(&SILHOUETTE);
            }
        }
    }

    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_secs(1) / self.config.target_fps;
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + interval);
    }
}

fn render_sky(width: u32, height: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        let t = if height > 1 {
            y as f32 / (height - 1) as f32
        } else {
            0.0
        };
        let row: [u8; 3] = std::array::from_fn(|c| (SKY_TOP[c] + (SKY_BOTTOM[c] - SKY_TOP[c]) * t) as u8);
        for _ in 0..width {
            pixels.extend_from_slice(&row);
        }
    }
    pixels
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        self.config.name.clone()
    }

    fn open(&mut self) -> Result<(), CameraError> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(CameraError::Configuration(format!(
                "{}: frame size {}x{} is empty",
                self.config.name, self.config.width, self.config.height
            )));
        }
        self.open = true;
        self.next_due = None;
        log::info!(
            "SyntheticSource: opened {} ({}x{} @ {} fps)",
            self.config.name,
            self.config.width,
            self.config.height,
            self.config.target_fps
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, CameraError> {
        if !self.open {
            self.stats.read_failures += 1;
            return Err(CameraError::Device(format!(
                "{} is not open",
                self.config.name
            )));
        }
        self.pace();
        self.sequence += 1;
        self.stats.frames_captured += 1;
        Ok(Frame::new(
            self.render(self.sequence),
            self.config.width,
            self.config.height,
            Local::now(),
            self.sequence,
        ))
    }

    fn close(&mut self) {
        if self.open {
            log::info!("SyntheticSource: closed {}", self.config.name);
        }
        self.open = false;
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorBackend, SilhouetteBackend};

    fn config() -> SyntheticConfig {
        SyntheticConfig {
            name: "stub://test".into(),
            width: 160,
            height: 120,
            target_fps: 0,
            pass_frames: 10,
            gap_frames: 5,
            drone_size: 16,
        }
    }

    #[test]
    fn read_before_open_is_device_error() {
        let mut source = SyntheticSource::new(config());
        assert!(matches!(source.read(), Err(CameraError::Device(_))));
        assert_eq!(source.stats().read_failures, 1);
    }

    #[test]
    fn frames_are_well_formed_and_sequenced() {
        let mut source = SyntheticSource::new(config());
        source.open().unwrap();
        let a = source.read().unwrap();
        let b = source.read().unwrap();
        assert!(a.is_well_formed());
        assert_eq!((a.width, a.height), (160, 120));
        assert_eq!(b.sequence, a.sequence + 1);
        assert_eq!(source.stats().frames_captured, 2);
        source.close();
        source.close();
        assert!(source.read().is_err());
    }

    #[test]
    fn drone_is_visible_during_pass_only() {
        let source = SyntheticSource::new(config());
        assert!(source.drone_center(1).is_some());
        assert!(source.drone_center(10).is_some());
        assert!(source.drone_center(11).is_none());
        assert!(source.drone_center(15).is_none());
        assert!(source.drone_center(16).is_some());
    }

    #[test]
    fn silhouette_backend_finds_the_drone() {
        let mut source = SyntheticSource::new(config());
        source.open().unwrap();
        let mut backend = SilhouetteBackend::new();

        let frame = source.read().unwrap();
        let (cx, cy) = source.drone_center(frame.sequence).unwrap();
        let found = backend
            .detect(frame.pixels(), frame.width, frame.height)
            .unwrap();
        assert_eq!(found.len(), 1);
        let b = found[0].bbox;
        assert!(b.x1 <= cx && cx <= b.x2 && b.y1 <= cy && cy <= b.y2);
        assert!(found[0].confidence >= 0.5);

        for _ in 0..10 {
            source.read().unwrap();
        }
        // sequence 11 is in the gap
        let empty = source.read().unwrap();
        assert_eq!(empty.sequence, 12);
        assert!(backend
            .detect(empty.pixels(), empty.width, empty.height)
            .unwrap()
            .is_empty());
    }
}
