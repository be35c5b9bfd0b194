//! Captured frames and the latest-frame publication slot.
//!
//! - `Frame`: immutable RGB24 image plus capture timestamp and sequence number.
//! - `FrameSlot`: single-slot "publish most recent, drop intermediate" buffer shared
//!   between the capture loop (one writer) and any number of readers.
//!
//! Frames are published as `Arc<Frame>` snapshots. A published frame is never mutated;
//! annotation produces a new frame before publication.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::sync::{Arc, PoisonError, RwLock};

use crate::detect::BBox;

/// Bytes per pixel of the only supported layout (RGB24, row-major, no padding).
pub const RGB_CHANNELS: usize = 3;

const ANNOTATION_COLOR: Rgb<u8> = Rgb([255, 32, 32]);

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured image.
///
/// The pixel buffer is private so a frame cannot change after it has been handed to
/// readers; `pixels()` gives read-only access.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Local>,
    /// Per-source sequence number, starting at 1.
    pub sequence: u64,
}

impl Frame {
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: DateTime<Local>,
        sequence: u64,
    ) -> Self {
        Self {
            pixels,
            width,
            height,
            captured_at,
            sequence,
        }
    }

    /// Solid-colour frame. Used for placeholders and tests.
    pub fn filled(
        width: u32,
        height: u32,
        rgb: [u8; 3],
        captured_at: DateTime<Local>,
        sequence: u64,
    ) -> Self {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * RGB_CHANNELS)
            .collect();
        Self::new(pixels, width, height, captured_at, sequence)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Expected buffer length for the declared dimensions, `None` on overflow.
    pub fn expected_len(width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(RGB_CHANNELS))
    }

    /// True when the buffer matches the declared non-zero dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && Self::expected_len(self.width, self.height) == Some(self.pixels.len())
    }

    fn to_rgb_image(&self) -> Result<RgbImage> {
        if !self.is_well_formed() {
            return Err(anyhow!(
                "frame #{} is malformed ({}x{}, {} bytes)",
                self.sequence,
                self.width,
                self.height,
                self.pixels.len()
            ));
        }
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame #{} buffer rejected by image", self.sequence))
    }

    /// Copy of this frame with a hollow rectangle drawn around every box.
    pub fn annotated(&self, boxes: &[BBox]) -> Result<Frame> {
        let mut img = self.to_rgb_image()?;
        for bbox in boxes {
            let Some(clamped) = bbox.clamp_to(self.width, self.height) else {
                continue;
            };
            let w = clamped.width().round().max(1.0) as u32;
            let h = clamped.height().round().max(1.0) as u32;
            let rect = Rect::at(clamped.x1.round() as i32, clamped.y1.round() as i32).of_size(w, h);
            draw_hollow_rect_mut(&mut img, rect, ANNOTATION_COLOR);
        }
        Ok(Frame::new(
            img.into_raw(),
            self.width,
            self.height,
            self.captured_at,
            self.sequence,
        ))
    }

    /// Encode as baseline JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        if !self.is_well_formed() {
            return Err(anyhow!("cannot encode malformed frame #{}", self.sequence));
        }
        let mut out = Vec::with_capacity(self.pixels.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
            &self.pixels,
            self.width,
            self.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// FrameSlot: latest-frame publication
// ----------------------------------------------------------------------------

/// Holds the most recently published frame.
///
/// The lock only guards a pointer swap or an `Arc` clone, so the capture loop never
/// waits on a reader for longer than that. Readers see either the previous or the
/// current snapshot, never a partially written frame.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: RwLock<Option<Arc<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published frame. Returns the previous snapshot.
    pub fn publish(&self, frame: Arc<Frame>) -> Option<Arc<Frame>> {
        let mut guard = self.latest.write().unwrap_or_else(PoisonError::into_inner);
        guard.replace(frame)
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(seq: u64) -> Frame {
        Frame::filled(32, 24, [200, 210, 230], Local::now(), seq)
    }

    #[test]
    fn filled_frame_is_well_formed() {
        let f = frame(1);
        assert!(f.is_well_formed());
        assert_eq!(f.pixels().len(), 32 * 24 * 3);
        assert_eq!(&f.pixels()[..3], &[200, 210, 230]);
    }

    #[test]
    fn short_buffer_is_malformed() {
        let f = Frame::new(vec![0u8; 10], 32, 24, Local::now(), 1);
        assert!(!f.is_well_formed());
        assert!(f.encode_jpeg(80).is_err());
        assert!(f.annotated(&[]).is_err());
    }

    #[test]
    fn annotation_draws_box_without_touching_source() {
        let f = frame(3);
        let boxed = f.annotated(&[BBox::new(4.0, 4.0, 12.0, 10.0)]).unwrap();

        // top-left corner of the rectangle is painted
        let idx = (4 * 32 + 4) * 3;
        assert_eq!(&boxed.pixels()[idx..idx + 3], &[255, 32, 32]);
        assert_eq!(&f.pixels()[idx..idx + 3], &[200, 210, 230]);
        assert_eq!(boxed.sequence, 3);
    }

    #[test]
    fn jpeg_encoding_produces_soi_marker() {
        let jpeg = frame(1).encode_jpeg(75).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn slot_publishes_latest_snapshot() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());

        assert!(slot.publish(Arc::new(frame(1))).is_none());
        let prev = slot.publish(Arc::new(frame(2))).unwrap();
        assert_eq!(prev.sequence, 1);
        assert_eq!(slot.latest().unwrap().sequence, 2);

        slot.clear();
        assert!(slot.latest().is_none());
    }

    #[test]
    fn concurrent_readers_never_see_partial_frames() {
        let slot = Arc::new(FrameSlot::new());
        let writer = {
            let slot = slot.clone();
            thread::spawn(move || {
                for seq in 1..=200u64 {
                    let shade = (seq % 255) as u8;
                    slot.publish(Arc::new(Frame::filled(
                        16,
                        16,
                        [shade, shade, shade],
                        Local::now(),
                        seq,
                    )));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                thread::spawn(move || {
                    let mut last_seq = 0;
                    for _ in 0..500 {
                        if let Some(f) = slot.latest() {
                            assert!(f.is_well_formed());
                            let first = f.pixels()[0];
                            assert!(f.pixels().iter().all(|&p| p == first));
                            assert!(f.sequence >= last_seq);
                            last_seq = f.sequence;
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
