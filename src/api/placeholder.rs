use anyhow::Result;
use chrono::Local;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::frame::Frame;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const BACKGROUND: Rgb<u8> = Rgb([16, 16, 16]);

/// Stand-in images for `/video` when there is no live frame to show.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Placeholder {
    /// Engine stopped: a yellow pause glyph.
    CameraStopped,
    /// Engine running but nothing captured yet: a red cross.
    NoFeed,
}

pub(super) fn placeholder_jpeg(kind: Placeholder, quality: u8) -> Result<Vec<u8>> {
    let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);
    let (cx, cy) = ((WIDTH / 2) as i32, (HEIGHT / 2) as i32);
    match kind {
        Placeholder::CameraStopped => {
            let yellow = Rgb([255, 255, 0]);
            draw_filled_rect_mut(&mut img, Rect::at(cx - 40, cy - 50).of_size(28, 100), yellow);
            draw_filled_rect_mut(&mut img, Rect::at(cx + 12, cy - 50).of_size(28, 100), yellow);
        }
        Placeholder::NoFeed => {
            let red = Rgb([255, 0, 0]);
            for offset in -2..=2 {
                let o = offset as f32;
                draw_line_segment_mut(
                    &mut img,
                    (cx as f32 - 60.0 + o, cy as f32 - 60.0),
                    (cx as f32 + 60.0 + o, cy as f32 + 60.0),
                    red,
                );
                draw_line_segment_mut(
                    &mut img,
                    (cx as f32 + 60.0 + o, cy as f32 - 60.0),
                    (cx as f32 - 60.0 + o, cy as f32 + 60.0),
                    red,
                );
            }
        }
    }
    Frame::new(img.into_raw(), WIDTH, HEIGHT, Local::now(), 0).encode_jpeg(quality)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_distinct_jpegs() {
        let stopped = placeholder_jpeg(Placeholder::CameraStopped, 80).unwrap();
        let no_feed = placeholder_jpeg(Placeholder::NoFeed, 80).unwrap();
        assert_eq!(&stopped[..2], &[0xFF, 0xD8]);
        assert_eq!(&no_feed[..2], &[0xFF, 0xD8]);
        assert_ne!(stopped, no_feed);
    }
}
