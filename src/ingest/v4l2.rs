//! V4L2 frame source for local USB cameras.
//!
//! Negotiates YUYV at the configured size and falls back to whatever the driver
//! accepts (RGB3, YUYV or MJPG). Every buffer is converted to packed RGB before it
//! leaves the source.

use ouroboros::self_referencing;
use std::io;
use std::time::Duration;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, SourceStats};
use crate::error::CameraError;
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    /// Upper bound on a single dequeue.
    pub read_timeout: Duration,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
            read_timeout: Duration::from_secs(2),
        }
    }
}

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    format: PixelFormat,
    active_width: u32,
    active_height: u32,
    sequence: u64,
    stats: SourceStats,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

fn pixel_format(fourcc: &v4l::FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"YUYV" => Some(PixelFormat::Yuyv),
        b"MJPG" => Some(PixelFormat::Mjpeg),
        _ => None,
    }
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            format: PixelFormat::Yuyv,
            sequence: 0,
            stats: SourceStats::default(),
        }
    }

    fn device_error(&self, what: &str, err: impl std::fmt::Display) -> CameraError {
        CameraError::Device(format!("{}: {}: {}", self.config.device, what, err))
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        self.config.device.clone()
    }

    fn open(&mut self) -> Result<(), CameraError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.close();

        let mut device = v4l::Device::with_path(&self.config.device)
            .map_err(|err| self.device_error("open", err))?;
        let mut format = device
            .format()
            .map_err(|err| self.device_error("read format", err))?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .map_err(|err| self.device_error("read format after set failure", err))?
            }
        };
        let pixel_format = pixel_format(&format.fourcc).ok_or_else(|| {
            CameraError::Configuration(format!(
                "{}: unsupported pixel format {}",
                self.config.device, format.fourcc
            ))
        })?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        let timeout = self.config.read_timeout;
        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4).map(
                    |mut stream| {
                        stream.set_timeout(timeout);
                        stream
                    },
                )
            },
        }
        .try_build()
        .map_err(|err| self.device_error("create buffer stream", err))?;

        self.format = pixel_format;
        self.active_width = format.width;
        self.active_height = format.height;
        self.state = Some(state);

        log::info!(
            "V4l2Source: opened {} ({}x{} {})",
            self.config.device,
            self.active_width,
            self.active_height,
            format.fourcc
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, CameraError> {
        use v4l::io::traits::CaptureStream;

        let Some(state) = self.state.as_mut() else {
            self.stats.read_failures += 1;
            return Err(CameraError::Device(format!(
                "{} is not open",
                self.config.device
            )));
        };
        let (format, width, height) = (self.format, self.active_width, self.active_height);
        let captured = state.with_mut(|fields| {
            fields
                .stream
                .next()
                .map(|(buf, _meta)| normalize_to_rgb(buf, width, height, format))
        });

        let pixels = match captured {
            Ok(Ok(pixels)) => pixels,
            Ok(Err(err)) => {
                self.stats.read_failures += 1;
                return Err(self.device_error("decode frame", err));
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                self.stats.read_failures += 1;
                return Err(CameraError::CaptureTimeout(self.config.read_timeout));
            }
            Err(err) => {
                self.stats.read_failures += 1;
                return Err(self.device_error("capture frame", err));
            }
        };

        self.sequence += 1;
        self.stats.frames_captured += 1;
        Ok(Frame::new(
            pixels,
            width,
            height,
            chrono::Local::now(),
            self.sequence,
        ))
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: closed {}", self.config.device);
        }
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_fails_to_open() {
        let mut source = V4l2Source::new(V4l2Config {
            device: "/dev/skywatch-missing-camera".to_string(),
            ..V4l2Config::default()
        });
        assert!(matches!(source.open(), Err(CameraError::Device(_))));
        assert!(matches!(source.read(), Err(CameraError::Device(_))));
        assert_eq!(source.stats().read_failures, 1);
    }

    #[test]
    fn known_fourccs_map_to_pixel_formats() {
        assert_eq!(
            pixel_format(&v4l::FourCC::new(b"MJPG")),
            Some(PixelFormat::Mjpeg)
        );
        assert_eq!(pixel_format(&v4l::FourCC::new(b"NV12")), None);
    }
}
