use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{EngineSettings, RetryPolicy};
use crate::track::{TrackerConfig, DEFAULT_GRACE_FRAMES, DEFAULT_MIN_IOU};

const DEFAULT_DB_PATH: &str = "skywatch.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_CAMERA_URL: &str = "stub://sky";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_READ_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 30;
const DEFAULT_DETECTOR_BACKEND: &str = "silhouette";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_NMS_IOU: f32 = 0.45;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_MIN_HITS: u32 = 1;
const DEFAULT_STREAM_INTERVAL_MS: u64 = 33;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_PERSIST_RETRIES: u32 = 3;
const DEFAULT_PERSIST_BACKOFF_MS: u64 = 200;

#[derive(Debug, Deserialize, Default)]
struct SkywatchConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfigFile>,
    stream: Option<StreamConfigFile>,
    events: Option<EventsConfigFile>,
    persistence: Option<PersistenceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    read_timeout_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    nms_iou: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    min_iou: Option<f32>,
    grace_frames: Option<u32>,
    min_hits: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    annotate: Option<bool>,
    interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PersistenceConfigFile {
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SkywatchConfig {
    pub db_path: String,
    pub api_addr: String,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub tracker: TrackerSettings,
    pub stream: StreamSettings,
    pub events: EventSettings,
    pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    /// `stub://<name>`, `/dev/videoN` or `v4l2:///dev/videoN`.
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub read_timeout: Duration,
    /// Consecutive read failures tolerated before the engine stops itself.
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    /// "silhouette" or "tract".
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub nms_iou: f32,
    /// Square model input edge in pixels.
    pub input_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    pub min_iou: f32,
    pub grace_frames: u32,
    /// Tracks matched on fewer frames than this are not reported.
    pub min_hits: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Draw live track boxes on published frames.
    pub annotate: bool,
    pub interval: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventSettings {
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceSettings {
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for SkywatchConfig {
    fn default() -> Self {
        // all-None file sections resolve to the defaults and cannot fail
        Self::from_file(SkywatchConfigFile::default())
    }
}

impl SkywatchConfig {
    /// Load from the file named by `SKYWATCH_CONFIG` (if any), apply environment
    /// overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SKYWATCH_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit config file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SkywatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SkywatchConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let camera = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            url: camera
                .url
                .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
            width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            target_fps: camera.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
            read_timeout: Duration::from_millis(
                camera.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            max_consecutive_failures: camera
                .max_consecutive_failures
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
        };

        let detector = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            model_path: detector.model_path,
            confidence_threshold: detector
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            nms_iou: detector.nms_iou.unwrap_or(DEFAULT_NMS_IOU),
            input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
        };

        let tracker = file.tracker.unwrap_or_default();
        let tracker = TrackerSettings {
            min_iou: tracker.min_iou.unwrap_or(DEFAULT_MIN_IOU),
            grace_frames: tracker.grace_frames.unwrap_or(DEFAULT_GRACE_FRAMES),
            min_hits: tracker.min_hits.unwrap_or(DEFAULT_MIN_HITS),
        };

        let stream = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            annotate: stream.annotate.unwrap_or(true),
            interval: Duration::from_millis(
                stream.interval_ms.unwrap_or(DEFAULT_STREAM_INTERVAL_MS),
            ),
            jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let events = EventSettings {
            queue_capacity: file
                .events
                .and_then(|events| events.queue_capacity)
                .unwrap_or(DEFAULT_EVENT_QUEUE_CAPACITY),
        };

        let persistence = file.persistence.unwrap_or_default();
        let persistence = PersistenceSettings {
            max_retries: persistence.max_retries.unwrap_or(DEFAULT_PERSIST_RETRIES),
            retry_backoff: Duration::from_millis(
                persistence
                    .retry_backoff_ms
                    .unwrap_or(DEFAULT_PERSIST_BACKOFF_MS),
            ),
        };

        Self {
            db_path,
            api_addr,
            camera,
            detector,
            tracker,
            stream,
            events,
            persistence,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = non_empty_env("SKYWATCH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = non_empty_env("SKYWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = non_empty_env("SKYWATCH_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(path) = non_empty_env("SKYWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(backend) = non_empty_env("SKYWATCH_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(confidence) = non_empty_env("SKYWATCH_CONFIDENCE") {
            self.detector.confidence_threshold = confidence.trim().parse().map_err(|_| {
                anyhow!("SKYWATCH_CONFIDENCE must be a number between 0 and 1")
            })?;
        }
        if let Some(grace) = non_empty_env("SKYWATCH_GRACE_FRAMES") {
            self.tracker.grace_frames = grace.trim().parse().map_err(|_| {
                anyhow!("SKYWATCH_GRACE_FRAMES must be a non-negative integer")
            })?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.camera.url = self.camera.url.trim().to_string();
        if self.camera.url.is_empty() {
            return Err(anyhow!("camera.url must not be empty"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!(
                "camera frame size {}x{} is empty",
                self.camera.width,
                self.camera.height
            ));
        }
        if self.camera.read_timeout.is_zero() {
            return Err(anyhow!("camera.read_timeout_ms must be greater than zero"));
        }

        self.detector.backend = self.detector.backend.trim().to_lowercase();
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!(
                "detector.confidence_threshold must be within [0, 1], got {}",
                self.detector.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.detector.nms_iou) {
            return Err(anyhow!("detector.nms_iou must be within [0, 1]"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector.input_size must be greater than zero"));
        }

        if !(0.0..1.0).contains(&self.tracker.min_iou) {
            return Err(anyhow!(
                "tracker.min_iou must be within [0, 1), got {}",
                self.tracker.min_iou
            ));
        }
        if self.tracker.min_hits == 0 {
            return Err(anyhow!("tracker.min_hits must be at least 1"));
        }

        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("stream.jpeg_quality must be within 1..=100"));
        }
        if self.stream.interval.is_zero() {
            return Err(anyhow!("stream.interval_ms must be greater than zero"));
        }
        if self.events.queue_capacity == 0 {
            return Err(anyhow!("events.queue_capacity must be greater than zero"));
        }
        Ok(())
    }

    /// Capture-loop parameters derived from this configuration.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            target_fps: self.camera.target_fps,
            max_consecutive_failures: self.camera.max_consecutive_failures,
            tracker: TrackerConfig {
                min_iou: self.tracker.min_iou,
                grace_frames: self.tracker.grace_frames,
            },
            min_hits: self.tracker.min_hits,
            annotate: self.stream.annotate,
            event_queue_capacity: self.events.queue_capacity,
            retry: RetryPolicy {
                max_retries: self.persistence.max_retries,
                backoff: self.persistence.retry_backoff,
            },
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<SkywatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
