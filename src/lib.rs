//! skywatch: aerial object detection & tracking service
//!
//! A camera feed is run through a detector frame by frame. Per-frame candidates are
//! joined into tracks, and every finished track becomes one persisted detection
//! episode. Status and detection events are republished to live subscribers.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! - `ingest`: frame sources (synthetic sky, scripted, V4L2 devices)
//! - `detect`: detector backends and the inference adapter
//! - `track`: the track manager state machine
//! - `engine`: capture loop, lifecycle, latest frame, event and persistence workers
//! - `events` / `storage`: the sinks the engine reports to
//! - `api`: HTTP control, history, MJPEG video and server-sent events
//!
//! The engine never blocks on a sink: events go through a bounded queue and records
//! through a persistence worker, so a slow database or subscriber cannot stall capture.

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod storage;
pub mod track;

pub use config::SkywatchConfig;
pub use detect::{BBox, Candidate, DetectorBackend, InferenceAdapter};
pub use engine::{Engine, EngineSettings, RetryPolicy, StartOutcome, StopOutcome};
pub use error::{CameraError, EngineError, InferenceError};
pub use events::{EngineEvent, EventHub, EventSink, StatusSnapshot};
pub use frame::{Frame, FrameSlot};
pub use ingest::{FrameSource, ScriptedSource, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::{V4l2Config, V4l2Source};
pub use storage::{
    DetectionStore, InMemoryDetectionStore, PersistenceSink, SharedStore, SqliteDetectionStore,
};
pub use track::{DetectionRecord, TrackManager, TrackerConfig};

/// A fresh shared-cache in-memory SQLite URI. Every connection opened with the same URI
/// sees the same database while at least one of them is alive.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:skywatch_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_memory_uris_are_unique() {
        assert_ne!(shared_memory_uri(), shared_memory_uri());
    }

    #[test]
    fn plain_paths_open_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("skywatch.db");
        let conn = open_db_connection(&path.to_string_lossy())?;
        conn.execute_batch("CREATE TABLE t (x INTEGER);")?;
        assert!(path.exists());
        Ok(())
    }
}
