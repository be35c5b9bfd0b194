//! Track manager: turns per-frame candidates into continuous sightings.
//!
//! Each frame runs four steps:
//!
//! 1. **Association**: live tracks, most recently seen first (lower id on ties), each
//!    take the free candidate with the highest IoU strictly above `min_iou`. This is a
//!    greedy bipartite match, not an optimal assignment.
//! 2. **Update** matched tracks: last-seen time and box replaced, miss counter reset.
//! 3. **Age** unmatched tracks. A track whose miss counter exceeds `grace_frames` is
//!    terminated; its end time is the last frame it was seen on.
//! 4. **Spawn** a track for every candidate left unmatched.
//!
//! The manager is single-owner state: the capture loop owns it and nothing else
//! touches it, so there is no locking here.

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::detect::{BBox, Candidate};

pub const DEFAULT_MIN_IOU: f32 = 0.2;
pub const DEFAULT_GRACE_FRAMES: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Minimum overlap (exclusive) for a candidate to continue a track.
    pub min_iou: f32,
    /// Consecutive missed frames tolerated before a track ends.
    pub grace_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: DEFAULT_MIN_IOU,
            grace_frames: DEFAULT_GRACE_FRAMES,
        }
    }
}

/// One continuous sighting of an object.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: u64,
    pub started_at: DateTime<Local>,
    /// Never decreases, even if the wall clock steps backwards.
    pub last_seen_at: DateTime<Local>,
    pub bbox: BBox,
    /// Consecutive frames since the last successful match.
    pub misses: u32,
    /// Frames this track was matched on, including the spawning frame.
    pub hits: u32,
    pub peak_confidence: f32,
}

impl Track {
    fn spawn(id: u64, at: DateTime<Local>, candidate: &Candidate) -> Self {
        Self {
            id,
            started_at: at,
            last_seen_at: at,
            bbox: candidate.bbox,
            misses: 0,
            hits: 1,
            peak_confidence: candidate.confidence,
        }
    }

    fn observe(&mut self, at: DateTime<Local>, candidate: &Candidate) {
        self.last_seen_at = self.last_seen_at.max(at);
        self.bbox = candidate.bbox;
        self.misses = 0;
        self.hits += 1;
        self.peak_confidence = self.peak_confidence.max(candidate.confidence);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Miss counter exceeded the grace threshold.
    Expired,
    /// Force-terminated by `flush` (engine stop).
    Flushed,
}

/// A track that left the live set.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletedTrack {
    pub track: Track,
    pub reason: Termination,
}

impl CompletedTrack {
    pub fn to_record(&self) -> DetectionRecord {
        let t = &self.track;
        DetectionRecord {
            track_id: t.id,
            detection_date: t.started_at.date_naive(),
            start_time: t.started_at,
            end_time: t.last_seen_at,
            peak_confidence: t.peak_confidence,
            frame_count: t.hits,
        }
    }
}

/// Durable summary of one completed track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub track_id: u64,
    pub detection_date: NaiveDate,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub peak_confidence: f32,
    pub frame_count: u32,
}

#[derive(Debug)]
pub struct TrackManager {
    config: TrackerConfig,
    live: Vec<Track>,
    next_id: u64,
}

impl TrackManager {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            live: Vec::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> TrackerConfig {
        self.config
    }

    /// Live tracks in creation order.
    pub fn live(&self) -> &[Track] {
        &self.live
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Process one frame. Returns the tracks that ended on this frame, by id.
    pub fn update(&mut self, at: DateTime<Local>, candidates: &[Candidate]) -> Vec<CompletedTrack> {
        let mut taken = vec![false; candidates.len()];
        let mut matched = vec![false; self.live.len()];

        let mut order: Vec<usize> = (0..self.live.len()).collect();
        order.sort_by(|&a, &b| {
            self.live[b]
                .last_seen_at
                .cmp(&self.live[a].last_seen_at)
                .then_with(|| self.live[a].id.cmp(&self.live[b].id))
        });

        for ti in order {
            let mut best: Option<(usize, f32)> = None;
            for (ci, cand) in candidates.iter().enumerate() {
                if taken[ci] {
                    continue;
                }
                let iou = self.live[ti].bbox.iou(&cand.bbox);
                if iou > self.config.min_iou && best.map_or(true, |(_, b)| iou > b) {
                    best = Some((ci, iou));
                }
            }
            if let Some((ci, _)) = best {
                taken[ci] = true;
                matched[ti] = true;
                self.live[ti].observe(at, &candidates[ci]);
            }
        }

        for (track, hit) in self.live.iter_mut().zip(&matched) {
            if !hit {
                track.misses += 1;
            }
        }

        let grace = self.config.grace_frames;
        let (expired, kept): (Vec<Track>, Vec<Track>) = std::mem::take(&mut self.live)
            .into_iter()
            .partition(|t| t.misses > grace);
        self.live = kept;

        for (cand, _) in candidates.iter().zip(&taken).filter(|(_, t)| !**t) {
            let id = self.next_id;
            self.next_id += 1;
            self.live.push(Track::spawn(id, at, cand));
        }

        expired
            .into_iter()
            .map(|track| CompletedTrack {
                track,
                reason: Termination::Expired,
            })
            .collect()
    }

    /// A capture gap: ages every live track like a frame with no candidates.
    pub fn age(&mut self, at: DateTime<Local>) -> Vec<CompletedTrack> {
        self.update(at, &[])
    }

    /// Terminate every live track. Each is returned exactly once.
    pub fn flush(&mut self) -> Vec<CompletedTrack> {
        std::mem::take(&mut self.live)
            .into_iter()
            .map(|track| CompletedTrack {
                track,
                reason: Termination::Flushed,
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
