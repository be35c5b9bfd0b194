//! Detection & tracking engine.
//!
//! One capture thread owns the frame source, the inference adapter and the track
//! manager. Everything it produces leaves through three doors:
//!
//! - the latest frame, published to a `FrameSlot` as an immutable `Arc<Frame>`;
//! - completed detections, queued (unbounded) to the persistence worker;
//! - events, queued (bounded, dropped when full) to the dispatcher.
//!
//! Start/stop may be called from any thread. They are serialised by the control lock,
//! which is never taken by the capture thread, so readers of status and frames never
//! wait on a lifecycle transition.

use chrono::{Local, NaiveDate};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::SkywatchConfig;
use crate::detect::{adapter_from_settings, BBox, Candidate, InferenceAdapter};
use crate::error::EngineError;
use crate::events::{
    CallbackSink, DetectionCallback, DetectionSummary, EngineEvent, EventSink, LogSink,
    StatusCallback, StatusSnapshot,
};
use crate::frame::{Frame, FrameSlot};
use crate::ingest::{open_source, FrameSource};
use crate::storage::PersistenceSink;
use crate::track::{CompletedTrack, DetectionRecord, TrackManager, TrackerConfig};

const CAPTURE_THREAD: &str = "skywatch-capture";
const EVENTS_THREAD: &str = "skywatch-events";
const PERSIST_THREAD: &str = "skywatch-persist";

pub const CAMERA_OFFLINE: &str = "camera offline";

#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Capture cadence. 0 runs as fast as the source delivers.
    pub target_fps: u32,
    /// Consecutive read failures tolerated; one more stops the engine.
    pub max_consecutive_failures: u32,
    pub tracker: TrackerConfig,
    /// Completed tracks matched on fewer frames are discarded.
    pub min_hits: u32,
    /// Draw live track boxes on published frames.
    pub annotate: bool,
    pub event_queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            target_fps: 30,
            max_consecutive_failures: 30,
            tracker: TrackerConfig::default(),
            min_hits: 1,
            annotate: false,
            event_queue_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

/// Persistence retries. Attempt `n` (1-based) that fails waits `backoff * n` before the
/// next one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// `flushed` live tracks were force-terminated.
    Stopped { flushed: usize },
    AlreadyStopped,
}

struct Pipeline {
    source: Box<dyn FrameSource>,
    adapter: InferenceAdapter,
}

struct LoopExit {
    pipeline: Pipeline,
    flushed: usize,
}

type CaptureBody = Box<dyn FnOnce() -> Option<LoopExit> + Send + 'static>;

struct CaptureWorker {
    handle: JoinHandle<Option<LoopExit>>,
    stop_tx: Sender<()>,
}

#[derive(Default)]
struct Control {
    pipeline: Option<Pipeline>,
    worker: Option<CaptureWorker>,
}

struct StatusState {
    running: bool,
    today: NaiveDate,
    today_count: u64,
}

impl StatusState {
    fn roll_over(&mut self, now: NaiveDate) {
        if now != self.today {
            log::info!(
                "engine: new day {} ({} detections on {})",
                now,
                self.today_count,
                self.today
            );
            self.today = now;
            self.today_count = 0;
        }
    }
}

struct Shared {
    status: Mutex<StatusState>,
    frames: FrameSlot,
    settings: EngineSettings,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, StatusState> {
        let mut guard = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        guard.roll_over(Local::now().date_naive());
        guard
    }

    fn snapshot(&self, message: Option<&str>) -> StatusSnapshot {
        let status = self.status();
        StatusSnapshot {
            is_running: status.running,
            today_detection_count: status.today_count,
            timestamp: Local::now(),
            message: message.map(str::to_string),
        }
    }
}

/// Sending half of the engine's queues, plus the state needed to fill them.
#[derive(Clone)]
struct Outbox {
    shared: Arc<Shared>,
    events: Sender<EngineEvent>,
    persist: Sender<DetectionRecord>,
}

impl Outbox {
    fn emit(&self, event: EngineEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::warn!("engine: event queue full, dropping {}", event.name());
            }
            Err(TrySendError::Disconnected(event)) => {
                log::debug!("engine: dispatcher gone, dropping {}", event.name());
            }
        }
    }

    fn emit_status(&self, message: Option<&str>) {
        self.emit(EngineEvent::StatusUpdate(self.shared.snapshot(message)));
    }

    fn report(&self, completed: Vec<CompletedTrack>) {
        for done in completed {
            let hits = done.track.hits;
            if hits < self.shared.settings.min_hits {
                log::debug!(
                    "engine: discarding track {} ({} hits < min_hits {})",
                    done.track.id,
                    hits,
                    self.shared.settings.min_hits
                );
                continue;
            }

            let record = done.to_record();
            let total = {
                let mut status = self.shared.status();
                if record.detection_date == status.today {
                    status.today_count += 1;
                }
                status.today_count
            };
            log::info!(
                "engine: detection track={} reason={:?} frames={} peak={:.2} start={} end={}",
                record.track_id,
                done.reason,
                record.frame_count,
                record.peak_confidence,
                record.start_time.format("%H:%M:%S%.3f"),
                record.end_time.format("%H:%M:%S%.3f"),
            );

            if self.persist.send(record.clone()).is_err() {
                log::error!(
                    "engine: persistence worker gone, detection track={} lost",
                    record.track_id
                );
            }
            self.emit(EngineEvent::NewDetection(DetectionSummary::new(record, total)));
        }
    }
}

/// The detection & tracking engine. Share it as `Arc<Engine>`.
pub struct Engine {
    shared: Arc<Shared>,
    outbox: Outbox,
    control: Mutex<Control>,
    sink: Arc<Mutex<Box<dyn EventSink>>>,
    dispatcher: Option<JoinHandle<()>>,
    persister: Option<JoinHandle<()>>,
}

impl Engine {
    /// Build a stopped engine. Today's counter is seeded from `persistence`.
    pub fn new(
        settings: EngineSettings,
        source: Box<dyn FrameSource>,
        mut adapter: InferenceAdapter,
        mut persistence: Box<dyn PersistenceSink>,
    ) -> Result<Self, EngineError> {
        let today = Local::now().date_naive();
        let today_count = persistence.count_on(today).unwrap_or_else(|e| {
            log::warn!("engine: could not read today's detection count: {:#}", e);
            0
        });
        if let Err(e) = adapter.warm_up() {
            log::warn!("engine: detector warm-up failed: {}", e);
        }

        let shared = Arc::new(Shared {
            status: Mutex::new(StatusState {
                running: false,
                today,
                today_count,
            }),
            frames: FrameSlot::new(),
            settings: settings.clone(),
        });

        let sink: Arc<Mutex<Box<dyn EventSink>>> = Arc::new(Mutex::new(Box::new(LogSink)));
        let (events_tx, events_rx) = crossbeam_channel::bounded(settings.event_queue_capacity.max(1));
        let (persist_tx, persist_rx) = crossbeam_channel::unbounded();

        let dispatcher = {
            let sink = sink.clone();
            std::thread::Builder::new()
                .name(EVENTS_THREAD.into())
                .spawn(move || run_dispatcher(events_rx, sink))
                .map_err(|source| EngineError::Spawn {
                    name: EVENTS_THREAD,
                    source,
                })?
        };
        let retry = settings.retry;
        let persister = std::thread::Builder::new()
            .name(PERSIST_THREAD.into())
            .spawn(move || run_persister(persist_rx, persistence, retry))
            .map_err(|source| EngineError::Spawn {
                name: PERSIST_THREAD,
                source,
            })?;

        log::info!(
            "engine: ready source={} detector={} fps={} grace={} min_iou={:.2} min_hits={} today={}",
            source.describe(),
            adapter.backend_name(),
            settings.target_fps,
            settings.tracker.grace_frames,
            settings.tracker.min_iou,
            settings.min_hits,
            today_count
        );

        Ok(Self {
            outbox: Outbox {
                shared: shared.clone(),
                events: events_tx,
                persist: persist_tx,
            },
            shared,
            control: Mutex::new(Control {
                pipeline: Some(Pipeline { source, adapter }),
                worker: None,
            }),
            sink,
            dispatcher: Some(dispatcher),
            persister: Some(persister),
        })
    }

    /// Build the source and detector described by `config`.
    pub fn from_config(
        config: &SkywatchConfig,
        persistence: Box<dyn PersistenceSink>,
    ) -> Result<Self, EngineError> {
        let source = open_source(&config.camera)?;
        let adapter = adapter_from_settings(&config.detector)?;
        Self::new(config.engine_settings(), source, adapter, persistence)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    /// Start capturing. Returns false (and logs why) if the camera could not be opened.
    pub fn start(&self) -> bool {
        match self.try_start() {
            Ok(_) => true,
            Err(e) => {
                log::error!("engine: start failed: {}", e);
                false
            }
        }
    }

    pub fn try_start(&self) -> Result<StartOutcome, EngineError> {
        self.start_with(|body| {
            std::thread::Builder::new()
                .name(CAPTURE_THREAD.into())
                .spawn(body)
        })
    }

    fn start_with<S>(&self, spawn: S) -> Result<StartOutcome, EngineError>
    where
        S: FnOnce(CaptureBody) -> std::io::Result<JoinHandle<Option<LoopExit>>>,
    {
        let mut control = self.lock_control();
        if control.worker.is_some() {
            if self.is_running() {
                return Ok(StartOutcome::AlreadyRunning);
            }
            // the loop stopped itself; take the pipeline back before reopening
            self.reclaim(&mut control)?;
        }

        let mut pipeline = control
            .pipeline
            .take()
            .ok_or(EngineError::WorkerPanicked(CAPTURE_THREAD))?;
        if let Err(e) = pipeline.source.open() {
            control.pipeline = Some(pipeline);
            return Err(e.into());
        }

        self.shared.frames.clear();
        self.shared.status().running = true;

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let handle = match spawn_capture(pipeline, self.outbox.clone(), stop_rx, spawn) {
            Ok(handle) => handle,
            Err((pipeline, source)) => {
                self.shared.status().running = false;
                match pipeline {
                    Some(mut pipeline) => {
                        pipeline.source.close();
                        control.pipeline = Some(pipeline);
                    }
                    None => log::error!("engine: capture pipeline lost with the failed spawn"),
                }
                return Err(EngineError::Spawn {
                    name: CAPTURE_THREAD,
                    source,
                });
            }
        };
        control.worker = Some(CaptureWorker { handle, stop_tx });

        log::info!("engine: started");
        self.outbox.emit_status(None);
        Ok(StartOutcome::Started)
    }

    /// Stop capturing. Live tracks are flushed as detections before this returns.
    pub fn stop(&self) -> bool {
        match self.try_stop() {
            Ok(_) => true,
            Err(e) => {
                log::error!("engine: stop failed: {}", e);
                false
            }
        }
    }

    pub fn try_stop(&self) -> Result<StopOutcome, EngineError> {
        let mut control = self.lock_control();
        if control.worker.is_none() {
            return Ok(StopOutcome::AlreadyStopped);
        }
        if !self.is_running() {
            self.reclaim(&mut control)?;
            return Ok(StopOutcome::AlreadyStopped);
        }

        let Some(worker) = control.worker.take() else {
            return Ok(StopOutcome::AlreadyStopped);
        };
        // a full slot means a stop is already pending
        let _ = worker.stop_tx.try_send(());
        let joined = worker.handle.join();
        self.shared.status().running = false;
        self.shared.frames.clear();

        let flushed = match joined {
            Ok(Some(exit)) => {
                control.pipeline = Some(exit.pipeline);
                exit.flushed
            }
            Ok(None) | Err(_) => {
                self.outbox.emit_status(None);
                return Err(EngineError::WorkerPanicked(CAPTURE_THREAD));
            }
        };

        log::info!("engine: stopped (flushed {} live tracks)", flushed);
        self.outbox.emit_status(None);
        Ok(StopOutcome::Stopped { flushed })
    }

    pub fn is_running(&self) -> bool {
        self.shared.status().running
    }

    /// Most recently published frame, if capture has produced one since the last start.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.shared.frames.latest()
    }

    /// Detections reported today (local date), including those stored before startup.
    pub fn today_detection_count(&self) -> u64 {
        self.shared.status().today_count
    }

    /// Account for records stored (`delta > 0`) or deleted outside the capture loop.
    /// Only records dated today move the counter.
    pub fn adjust_today(&self, date: NaiveDate, delta: i64) {
        let mut status = self.shared.status();
        if date != status.today {
            return;
        }
        status.today_count = if delta >= 0 {
            status.today_count.saturating_add(delta.unsigned_abs())
        } else {
            status.today_count.saturating_sub(delta.unsigned_abs())
        };
    }

    pub fn status(&self) -> StatusSnapshot {
        self.shared.snapshot(None)
    }

    /// Replace the sink events are delivered to. Events already queued go to the new
    /// sink.
    pub fn set_event_sink(&self, sink: Box<dyn EventSink>) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    pub fn set_callbacks(&self, on_new_detection: DetectionCallback, on_status_update: StatusCallback) {
        self.set_event_sink(Box::new(CallbackSink::new(on_new_detection, on_status_update)));
    }

    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join a capture thread that already left its loop.
    fn reclaim(&self, control: &mut Control) -> Result<(), EngineError> {
        let Some(worker) = control.worker.take() else {
            return Ok(());
        };
        match worker.handle.join() {
            Ok(Some(exit)) => {
                control.pipeline = Some(exit.pipeline);
                Ok(())
            }
            Ok(None) | Err(_) => Err(EngineError::WorkerPanicked(CAPTURE_THREAD)),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.try_stop() {
            log::error!("engine: stop during shutdown failed: {}", e);
        }
        // Swap in detached senders so the workers see their queues close once drained.
        drop(std::mem::replace(
            &mut self.outbox.events,
            crossbeam_channel::bounded(0).0,
        ));
        drop(std::mem::replace(
            &mut self.outbox.persist,
            crossbeam_channel::unbounded().0,
        ));
        for (name, handle) in [
            (EVENTS_THREAD, self.dispatcher.take()),
            (PERSIST_THREAD, self.persister.take()),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    log::error!("engine: {} thread panicked", name);
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Capture loop
// ----------------------------------------------------------------------------

/// Hand `pipeline` to a capture thread built by `spawn`. If spawning fails the pipeline
/// is given back so the next start can retry.
fn spawn_capture<S>(
    pipeline: Pipeline,
    outbox: Outbox,
    stop_rx: Receiver<()>,
    spawn: S,
) -> Result<JoinHandle<Option<LoopExit>>, (Option<Pipeline>, std::io::Error)>
where
    S: FnOnce(CaptureBody) -> std::io::Result<JoinHandle<Option<LoopExit>>>,
{
    let handoff = Arc::new(Mutex::new(Some(pipeline)));
    let slot = handoff.clone();
    let body: CaptureBody = Box::new(move || {
        let pipeline = slot.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        Some(run_capture(pipeline, outbox, stop_rx))
    });
    spawn(body).map_err(|e| {
        let pipeline = handoff.lock().unwrap_or_else(PoisonError::into_inner).take();
        (pipeline, e)
    })
}

fn run_capture(mut pipeline: Pipeline, outbox: Outbox, stop_rx: Receiver<()>) -> LoopExit {
    let settings = &outbox.shared.settings;
    let cycle = if settings.target_fps > 0 {
        Duration::from_secs(1) / settings.target_fps
    } else {
        Duration::ZERO
    };
    let mut tracks = TrackManager::new(settings.tracker);
    let mut failures = 0u32;
    let mut offline = false;

    log::info!("engine: capture loop running on {}", pipeline.source.describe());
    loop {
        let cycle_start = Instant::now();
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match pipeline.source.read() {
            Ok(frame) => {
                failures = 0;
                let candidates = run_inference(&mut pipeline.adapter, &frame);
                outbox.report(tracks.update(frame.captured_at, &candidates));
                publish(&outbox.shared, frame, &tracks, settings.annotate);
            }
            Err(e) => {
                failures += 1;
                log::warn!(
                    "engine: frame read failed ({}/{}): {}",
                    failures,
                    settings.max_consecutive_failures,
                    e
                );
                outbox.report(tracks.age(Local::now()));
                if failures > settings.max_consecutive_failures {
                    log::error!(
                        "engine: {} consecutive read failures, stopping capture",
                        failures
                    );
                    offline = true;
                    break;
                }
            }
        }

        if let Some(rest) = cycle.checked_sub(cycle_start.elapsed()) {
            match stop_rx.recv_timeout(rest) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    let flushed = tracks.flush();
    let count = flushed.len();
    outbox.report(flushed);
    pipeline.source.close();
    let stats = pipeline.source.stats();
    log::info!(
        "engine: capture loop exited frames={} read_failures={}",
        stats.frames_captured,
        stats.read_failures
    );

    if offline {
        outbox.shared.status().running = false;
        outbox.shared.frames.clear();
        outbox.emit_status(Some(CAMERA_OFFLINE));
    }
    LoopExit {
        pipeline,
        flushed: count,
    }
}

/// Inference failures and backend panics both count as a frame with no candidates.
fn run_inference(adapter: &mut InferenceAdapter, frame: &Frame) -> Vec<Candidate> {
    match catch_unwind(AssertUnwindSafe(|| adapter.detect(frame))) {
        Ok(Ok(candidates)) => candidates,
        Ok(Err(e)) => {
            log::warn!("engine: inference failed on frame {}: {}", frame.sequence, e);
            Vec::new()
        }
        Err(_) => {
            log::error!(
                "engine: detector backend panicked on frame {}",
                frame.sequence
            );
            Vec::new()
        }
    }
}

fn publish(shared: &Shared, frame: Frame, tracks: &TrackManager, annotate: bool) {
    let boxes: Vec<BBox> = if annotate {
        tracks
            .live()
            .iter()
            .filter(|t| t.misses == 0)
            .map(|t| t.bbox)
            .collect()
    } else {
        Vec::new()
    };
    let frame = if boxes.is_empty() {
        frame
    } else {
        match frame.annotated(&boxes) {
            Ok(annotated) => annotated,
            Err(e) => {
                log::warn!("engine: annotation failed: {:#}", e);
                frame
            }
        }
    };
    shared.frames.publish(Arc::new(frame));
}

// ----------------------------------------------------------------------------
// Workers
// ----------------------------------------------------------------------------

fn run_dispatcher(events: Receiver<EngineEvent>, sink: Arc<Mutex<Box<dyn EventSink>>>) {
    for event in events.iter() {
        let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
        if catch_unwind(AssertUnwindSafe(|| sink.deliver(&event))).is_err() {
            log::error!("engine: event sink panicked on {}", event.name());
        }
    }
    log::debug!("engine: dispatcher drained");
}

fn run_persister(
    records: Receiver<DetectionRecord>,
    mut sink: Box<dyn PersistenceSink>,
    retry: RetryPolicy,
) {
    for record in records.iter() {
        persist_with_retry(sink.as_mut(), &record, retry);
    }
    log::debug!("engine: persistence worker drained");
}

fn persist_with_retry(sink: &mut dyn PersistenceSink, record: &DetectionRecord, retry: RetryPolicy) {
    let attempts = retry.max_retries.saturating_add(1);
    for attempt in 1..=attempts {
        match sink.persist(record) {
            Ok(id) => {
                log::debug!("engine: stored detection id={} track={}", id, record.track_id);
                return;
            }
            Err(e) if attempt < attempts => {
                log::warn!(
                    "engine: persist attempt {}/{} failed for track {}: {:#}",
                    attempt,
                    attempts,
                    record.track_id,
                    e
                );
                std::thread::sleep(retry.backoff * attempt);
            }
            Err(e) => {
                log::error!(
                    "engine: DATA LOSS: detection track={} start={} end={} not stored after {} attempts: {:#}",
                    record.track_id,
                    record.start_time.to_rfc3339(),
                    record.end_time.to_rfc3339(),
                    attempts,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ScriptedBackend;
    use crate::ingest::ScriptedSource;
    use crate::storage::{DetectionStore, InMemoryDetectionStore, SharedStore};
    use anyhow::anyhow;

    struct FlakySink {
        failures_left: u32,
        attempts: Arc<Mutex<u32>>,
        store: InMemoryDetectionStore,
    }

    impl PersistenceSink for FlakySink {
        fn persist(&mut self, record: &DetectionRecord) -> anyhow::Result<i64> {
            *self.attempts.lock().unwrap() += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(anyhow!("disk full"));
            }
            self.store.insert(record)
        }

        fn count_on(&mut self, date: NaiveDate) -> anyhow::Result<u64> {
            self.store.count_for_date(date)
        }
    }

    fn record() -> DetectionRecord {
        let now = Local::now();
        DetectionRecord {
            track_id: 1,
            detection_date: now.date_naive(),
            start_time: now,
            end_time: now,
            peak_confidence: 0.8,
            frame_count: 3,
        }
    }

    #[test]
    fn persist_retries_until_success() {
        let attempts = Arc::new(Mutex::new(0));
        let mut sink = FlakySink {
            failures_left: 2,
            attempts: attempts.clone(),
            store: InMemoryDetectionStore::default(),
        };
        let retry = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(1),
        };
        persist_with_retry(&mut sink, &record(), retry);
        assert_eq!(*attempts.lock().unwrap(), 3);
        assert_eq!(sink.store.count_for_date(record().detection_date).unwrap(), 1);
    }

    #[test]
    fn persist_gives_up_after_max_retries() {
        let attempts = Arc::new(Mutex::new(0));
        let mut sink = FlakySink {
            failures_left: 10,
            attempts: attempts.clone(),
            store: InMemoryDetectionStore::default(),
        };
        let retry = RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(1),
        };
        persist_with_retry(&mut sink, &record(), retry);
        assert_eq!(*attempts.lock().unwrap(), 2);
        assert_eq!(sink.store.count_for_date(record().detection_date).unwrap(), 0);
    }

    #[test]
    fn today_count_is_seeded_from_persistence() {
        let mut store = SharedStore::new(InMemoryDetectionStore::default());
        store.insert(&record()).unwrap();
        store.insert(&record()).unwrap();
        let engine = Engine::new(
            EngineSettings::default(),
            Box::new(ScriptedSource::frames(8, 8)),
            InferenceAdapter::new(Box::new(ScriptedBackend::default()), 0.5),
            Box::new(store),
        )
        .unwrap();
        assert_eq!(engine.today_detection_count(), 2);
        assert!(!engine.is_running());
        assert!(engine.latest_frame().is_none());
    }

    #[test]
    fn failed_capture_spawn_keeps_pipeline_for_retry() {
        let source = ScriptedSource::frames(8, 8);
        let tally = source.tally();
        let engine = Engine::new(
            EngineSettings::default(),
            Box::new(source),
            InferenceAdapter::new(Box::new(ScriptedBackend::default()), 0.5),
            Box::new(SharedStore::new(InMemoryDetectionStore::default())),
        )
        .unwrap();

        let failed = engine.start_with(|_body| {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "thread limit reached",
            ))
        });
        assert!(matches!(failed, Err(EngineError::Spawn { .. })));
        assert!(!engine.is_running());
        assert_eq!(tally.opens(), 1);
        assert_eq!(tally.closes(), 1);

        assert_eq!(engine.try_start().unwrap(), StartOutcome::Started);
        assert_eq!(tally.opens(), 2);
        assert!(matches!(
            engine.try_stop().unwrap(),
            StopOutcome::Stopped { flushed: 0 }
        ));
        assert_eq!(tally.closes(), 2);
    }

    #[test]
    fn adjust_today_only_moves_todays_counter() {
        let engine = Engine::new(
            EngineSettings::default(),
            Box::new(ScriptedSource::frames(8, 8)),
            InferenceAdapter::new(Box::new(ScriptedBackend::default()), 0.5),
            Box::new(SharedStore::new(InMemoryDetectionStore::default())),
        )
        .unwrap();
        let today = Local::now().date_naive();

        engine.adjust_today(today, 1);
        engine.adjust_today(today, 1);
        assert_eq!(engine.today_detection_count(), 2);
        engine.adjust_today(today.pred_opt().unwrap(), 1);
        assert_eq!(engine.today_detection_count(), 2);
        engine.adjust_today(today, -5);
        assert_eq!(engine.today_detection_count(), 0);
    }

    #[test]
    fn status_rolls_over_at_midnight() {
        let yesterday = Local::now().date_naive().pred_opt().unwrap();
        let mut state = StatusState {
            running: true,
            today: yesterday,
            today_count: 9,
        };
        state.roll_over(Local::now().date_naive());
        assert_eq!(state.today_count, 0);
        assert_eq!(state.today, Local::now().date_naive());
    }
}
