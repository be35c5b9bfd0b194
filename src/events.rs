//! Engine events and the sinks that receive them.
//!
//! Events leave the capture thread through a bounded queue and are delivered on the
//! engine's dispatcher thread, so a sink may block without stalling capture. It only
//! delays (and eventually drops) later events.

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::track::DetectionRecord;

/// A completed, reported track.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionSummary {
    #[serde(flatten)]
    pub record: DetectionRecord,
    pub duration_seconds: f64,
    /// Daily counter after this detection was counted.
    pub total_detections_today: u64,
}

impl DetectionSummary {
    pub fn new(record: DetectionRecord, total_detections_today: u64) -> Self {
        let duration_seconds = (record.end_time - record.start_time)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        Self {
            record,
            duration_seconds,
            total_detections_today,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub is_running: bool,
    #[serde(rename = "total_detections_today")]
    pub today_detection_count: u64,
    pub timestamp: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    NewDetection(DetectionSummary),
    StatusUpdate(StatusSnapshot),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::NewDetection(_) => "new_detection",
            EngineEvent::StatusUpdate(_) => "status_update",
        }
    }
}

pub trait EventSink: Send {
    fn deliver(&mut self, event: &EngineEvent);
}

/// Default sink: events only show up in the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn deliver(&mut self, event: &EngineEvent) {
        log::debug!("events: {} (no subscriber attached)", event.name());
    }
}

pub type DetectionCallback = Box<dyn FnMut(&DetectionSummary) + Send>;
pub type StatusCallback = Box<dyn FnMut(&StatusSnapshot) + Send>;

/// Routes each event kind to its own closure.
pub struct CallbackSink {
    on_new_detection: DetectionCallback,
    on_status_update: StatusCallback,
}

impl CallbackSink {
    pub fn new(on_new_detection: DetectionCallback, on_status_update: StatusCallback) -> Self {
        Self {
            on_new_detection,
            on_status_update,
        }
    }
}

impl EventSink for CallbackSink {
    fn deliver(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::NewDetection(summary) => (self.on_new_detection)(summary),
            EngineEvent::StatusUpdate(status) => (self.on_status_update)(status),
        }
    }
}

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Fans events out to any number of subscribers.
///
/// Each subscriber has its own bounded queue. A subscriber that falls a full queue
/// behind, or whose receiving end is gone, is removed; it sees the channel disconnect
/// once it has drained what was queued.
#[derive(Clone)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<Sender<EngineEvent>>>>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = crossbeam_channel::bounded(self.capacity);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.push(tx);
        log::info!("events: subscriber connected (total={})", subscribers.len());
        Subscription { receiver: rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publish(&self, event: &EngineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("events: dropping subscriber that fell behind");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        if subscribers.len() != before {
            log::info!(
                "events: subscriber disconnected (total={})",
                subscribers.len()
            );
        }
    }
}

impl EventSink for EventHub {
    fn deliver(&mut self, event: &EngineEvent) {
        self.publish(event);
    }
}

/// Receiving end of an `EventHub` subscription.
pub struct Subscription {
    receiver: Receiver<EngineEvent>,
}

impl Subscription {
    /// `Disconnected` once the hub has dropped this subscriber and the queue is empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<EngineEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<EngineEvent> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status(running: bool) -> EngineEvent {
        EngineEvent::StatusUpdate(StatusSnapshot {
            is_running: running,
            today_detection_count: 3,
            timestamp: Local::now(),
            message: None,
        })
    }

    fn summary() -> DetectionSummary {
        let start = Local
            .with_ymd_and_hms(2024, 6, 1, 9, 30, 0)
            .single()
            .unwrap();
        DetectionSummary::new(
            DetectionRecord {
                track_id: 4,
                detection_date: start.date_naive(),
                start_time: start,
                end_time: start + chrono::Duration::milliseconds(2_500),
                peak_confidence: 0.9,
                frame_count: 75,
            },
            1,
        )
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(status(true)).unwrap();
        assert_eq!(json["event"], "status_update");
        assert_eq!(json["is_running"], true);
        assert_eq!(json["total_detections_today"], 3);
        assert!(json.get("message").is_none());

        let json = serde_json::to_value(EngineEvent::NewDetection(summary())).unwrap();
        assert_eq!(json["event"], "new_detection");
        assert_eq!(json["track_id"], 4);
        assert_eq!(json["detection_date"], "2024-06-01");
        assert_eq!(json["duration_seconds"], 2.5);
    }

    #[test]
    fn callback_sink_routes_by_kind() {
        let detections = Arc::new(AtomicUsize::new(0));
        let statuses = Arc::new(AtomicUsize::new(0));
        let (d, s) = (detections.clone(), statuses.clone());
        let mut sink = CallbackSink::new(
            Box::new(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
        );
        sink.deliver(&status(true));
        sink.deliver(&EngineEvent::NewDetection(summary()));
        sink.deliver(&status(false));
        assert_eq!(detections.load(Ordering::SeqCst), 1);
        assert_eq!(statuses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hub_fans_out_and_prunes() {
        let hub = EventHub::new(1);
        let fast = hub.subscribe();
        let slow = hub.subscribe();
        let gone = hub.subscribe();
        drop(gone);
        assert_eq!(hub.subscriber_count(), 3);

        hub.publish(&status(true));
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(fast.try_recv().map(|e| e.name()), Some("status_update"));

        // `slow` still holds the first event, so its queue of one is full
        let mut sink = hub.clone();
        sink.deliver(&status(false));
        assert_eq!(hub.subscriber_count(), 1);
        assert!(matches!(
            fast.try_recv(),
            Some(EngineEvent::StatusUpdate(StatusSnapshot {
                is_running: false,
                ..
            }))
        ));

        assert!(matches!(
            slow.recv_timeout(Duration::from_millis(10)),
            Ok(EngineEvent::StatusUpdate(_))
        ));
        assert_eq!(
            slow.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        );
        assert_eq!(
            fast.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
    }
}
