use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDate};
use skywatch::api::{ApiConfig, ApiHandle, ApiServer};
use skywatch::detect::ScriptedBackend;
use skywatch::storage::StoredDetection;
use skywatch::{
    DetectionRecord, DetectionStore, Engine, EngineSettings, EventHub, InMemoryDetectionStore,
    InferenceAdapter, ScriptedSource, SharedStore,
};

/// A store whose disk is gone.
struct BrokenStore;

impl DetectionStore for BrokenStore {
    fn insert(&mut self, _record: &DetectionRecord) -> Result<i64> {
        Err(anyhow!("database is locked"))
    }

    fn get(&mut self, _id: i64) -> Result<Option<StoredDetection>> {
        Err(anyhow!("database is locked"))
    }

    fn list_for_date(&mut self, _date: NaiveDate) -> Result<Vec<StoredDetection>> {
        Err(anyhow!("database is locked"))
    }

    fn list(&mut self, _limit: usize, _offset: usize) -> Result<Vec<StoredDetection>> {
        Err(anyhow!("database is locked"))
    }

    fn delete(&mut self, _id: i64) -> Result<bool> {
        Err(anyhow!("database is locked"))
    }

    fn count_for_date(&mut self, _date: NaiveDate) -> Result<u64> {
        Err(anyhow!("database is locked"))
    }
}

struct Server {
    handle: ApiHandle,
    engine: Arc<Engine>,
}

fn spawn_server() -> Server {
    spawn_server_with(SharedStore::new(InMemoryDetectionStore::default()))
}

fn spawn_server_with(store: SharedStore) -> Server {
    let hub = EventHub::default();
    let source = ScriptedSource::frames(64, 48).with_interval(Duration::from_millis(5));
    let adapter = InferenceAdapter::new(Box::new(ScriptedBackend::default()), 0.5);
    let engine = Arc::new(
        Engine::new(
            EngineSettings::default(),
            Box::new(source),
            adapter,
            Box::new(store.clone()),
        )
        .expect("engine"),
    );
    engine.set_event_sink(Box::new(hub.clone()));

    let cfg = ApiConfig {
        addr: "127.0.0.1:0".to_string(),
        ..ApiConfig::default()
    };
    let handle = ApiServer::new(cfg, engine.clone(), store, hub)
        .spawn()
        .expect("spawn api");
    Server { handle, engine }
}

impl Server {
    fn shutdown(self) {
        self.engine.stop();
        self.handle.stop().expect("stop api");
    }
}

fn send(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    let payload = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("");
    let json = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(payload).expect("json body")
    };
    (status, json)
}

/// Read from a streaming response until `needle` has been seen.
fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut seen = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).expect("stream read");
        assert!(n > 0, "stream closed before '{}'", needle);
        seen.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&seen);
        if text.contains(needle) {
            return text.into_owned();
        }
    }
}

fn open_stream(addr: SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
    stream.write_all(request.as_bytes()).unwrap();
    stream
}

#[test]
fn health_and_index() {
    let server = spawn_server();
    let addr = server.handle.addr;

    let (status, body) = send(addr, "GET", "/health", None);
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["camera_running"], false);
    assert!(body["timestamp"].is_string());

    let (status, body) = send(addr, "GET", "/", None);
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Drone Tracking API");

    let (status, _) = send(addr, "OPTIONS", "/detections", None);
    assert_eq!(status, 204);
    let (status, _) = send(addr, "GET", "/nowhere", None);
    assert_eq!(status, 404);
    let (status, _) = send(addr, "PUT", "/health", None);
    assert_eq!(status, 405);

    server.shutdown();
}

#[test]
fn camera_control_round_trip() {
    let server = spawn_server();
    let addr = server.handle.addr;

    let (status, body) = send(addr, "POST", "/camera/start", None);
    assert_eq!(status, 200);
    assert_eq!(body["is_running"], true);
    assert_eq!(body["message"], "Camera started successfully");

    let (_, body) = send(addr, "POST", "/camera/START", None);
    assert_eq!(body["message"], "Camera is already running");

    let (status, body) = send(addr, "GET", "/camera/status", None);
    assert_eq!(status, 200);
    assert_eq!(body["is_running"], true);
    assert_eq!(body["total_detections_today"], 0);

    let (status, body) = send(addr, "POST", "/camera/stop", None);
    assert_eq!(status, 200);
    assert_eq!(body["is_running"], false);
    assert_eq!(body["message"], "Camera stopped successfully");

    let (_, body) = send(addr, "POST", "/camera/stop", None);
    assert_eq!(body["message"], "Camera is already stopped");

    let (status, body) = send(addr, "POST", "/camera/launch", None);
    assert_eq!(status, 400);
    assert_eq!(body["detail"], "Invalid action. Use 'start' or 'stop'");

    server.shutdown();
}

#[test]
fn detection_history_crud() {
    let server = spawn_server();
    let addr = server.handle.addr;

    let now = Local::now();
    let create = format!(
        r#"{{"start_time": "{}", "end_time": "{}", "peak_confidence": 0.8, "frame_count": 4}}"#,
        now.to_rfc3339(),
        (now + chrono::Duration::seconds(2)).to_rfc3339()
    );
    let (status, created) = send(addr, "POST", "/detections", Some(&create));
    assert_eq!(status, 200);
    let id = created["id"].as_i64().expect("id");
    assert_eq!(created["frame_count"], 4);
    assert_eq!(
        created["detection_date"],
        now.date_naive().format("%Y-%m-%d").to_string()
    );

    let (status, today) = send(addr, "GET", "/detections/today", None);
    assert_eq!(status, 200);
    assert_eq!(today.as_array().map(Vec::len), Some(1));

    let (_, page) = send(addr, "GET", "/detections?limit=10&offset=0", None);
    assert_eq!(page[0]["id"], id);
    let (_, page) = send(addr, "GET", "/detections?offset=1", None);
    assert_eq!(page.as_array().map(Vec::len), Some(0));
    let (status, _) = send(addr, "GET", "/detections?limit=many", None);
    assert_eq!(status, 400);

    let (status, old) = send(addr, "GET", "/detections/date/2020-01-01", None);
    assert_eq!(status, 200);
    assert_eq!(old.as_array().map(Vec::len), Some(0));
    let (status, _) = send(addr, "GET", "/detections/date/yesterday", None);
    assert_eq!(status, 400);

    let bad = format!(
        r#"{{"start_time": "{}", "end_time": "{}", "peak_confidence": 0.8}}"#,
        now.to_rfc3339(),
        (now - chrono::Duration::seconds(2)).to_rfc3339()
    );
    let (status, _) = send(addr, "POST", "/detections", Some(&bad));
    assert_eq!(status, 400);

    let path = format!("/detections/{}", id);
    let (status, body) = send(addr, "DELETE", &path, None);
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Detection deleted successfully");
    let (status, body) = send(addr, "DELETE", &path, None);
    assert_eq!(status, 404);
    assert_eq!(body["detail"], "Detection not found");

    server.shutdown();
}

#[test]
fn events_stream_starts_with_status_and_follows_engine() {
    let server = spawn_server();
    let addr = server.handle.addr;

    let mut events = open_stream(addr, "/events");
    let head = read_until(&mut events, "\"is_running\":false");
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("text/event-stream"));
    assert!(head.contains("event: status_update"));

    let (status, _) = send(addr, "POST", "/camera/start", None);
    assert_eq!(status, 200);
    let next = read_until(&mut events, "\"is_running\":true");
    assert!(next.contains("\"event\":\"status_update\""));

    drop(events);
    server.shutdown();
}

#[test]
fn video_stream_serves_jpeg_parts() {
    let server = spawn_server();
    let addr = server.handle.addr;

    let mut video = open_stream(addr, "/video");
    let text = read_until(&mut video, "Content-Type: image/jpeg");
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("--frame"));

    server.engine.start();
    let mut video = open_stream(addr, "/video");
    read_until(&mut video, "Content-Length:");

    drop(video);
    server.shutdown();
}

fn today_counts(addr: SocketAddr) -> (usize, u64) {
    let (_, rows) = send(addr, "GET", "/detections/today", None);
    let (_, status) = send(addr, "GET", "/camera/status", None);
    (
        rows.as_array().map(Vec::len).unwrap_or(0),
        status["total_detections_today"].as_u64().expect("counter"),
    )
}

#[test]
fn status_counter_follows_history_edits() {
    let server = spawn_server();
    let addr = server.handle.addr;

    let now = Local::now();
    let today = format!(
        r#"{{"start_time": "{}", "end_time": "{}", "peak_confidence": 0.7}}"#,
        now.to_rfc3339(),
        now.to_rfc3339()
    );
    let (_, first) = send(addr, "POST", "/detections", Some(&today));
    send(addr, "POST", "/detections", Some(&today));
    assert_eq!(today_counts(addr), (2, 2));

    // rows for other days leave today's counter alone
    let old = r#"{"start_time": "2020-01-01T10:00:00+00:00", "end_time": "2020-01-01T10:00:05+00:00", "peak_confidence": 0.9}"#;
    let (status, old_row) = send(addr, "POST", "/detections", Some(old));
    assert_eq!(status, 200);
    assert_eq!(today_counts(addr), (2, 2));

    send(addr, "DELETE", &format!("/detections/{}", first["id"]), None);
    assert_eq!(today_counts(addr), (1, 1));
    send(addr, "DELETE", &format!("/detections/{}", old_row["id"]), None);
    assert_eq!(today_counts(addr), (1, 1));
    let (status, _) = send(addr, "DELETE", &format!("/detections/{}", first["id"]), None);
    assert_eq!(status, 404);
    assert_eq!(today_counts(addr), (1, 1));

    server.shutdown();
}

#[test]
fn store_failures_answer_with_500() {
    let server = spawn_server_with(SharedStore::new(BrokenStore));
    let addr = server.handle.addr;

    for (method, path) in [
        ("GET", "/detections"),
        ("GET", "/detections/today"),
        ("GET", "/detections/date/2024-06-01"),
        ("DELETE", "/detections/1"),
    ] {
        let (status, body) = send(addr, method, path, None);
        assert_eq!(status, 500, "{} {}", method, path);
        assert!(body["detail"].as_str().unwrap().contains("database is locked"));
    }

    let now = Local::now().to_rfc3339();
    let create = format!(
        r#"{{"start_time": "{}", "end_time": "{}", "peak_confidence": 0.7}}"#,
        now, now
    );
    let (status, _) = send(addr, "POST", "/detections", Some(&create));
    assert_eq!(status, 500);
    let (_, camera) = send(addr, "GET", "/camera/status", None);
    assert_eq!(camera["total_detections_today"], 0);

    server.shutdown();
}
