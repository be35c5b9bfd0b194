//! HTTP surface: camera control, detection history, MJPEG video and server-sent events.
//!
//! A plain `TcpListener` accept loop on its own thread. Each connection is served on a
//! short-lived thread because `/video` and `/events` stream until the client leaves or
//! the server is stopped.

mod placeholder;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveDate};
use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::StreamSettings;
use crate::engine::{Engine, StartOutcome, StopOutcome};
use crate::events::{EngineEvent, EventHub};
use crate::storage::{DetectionStore, SharedStore, StoredDetection};
use crate::track::DetectionRecord;

use placeholder::{placeholder_jpeg, Placeholder};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_PAGE_LIMIT: usize = 100;
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub stream: StreamSettings,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            stream: StreamSettings {
                annotate: true,
                interval: Duration::from_millis(33),
                jpeg_quality: 80,
            },
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections and end open streams.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Everything a connection thread needs.
#[derive(Clone)]
struct ApiContext {
    engine: Arc<Engine>,
    store: SharedStore,
    hub: EventHub,
    stream: StreamSettings,
    shutdown: Arc<AtomicBool>,
}

pub struct ApiServer {
    cfg: ApiConfig,
    engine: Arc<Engine>,
    store: SharedStore,
    hub: EventHub,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, engine: Arc<Engine>, store: SharedStore, hub: EventHub) -> Self {
        Self {
            cfg,
            engine,
            store,
            hub,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = ApiContext {
            engine: self.engine,
            store: self.store,
            hub: self.hub,
            stream: self.cfg.stream,
            shutdown: shutdown.clone(),
        };
        let join = std::thread::Builder::new()
            .name("skywatch-api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx) {
                    log::error!("api: server stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: ApiContext) -> Result<()> {
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let conn_ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("skywatch-http".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &conn_ctx) {
                            log::warn!("api: request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("api: dropping connection from {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &ApiContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json(&mut stream, 403, &json!({"detail": "forbidden"}))?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json(&mut stream, 400, &json!({"detail": err.to_string()}))?;
            return Ok(());
        }
    };
    log::debug!("api: {} {}", request.method, request.path);

    if request.method == "OPTIONS" {
        return write_response(&mut stream, 204, "text/plain", b"");
    }

    let segments: Vec<&str> = request
        .path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    match (request.method.as_str(), segments.as_slice()) {
        ("GET", []) => write_json(
            &mut stream,
            200,
            &json!({
                "message": "Drone Tracking API",
                "version": env!("CARGO_PKG_VERSION"),
                "endpoints": [
                    "/video - Video stream",
                    "/camera/{action} - Camera control",
                    "/camera/status - Camera status",
                    "/detections/today - Today's detections",
                    "/detections - All detections",
                    "/events - Server-sent events",
                ],
            }),
        ),
        ("GET", ["health"]) => write_json(
            &mut stream,
            200,
            &json!({
                "status": "healthy",
                "camera_running": ctx.engine.is_running(),
                "timestamp": Local::now(),
            }),
        ),
        ("GET", ["camera", "status"]) => {
            let status = camera_status(&ctx.engine, "Camera status retrieved");
            write_json(&mut stream, 200, &status)
        }
        ("POST", ["camera", action]) => camera_control(&mut stream, &ctx.engine, action),
        ("GET", ["detections", "today"]) => {
            let date = Local::now().date_naive();
            write_rows(&mut stream, date, ctx.store.clone().list_for_date(date))
        }
        ("GET", ["detections", "date", raw]) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => write_rows(&mut stream, date, ctx.store.clone().list_for_date(date)),
            Err(_) => write_json(
                &mut stream,
                400,
                &json!({"detail": format!("invalid date '{}', expected YYYY-MM-DD", raw)}),
            ),
        },
        ("GET", ["detections"]) => {
            let (limit, offset) = match page(&request) {
                Ok(page) => page,
                Err(err) => {
                    return write_json(&mut stream, 400, &json!({"detail": err.to_string()}))
                }
            };
            match ctx.store.clone().list(limit, offset) {
                Ok(rows) => write_json(&mut stream, 200, &rows),
                Err(err) => store_failure(&mut stream, err),
            }
        }
        ("POST", ["detections"]) => create_detection(&mut stream, ctx, &request.body),
        ("DELETE", ["detections", raw]) => {
            let Ok(id) = raw.parse::<i64>() else {
                return write_json(&mut stream, 400, &json!({"detail": "invalid detection id"}));
            };
            delete_detection(&mut stream, ctx, id)
        }
        ("GET", ["video"]) => stream_video(&mut stream, ctx),
        ("GET", ["events"]) => stream_events(&mut stream, ctx),
        (
            _,
            [] | ["health"] | ["camera", ..] | ["detections", ..] | ["video"] | ["events"],
        ) => write_json(&mut stream, 405, &json!({"detail": "method not allowed"})),
        _ => write_json(&mut stream, 404, &json!({"detail": "not found"})),
    }
}

#[derive(Debug, Serialize)]
struct CameraStatus {
    is_running: bool,
    message: String,
    total_detections_today: u64,
}

fn camera_status(engine: &Engine, message: &str) -> CameraStatus {
    CameraStatus {
        is_running: engine.is_running(),
        message: message.to_string(),
        total_detections_today: engine.today_detection_count(),
    }
}

fn camera_control(stream: &mut TcpStream, engine: &Engine, action: &str) -> Result<()> {
    let message = match action.to_ascii_lowercase().as_str() {
        "start" => match engine.try_start() {
            Ok(StartOutcome::Started) => "Camera started successfully",
            Ok(StartOutcome::AlreadyRunning) => "Camera is already running",
            Err(err) => {
                log::error!("api: camera start failed: {}", err);
                return write_json(
                    stream,
                    500,
                    &json!({"detail": format!("Failed to start camera: {}", err)}),
                );
            }
        },
        "stop" => match engine.try_stop() {
            Ok(StopOutcome::Stopped { .. }) => "Camera stopped successfully",
            Ok(StopOutcome::AlreadyStopped) => "Camera is already stopped",
            Err(err) => {
                log::error!("api: camera stop failed: {}", err);
                return write_json(
                    stream,
                    500,
                    &json!({"detail": format!("Failed to stop camera: {}", err)}),
                );
            }
        },
        _ => {
            return write_json(
                stream,
                400,
                &json!({"detail": "Invalid action. Use 'start' or 'stop'"}),
            )
        }
    };
    write_json(stream, 200, &camera_status(engine, message))
}

fn page(request: &HttpRequest) -> Result<(usize, usize)> {
    let parse = |key: &str, default: usize| -> Result<usize> {
        match request.query.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
            None => Ok(default),
        }
    };
    Ok((parse("limit", DEFAULT_PAGE_LIMIT)?, parse("offset", 0)?))
}

/// Body of `POST /detections`. Omitted fields get neutral defaults.
#[derive(Debug, Deserialize)]
struct DetectionCreate {
    #[serde(default)]
    track_id: u64,
    detection_date: Option<NaiveDate>,
    start_time: DateTime<Local>,
    end_time: DateTime<Local>,
    peak_confidence: f32,
    #[serde(default)]
    frame_count: u32,
}

impl DetectionCreate {
    fn into_record(self) -> Result<DetectionRecord> {
        if self.end_time < self.start_time {
            return Err(anyhow!("end_time precedes start_time"));
        }
        if !(0.0..=1.0).contains(&self.peak_confidence) {
            return Err(anyhow!("peak_confidence must be within [0, 1]"));
        }
        Ok(DetectionRecord {
            track_id: self.track_id,
            detection_date: self
                .detection_date
                .unwrap_or_else(|| self.start_time.date_naive()),
            start_time: self.start_time,
            end_time: self.end_time,
            peak_confidence: self.peak_confidence,
            frame_count: self.frame_count,
        })
    }
}

fn write_rows(
    stream: &mut TcpStream,
    date: NaiveDate,
    rows: Result<Vec<StoredDetection>>,
) -> Result<()> {
    match rows {
        Ok(rows) => {
            log::info!("api: {} detections for {}", rows.len(), date);
            write_json(stream, 200, &rows)
        }
        Err(err) => store_failure(stream, err),
    }
}

fn store_failure(stream: &mut TcpStream, err: anyhow::Error) -> Result<()> {
    log::error!("api: detection store failed: {:#}", err);
    write_json(
        stream,
        500,
        &json!({"detail": format!("Detection store error: {}", err)}),
    )
}

fn delete_detection(stream: &mut TcpStream, ctx: &ApiContext, id: i64) -> Result<()> {
    let mut store = ctx.store.clone();
    let removed = store.get(id).and_then(|row| match row {
        Some(row) => Ok(store.delete(id)?.then_some(row)),
        None => Ok(None),
    });
    match removed {
        Ok(Some(row)) => {
            ctx.engine.adjust_today(row.record.detection_date, -1);
            write_json(
                stream,
                200,
                &json!({"message": "Detection deleted successfully"}),
            )
        }
        Ok(None) => write_json(stream, 404, &json!({"detail": "Detection not found"})),
        Err(err) => store_failure(stream, err),
    }
}

fn create_detection(stream: &mut TcpStream, ctx: &ApiContext, body: &[u8]) -> Result<()> {
    let record = match serde_json::from_slice::<DetectionCreate>(body)
        .map_err(anyhow::Error::from)
        .and_then(DetectionCreate::into_record)
    {
        Ok(record) => record,
        Err(err) => return write_json(stream, 400, &json!({"detail": err.to_string()})),
    };
    let mut store = ctx.store.clone();
    let stored = store.insert(&record).and_then(|id| {
        store
            .get(id)?
            .ok_or_else(|| anyhow!("detection {} vanished after insert", id))
    });
    match stored {
        Ok(stored) => {
            ctx.engine.adjust_today(stored.record.detection_date, 1);
            write_json(stream, 200, &stored)
        }
        Err(err) => store_failure(stream, err),
    }
}

fn stream_video(stream: &mut TcpStream, ctx: &ApiContext) -> Result<()> {
    log::info!("api: streaming video to {}", stream.peer_addr()?);
    let quality = ctx.stream.jpeg_quality;
    let stopped = placeholder_jpeg(Placeholder::CameraStopped, quality)?;
    let no_feed = placeholder_jpeg(Placeholder::NoFeed, quality)?;

    stream.write_all(
        b"HTTP/1.1 200 OK\r\n\
          Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
          Cache-Control: no-cache, no-store, must-revalidate\r\n\
          Pragma: no-cache\r\n\
          Expires: 0\r\n\
          Access-Control-Allow-Origin: *\r\n\
          Connection: close\r\n\r\n",
    )?;

    let mut last: Option<(u64, Vec<u8>)> = None;
    while !ctx.shutdown.load(Ordering::SeqCst) {
        let jpeg: &[u8] = if !ctx.engine.is_running() {
            stopped.as_slice()
        } else {
            match ctx.engine.latest_frame() {
                Some(frame) => {
                    let fresh = !matches!(&last, Some((seq, _)) if *seq == frame.sequence);
                    if fresh {
                        match frame.encode_jpeg(quality) {
                            Ok(bytes) => last = Some((frame.sequence, bytes)),
                            Err(err) => log::error!("api: failed to encode frame: {:#}", err),
                        }
                    }
                    match &last {
                        Some((_, bytes)) => bytes.as_slice(),
                        None => no_feed.as_slice(),
                    }
                }
                None => no_feed.as_slice(),
            }
        };

        let part = format!(
            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        );
        let written = stream
            .write_all(part.as_bytes())
            .and_then(|_| stream.write_all(jpeg))
            .and_then(|_| stream.write_all(b"\r\n"));
        if written.is_err() {
            log::info!("api: video client disconnected");
            return Ok(());
        }
        std::thread::sleep(ctx.stream.interval);
    }
    Ok(())
}

fn stream_events(stream: &mut TcpStream, ctx: &ApiContext) -> Result<()> {
    let subscription = ctx.hub.subscribe();
    stream.write_all(
        b"HTTP/1.1 200 OK\r\n\
          Content-Type: text/event-stream\r\n\
          Cache-Control: no-cache\r\n\
          Access-Control-Allow-Origin: *\r\n\
          Connection: keep-alive\r\n\r\n",
    )?;
    write_sse(stream, &EngineEvent::StatusUpdate(ctx.engine.status()))?;

    let poll = Duration::from_millis(250);
    let mut idle = Duration::ZERO;
    while !ctx.shutdown.load(Ordering::SeqCst) {
        match subscription.recv_timeout(poll) {
            Ok(event) => {
                idle = Duration::ZERO;
                if write_sse(stream, &event).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                idle += poll;
                if idle >= SSE_KEEPALIVE {
                    idle = Duration::ZERO;
                    if stream.write_all(b": keep-alive\n\n").is_err() {
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::info!("api: event stream closed");
    Ok(())
}

fn write_sse(stream: &mut TcpStream, event: &EngineEvent) -> Result<()> {
    let data = serde_json::to_string(event)?;
    let frame = format!("event: {}\ndata: {}\n\n", event.name(), data);
    stream.write_all(frame.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = match headers.get("content-length") {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        query,
        body,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn write_json<T: Serialize + ?Sized>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: GET, POST, DELETE, OPTIONS\r\nAccess-Control-Allow-Headers: *\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
}
