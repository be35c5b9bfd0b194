//! skywatchd - drone detection & tracking daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + SKYWATCH_* environment overrides)
//! 2. Opens the detection database
//! 3. Builds the engine from the configured camera and detector
//! 4. Serves the HTTP API (control, history, video, events)
//! 5. Stops capture cleanly on Ctrl-C, flushing live tracks

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use skywatch::{
    api::{ApiConfig, ApiServer},
    Engine, EventHub, SharedStore, SkywatchConfig, SqliteDetectionStore,
};

#[derive(Parser, Debug)]
#[command(
    name = "skywatchd",
    version,
    about = "Camera capture, drone detection and tracking service"
)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "SKYWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Start capturing immediately instead of waiting for POST /camera/start.
    #[arg(long, env = "SKYWATCH_AUTOSTART")]
    autostart: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = SkywatchConfig::load_from(args.config.as_deref())?;

    let store = SharedStore::new(SqliteDetectionStore::open(&config.db_path)?);
    let hub = EventHub::new(config.events.queue_capacity);

    let engine = Arc::new(Engine::from_config(&config, Box::new(store.clone()))?);
    engine.set_event_sink(Box::new(hub.clone()));

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        stream: config.stream.clone(),
    };
    let api_handle = ApiServer::new(api_config, engine.clone(), store, hub).spawn()?;
    log::info!("skywatch api listening on http://{}", api_handle.addr);
    log::info!(
        "skywatchd running. camera={} detector={} db={}",
        config.camera.url,
        config.detector.backend,
        config.db_path
    );

    if args.autostart && !engine.start() {
        log::warn!("autostart failed; capture can be started with POST /camera/start");
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("skywatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping capture and API server...");

    // stop capture first so flushed tracks reach the database before exit
    engine.stop();
    api_handle.stop()?;
    log::info!(
        "skywatchd stopped. detections today: {}",
        engine.today_detection_count()
    );
    release(engine);

    Ok(())
}

/// Drop the engine once streaming connections have let go of it, which drains the
/// persistence queue.
fn release(mut engine: Arc<Engine>) {
    for _ in 0..50 {
        match Arc::try_unwrap(engine) {
            Ok(engine) => {
                drop(engine);
                return;
            }
            Err(shared) => {
                engine = shared;
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    log::warn!("engine still referenced at exit; pending detections may not be stored");
}
