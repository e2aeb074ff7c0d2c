//! attendanced - multi-camera attendance daemon
//!
//! This daemon:
//! 1. Loads the engine configuration (file named by ATTENDANCE_CONFIG, env overrides)
//! 2. Opens the attendance store (SQLite when db_path is set, in-memory otherwise)
//! 3. Starts one capture and one detection thread per enabled camera
//! 4. Logs camera and zone stats periodically
//! 5. Stops every camera on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use dwell_attendance::{
    AttendanceSink, Coordinator, EngineConfig, InMemoryAttendanceSink, SqliteAttendanceSink,
    StubRecognizer, TransportRegistry,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Engine config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "ATTENDANCE_CONFIG")]
    config: Option<PathBuf>,
    /// Seconds between stats log lines. 0 disables them.
    #[arg(long, default_value_t = 30)]
    stats_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load_from_path(path)?,
        None => EngineConfig::load()?,
    };

    let sink: Arc<dyn AttendanceSink> = match &config.db_path {
        Some(db_path) => {
            log::info!("attendance store: {}", db_path);
            Arc::new(SqliteAttendanceSink::open(db_path)?)
        }
        None => {
            log::warn!("attendance store: in-memory (set db_path to persist)");
            Arc::new(InMemoryAttendanceSink::new())
        }
    };
    let recognizer = Arc::new(StubRecognizer::new(config.recognizer_roster.clone()));
    let transports = Arc::new(TransportRegistry::with_defaults());

    let coordinator = Coordinator::new(config, transports, recognizer, sink)?;
    coordinator.start_monitoring()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    log::info!("attendanced running, waiting for shutdown signal (Ctrl-C)...");
    if args.stats_interval_secs == 0 {
        let _ = rx.recv();
    } else {
        let interval = Duration::from_secs(args.stats_interval_secs);
        while let Err(mpsc::RecvTimeoutError::Timeout) = rx.recv_timeout(interval) {
            log_stats(&coordinator);
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    coordinator.stop_monitoring();
    log_stats(&coordinator);
    Ok(())
}

fn log_stats(coordinator: &Coordinator) {
    for (camera_id, stats) in coordinator.camera_stats() {
        log::info!(
            "camera {}: {:?} fps={:.1} frames={} dropped={} skipped={} detections={} errors={}",
            camera_id,
            stats.state,
            stats.fps,
            stats.frame_count,
            stats.frames_dropped,
            stats.frames_skipped,
            stats.detection_count,
            stats.error_count
        );
    }
    match serde_json::to_string(&coordinator.zone_overview()) {
        Ok(overview) => log::info!("zones: {}", overview),
        Err(err) => log::warn!("zones: overview not serializable: {}", err),
    }
    let engine = coordinator.zone_stats();
    log::info!(
        "actions: fired={} declined={} failed={} events={}",
        engine.fired_actions,
        engine.declined_actions,
        engine.failed_actions,
        engine.events_processed
    );
}
