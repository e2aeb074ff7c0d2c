//! Dwell Attendance Engine
//!
//! This crate implements the camera ingestion and zone-based automatic attendance core.
//!
//! # Architecture
//!
//! Frames flow through a fixed pipeline, one pair of workers per camera:
//!
//! 1. **FrameSource** owns a camera connection and publishes timestamped frames.
//! 2. **FrameQueue** buffers frames with drop-oldest backpressure.
//! 3. **DetectionWorker** throttles recognition and emits detection events.
//! 4. **ZoneStateMachine** tracks dwell per (employee, zone) and fires at most once per episode.
//! 5. **AttendanceActionGate** validates a candidate clock-in/out against the attendance store.
//!
//! The engine enforces these invariants by construction:
//!
//! - At most one live dwell state per (employee, zone).
//! - An action fires at most once per dwell episode.
//! - An employee's current location never moves backwards in time.
//! - A frame queue never exceeds its capacity and producers never block on it.
//!
//! # Module Structure
//!
//! - `frame`: Frame samples and the bounded per-camera queue
//! - `ingest`: Camera transports and the per-camera `FrameSource`
//! - `detect`: The `Recognizer` seam and the per-camera `DetectionWorker`
//! - `zones`: Zone registry, dwell state machine, action gate
//! - `attendance` / `storage`: The attendance sink seam and its implementations
//! - `coordinator`: Lifecycle owner for all cameras plus the cleanup sweep

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod attendance;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod stats;
pub mod storage;
pub mod zones;

pub use attendance::{
    AttendanceAction, AttendanceRecord, AttendanceSink, AttendanceStatusSnapshot,
    InMemoryAttendanceSink,
};
pub use config::{CameraConfig, EngineConfig, Resolution, Tunables};
pub use coordinator::Coordinator;
pub use detect::{
    BoundingBox, DetectionEvent, DetectionHandler, DetectionWorker, Recognition, Recognizer,
    StubRecognizer, WorkerSettings,
};
pub use frame::{FrameQueue, FrameSample, PushOutcome};
pub use ingest::{
    CameraTransport, CapturedImage, FrameSource, FrameStream, ReconnectPolicy, SourceState,
    SyntheticTransport, TransportRegistry,
};
pub use stats::{CameraRuntimeStats, CameraStatsCell};
pub use storage::SqliteAttendanceSink;
pub use zones::{
    ActionDecision, ActionOutcome, AttendanceActionGate, DeclineReason, EmployeeLocation,
    GateDecision, MovementHistoryEntry, Point, SweepReport, TriggeredAction, ZoneDefinition,
    ZoneDwellState, ZoneEngineStats, ZoneOverview, ZoneRegistry, ZoneStateMachine, ZoneType,
};

// -------------------- Timestamps --------------------

/// Milliseconds since the Unix epoch.
///
/// Event timestamps drive every dwell, cooldown and eviction computation. Values may be
/// negative (before the epoch), which keeps scenario arithmetic simple in tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_millis(ms: i64) -> Self {
        Timestamp(ms)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Timestamp((secs * 1000.0).round() as i64)
    }

    /// Wall-clock now. A clock before the epoch reads as the epoch.
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timestamp(ms)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Elapsed time from `earlier` to `self`, saturating at zero.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        let delta = self.0.saturating_sub(earlier.0);
        Duration::from_millis(delta.max(0) as u64)
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        let ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_sub(ms))
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        let ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(ms))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let millis = self.0.unsigned_abs();
        write!(f, "{}{}.{:03}", sign, millis / 1000, millis % 1000)
    }
}

// -------------------- Identifiers --------------------

/// Validate a camera, zone or employee identifier.
///
/// Identifiers end up in log lines and database rows, so they are restricted to a
/// conservative character set.
pub fn validate_identifier(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("{} id must not be empty", kind));
    }
    if id.len() > 128 {
        return Err(anyhow!("{} id '{}' exceeds 128 characters", kind, id));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '-')))
    {
        return Err(anyhow!(
            "{} id '{}' contains invalid character {:?}",
            kind,
            id,
            bad
        ));
    }
    Ok(())
}
