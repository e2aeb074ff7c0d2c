//! Per-camera runtime statistics.
//!
//! Each camera owns one `CameraStatsCell`, shared by its `FrameSource` and
//! `DetectionWorker`. Readers take snapshots; nothing outside that pair mutates it.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::ingest::SourceState;
use crate::Timestamp;

#[derive(Clone, Debug, Default, Serialize)]
pub struct CameraRuntimeStats {
    pub connected: bool,
    pub state: SourceState,
    /// Measured capture rate over the last completed one-second window.
    pub fps: f32,
    pub frame_count: u64,
    pub frames_dropped: u64,
    pub frames_skipped: u64,
    pub detection_count: u64,
    pub last_detection_time: Option<Timestamp>,
    pub error_count: u64,
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

struct FpsWindow {
    started: Instant,
    frames: u32,
}

struct Inner {
    stats: CameraRuntimeStats,
    window: FpsWindow,
}

pub struct CameraStatsCell {
    inner: Mutex<Inner>,
}

impl CameraStatsCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                stats: CameraRuntimeStats::default(),
                window: FpsWindow {
                    started: Instant::now(),
                    frames: 0,
                },
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> CameraRuntimeStats {
        self.lock().stats.clone()
    }

    pub(crate) fn set_state(&self, state: SourceState) {
        let mut inner = self.lock();
        inner.stats.state = state;
        inner.stats.connected = state == SourceState::Connected;
        if state != SourceState::Connected {
            inner.stats.fps = 0.0;
        }
    }

    pub(crate) fn record_connect_attempt(&self) {
        self.lock().stats.connect_attempts += 1;
    }

    pub(crate) fn record_reconnect(&self) {
        self.lock().stats.reconnects += 1;
    }

    pub(crate) fn record_error(&self, message: String) {
        let mut inner = self.lock();
        inner.stats.error_count += 1;
        inner.stats.last_error = Some(message);
    }

    pub(crate) fn record_frame(&self, dropped_oldest: bool) {
        let mut inner = self.lock();
        inner.stats.frame_count += 1;
        if dropped_oldest {
            inner.stats.frames_dropped += 1;
        }
        inner.window.frames += 1;
        let elapsed = inner.window.started.elapsed();
        if elapsed.as_secs_f32() >= 1.0 {
            inner.stats.fps = inner.window.frames as f32 / elapsed.as_secs_f32();
            inner.window = FpsWindow {
                started: Instant::now(),
                frames: 0,
            };
        }
    }

    pub(crate) fn record_skipped(&self) {
        self.lock().stats.frames_skipped += 1;
    }

    pub(crate) fn record_detection(&self, at: Timestamp) {
        let mut inner = self.lock();
        inner.stats.detection_count += 1;
        inner.stats.last_detection_time = Some(at);
    }
}

impl Default for CameraStatsCell {
    fn default() -> Self {
        Self::new()
    }
}
