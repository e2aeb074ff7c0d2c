//! Per-camera frame source.
//!
//! `FrameSource` owns one camera connection for its whole life:
//! `Disconnected -> Connecting -> Connected -> Disconnected`.
//!
//! - Connect failures retry with jittered exponential backoff. After
//!   `max_retries` attempts the source gives up, seals its queue and stays `Disconnected`.
//! - A read failure is a transient miss. `max_consecutive_read_failures` misses in a
//!   row drop the connection and start a new connect cycle.
//! - Frames are stamped at capture time and pushed drop-oldest into the camera queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use serde::Serialize;

use crate::config::{CameraConfig, Tunables};
use crate::frame::{FrameQueue, FrameSample, PushOutcome};
use crate::stats::CameraStatsCell;
use crate::Timestamp;

use super::transport::{CameraTransport, FrameStream};

/// Granularity of stop-flag checks while backing off.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Connect attempts per connect cycle.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_consecutive_read_failures: u32,
}

impl From<&Tunables> for ReconnectPolicy {
    fn from(t: &Tunables) -> Self {
        Self {
            max_retries: t.max_reconnect_retries,
            backoff_base: t.reconnect_backoff_base,
            backoff_max: t.reconnect_backoff_max,
            max_consecutive_read_failures: t.max_consecutive_read_failures,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }

    /// `delay_for_attempt` plus up to 25% random jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=0.25);
        delay + delay.mul_f64(jitter)
    }
}

enum PumpExit {
    Stopped,
    Reconnect,
}

pub struct FrameSource {
    camera: CameraConfig,
    transport: Arc<dyn CameraTransport>,
    queue: Arc<FrameQueue>,
    stats: Arc<CameraStatsCell>,
    policy: ReconnectPolicy,
    stop: Arc<AtomicBool>,
    sequence_no: u64,
}

impl FrameSource {
    pub fn new(
        camera: CameraConfig,
        transport: Arc<dyn CameraTransport>,
        queue: Arc<FrameQueue>,
        stats: Arc<CameraStatsCell>,
        policy: ReconnectPolicy,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            camera,
            transport,
            queue,
            stats,
            policy,
            stop,
            sequence_no: 0,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", self.camera.camera_id))
            .spawn(move || self.run())?;
        Ok(handle)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Capture loop. Returns on stop, on a closed queue, or after giving up on the camera.
    pub fn run(mut self) {
        loop {
            let Some(stream) = self.connect() else {
                break;
            };
            match self.pump(stream) {
                PumpExit::Stopped => break,
                PumpExit::Reconnect => {
                    self.stats.record_reconnect();
                    log::warn!(
                        "FrameSource[{}]: reconnecting to {}",
                        self.camera.camera_id,
                        self.camera.source_uri
                    );
                }
            }
        }
        self.stats.set_state(SourceState::Disconnected);
        log::info!("FrameSource[{}]: stopped", self.camera.camera_id);
    }

    /// One connect cycle. `None` when stopped or when every attempt failed.
    fn connect(&mut self) -> Option<Box<dyn FrameStream>> {
        let max = self.policy.max_retries.max(1);
        for attempt in 1..=max {
            if self.stopped() {
                return None;
            }
            self.stats.set_state(SourceState::Connecting);
            self.stats.record_connect_attempt();
            log::info!(
                "FrameSource[{}]: connecting to {} (attempt {}/{})",
                self.camera.camera_id,
                self.camera.source_uri,
                attempt,
                max
            );
            match self.transport.open(&self.camera) {
                Ok(stream) => {
                    self.stats.set_state(SourceState::Connected);
                    log::info!("FrameSource[{}]: connected", self.camera.camera_id);
                    return Some(stream);
                }
                Err(err) => {
                    self.stats.record_error(format!("connect failed: {err:#}"));
                    log::warn!(
                        "FrameSource[{}]: connect attempt {} failed: {:#}",
                        self.camera.camera_id,
                        attempt,
                        err
                    );
                    if attempt < max {
                        let delay = self.policy.jittered_delay(attempt);
                        if !self.sleep_unless_stopped(delay) {
                            return None;
                        }
                    }
                }
            }
        }
        self.stats.set_state(SourceState::Disconnected);
        // No more frames will arrive; let the detection side drain and exit.
        self.queue.seal();
        log::error!(
            "FrameSource[{}]: giving up on {} after {} connect attempts",
            self.camera.camera_id,
            self.camera.source_uri,
            max
        );
        None
    }

    fn pump(&mut self, mut stream: Box<dyn FrameStream>) -> PumpExit {
        let mut consecutive_failures = 0u32;
        while !self.stopped() {
            let image = match stream.next_frame() {
                Ok(image) => image,
                Err(err) => {
                    consecutive_failures += 1;
                    self.stats.record_error(format!("read failed: {err:#}"));
                    log::warn!(
                        "FrameSource[{}]: frame read failed ({} in a row): {:#}",
                        self.camera.camera_id,
                        consecutive_failures,
                        err
                    );
                    if consecutive_failures >= self.policy.max_consecutive_read_failures {
                        return PumpExit::Reconnect;
                    }
                    continue;
                }
            };
            consecutive_failures = 0;
            self.sequence_no += 1;
            let frame = FrameSample::new(
                self.camera.camera_id.as_str(),
                Timestamp::now(),
                self.sequence_no,
                image.width,
                image.height,
                image.pixels,
            );
            match self.queue.push(frame) {
                PushOutcome::Accepted => self.stats.record_frame(false),
                PushOutcome::DroppedOldest => self.stats.record_frame(true),
                PushOutcome::Closed => return PumpExit::Stopped,
            }
        }
        PumpExit::Stopped
    }

    /// Sleep for `duration`, waking early on stop. Returns false if stopped.
    fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }
}
