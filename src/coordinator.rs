//! Lifecycle owner for cameras and the zone sweeper.
//!
//! Each running camera has two threads, `capture-<id>` (a `FrameSource`) and
//! `detect-<id>` (a `DetectionWorker`), joined by the camera's `FrameQueue`. Detection
//! events from every camera land in the shared `ZoneStateMachine`. One `zone-sweeper`
//! thread evicts stale dwell states and locations on `cleanup_interval`.
//!
//! Stopping never blocks forever: each join waits at most `stop_timeout`, after which
//! the thread is detached and a forced termination is logged.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::attendance::AttendanceSink;
use crate::config::{CameraConfig, EngineConfig, Tunables};
use crate::detect::{DetectionHandler, DetectionWorker, Recognizer, WorkerSettings};
use crate::frame::FrameQueue;
use crate::ingest::{FrameSource, ReconnectPolicy, TransportRegistry};
use crate::stats::{CameraRuntimeStats, CameraStatsCell};
use crate::zones::{
    AttendanceActionGate, EmployeeLocation, MovementHistoryEntry, ZoneEngineStats, ZoneOverview,
    ZoneRegistry, ZoneStateMachine,
};
use crate::Timestamp;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Threads and shared handles of one running camera.
struct CameraRuntime {
    queue: Arc<FrameQueue>,
    stop: Arc<AtomicBool>,
    capture: JoinHandle<()>,
    detect: Option<JoinHandle<()>>,
}

impl CameraRuntime {
    /// False once the capture thread has exited on its own, e.g. after giving up.
    fn is_live(&self) -> bool {
        !self.capture.is_finished()
    }
}

struct CameraSlot {
    config: CameraConfig,
    stats: Arc<CameraStatsCell>,
    runtime: Option<CameraRuntime>,
}

/// Stop flag the sweeper can sleep on.
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn stop(&self) {
        *self
            .stopped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        self.wake.notify_all();
    }

    /// Wait up to `timeout`. Returns true once stopped.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self
            .stopped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

struct Sweeper {
    signal: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

pub struct Coordinator {
    tunables: Tunables,
    derive_zones: bool,
    transports: Arc<TransportRegistry>,
    recognizer: Arc<dyn Recognizer>,
    engine: Arc<ZoneStateMachine>,
    cameras: Mutex<BTreeMap<String, CameraSlot>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Coordinator {
    pub fn new(
        config: EngineConfig,
        transports: Arc<TransportRegistry>,
        recognizer: Arc<dyn Recognizer>,
        sink: Arc<dyn AttendanceSink>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = config.zone_registry()?;
        let tunables = config.tunables.clone();
        let gate = AttendanceActionGate::new(
            sink,
            tunables.action_cooldown,
            tunables.min_work_duration,
        );
        let engine = Arc::new(ZoneStateMachine::new(registry, gate, &tunables));

        let cameras = config
            .cameras
            .into_iter()
            .map(|camera| {
                let slot = CameraSlot {
                    config: camera.clone(),
                    stats: Arc::new(CameraStatsCell::new()),
                    runtime: None,
                };
                (camera.camera_id, slot)
            })
            .collect();

        Ok(Self {
            tunables,
            derive_zones: config.zones.is_none(),
            transports,
            recognizer,
            engine,
            cameras: Mutex::new(cameras),
            sweeper: Mutex::new(None),
        })
    }

    fn cameras(&self) -> MutexGuard<'_, BTreeMap<String, CameraSlot>> {
        self.cameras
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Shared zone engine.
    pub fn engine(&self) -> &Arc<ZoneStateMachine> {
        &self.engine
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Start every enabled camera and the sweeper.
    ///
    /// A camera that fails to start is logged and left stopped; the others still run.
    pub fn start_monitoring(&self) -> Result<()> {
        self.recognizer.warm_up()?;
        self.start_sweeper()?;

        let camera_ids: Vec<String> = self
            .cameras()
            .values()
            .filter(|slot| {
                slot.config.enabled && !slot.runtime.as_ref().is_some_and(CameraRuntime::is_live)
            })
            .map(|slot| slot.config.camera_id.clone())
            .collect();
        for camera_id in camera_ids {
            if let Err(err) = self.start_camera(&camera_id) {
                log::error!("coordinator: camera {} failed to start: {:#}", camera_id, err);
            }
        }
        log::info!(
            "coordinator: monitoring {} camera(s) with recognizer {}",
            self.running_cameras().len(),
            self.recognizer.name()
        );
        Ok(())
    }

    /// Stop the sweeper and every camera. Returns once all threads are joined or timed out.
    pub fn stop_monitoring(&self) {
        self.stop_sweeper();
        let camera_ids: Vec<String> = self.cameras().keys().cloned().collect();
        for camera_id in camera_ids {
            // Unknown ids cannot occur here; the list was just taken from the map.
            let _ = self.stop_camera(&camera_id);
        }
        log::info!("coordinator: monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    pub fn running_cameras(&self) -> Vec<String> {
        self.cameras()
            .values()
            .filter(|slot| slot.runtime.as_ref().is_some_and(CameraRuntime::is_live))
            .map(|slot| slot.config.camera_id.clone())
            .collect()
    }

    pub fn camera_config(&self, camera_id: &str) -> Option<CameraConfig> {
        self.cameras()
            .get(camera_id)
            .map(|slot| slot.config.clone())
    }

    /// Start one camera's capture and detection threads with fresh stats.
    ///
    /// A camera whose capture thread gave up is reaped and started again.
    pub fn start_camera(&self, camera_id: &str) -> Result<()> {
        let mut cameras = self.cameras();
        let slot = cameras
            .get_mut(camera_id)
            .ok_or_else(|| anyhow!("unknown camera '{}'", camera_id))?;
        if slot.runtime.as_ref().is_some_and(|runtime| !runtime.is_live()) {
            if let Some(runtime) = slot.runtime.take() {
                shutdown_runtime(runtime, camera_id, self.deadline());
            }
        }
        if slot.runtime.is_some() {
            return Err(anyhow!("camera {} is already running", camera_id));
        }
        if !slot.config.enabled {
            return Err(anyhow!("camera {} is disabled", camera_id));
        }

        let transport = match self.transports.resolve(&slot.config.source_uri) {
            Ok(transport) => transport,
            Err(err) => {
                slot.stats.record_error(format!("{err:#}"));
                return Err(err);
            }
        };
        let stats = Arc::new(CameraStatsCell::new());
        let queue = Arc::new(FrameQueue::new(self.tunables.frame_queue_capacity));
        let stop = Arc::new(AtomicBool::new(false));

        let capture = FrameSource::new(
            slot.config.clone(),
            transport,
            queue.clone(),
            stats.clone(),
            ReconnectPolicy::from(&self.tunables),
            stop.clone(),
        )
        .spawn()?;

        let detect = if slot.config.detection_enabled {
            let handler: Arc<dyn DetectionHandler> = self.engine.clone();
            let spawned = DetectionWorker::new(
                camera_id,
                queue.clone(),
                self.recognizer.clone(),
                handler,
                stats.clone(),
                WorkerSettings::from(&self.tunables),
                stop.clone(),
            )
            .spawn();
            match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    stop.store(true, Ordering::SeqCst);
                    queue.close();
                    let name = format!("capture-{camera_id}");
                    join_with_timeout(capture, &name, self.deadline());
                    return Err(err);
                }
            }
        } else {
            None
        };

        slot.stats = stats;
        slot.runtime = Some(CameraRuntime {
            queue,
            stop,
            capture,
            detect,
        });
        log::info!(
            "coordinator: camera {} started ({}, detection {})",
            camera_id,
            slot.config.source_uri,
            if slot.config.detection_enabled { "on" } else { "off" }
        );
        Ok(())
    }

    /// Stop one camera. Returns false if any of its threads had to be abandoned.
    ///
    /// Stopping a camera that is not running is a no-op.
    pub fn stop_camera(&self, camera_id: &str) -> Result<bool> {
        let runtime = {
            let mut cameras = self.cameras();
            let slot = cameras
                .get_mut(camera_id)
                .ok_or_else(|| anyhow!("unknown camera '{}'", camera_id))?;
            slot.runtime.take()
        };
        let Some(runtime) = runtime else {
            return Ok(true);
        };
        let clean = shutdown_runtime(runtime, camera_id, self.deadline());
        log::info!("coordinator: camera {} stopped", camera_id);
        Ok(clean)
    }

    /// Stop, replace the configuration, and start again if enabled.
    ///
    /// Unknown camera ids are added. Derived zones are re-derived from the new locations.
    pub fn reconfigure_camera(&self, camera: CameraConfig) -> Result<()> {
        crate::validate_identifier("camera", &camera.camera_id)?;
        if camera.source_uri.trim().is_empty() {
            return Err(anyhow!("camera {} has an empty source_uri", camera.camera_id));
        }
        if camera.fps == 0 {
            return Err(anyhow!("camera {} fps must be greater than zero", camera.camera_id));
        }

        let camera_id = camera.camera_id.clone();
        if self.cameras().contains_key(&camera_id) {
            self.stop_camera(&camera_id)?;
        }

        let enabled = camera.enabled;
        {
            let mut cameras = self.cameras();
            let slot = cameras.entry(camera_id.clone()).or_insert_with(|| CameraSlot {
                config: camera.clone(),
                stats: Arc::new(CameraStatsCell::new()),
                runtime: None,
            });
            slot.config = camera;
        }
        log::info!("coordinator: camera {} reconfigured", camera_id);

        if self.derive_zones {
            self.rederive_zones()?;
        }
        if enabled && self.is_monitoring() {
            self.start_camera(&camera_id)?;
        }
        Ok(())
    }

    /// Replace the zone registry. Every referenced camera must be known.
    pub fn replace_zone_registry(&self, registry: ZoneRegistry) -> Result<()> {
        {
            let cameras = self.cameras();
            for zone in registry.zones() {
                for camera_id in &zone.camera_ids {
                    if !cameras.contains_key(camera_id) {
                        return Err(anyhow!(
                            "zone {} references unknown camera '{}'",
                            zone.zone_id,
                            camera_id
                        ));
                    }
                }
            }
        }
        self.engine.replace_registry(registry);
        Ok(())
    }

    /// Rebuild the registry from current camera locations and swap it in.
    pub fn rederive_zones(&self) -> Result<()> {
        let configs: Vec<CameraConfig> = self
            .cameras()
            .values()
            .map(|slot| slot.config.clone())
            .collect();
        let registry = ZoneRegistry::derive_from_cameras(&configs)?;
        self.engine.replace_registry(registry);
        Ok(())
    }

    pub fn camera_stats(&self) -> BTreeMap<String, CameraRuntimeStats> {
        self.cameras()
            .iter()
            .map(|(camera_id, slot)| (camera_id.clone(), slot.stats.snapshot()))
            .collect()
    }

    pub fn zone_overview(&self) -> BTreeMap<String, ZoneOverview> {
        self.engine.zone_overview()
    }

    pub fn zone_stats(&self) -> ZoneEngineStats {
        self.engine.stats()
    }

    pub fn employee_location(&self, employee_id: &str) -> Option<EmployeeLocation> {
        self.engine.employee_location(employee_id)
    }

    pub fn employee_locations(&self) -> BTreeMap<String, EmployeeLocation> {
        self.engine.employee_locations()
    }

    /// Movement history for the last `hours`, oldest first.
    pub fn export_movement_history(
        &self,
        employee_id: &str,
        hours: u32,
    ) -> Vec<MovementHistoryEntry> {
        self.engine
            .export_movement_history(employee_id, hours, Timestamp::now())
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.tunables.stop_timeout
    }

    fn start_sweeper(&self) -> Result<()> {
        let mut sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sweeper.is_some() {
            return Ok(());
        }

        let signal = Arc::new(StopSignal::new());
        let engine = self.engine.clone();
        let interval = self.tunables.cleanup_interval;
        let thread_signal = signal.clone();
        let handle = std::thread::Builder::new()
            .name("zone-sweeper".to_string())
            .spawn(move || {
                while !thread_signal.wait(interval) {
                    engine.sweep(Timestamp::now());
                }
            })?;
        *sweeper = Some(Sweeper { signal, handle });
        Ok(())
    }

    fn stop_sweeper(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.signal.stop();
            join_with_timeout(sweeper.handle, "zone-sweeper", self.deadline());
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

/// Signal a camera's threads to stop and join them by `deadline`.
fn shutdown_runtime(runtime: CameraRuntime, camera_id: &str, deadline: Instant) -> bool {
    runtime.stop.store(true, Ordering::SeqCst);
    runtime.queue.close();

    let capture_name = format!("capture-{camera_id}");
    let mut clean = join_with_timeout(runtime.capture, &capture_name, deadline);
    if let Some(detect) = runtime.detect {
        clean &= join_with_timeout(detect, &format!("detect-{camera_id}"), deadline);
    }
    clean
}

/// Join `handle` if it finishes before `deadline`; otherwise detach it and log.
///
/// Returns true when the thread was joined.
fn join_with_timeout(handle: JoinHandle<()>, name: &str, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::error!("coordinator: {} did not stop in time; forced termination", name);
            return false;
        }
        std::thread::sleep(JOIN_POLL_INTERVAL);
    }
    if handle.join().is_err() {
        log::error!("coordinator: {} panicked", name);
    }
    true
}
