use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::zones::{Point, TriggeredAction, ZoneDefinition, ZoneRegistry, ZoneType};

const DEFAULT_CAMERA_ID: &str = "cam_entrance";
const DEFAULT_CAMERA_URI: &str = "stub://entrance";
const DEFAULT_CAMERA_LOCATION: &str = "Main Entrance";
const DEFAULT_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_ROSTER: &[&str] = &["EMP001", "EMP002", "EMP003"];

pub const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.6;
pub const DEFAULT_MOVEMENT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ACTION_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_MIN_WORK_DURATION: Duration = Duration::from_secs(600);
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_MAX_RECONNECT_RETRIES: u32 = 5;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_READ_FAILURES: u32 = 10;
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_QUEUE_POP_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_HISTORY_CAP: usize = 50;

// ----------------------------------------------------------------------------
// On-disk shape
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    db_path: Option<String>,
    cameras: Option<Vec<CameraConfigFile>>,
    zones: Option<Vec<ZoneConfigFile>>,
    tunables: Option<TunablesFile>,
    recognizer: Option<RecognizerConfigFile>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    camera_id: String,
    name: Option<String>,
    source_uri: String,
    location: Option<String>,
    enabled: Option<bool>,
    detection_enabled: Option<bool>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ZoneConfigFile {
    zone_id: String,
    name: Option<String>,
    camera_ids: Vec<String>,
    zone_type: ZoneType,
    dwell_time_secs: Option<f64>,
    triggered_action: Option<TriggeredAction>,
    region: Option<Vec<[f32; 2]>>,
}

#[derive(Debug, Deserialize, Default)]
struct TunablesFile {
    detection_interval_secs: Option<f64>,
    min_confidence_threshold: Option<f32>,
    movement_timeout_secs: Option<f64>,
    action_cooldown_secs: Option<f64>,
    min_work_duration_secs: Option<f64>,
    frame_queue_capacity: Option<usize>,
    max_reconnect_retries: Option<u32>,
    reconnect_backoff_base_secs: Option<f64>,
    reconnect_backoff_max_secs: Option<f64>,
    max_consecutive_read_failures: Option<u32>,
    cleanup_interval_secs: Option<f64>,
    stop_timeout_secs: Option<f64>,
    queue_pop_timeout_secs: Option<f64>,
    movement_history_cap: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognizerConfigFile {
    roster: Option<Vec<String>>,
}

// ----------------------------------------------------------------------------
// Runtime shape
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// One camera. Immutable once started; reconfigure with stop then start.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraConfig {
    pub camera_id: String,
    pub name: String,
    pub source_uri: String,
    pub location: String,
    pub enabled: bool,
    pub detection_enabled: bool,
    pub fps: u32,
    pub resolution: Resolution,
}

impl CameraConfig {
    pub fn new(camera_id: &str, source_uri: &str, location: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            name: camera_id.to_string(),
            source_uri: source_uri.to_string(),
            location: location.to_string(),
            enabled: true,
            detection_enabled: true,
            fps: DEFAULT_FPS,
            resolution: Resolution {
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
            },
        }
    }
}

/// Engine tunables.
#[derive(Clone, Debug, PartialEq)]
pub struct Tunables {
    pub detection_interval: Duration,
    pub min_confidence_threshold: f32,
    pub movement_timeout: Duration,
    pub action_cooldown: Duration,
    pub min_work_duration: Duration,
    pub frame_queue_capacity: usize,
    pub max_reconnect_retries: u32,
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_max: Duration,
    pub max_consecutive_read_failures: u32,
    pub cleanup_interval: Duration,
    pub stop_timeout: Duration,
    pub queue_pop_timeout: Duration,
    pub movement_history_cap: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            detection_interval: DEFAULT_DETECTION_INTERVAL,
            min_confidence_threshold: DEFAULT_MIN_CONFIDENCE,
            movement_timeout: DEFAULT_MOVEMENT_TIMEOUT,
            action_cooldown: DEFAULT_ACTION_COOLDOWN,
            min_work_duration: DEFAULT_MIN_WORK_DURATION,
            frame_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_reconnect_retries: DEFAULT_MAX_RECONNECT_RETRIES,
            reconnect_backoff_base: DEFAULT_BACKOFF_BASE,
            reconnect_backoff_max: DEFAULT_BACKOFF_MAX,
            max_consecutive_read_failures: DEFAULT_MAX_READ_FAILURES,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            queue_pop_timeout: DEFAULT_QUEUE_POP_TIMEOUT,
            movement_history_cap: DEFAULT_HISTORY_CAP,
        }
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence_threshold) {
            return Err(anyhow!(
                "min_confidence_threshold must be within [0, 1], got {}",
                self.min_confidence_threshold
            ));
        }
        if self.frame_queue_capacity == 0 {
            return Err(anyhow!("frame_queue_capacity must be at least 1"));
        }
        if self.max_reconnect_retries == 0 {
            return Err(anyhow!("max_reconnect_retries must be at least 1"));
        }
        if self.max_consecutive_read_failures == 0 {
            return Err(anyhow!("max_consecutive_read_failures must be at least 1"));
        }
        if self.movement_history_cap == 0 {
            return Err(anyhow!("movement_history_cap must be at least 1"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(anyhow!("cleanup_interval must be greater than zero"));
        }
        if self.queue_pop_timeout.is_zero() {
            return Err(anyhow!("queue_pop_timeout must be greater than zero"));
        }
        if self.reconnect_backoff_max < self.reconnect_backoff_base {
            return Err(anyhow!(
                "reconnect_backoff_max must not be below reconnect_backoff_base"
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// SQLite attendance store. `None` keeps attendance in memory.
    pub db_path: Option<String>,
    pub cameras: Vec<CameraConfig>,
    /// Explicit zones. `None` derives zones from camera locations.
    pub zones: Option<Vec<ZoneDefinition>>,
    pub tunables: Tunables,
    /// Employee ids the stub recognizer may report.
    pub recognizer_roster: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            cameras: vec![CameraConfig::new(
                DEFAULT_CAMERA_ID,
                DEFAULT_CAMERA_URI,
                DEFAULT_CAMERA_LOCATION,
            )],
            zones: None,
            tunables: Tunables::default(),
            recognizer_roster: DEFAULT_ROSTER.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    /// Load from `ATTENDANCE_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ATTENDANCE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit path without consulting `ATTENDANCE_CONFIG`.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Result<Self> {
        let defaults = Self::default();

        let cameras = match file.cameras {
            Some(cameras) => cameras.into_iter().map(camera_from_file).collect(),
            None => defaults.cameras,
        };

        let zones = match file.zones {
            Some(zones) => Some(
                zones
                    .into_iter()
                    .map(zone_from_file)
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };

        let tunables = tunables_from_file(file.tunables.unwrap_or_default())?;

        let recognizer_roster = file
            .recognizer
            .and_then(|r| r.roster)
            .unwrap_or(defaults.recognizer_roster);

        Ok(Self {
            db_path: file.db_path,
            cameras,
            zones,
            tunables,
            recognizer_roster,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("ATTENDANCE_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = Some(path);
            }
        }
        if let Ok(value) = std::env::var("ATTENDANCE_MIN_CONFIDENCE") {
            self.tunables.min_confidence_threshold = value.trim().parse().map_err(|_| {
                anyhow!("ATTENDANCE_MIN_CONFIDENCE must be a number between 0 and 1")
            })?;
        }
        if let Some(d) = env_secs("ATTENDANCE_DETECTION_INTERVAL_SECS")? {
            self.tunables.detection_interval = d;
        }
        if let Some(d) = env_secs("ATTENDANCE_MOVEMENT_TIMEOUT_SECS")? {
            self.tunables.movement_timeout = d;
        }
        if let Some(d) = env_secs("ATTENDANCE_ACTION_COOLDOWN_SECS")? {
            self.tunables.action_cooldown = d;
        }
        if let Some(d) = env_secs("ATTENDANCE_MIN_WORK_SECS")? {
            self.tunables.min_work_duration = d;
        }
        if let Ok(value) = std::env::var("ATTENDANCE_QUEUE_CAPACITY") {
            self.tunables.frame_queue_capacity = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("ATTENDANCE_QUEUE_CAPACITY must be a positive integer"))?;
        }
        if let Ok(value) = std::env::var("ATTENDANCE_MAX_RECONNECT_RETRIES") {
            self.tunables.max_reconnect_retries = value.trim().parse().map_err(|_| {
                anyhow!("ATTENDANCE_MAX_RECONNECT_RETRIES must be a positive integer")
            })?;
        }
        Ok(())
    }

    /// Check identifiers, camera settings, zone references and tunables.
    pub fn validate(&self) -> Result<()> {
        self.tunables.validate()?;

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            crate::validate_identifier("camera", &camera.camera_id)?;
            if !seen.insert(camera.camera_id.as_str()) {
                return Err(anyhow!("duplicate camera id '{}'", camera.camera_id));
            }
            if camera.source_uri.trim().is_empty() {
                return Err(anyhow!("camera {} has an empty source_uri", camera.camera_id));
            }
            if camera.fps == 0 {
                return Err(anyhow!("camera {} fps must be greater than zero", camera.camera_id));
            }
        }

        let registry = self.zone_registry()?;
        for zone in registry.zones() {
            for camera_id in &zone.camera_ids {
                if !seen.contains(camera_id.as_str()) {
                    return Err(anyhow!(
                        "zone {} references unknown camera '{}'",
                        zone.zone_id,
                        camera_id
                    ));
                }
            }
        }

        for employee_id in &self.recognizer_roster {
            crate::validate_identifier("employee", employee_id)?;
        }
        Ok(())
    }

    /// Build the zone registry: explicit zones when configured, otherwise derived from
    /// camera locations.
    pub fn zone_registry(&self) -> Result<ZoneRegistry> {
        match &self.zones {
            Some(zones) => ZoneRegistry::new(zones.clone()),
            None => ZoneRegistry::derive_from_cameras(&self.cameras),
        }
    }
}

fn camera_from_file(file: CameraConfigFile) -> CameraConfig {
    CameraConfig {
        name: file.name.unwrap_or_else(|| file.camera_id.clone()),
        location: file.location.unwrap_or_default(),
        enabled: file.enabled.unwrap_or(true),
        detection_enabled: file.detection_enabled.unwrap_or(true),
        fps: file.fps.unwrap_or(DEFAULT_FPS),
        resolution: Resolution {
            width: file.width.unwrap_or(DEFAULT_WIDTH),
            height: file.height.unwrap_or(DEFAULT_HEIGHT),
        },
        camera_id: file.camera_id,
        source_uri: file.source_uri,
    }
}

fn zone_from_file(file: ZoneConfigFile) -> Result<ZoneDefinition> {
    let dwell_time_required = match file.dwell_time_secs {
        Some(secs) => secs_to_duration("dwell_time_secs", secs)?,
        None => file.zone_type.default_dwell_time(),
    };
    Ok(ZoneDefinition {
        name: file.name.unwrap_or_else(|| file.zone_id.clone()),
        zone_id: file.zone_id,
        camera_ids: file.camera_ids,
        dwell_time_required,
        triggered_action: file
            .triggered_action
            .unwrap_or_else(|| file.zone_type.default_action()),
        zone_type: file.zone_type,
        region: file
            .region
            .map(|points| points.into_iter().map(|[x, y]| Point { x, y }).collect()),
    })
}

fn tunables_from_file(file: TunablesFile) -> Result<Tunables> {
    let d = Tunables::default();
    let secs_or = |field: &str, value: Option<f64>, default: Duration| -> Result<Duration> {
        match value {
            Some(secs) => secs_to_duration(field, secs),
            None => Ok(default),
        }
    };
    Ok(Tunables {
        detection_interval: secs_or(
            "detection_interval_secs",
            file.detection_interval_secs,
            d.detection_interval,
        )?,
        min_confidence_threshold: file
            .min_confidence_threshold
            .unwrap_or(d.min_confidence_threshold),
        movement_timeout: secs_or(
            "movement_timeout_secs",
            file.movement_timeout_secs,
            d.movement_timeout,
        )?,
        action_cooldown: secs_or(
            "action_cooldown_secs",
            file.action_cooldown_secs,
            d.action_cooldown,
        )?,
        min_work_duration: secs_or(
            "min_work_duration_secs",
            file.min_work_duration_secs,
            d.min_work_duration,
        )?,
        frame_queue_capacity: file.frame_queue_capacity.unwrap_or(d.frame_queue_capacity),
        max_reconnect_retries: file.max_reconnect_retries.unwrap_or(d.max_reconnect_retries),
        reconnect_backoff_base: secs_or(
            "reconnect_backoff_base_secs",
            file.reconnect_backoff_base_secs,
            d.reconnect_backoff_base,
        )?,
        reconnect_backoff_max: secs_or(
            "reconnect_backoff_max_secs",
            file.reconnect_backoff_max_secs,
            d.reconnect_backoff_max,
        )?,
        max_consecutive_read_failures: file
            .max_consecutive_read_failures
            .unwrap_or(d.max_consecutive_read_failures),
        cleanup_interval: secs_or(
            "cleanup_interval_secs",
            file.cleanup_interval_secs,
            d.cleanup_interval,
        )?,
        stop_timeout: secs_or("stop_timeout_secs", file.stop_timeout_secs, d.stop_timeout)?,
        queue_pop_timeout: secs_or(
            "queue_pop_timeout_secs",
            file.queue_pop_timeout_secs,
            d.queue_pop_timeout,
        )?,
        movement_history_cap: file.movement_history_cap.unwrap_or(d.movement_history_cap),
    })
}

fn secs_to_duration(field: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("{} must be a finite, non-negative number of seconds", field))
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            let secs: f64 = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be a number of seconds", key))?;
            Ok(Some(secs_to_duration(key, secs)?))
        }
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_derives_an_entry_zone() {
        let cfg = EngineConfig::default();
        cfg.validate().expect("defaults validate");

        let registry = cfg.zone_registry().expect("registry");
        let zones = registry.zones_for_camera(DEFAULT_CAMERA_ID);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].zone_type, ZoneType::Entry);
        assert_eq!(zones[0].triggered_action, TriggeredAction::ClockIn);
    }

    #[test]
    fn validate_rejects_out_of_range_confidence() {
        let mut cfg = EngineConfig::default();
        cfg.tunables.min_confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_cameras() {
        let mut cfg = EngineConfig::default();
        cfg.cameras.push(cfg.cameras[0].clone());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate camera id"));
    }

    #[test]
    fn validate_rejects_zone_with_unknown_camera() {
        let mut cfg = EngineConfig::default();
        cfg.zones = Some(vec![ZoneDefinition::new(
            "zone:lobby",
            ZoneType::Entry,
            &["cam_missing"],
        )]);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown camera"));
    }

    #[test]
    fn negative_durations_are_rejected() {
        assert!(secs_to_duration("movement_timeout_secs", -1.0).is_err());
        assert!(secs_to_duration("movement_timeout_secs", f64::NAN).is_err());
        assert_eq!(
            secs_to_duration("movement_timeout_secs", 1.5).unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn zone_file_defaults_follow_zone_type() {
        let zone = zone_from_file(ZoneConfigFile {
            zone_id: "zone:exit".to_string(),
            name: None,
            camera_ids: vec!["cam_a".to_string()],
            zone_type: ZoneType::Exit,
            dwell_time_secs: None,
            triggered_action: None,
            region: Some(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]),
        })
        .unwrap();
        assert_eq!(zone.triggered_action, TriggeredAction::ClockOut);
        assert_eq!(zone.dwell_time_required, ZoneType::Exit.default_dwell_time());
        assert_eq!(zone.region.as_ref().map(Vec::len), Some(3));
    }
}
