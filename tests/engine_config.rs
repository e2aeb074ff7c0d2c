use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use dwell_attendance::config::EngineConfig;
use dwell_attendance::{TriggeredAction, ZoneType};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ATTENDANCE_CONFIG",
        "ATTENDANCE_DB_PATH",
        "ATTENDANCE_MIN_CONFIDENCE",
        "ATTENDANCE_DETECTION_INTERVAL_SECS",
        "ATTENDANCE_MOVEMENT_TIMEOUT_SECS",
        "ATTENDANCE_ACTION_COOLDOWN_SECS",
        "ATTENDANCE_MIN_WORK_SECS",
        "ATTENDANCE_QUEUE_CAPACITY",
        "ATTENDANCE_MAX_RECONNECT_RETRIES",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "attendance_prod.db",
        "cameras": [
            { "camera_id": "cam_front", "source_uri": "stub://front", "location": "Front Entrance", "fps": 15 },
            { "camera_id": "cam_floor", "source_uri": "stub://floor", "location": "Floor 2", "detection_enabled": false }
        ],
        "tunables": {
            "detection_interval_secs": 1.5,
            "movement_timeout_secs": 45,
            "frame_queue_capacity": 4
        },
        "recognizer": { "roster": ["EMP100", "EMP200"] }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("ATTENDANCE_CONFIG", file.path());
    std::env::set_var("ATTENDANCE_MIN_CONFIDENCE", "0.75");
    std::env::set_var("ATTENDANCE_MAX_RECONNECT_RETRIES", "3");
    std::env::set_var("ATTENDANCE_MIN_WORK_SECS", "900");

    let cfg = EngineConfig::load().expect("load config");
    clear_env();

    assert_eq!(cfg.db_path.as_deref(), Some("attendance_prod.db"));
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].fps, 15);
    assert!(cfg.cameras[0].detection_enabled);
    assert!(!cfg.cameras[1].detection_enabled);
    assert_eq!(cfg.recognizer_roster, vec!["EMP100", "EMP200"]);

    let t = &cfg.tunables;
    assert_eq!(t.detection_interval, Duration::from_millis(1500));
    assert_eq!(t.movement_timeout, Duration::from_secs(45));
    assert_eq!(t.frame_queue_capacity, 4);
    assert!((t.min_confidence_threshold - 0.75).abs() < f32::EPSILON);
    assert_eq!(t.max_reconnect_retries, 3);
    assert_eq!(t.min_work_duration, Duration::from_secs(900));
    assert_eq!(t.action_cooldown, Duration::from_secs(60));

    // No explicit zones: one derived zone per location.
    let registry = cfg.zone_registry().expect("derived registry");
    assert_eq!(
        registry.zone("zone:front_entrance").map(|z| z.zone_type),
        Some(ZoneType::Entry)
    );
    assert_eq!(
        registry.zone("zone:floor_2").map(|z| z.zone_type),
        Some(ZoneType::WorkArea)
    );
}

#[test]
fn loads_toml_config_with_explicit_zones() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[[cameras]]
camera_id = "cam_a"
source_uri = "stub://a"
location = "Lobby"

[[cameras]]
camera_id = "cam_b"
source_uri = "stub://b"
location = "Lobby"

[[zones]]
zone_id = "zone:lobby_in"
camera_ids = ["cam_a", "cam_b"]
zone_type = "entry"
dwell_time_secs = 5

[[zones]]
zone_id = "zone:desk"
camera_ids = ["cam_b"]
zone_type = "work_area"
triggered_action = "none"
region = [[0.0, 0.0], [0.5, 0.0], [0.5, 0.5], [0.0, 0.5]]

[tunables]
action_cooldown_secs = 120
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = EngineConfig::load_from_path(file.path()).expect("load toml config");
    assert_eq!(cfg.tunables.action_cooldown, Duration::from_secs(120));

    let registry = cfg.zone_registry().expect("explicit registry");
    assert_eq!(registry.len(), 2);

    let lobby = registry.zone("zone:lobby_in").expect("lobby zone");
    assert_eq!(lobby.dwell_time_required, Duration::from_secs(5));
    assert_eq!(lobby.triggered_action, TriggeredAction::ClockIn);

    let desk = registry.zone("zone:desk").expect("desk zone");
    assert_eq!(desk.triggered_action, TriggeredAction::None);
    assert_eq!(desk.region.as_ref().map(|r| r.len()), Some(4));

    let zone_ids: Vec<&str> = registry
        .zones_for_camera("cam_b")
        .iter()
        .map(|z| z.zone_id.as_str())
        .collect();
    assert_eq!(zone_ids.len(), 2);
    assert!(zone_ids.contains(&"zone:lobby_in"));
    assert!(zone_ids.contains(&"zone:desk"));
}

#[test]
fn rejects_invalid_env_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ATTENDANCE_QUEUE_CAPACITY", "lots");
    let err = EngineConfig::load().unwrap_err();
    clear_env();
    assert!(err.to_string().contains("ATTENDANCE_QUEUE_CAPACITY"));
}

#[test]
fn rejects_zone_with_unknown_camera() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "cameras": [ { "camera_id": "cam_a", "source_uri": "stub://a" } ],
        "zones": [ { "zone_id": "zone:x", "camera_ids": ["cam_z"], "zone_type": "exit" } ]
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    let err = EngineConfig::load_from_path(file.path()).unwrap_err();
    assert!(err.to_string().contains("cam_z"));
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = EngineConfig::load().expect("defaults");
    assert!(cfg.db_path.is_none());
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.tunables.detection_interval, Duration::from_secs(2));
    assert_eq!(cfg.tunables.frame_queue_capacity, 10);
    assert_eq!(cfg.tunables.max_reconnect_retries, 5);
}
