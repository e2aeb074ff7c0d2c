use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::attendance::AttendanceAction;
use crate::config::CameraConfig;
use crate::detect::BoundingBox;

const DERIVED_DWELL_TIME: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    Entry,
    Exit,
    WorkArea,
    Transit,
}

impl ZoneType {
    /// Specificity used to pick an employee's current zone when one camera feeds several.
    pub fn priority(self) -> u8 {
        match self {
            ZoneType::Exit => 3,
            ZoneType::Entry => 2,
            ZoneType::WorkArea => 1,
            ZoneType::Transit => 0,
        }
    }

    pub fn default_action(self) -> TriggeredAction {
        match self {
            ZoneType::Entry => TriggeredAction::ClockIn,
            ZoneType::Exit => TriggeredAction::ClockOut,
            ZoneType::WorkArea | ZoneType::Transit => TriggeredAction::None,
        }
    }

    pub fn default_dwell_time(self) -> Duration {
        match self {
            ZoneType::Entry | ZoneType::Exit => DERIVED_DWELL_TIME,
            ZoneType::WorkArea | ZoneType::Transit => Duration::ZERO,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredAction {
    ClockIn,
    ClockOut,
    None,
}

impl TriggeredAction {
    pub fn attendance_action(self) -> Option<AttendanceAction> {
        match self {
            TriggeredAction::ClockIn => Some(AttendanceAction::ClockIn),
            TriggeredAction::ClockOut => Some(AttendanceAction::ClockOut),
            TriggeredAction::None => None,
        }
    }
}

/// Normalized image coordinate (0..1 on both axes).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ZoneDefinition {
    pub zone_id: String,
    pub name: String,
    pub camera_ids: Vec<String>,
    pub zone_type: ZoneType,
    pub dwell_time_required: Duration,
    pub triggered_action: TriggeredAction,
    /// Optional polygon in normalized frame coordinates. Without one, every detection
    /// from a mapped camera counts for the zone.
    pub region: Option<Vec<Point>>,
}

impl ZoneDefinition {
    /// Zone with the type's default action and dwell time.
    pub fn new(zone_id: &str, zone_type: ZoneType, camera_ids: &[&str]) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            name: zone_id.to_string(),
            camera_ids: camera_ids.iter().map(|c| c.to_string()).collect(),
            zone_type,
            dwell_time_required: zone_type.default_dwell_time(),
            triggered_action: zone_type.default_action(),
            region: None,
        }
    }

    pub fn with_dwell_time(mut self, dwell: Duration) -> Self {
        self.dwell_time_required = dwell;
        self
    }

    pub fn with_action(mut self, action: TriggeredAction) -> Self {
        self.triggered_action = action;
        self
    }

    pub fn with_region(mut self, region: Vec<Point>) -> Self {
        self.region = Some(region);
        self
    }

    /// Ray-casting point-in-polygon test. Zones without a region contain every point.
    pub fn is_point_in_zone(&self, point: Point) -> bool {
        let Some(region) = &self.region else {
            return true;
        };
        if region.len() < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = region.len() - 1;
        for i in 0..region.len() {
            let (pi, pj) = (region[i], region[j]);
            if (pi.y > point.y) != (pj.y > point.y)
                && point.x < (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Whether a detection's bounding box counts toward this zone.
    pub fn accepts(&self, bbox: &BoundingBox) -> bool {
        self.is_point_in_zone(bbox.center())
    }
}

/// Camera → zone lookup.
///
/// Immutable once built; the state machine swaps in a whole new registry rather than
/// editing one in place.
#[derive(Clone, Debug, Default)]
pub struct ZoneRegistry {
    zones: BTreeMap<String, ZoneDefinition>,
    by_camera: HashMap<String, Vec<String>>,
}

impl ZoneRegistry {
    pub fn new(zones: Vec<ZoneDefinition>) -> Result<Self> {
        let mut registry = Self::default();
        for zone in zones {
            crate::validate_identifier("zone", &zone.zone_id)?;
            if zone.camera_ids.is_empty() {
                return Err(anyhow!("zone {} has no cameras", zone.zone_id));
            }
            if registry.zones.contains_key(&zone.zone_id) {
                return Err(anyhow!("duplicate zone id '{}'", zone.zone_id));
            }
            for camera_id in &zone.camera_ids {
                crate::validate_identifier("camera", camera_id)?;
                let zones = registry.by_camera.entry(camera_id.clone()).or_default();
                if !zones.contains(&zone.zone_id) {
                    zones.push(zone.zone_id.clone());
                }
            }
            registry.zones.insert(zone.zone_id.clone(), zone);
        }
        Ok(registry)
    }

    /// Derive zones from camera locations.
    ///
    /// Cameras sharing a location share a zone. Locations mentioning "entrance" or
    /// "entry" become entry zones, "exit" becomes an exit zone, anything else a work area.
    pub fn derive_from_cameras(cameras: &[CameraConfig]) -> Result<Self> {
        let mut grouped: BTreeMap<String, (String, Vec<&str>)> = BTreeMap::new();
        for camera in cameras {
            let location = if camera.location.trim().is_empty() {
                camera.camera_id.as_str()
            } else {
                camera.location.trim()
            };
            let zone_id = format!("zone:{}", slugify(location));
            grouped
                .entry(zone_id)
                .or_insert_with(|| (location.to_string(), Vec::new()))
                .1
                .push(camera.camera_id.as_str());
        }

        let zones = grouped
            .into_iter()
            .map(|(zone_id, (name, camera_ids))| {
                let zone_type = zone_type_for_location(&name);
                let mut zone = ZoneDefinition::new(&zone_id, zone_type, &camera_ids);
                zone.name = name;
                zone
            })
            .collect();
        Self::new(zones)
    }

    pub fn zone(&self, zone_id: &str) -> Option<&ZoneDefinition> {
        self.zones.get(zone_id)
    }

    /// Zones observed by a camera, in registration order.
    pub fn zones_for_camera(&self, camera_id: &str) -> Vec<&ZoneDefinition> {
        self.by_camera
            .get(camera_id)
            .map(|ids| ids.iter().filter_map(|id| self.zones.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn zones(&self) -> impl Iterator<Item = &ZoneDefinition> {
        self.zones.values()
    }

    pub fn contains(&self, zone_id: &str) -> bool {
        self.zones.contains_key(zone_id)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

fn zone_type_for_location(location: &str) -> ZoneType {
    let lower = location.to_lowercase();
    if lower.contains("exit") {
        ZoneType::Exit
    } else if lower.contains("entrance") || lower.contains("entry") {
        ZoneType::Entry
    } else {
        ZoneType::WorkArea
    }
}

fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut last_sep = true;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_sep = false;
        } else if !last_sep {
            slug.push('_');
            last_sep = true;
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("unnamed");
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Point> {
        vec![
            Point { x: 0.25, y: 0.25 },
            Point { x: 0.75, y: 0.25 },
            Point { x: 0.75, y: 0.75 },
            Point { x: 0.25, y: 0.75 },
        ]
    }

    #[test]
    fn derivation_maps_locations_to_zone_types() {
        let cameras = vec![
            CameraConfig::new("cam_front", "stub://front", "Main Entrance"),
            CameraConfig::new("cam_back", "stub://back", "Rear Exit"),
            CameraConfig::new("cam_floor", "stub://floor", "Assembly Floor"),
            CameraConfig::new("cam_front2", "stub://front2", "main entrance"),
        ];
        let registry = ZoneRegistry::derive_from_cameras(&cameras).unwrap();
        assert_eq!(registry.len(), 3);

        let entry = registry.zone("zone:main_entrance").unwrap();
        assert_eq!(entry.zone_type, ZoneType::Entry);
        assert_eq!(entry.triggered_action, TriggeredAction::ClockIn);
        assert_eq!(entry.camera_ids, vec!["cam_front", "cam_front2"]);

        let exit = registry.zone("zone:rear_exit").unwrap();
        assert_eq!(exit.zone_type, ZoneType::Exit);
        assert_eq!(exit.triggered_action, TriggeredAction::ClockOut);

        let floor = registry.zone("zone:assembly_floor").unwrap();
        assert_eq!(floor.zone_type, ZoneType::WorkArea);
        assert_eq!(floor.triggered_action, TriggeredAction::None);
    }

    #[test]
    fn camera_may_feed_several_zones() {
        let registry = ZoneRegistry::new(vec![
            ZoneDefinition::new("zone:in", ZoneType::Entry, &["cam_door"]),
            ZoneDefinition::new("zone:out", ZoneType::Exit, &["cam_door", "cam_gate"]),
        ])
        .unwrap();

        let ids: Vec<&str> = registry
            .zones_for_camera("cam_door")
            .iter()
            .map(|z| z.zone_id.as_str())
            .collect();
        assert_eq!(ids, vec!["zone:in", "zone:out"]);
        assert_eq!(registry.zones_for_camera("cam_gate").len(), 1);
        assert!(registry.zones_for_camera("cam_unknown").is_empty());
    }

    #[test]
    fn duplicate_zone_ids_are_rejected() {
        let result = ZoneRegistry::new(vec![
            ZoneDefinition::new("zone:a", ZoneType::Entry, &["cam_1"]),
            ZoneDefinition::new("zone:a", ZoneType::Exit, &["cam_2"]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn point_in_polygon() {
        let zone = ZoneDefinition::new("zone:desk", ZoneType::WorkArea, &["cam_1"])
            .with_region(square());
        assert!(zone.is_point_in_zone(Point { x: 0.5, y: 0.5 }));
        assert!(!zone.is_point_in_zone(Point { x: 0.1, y: 0.5 }));
        assert!(!zone.is_point_in_zone(Point { x: 0.5, y: 0.9 }));

        let open = ZoneDefinition::new("zone:open", ZoneType::WorkArea, &["cam_1"]);
        assert!(open.is_point_in_zone(Point { x: 0.99, y: 0.01 }));
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  Main   Entrance!! "), "main_entrance");
        assert_eq!(slugify("***"), "unnamed");
    }
}
