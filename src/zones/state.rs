//! Dwell tracking.
//!
//! One `ZoneDwellState` per (employee, zone). A state is created by the first detection,
//! refreshed by later ones, and destroyed by the cleanup sweep once the employee has been
//! absent longer than `movement_timeout`. While it lives, its action fires at most once.
//!
//! Dwell states, current locations and movement history sit behind one mutex: the
//! at-most-one-state and fire-once checks span all of them.

use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crate::attendance::AttendanceAction;
use crate::config::Tunables;
use crate::detect::{DetectionEvent, DetectionHandler};
use crate::zones::gate::{AttendanceActionGate, DeclineReason, GateDecision};
use crate::zones::registry::{TriggeredAction, ZoneDefinition, ZoneRegistry, ZoneType};
use crate::Timestamp;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ZoneDwellState {
    pub employee_id: String,
    pub zone_id: String,
    pub first_seen_at: Timestamp,
    pub last_seen_at: Timestamp,
    pub triggered: bool,
    /// The action was attempted but the attendance store rejected it twice.
    pub action_failed: bool,
    pub detections: u32,
}

impl ZoneDwellState {
    fn start(employee_id: &str, zone_id: &str, at: Timestamp) -> Self {
        Self {
            employee_id: employee_id.to_string(),
            zone_id: zone_id.to_string(),
            first_seen_at: at,
            last_seen_at: at,
            triggered: false,
            action_failed: false,
            detections: 1,
        }
    }

    pub fn dwell_time(&self) -> Duration {
        self.last_seen_at.duration_since(self.first_seen_at)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EmployeeLocation {
    pub zone_id: String,
    pub camera_id: String,
    pub timestamp: Timestamp,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MovementHistoryEntry {
    pub timestamp: Timestamp,
    pub zone_id: String,
    pub camera_id: String,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ZoneOverview {
    pub name: String,
    pub zone_type: ZoneType,
    pub employees_present: Vec<String>,
    pub triggered_action: TriggeredAction,
    pub failed_actions: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_dwell_states: usize,
    pub expired_locations: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ZoneEngineStats {
    pub events_processed: u64,
    pub unrecognized_events: u64,
    pub fired_actions: u64,
    pub declined_actions: u64,
    pub failed_actions: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionDecision {
    Fired,
    Declined(DeclineReason),
    /// Attempted, store failed twice; the episode will not retry.
    Failed,
}

/// What happened when a dwell episode reached its threshold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionOutcome {
    pub employee_id: String,
    pub zone_id: String,
    pub action: AttendanceAction,
    pub at: Timestamp,
    pub decision: ActionDecision,
}

#[derive(Default)]
struct ZoneState {
    dwell: HashMap<(String, String), ZoneDwellState>,
    locations: HashMap<String, EmployeeLocation>,
    history: HashMap<String, VecDeque<MovementHistoryEntry>>,
    failed_by_zone: HashMap<String, u64>,
    stats: ZoneEngineStats,
}

pub struct ZoneStateMachine {
    registry: RwLock<Arc<ZoneRegistry>>,
    gate: AttendanceActionGate,
    movement_timeout: Duration,
    history_cap: usize,
    state: Mutex<ZoneState>,
}

impl ZoneStateMachine {
    pub fn new(registry: ZoneRegistry, gate: AttendanceActionGate, tunables: &Tunables) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
            gate,
            movement_timeout: tunables.movement_timeout,
            history_cap: tunables.movement_history_cap.max(1),
            state: Mutex::new(ZoneState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ZoneState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current registry snapshot.
    pub fn registry(&self) -> Arc<ZoneRegistry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swap in a new registry. Dwell states for zones that no longer exist are dropped.
    pub fn replace_registry(&self, registry: ZoneRegistry) {
        let registry = Arc::new(registry);
        {
            let mut current = self
                .registry
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = registry.clone();
        }
        let mut state = self.lock();
        let before = state.dwell.len();
        state.dwell.retain(|(_, zone_id), _| registry.contains(zone_id));
        state.failed_by_zone.retain(|zone_id, _| registry.contains(zone_id));
        log::info!(
            "zones: registry replaced ({} zones), dropped {} orphaned dwell states",
            registry.len(),
            before - state.dwell.len()
        );
    }

    /// Apply one detection event. Returns the outcome of every action that reached its
    /// dwell threshold during this event.
    pub fn process(&self, event: &DetectionEvent) -> Vec<ActionOutcome> {
        let registry = self.registry();
        let mut state = self.lock();

        let Some(employee_id) = event.employee_id.as_deref() else {
            state.stats.unrecognized_events += 1;
            return Vec::new();
        };
        state.stats.events_processed += 1;

        let zones: Vec<&ZoneDefinition> = registry
            .zones_for_camera(&event.camera_id)
            .into_iter()
            .filter(|zone| zone.accepts(&event.bounding_box))
            .collect();
        if zones.is_empty() {
            log::debug!(
                "zones: {} seen on {} outside any zone",
                employee_id,
                event.camera_id
            );
            return Vec::new();
        }

        let t = event.timestamp;
        let mut outcomes = Vec::new();
        for zone in &zones {
            if let Some(outcome) = self.update_dwell(&mut state, employee_id, zone, t) {
                match outcome.decision {
                    ActionDecision::Fired => state.stats.fired_actions += 1,
                    ActionDecision::Declined(_) => state.stats.declined_actions += 1,
                    ActionDecision::Failed => {
                        state.stats.failed_actions += 1;
                        *state
                            .failed_by_zone
                            .entry(zone.zone_id.clone())
                            .or_default() += 1;
                    }
                }
                outcomes.push(outcome);
            }
        }

        // Most specific zone wins when a camera feeds several.
        if let Some(best) = zones
            .iter()
            .max_by_key(|zone| (zone.zone_type.priority(), action_priority(zone.triggered_action)))
        {
            let location = EmployeeLocation {
                zone_id: best.zone_id.clone(),
                camera_id: event.camera_id.clone(),
                timestamp: t,
                confidence: event.confidence,
            };
            let newer = state
                .locations
                .get(employee_id)
                .map(|current| t > current.timestamp)
                .unwrap_or(true);
            if newer {
                state.locations.insert(employee_id.to_string(), location);
            }

            let cap = self.history_cap;
            let history = state.history.entry(employee_id.to_string()).or_default();
            history.push_back(MovementHistoryEntry {
                timestamp: t,
                zone_id: best.zone_id.clone(),
                camera_id: event.camera_id.clone(),
                confidence: event.confidence,
            });
            while history.len() > cap {
                history.pop_front();
            }
        }

        outcomes
    }

    fn update_dwell(
        &self,
        state: &mut ZoneState,
        employee_id: &str,
        zone: &ZoneDefinition,
        t: Timestamp,
    ) -> Option<ActionOutcome> {
        let key = (employee_id.to_string(), zone.zone_id.clone());
        let dwell = match state.dwell.entry(key) {
            Entry::Occupied(entry) => {
                let dwell = entry.into_mut();
                if t.duration_since(dwell.last_seen_at) > self.movement_timeout {
                    // Absent past the timeout and the sweep has not run yet.
                    log::debug!(
                        "zones: new dwell episode for {} in {} (stale since {})",
                        employee_id,
                        zone.zone_id,
                        dwell.last_seen_at
                    );
                    *dwell = ZoneDwellState::start(employee_id, &zone.zone_id, t);
                } else {
                    dwell.last_seen_at = dwell.last_seen_at.max(t);
                    dwell.detections = dwell.detections.saturating_add(1);
                }
                dwell
            }
            Entry::Vacant(entry) => {
                entry.insert(ZoneDwellState::start(employee_id, &zone.zone_id, t))
            }
        };

        let action = zone.triggered_action.attendance_action()?;
        if dwell.triggered || t.duration_since(dwell.first_seen_at) < zone.dwell_time_required {
            return None;
        }

        // Sink calls run under the state lock; evaluate and fire see one episode.
        let decision = match self.gate.evaluate(employee_id, action, t) {
            GateDecision::Allow => match self.gate.fire(employee_id, &zone.zone_id, action, t) {
                Ok(()) => {
                    dwell.triggered = true;
                    log::info!(
                        "zones: {} for {} in {} after {:.1}s dwell",
                        action,
                        employee_id,
                        zone.zone_id,
                        t.duration_since(dwell.first_seen_at).as_secs_f32()
                    );
                    ActionDecision::Fired
                }
                Err(err) => {
                    // Attempted but unconfirmed: no automatic retry within this episode.
                    dwell.triggered = true;
                    dwell.action_failed = true;
                    log::error!(
                        "zones: {} for {} in {} failed after retry: {}",
                        action,
                        employee_id,
                        zone.zone_id,
                        err
                    );
                    ActionDecision::Failed
                }
            },
            GateDecision::Decline(reason) => {
                log::debug!(
                    "zones: {} for {} in {} declined: {}",
                    action,
                    employee_id,
                    zone.zone_id,
                    reason
                );
                ActionDecision::Declined(reason)
            }
        };

        Some(ActionOutcome {
            employee_id: employee_id.to_string(),
            zone_id: zone.zone_id.clone(),
            action,
            at: t,
            decision,
        })
    }

    /// Evict dwell states and locations not refreshed within `movement_timeout` of `now`.
    pub fn sweep(&self, now: Timestamp) -> SweepReport {
        let timeout = self.movement_timeout;
        let mut state = self.lock();

        let dwell_before = state.dwell.len();
        state
            .dwell
            .retain(|_, dwell| now.duration_since(dwell.last_seen_at) <= timeout);
        let locations_before = state.locations.len();
        state
            .locations
            .retain(|_, location| now.duration_since(location.timestamp) <= timeout);

        let report = SweepReport {
            expired_dwell_states: dwell_before - state.dwell.len(),
            expired_locations: locations_before - state.locations.len(),
        };
        if report.expired_dwell_states > 0 || report.expired_locations > 0 {
            log::debug!(
                "zones: sweep expired {} dwell states, {} locations",
                report.expired_dwell_states,
                report.expired_locations
            );
        }
        report
    }

    pub fn dwell_state(&self, employee_id: &str, zone_id: &str) -> Option<ZoneDwellState> {
        self.lock()
            .dwell
            .get(&(employee_id.to_string(), zone_id.to_string()))
            .cloned()
    }

    pub fn dwell_state_count(&self) -> usize {
        self.lock().dwell.len()
    }

    pub fn employee_location(&self, employee_id: &str) -> Option<EmployeeLocation> {
        self.lock().locations.get(employee_id).cloned()
    }

    pub fn employee_locations(&self) -> BTreeMap<String, EmployeeLocation> {
        self.lock()
            .locations
            .iter()
            .map(|(id, location)| (id.clone(), location.clone()))
            .collect()
    }

    /// Movement history for an employee at or after `since`, oldest first.
    pub fn movement_history(
        &self,
        employee_id: &str,
        since: Timestamp,
    ) -> Vec<MovementHistoryEntry> {
        self.lock()
            .history
            .get(employee_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Movement history covering the last `hours` before `now`.
    pub fn export_movement_history(
        &self,
        employee_id: &str,
        hours: u32,
        now: Timestamp,
    ) -> Vec<MovementHistoryEntry> {
        let window = Duration::from_secs(u64::from(hours) * 3600);
        self.movement_history(employee_id, now.saturating_sub(window))
    }

    pub fn zone_overview(&self) -> BTreeMap<String, ZoneOverview> {
        let registry = self.registry();
        let state = self.lock();

        let mut present: HashMap<&str, Vec<String>> = HashMap::new();
        for (employee_id, zone_id) in state.dwell.keys() {
            present
                .entry(zone_id.as_str())
                .or_default()
                .push(employee_id.clone());
        }

        registry
            .zones()
            .map(|zone| {
                let mut employees = present.remove(zone.zone_id.as_str()).unwrap_or_default();
                employees.sort();
                let overview = ZoneOverview {
                    name: zone.name.clone(),
                    zone_type: zone.zone_type,
                    employees_present: employees,
                    triggered_action: zone.triggered_action,
                    failed_actions: state.failed_by_zone.get(&zone.zone_id).copied().unwrap_or(0),
                };
                (zone.zone_id.clone(), overview)
            })
            .collect()
    }

    pub fn stats(&self) -> ZoneEngineStats {
        self.lock().stats
    }
}

impl DetectionHandler for ZoneStateMachine {
    fn handle(&self, event: DetectionEvent) {
        self.process(&event);
    }
}

fn action_priority(action: TriggeredAction) -> u8 {
    match action {
        TriggeredAction::ClockOut => 2,
        TriggeredAction::ClockIn => 1,
        TriggeredAction::None => 0,
    }
}
