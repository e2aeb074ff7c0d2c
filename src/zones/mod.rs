//! Zone engine: registry, dwell state machine and action gate.

mod gate;
mod registry;
mod state;

pub use gate::{AttendanceActionGate, DeclineReason, GateDecision};
pub use registry::{Point, TriggeredAction, ZoneDefinition, ZoneRegistry, ZoneType};
pub use state::{
    ActionDecision, ActionOutcome, EmployeeLocation, MovementHistoryEntry, SweepReport,
    ZoneDwellState, ZoneEngineStats, ZoneOverview, ZoneStateMachine,
};
