//! Attendance store seam.
//!
//! The engine never owns attendance records. It reads the current status through
//! `AttendanceSink::status` and performs clock-in/out through the same trait; the store
//! decides how records are persisted and how calendar rules (weekends, holidays) apply.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceAction {
    ClockIn,
    ClockOut,
}

impl AttendanceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceAction::ClockIn => "clock_in",
            AttendanceAction::ClockOut => "clock_out",
        }
    }
}

impl fmt::Display for AttendanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time attendance status for one employee.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AttendanceStatusSnapshot {
    pub is_clocked_in: bool,
    /// Start of the currently open shift, when clocked in.
    pub clock_in_time: Option<Timestamp>,
    pub last_clock_in_time: Option<Timestamp>,
    pub last_clock_out_time: Option<Timestamp>,
}

/// Attendance store used by the action gate.
///
/// Implementations must be safe to call from any detection worker thread.
pub trait AttendanceSink: Send + Sync {
    fn status(&self, employee_id: &str) -> Result<AttendanceStatusSnapshot>;

    fn clock_in(&self, employee_id: &str, zone_id: &str, at: Timestamp) -> Result<()>;

    fn clock_out(&self, employee_id: &str, zone_id: &str, at: Timestamp) -> Result<()>;
}

/// A clock event accepted by a sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub employee_id: String,
    pub zone_id: String,
    pub action: AttendanceAction,
    pub at: Timestamp,
}

// ----------------------------------------------------------------------------
// In-memory sink
// ----------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    status: HashMap<String, AttendanceStatusSnapshot>,
    records: Vec<AttendanceRecord>,
    fail_writes: u32,
    fail_status: bool,
}

/// Process-local attendance store.
///
/// Used when no database is configured, and as the recording double in tests. Failure
/// injection (`fail_next_writes`, `set_status_failing`) exercises the engine's retry paths.
#[derive(Default)]
pub struct InMemoryAttendanceSink {
    state: Mutex<MemoryState>,
}

impl InMemoryAttendanceSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("attendance state lock poisoned"))
    }

    /// Seed an employee's status, e.g. a shift opened before the engine started.
    pub fn set_status(&self, employee_id: &str, status: AttendanceStatusSnapshot) -> Result<()> {
        self.lock()?.status.insert(employee_id.to_string(), status);
        Ok(())
    }

    /// Make the next `count` clock writes fail.
    pub fn fail_next_writes(&self, count: u32) -> Result<()> {
        self.lock()?.fail_writes = count;
        Ok(())
    }

    pub fn set_status_failing(&self, failing: bool) -> Result<()> {
        self.lock()?.fail_status = failing;
        Ok(())
    }

    pub fn records(&self) -> Result<Vec<AttendanceRecord>> {
        Ok(self.lock()?.records.clone())
    }

    pub fn records_for(
        &self,
        employee_id: &str,
        action: AttendanceAction,
    ) -> Result<Vec<AttendanceRecord>> {
        Ok(self
            .lock()?
            .records
            .iter()
            .filter(|r| r.employee_id == employee_id && r.action == action)
            .cloned()
            .collect())
    }

    fn write(
        &self,
        employee_id: &str,
        zone_id: &str,
        action: AttendanceAction,
        at: Timestamp,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(anyhow!("attendance store unavailable"));
        }
        let status = state.status.entry(employee_id.to_string()).or_default();
        match action {
            AttendanceAction::ClockIn => {
                status.is_clocked_in = true;
                status.clock_in_time = Some(at);
                status.last_clock_in_time = Some(at);
            }
            AttendanceAction::ClockOut => {
                status.is_clocked_in = false;
                status.clock_in_time = None;
                status.last_clock_out_time = Some(at);
            }
        }
        state.records.push(AttendanceRecord {
            employee_id: employee_id.to_string(),
            zone_id: zone_id.to_string(),
            action,
            at,
        });
        Ok(())
    }
}

impl AttendanceSink for InMemoryAttendanceSink {
    fn status(&self, employee_id: &str) -> Result<AttendanceStatusSnapshot> {
        let state = self.lock()?;
        if state.fail_status {
            return Err(anyhow!("attendance status unavailable"));
        }
        Ok(state.status.get(employee_id).copied().unwrap_or_default())
    }

    fn clock_in(&self, employee_id: &str, zone_id: &str, at: Timestamp) -> Result<()> {
        self.write(employee_id, zone_id, AttendanceAction::ClockIn, at)
    }

    fn clock_out(&self, employee_id: &str, zone_id: &str, at: Timestamp) -> Result<()> {
        self.write(employee_id, zone_id, AttendanceAction::ClockOut, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_in_then_out_updates_status() -> Result<()> {
        let sink = InMemoryAttendanceSink::new();
        sink.clock_in("EMP1", "zone:entry", Timestamp::from_secs(10))?;

        let status = sink.status("EMP1")?;
        assert!(status.is_clocked_in);
        assert_eq!(status.clock_in_time, Some(Timestamp::from_secs(10)));

        sink.clock_out("EMP1", "zone:exit", Timestamp::from_secs(700))?;
        let status = sink.status("EMP1")?;
        assert!(!status.is_clocked_in);
        assert_eq!(status.clock_in_time, None);
        assert_eq!(status.last_clock_in_time, Some(Timestamp::from_secs(10)));
        assert_eq!(status.last_clock_out_time, Some(Timestamp::from_secs(700)));

        assert_eq!(sink.records()?.len(), 2);
        Ok(())
    }

    #[test]
    fn injected_failures_are_consumed() -> Result<()> {
        let sink = InMemoryAttendanceSink::new();
        sink.fail_next_writes(1)?;
        assert!(sink.clock_in("EMP1", "zone:entry", Timestamp::from_secs(1)).is_err());
        assert!(sink.clock_in("EMP1", "zone:entry", Timestamp::from_secs(2)).is_ok());
        assert_eq!(sink.records_for("EMP1", AttendanceAction::ClockIn)?.len(), 1);
        Ok(())
    }

    #[test]
    fn unknown_employee_reads_as_clocked_out() -> Result<()> {
        let sink = InMemoryAttendanceSink::new();
        assert_eq!(sink.status("EMP404")?, AttendanceStatusSnapshot::default());
        Ok(())
    }
}
