//! Attendance action gate.
//!
//! Decides whether a candidate clock-in/out may fire right now, given the employee's
//! attendance status, the per-action cooldown and the minimum shift length.

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::attendance::{AttendanceAction, AttendanceSink, AttendanceStatusSnapshot};
use crate::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclineReason {
    AlreadyClockedIn,
    NotClockedIn,
    CooldownActive { remaining: Duration },
    MinimumWorkNotMet { remaining: Duration },
    StatusUnavailable,
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclineReason::AlreadyClockedIn => f.write_str("already clocked in"),
            DeclineReason::NotClockedIn => f.write_str("not clocked in"),
            DeclineReason::CooldownActive { remaining } => {
                write!(f, "cooldown active ({}s remaining)", remaining.as_secs())
            }
            DeclineReason::MinimumWorkNotMet { remaining } => {
                write!(f, "minimum work duration not met ({}s remaining)", remaining.as_secs())
            }
            DeclineReason::StatusUnavailable => f.write_str("attendance status unavailable"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Decline(DeclineReason),
}

pub struct AttendanceActionGate {
    sink: Arc<dyn AttendanceSink>,
    action_cooldown: Duration,
    min_work_duration: Duration,
}

impl AttendanceActionGate {
    pub fn new(
        sink: Arc<dyn AttendanceSink>,
        action_cooldown: Duration,
        min_work_duration: Duration,
    ) -> Self {
        Self {
            sink,
            action_cooldown,
            min_work_duration,
        }
    }

    /// Query the sink and decide. A failed status query declines the action.
    pub fn evaluate(
        &self,
        employee_id: &str,
        action: AttendanceAction,
        now: Timestamp,
    ) -> GateDecision {
        match self.sink.status(employee_id) {
            Ok(status) => self.decide(&status, action, now),
            Err(err) => {
                log::warn!(
                    "gate: status query for {} failed, declining {}: {}",
                    employee_id,
                    action,
                    err
                );
                GateDecision::Decline(DeclineReason::StatusUnavailable)
            }
        }
    }

    /// Pure decision over a status snapshot.
    pub fn decide(
        &self,
        status: &AttendanceStatusSnapshot,
        action: AttendanceAction,
        now: Timestamp,
    ) -> GateDecision {
        match action {
            AttendanceAction::ClockIn => {
                if status.is_clocked_in {
                    return GateDecision::Decline(DeclineReason::AlreadyClockedIn);
                }
                if let Some(remaining) =
                    remaining(status.last_clock_in_time, self.action_cooldown, now)
                {
                    return GateDecision::Decline(DeclineReason::CooldownActive { remaining });
                }
            }
            AttendanceAction::ClockOut => {
                if !status.is_clocked_in {
                    return GateDecision::Decline(DeclineReason::NotClockedIn);
                }
                if let Some(remaining) =
                    remaining(status.clock_in_time, self.min_work_duration, now)
                {
                    return GateDecision::Decline(DeclineReason::MinimumWorkNotMet { remaining });
                }
                if let Some(remaining) =
                    remaining(status.last_clock_out_time, self.action_cooldown, now)
                {
                    return GateDecision::Decline(DeclineReason::CooldownActive { remaining });
                }
            }
        }
        GateDecision::Allow
    }

    /// Perform the action against the sink, retrying once on failure.
    pub fn fire(
        &self,
        employee_id: &str,
        zone_id: &str,
        action: AttendanceAction,
        at: Timestamp,
    ) -> Result<()> {
        match self.write(employee_id, zone_id, action, at) {
            Ok(()) => Ok(()),
            Err(first) => {
                log::warn!(
                    "gate: {} for {} in {} failed, retrying once: {}",
                    action,
                    employee_id,
                    zone_id,
                    first
                );
                self.write(employee_id, zone_id, action, at)
            }
        }
    }

    fn write(
        &self,
        employee_id: &str,
        zone_id: &str,
        action: AttendanceAction,
        at: Timestamp,
    ) -> Result<()> {
        match action {
            AttendanceAction::ClockIn => self.sink.clock_in(employee_id, zone_id, at),
            AttendanceAction::ClockOut => self.sink.clock_out(employee_id, zone_id, at),
        }
    }
}

/// Time left before `since + window` elapses, or `None` if it already has.
fn remaining(since: Option<Timestamp>, window: Duration, now: Timestamp) -> Option<Duration> {
    let since = since?;
    let elapsed = now.duration_since(since);
    if elapsed < window {
        Some(window - elapsed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::InMemoryAttendanceSink;

    fn gate_with(sink: Arc<InMemoryAttendanceSink>) -> AttendanceActionGate {
        AttendanceActionGate::new(sink, Duration::from_secs(60), Duration::from_secs(600))
    }

    fn clocked_in_at(secs: i64) -> AttendanceStatusSnapshot {
        AttendanceStatusSnapshot {
            is_clocked_in: true,
            clock_in_time: Some(Timestamp::from_secs(secs)),
            last_clock_in_time: Some(Timestamp::from_secs(secs)),
            last_clock_out_time: None,
        }
    }

    #[test]
    fn clock_in_declined_while_clocked_in() {
        let gate = gate_with(Arc::new(InMemoryAttendanceSink::new()));
        let decision = gate.decide(
            &clocked_in_at(0),
            AttendanceAction::ClockIn,
            Timestamp::from_secs(5_000),
        );
        assert_eq!(decision, GateDecision::Decline(DeclineReason::AlreadyClockedIn));
    }

    #[test]
    fn clock_in_respects_cooldown() {
        let gate = gate_with(Arc::new(InMemoryAttendanceSink::new()));
        let status = AttendanceStatusSnapshot {
            is_clocked_in: false,
            clock_in_time: None,
            last_clock_in_time: Some(Timestamp::from_secs(100)),
            last_clock_out_time: Some(Timestamp::from_secs(120)),
        };
        assert_eq!(
            gate.decide(&status, AttendanceAction::ClockIn, Timestamp::from_secs(130)),
            GateDecision::Decline(DeclineReason::CooldownActive {
                remaining: Duration::from_secs(30)
            })
        );
        assert_eq!(
            gate.decide(&status, AttendanceAction::ClockIn, Timestamp::from_secs(160)),
            GateDecision::Allow
        );
    }

    #[test]
    fn clock_out_requires_open_shift_and_minimum_work() {
        let gate = gate_with(Arc::new(InMemoryAttendanceSink::new()));

        let closed = AttendanceStatusSnapshot::default();
        assert_eq!(
            gate.decide(&closed, AttendanceAction::ClockOut, Timestamp::from_secs(0)),
            GateDecision::Decline(DeclineReason::NotClockedIn)
        );

        let open = clocked_in_at(-30);
        assert_eq!(
            gate.decide(&open, AttendanceAction::ClockOut, Timestamp::from_secs(0)),
            GateDecision::Decline(DeclineReason::MinimumWorkNotMet {
                remaining: Duration::from_secs(570)
            })
        );
        assert_eq!(
            gate.decide(&open, AttendanceAction::ClockOut, Timestamp::from_secs(610)),
            GateDecision::Allow
        );
    }

    #[test]
    fn clock_out_respects_cooldown_after_previous_clock_out() {
        let gate = gate_with(Arc::new(InMemoryAttendanceSink::new()));
        let status = AttendanceStatusSnapshot {
            is_clocked_in: true,
            clock_in_time: Some(Timestamp::from_secs(0)),
            last_clock_in_time: Some(Timestamp::from_secs(0)),
            last_clock_out_time: Some(Timestamp::from_secs(980)),
        };
        assert!(matches!(
            gate.decide(&status, AttendanceAction::ClockOut, Timestamp::from_secs(1_000)),
            GateDecision::Decline(DeclineReason::CooldownActive { .. })
        ));
    }

    #[test]
    fn status_failure_declines() -> Result<()> {
        let sink = Arc::new(InMemoryAttendanceSink::new());
        sink.set_status_failing(true)?;
        let gate = gate_with(sink);
        assert_eq!(
            gate.evaluate("EMP1", AttendanceAction::ClockIn, Timestamp::from_secs(0)),
            GateDecision::Decline(DeclineReason::StatusUnavailable)
        );
        Ok(())
    }

    #[test]
    fn fire_retries_once() -> Result<()> {
        let sink = Arc::new(InMemoryAttendanceSink::new());
        let gate = gate_with(sink.clone());

        sink.fail_next_writes(1)?;
        gate.fire("EMP1", "zone:entry", AttendanceAction::ClockIn, Timestamp::from_secs(1))?;
        assert_eq!(sink.records()?.len(), 1);

        sink.fail_next_writes(2)?;
        assert!(gate
            .fire("EMP2", "zone:entry", AttendanceAction::ClockIn, Timestamp::from_secs(1))
            .is_err());
        assert_eq!(sink.records()?.len(), 1);
        Ok(())
    }
}
