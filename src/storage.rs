use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

use crate::attendance::{
    AttendanceAction, AttendanceRecord, AttendanceSink, AttendanceStatusSnapshot,
};
use crate::Timestamp;

/// SQLite-backed attendance store.
///
/// Keeps one status row per employee and an append-only table of clock events. The
/// status row and the event row are written in one transaction.
pub struct SqliteAttendanceSink {
    conn: Mutex<Connection>,
}

impl SqliteAttendanceSink {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open attendance database {}", db_path))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("attendance database lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS attendance_status (
              employee_id TEXT PRIMARY KEY,
              is_clocked_in INTEGER NOT NULL,
              clock_in_ms INTEGER,
              last_clock_in_ms INTEGER,
              last_clock_out_ms INTEGER
            );

            CREATE TABLE IF NOT EXISTS attendance_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              employee_id TEXT NOT NULL,
              zone_id TEXT NOT NULL,
              action TEXT NOT NULL,
              at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_attendance_events_employee
              ON attendance_events(employee_id, at_ms);
            "#,
        )?;
        Ok(())
    }

    fn record(
        &self,
        employee_id: &str,
        zone_id: &str,
        action: AttendanceAction,
        at: Timestamp,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO attendance_events(employee_id, zone_id, action, at_ms)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![employee_id, zone_id, action.as_str(), at.as_millis()],
        )?;
        match action {
            AttendanceAction::ClockIn => {
                tx.execute(
                    r#"
                    INSERT INTO attendance_status(
                      employee_id, is_clocked_in, clock_in_ms, last_clock_in_ms
                    )
                    VALUES (?1, 1, ?2, ?2)
                    ON CONFLICT(employee_id) DO UPDATE SET
                      is_clocked_in = 1,
                      clock_in_ms = excluded.clock_in_ms,
                      last_clock_in_ms = excluded.last_clock_in_ms
                    "#,
                    params![employee_id, at.as_millis()],
                )?;
            }
            AttendanceAction::ClockOut => {
                tx.execute(
                    r#"
                    INSERT INTO attendance_status(employee_id, is_clocked_in, last_clock_out_ms)
                    VALUES (?1, 0, ?2)
                    ON CONFLICT(employee_id) DO UPDATE SET
                      is_clocked_in = 0,
                      clock_in_ms = NULL,
                      last_clock_out_ms = excluded.last_clock_out_ms
                    "#,
                    params![employee_id, at.as_millis()],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Clock events for one employee, oldest first.
    pub fn records_for(&self, employee_id: &str) -> Result<Vec<AttendanceRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT zone_id, action, at_ms FROM attendance_events
             WHERE employee_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![employee_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (zone_id, action, at_ms) = row?;
            let action = match action.as_str() {
                "clock_in" => AttendanceAction::ClockIn,
                "clock_out" => AttendanceAction::ClockOut,
                other => return Err(anyhow!("corrupt attendance event action '{}'", other)),
            };
            out.push(AttendanceRecord {
                employee_id: employee_id.to_string(),
                zone_id,
                action,
                at: Timestamp::from_millis(at_ms),
            });
        }
        Ok(out)
    }
}

impl AttendanceSink for SqliteAttendanceSink {
    fn status(&self, employee_id: &str) -> Result<AttendanceStatusSnapshot> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT is_clocked_in, clock_in_ms, last_clock_in_ms, last_clock_out_ms
                FROM attendance_status WHERE employee_id = ?1
                "#,
                params![employee_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(match row {
            Some((clocked_in, clock_in, last_in, last_out)) => AttendanceStatusSnapshot {
                is_clocked_in: clocked_in != 0,
                clock_in_time: clock_in.map(Timestamp::from_millis),
                last_clock_in_time: last_in.map(Timestamp::from_millis),
                last_clock_out_time: last_out.map(Timestamp::from_millis),
            },
            None => AttendanceStatusSnapshot::default(),
        })
    }

    fn clock_in(&self, employee_id: &str, zone_id: &str, at: Timestamp) -> Result<()> {
        self.record(employee_id, zone_id, AttendanceAction::ClockIn, at)
    }

    fn clock_out(&self, employee_id: &str, zone_id: &str, at: Timestamp) -> Result<()> {
        self.record(employee_id, zone_id, AttendanceAction::ClockOut, at)
    }
}
