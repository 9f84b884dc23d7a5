//! Schedule engine: creation, due polling, run recording and activation.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use kazi_store::Database;

use crate::error::ScheduleError;
use crate::next_run::{next_run, parse_timezone};
use crate::schedule::{NewSchedule, RunOutcome, RunStatus, Schedule, ScheduleKind, ScheduleRun};

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

const SCHEDULE_COLUMNS: &str = "id, name, schedule_type, cron_expression, interval_minutes, \
     days_of_week, start_time, end_time, timezone, entity_type, entity_id, action, \
     action_config, is_active, run_count, last_run_at, last_status, next_run_at, created_at, \
     updated_at";

const RUN_COLUMNS: &str = "id, schedule_id, status, duration_ms, error, output, executed_at";

/// Schedule engine over the shared store.
#[derive(Clone)]
pub struct ScheduleEngine {
    db: Database,
}

impl ScheduleEngine {
    /// Create an engine.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a schedule. Validates the definition and computes the
    /// initial `next_run_at` before any write.
    pub async fn create(&self, new: NewSchedule) -> Result<Schedule, ScheduleError> {
        if new.name.trim().is_empty() {
            return Err(ScheduleError::Validation("name must not be empty".into()));
        }
        parse_timezone(&new.timezone)?;
        match &new.kind {
            ScheduleKind::OneShot => {}
            ScheduleKind::Interval { minutes } => {
                if *minutes == 0 {
                    return Err(ScheduleError::Validation(
                        "interval must be at least 1 minute".into(),
                    ));
                }
            }
            ScheduleKind::Cron {
                expression,
                days_of_week,
            } => {
                expression.parse::<cron::Schedule>()?;
                if let Some(days) = days_of_week {
                    if days.is_empty() {
                        return Err(ScheduleError::Validation(
                            "days_of_week must not be empty".into(),
                        ));
                    }
                    if days.iter().any(|d| *d > 6) {
                        return Err(ScheduleError::Validation(
                            "days_of_week entries must be 0 (Sunday) through 6 (Saturday)".into(),
                        ));
                    }
                }
            }
        }

        let now = Utc::now();
        let start_time = new.start_time.unwrap_or(now);
        if let Some(end_time) = new.end_time {
            if end_time <= start_time {
                return Err(ScheduleError::Validation(
                    "end_time must be after start_time".into(),
                ));
            }
        }

        let mut schedule = Schedule {
            id: Uuid::new_v4(),
            name: new.name,
            kind: new.kind,
            start_time,
            end_time: new.end_time,
            timezone: new.timezone,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            action: new.action,
            action_config: new.action_config,
            is_active: true,
            run_count: 0,
            last_run_at: None,
            last_status: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        schedule.next_run_at = next_run(&schedule, now)?;

        let insert = schedule.clone();
        self.db
            .conn()
            .call(move |conn| {
                let (cron_expression, interval_minutes, days_of_week) = kind_columns(&insert.kind);
                conn.execute(
                    "INSERT INTO schedules (id, name, schedule_type, cron_expression, \
                     interval_minutes, days_of_week, start_time, end_time, timezone, \
                     entity_type, entity_id, action, action_config, is_active, run_count, \
                     next_run_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                     ?16, ?17, ?18)",
                    params![
                        insert.id.to_string(),
                        insert.name,
                        insert.kind.as_type_str(),
                        cron_expression,
                        interval_minutes,
                        days_of_week,
                        insert.start_time.to_rfc3339(),
                        insert.end_time.map(|t| t.to_rfc3339()),
                        insert.timezone,
                        insert.entity_type,
                        insert.entity_id,
                        insert.action,
                        insert.action_config.to_string(),
                        insert.is_active,
                        insert.run_count,
                        insert.next_run_at.map(|t| t.to_rfc3339()),
                        insert.created_at.to_rfc3339(),
                        insert.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| ScheduleError::Storage(e.to_string()))?;

        info!(schedule.id = %schedule.id, name = %schedule.name, "Schedule created");
        Ok(schedule)
    }

    /// Load a schedule by id.
    pub async fn get(&self, schedule_id: Uuid) -> Result<Schedule, ScheduleError> {
        let id = schedule_id.to_string();
        let schedule = self
            .db
            .conn()
            .call(move |conn| Ok(load_schedule(conn, &id)?))
            .await
            .map_err(|e| ScheduleError::Storage(e.to_string()))?;
        schedule.ok_or(ScheduleError::NotFound(schedule_id))
    }

    /// All schedules, newest first.
    pub async fn list(&self) -> Result<Vec<Schedule>, ScheduleError> {
        self.db
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at DESC, id DESC"
                ))?;
                let schedules = stmt
                    .query_map([], row_to_schedule)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(schedules)
            })
            .await
            .map_err(|e| ScheduleError::Storage(e.to_string()))
    }

    /// Active schedules whose next run has come due, soonest first. This
    /// is the polling entry point an external executor calls on a timer.
    pub async fn due(&self) -> Result<Vec<Schedule>, ScheduleError> {
        let now_ts = Utc::now().to_rfc3339();
        self.db
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules
                     WHERE is_active = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                     ORDER BY next_run_at ASC"
                ))?;
                let schedules = stmt
                    .query_map([&now_ts], row_to_schedule)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(schedules)
            })
            .await
            .map_err(|e| ScheduleError::Storage(e.to_string()))
    }

    /// Record one firing: append the immutable audit row, bump the run
    /// bookkeeping and recompute `next_run_at` seeded from now, all in one
    /// transaction so the schedule can never stop advancing after a run.
    pub async fn record_run(
        &self,
        schedule_id: Uuid,
        outcome: RunOutcome,
    ) -> Result<Schedule, ScheduleError> {
        let schedule = self.get(schedule_id).await?;
        let now = Utc::now();
        let next = next_run(&schedule, now)?;

        let id = schedule_id.to_string();
        let now_ts = now.to_rfc3339();
        let next_ts = next.map(|t| t.to_rfc3339());
        let run_id = Uuid::new_v4();

        let updated = self
            .db
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO schedule_runs (id, schedule_id, status, duration_ms, error, \
                     output, executed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        run_id.to_string(),
                        id,
                        outcome.status.as_str(),
                        outcome.duration_ms,
                        outcome.error,
                        outcome.output.map(|v| v.to_string()),
                        now_ts,
                    ],
                )?;
                tx.execute(
                    "UPDATE schedules
                     SET run_count = run_count + 1, last_run_at = ?2, last_status = ?3,
                         next_run_at = ?4, updated_at = ?2
                     WHERE id = ?1",
                    params![id, now_ts, outcome.status.as_str(), next_ts],
                )?;
                let schedule = load_schedule(&tx, &id)?;
                tx.commit()?;
                Ok(schedule)
            })
            .await
            .map_err(|e| ScheduleError::Storage(e.to_string()))?;

        let schedule = updated.ok_or(ScheduleError::NotFound(schedule_id))?;
        debug!(
            schedule.id = %schedule.id,
            status = %outcome_status(&schedule),
            next_run_at = ?schedule.next_run_at,
            "Schedule run recorded"
        );
        Ok(schedule)
    }

    /// Put the schedule back into due-schedule polls.
    pub async fn activate(&self, schedule_id: Uuid) -> Result<Schedule, ScheduleError> {
        self.set_active(schedule_id, true).await
    }

    /// Remove the schedule from due-schedule polls. The computed
    /// `next_run_at` is preserved so reactivation resumes without a
    /// recompute.
    pub async fn deactivate(&self, schedule_id: Uuid) -> Result<Schedule, ScheduleError> {
        self.set_active(schedule_id, false).await
    }

    /// Run history for a schedule, newest first.
    pub async fn runs(
        &self,
        schedule_id: Uuid,
        limit: Option<u32>,
    ) -> Result<Vec<ScheduleRun>, ScheduleError> {
        let id = schedule_id.to_string();
        self.db
            .conn()
            .call(move |conn| {
                let mut sql = format!(
                    "SELECT {RUN_COLUMNS} FROM schedule_runs
                     WHERE schedule_id = ?1 ORDER BY executed_at DESC, id DESC"
                );
                if let Some(limit) = limit {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
                let mut stmt = conn.prepare(&sql)?;
                let runs = stmt
                    .query_map([&id], row_to_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(runs)
            })
            .await
            .map_err(|e| ScheduleError::Storage(e.to_string()))
    }

    async fn set_active(&self, schedule_id: Uuid, active: bool) -> Result<Schedule, ScheduleError> {
        let id = schedule_id.to_string();
        let now_ts = Utc::now().to_rfc3339();

        let updated = self
            .db
            .conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE schedules SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, active, now_ts],
                )?;
                Ok(load_schedule(conn, &id)?)
            })
            .await
            .map_err(|e| ScheduleError::Storage(e.to_string()))?;

        let schedule = updated.ok_or(ScheduleError::NotFound(schedule_id))?;
        info!(schedule.id = %schedule.id, active, "Schedule activation toggled");
        Ok(schedule)
    }
}

fn outcome_status(schedule: &Schedule) -> &str {
    schedule.last_status.map(|s| s.as_str()).unwrap_or("unknown")
}

fn kind_columns(kind: &ScheduleKind) -> (Option<String>, Option<u32>, Option<String>) {
    match kind {
        ScheduleKind::OneShot => (None, None, None),
        ScheduleKind::Interval { minutes } => (None, Some(*minutes), None),
        ScheduleKind::Cron {
            expression,
            days_of_week,
        } => (
            Some(expression.clone()),
            None,
            days_of_week
                .as_ref()
                .map(|days| serde_json::to_string(days).unwrap_or_else(|_| "[]".to_string())),
        ),
    }
}

fn load_schedule(conn: &Connection, id: &str) -> rusqlite::Result<Option<Schedule>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"
    ))?;
    stmt.query_row([id], row_to_schedule).optional()
}

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let id: String = row.get(0)?;
    let schedule_type: String = row.get(2)?;
    let cron_expression: Option<String> = row.get(3)?;
    let interval_minutes: Option<u32> = row.get(4)?;
    let days_of_week: Option<String> = row.get(5)?;
    let action_config: String = row.get(12)?;
    let last_status: Option<String> = row.get(16)?;

    let kind = match schedule_type.as_str() {
        "one_shot" => ScheduleKind::OneShot,
        "interval" => ScheduleKind::Interval {
            minutes: interval_minutes.ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    Type::Integer,
                    "interval schedule without interval_minutes".into(),
                )
            })?,
        },
        "cron" => ScheduleKind::Cron {
            expression: cron_expression.ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    Type::Text,
                    "cron schedule without cron_expression".into(),
                )
            })?,
            days_of_week: days_of_week
                .map(|days| {
                    serde_json::from_str(&days).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                    })
                })
                .transpose()?,
        },
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown schedule type: {other}").into(),
            ))
        }
    };

    Ok(Schedule {
        id: parse_uuid(0, &id)?,
        name: row.get(1)?,
        kind,
        start_time: ts(row, 6)?,
        end_time: opt_ts(row, 7)?,
        timezone: row.get(8)?,
        entity_type: row.get(9)?,
        entity_id: row.get(10)?,
        action: row.get(11)?,
        action_config: serde_json::from_str(&action_config).unwrap_or(serde_json::Value::Null),
        is_active: row.get(13)?,
        run_count: row.get(14)?,
        last_run_at: opt_ts(row, 15)?,
        last_status: last_status.as_deref().and_then(RunStatus::parse),
        next_run_at: opt_ts(row, 17)?,
        created_at: ts(row, 18)?,
        updated_at: ts(row, 19)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<ScheduleRun> {
    let id: String = row.get(0)?;
    let schedule_id: String = row.get(1)?;
    let status: String = row.get(2)?;
    let output: Option<String> = row.get(5)?;

    Ok(ScheduleRun {
        id: parse_uuid(0, &id)?,
        schedule_id: parse_uuid(1, &schedule_id)?,
        status: RunStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown run status: {status}").into(),
            )
        })?,
        duration_ms: row.get(3)?,
        error: row.get(4)?,
        output: output.map(|o| serde_json::from_str(&o).unwrap_or(serde_json::Value::Null)),
        executed_at: ts(row, 6)?,
    })
}

fn parse_uuid(idx: usize, text: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}
