//! Queue engine: enqueue, claim, complete, fail and maintenance.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kazi_store::Database;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{FailOutcome, Job, JobFilter, JobStatus, NewJob, QueueStats};

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

const JOB_COLUMNS: &str = "id, queue_name, job_type, payload, priority, status, attempts, \
     max_attempts, delay_until, worker_id, lease_expires_at, result, last_error, created_at, \
     started_at, completed_at, updated_at";

/// Queue engine over the shared store.
///
/// All mutation goes through conditional updates on the `status` column,
/// so every transition is a single-row compare-and-swap and at most one
/// worker can ever hold a job.
#[derive(Clone)]
pub struct QueueEngine {
    db: Database,
    config: QueueConfig,
}

impl QueueEngine {
    /// Create an engine with the default configuration.
    pub fn new(db: Database) -> Self {
        Self::with_config(db, QueueConfig::default())
    }

    /// Create an engine with a custom configuration.
    pub fn with_config(db: Database, config: QueueConfig) -> Self {
        Self { db, config }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a job. Validates arguments before any write.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Job, QueueError> {
        if new_job.queue_name.trim().is_empty() {
            return Err(QueueError::Validation("queue_name must not be empty".into()));
        }
        if new_job.job_type.trim().is_empty() {
            return Err(QueueError::Validation("job_type must not be empty".into()));
        }
        if new_job.max_attempts == Some(0) {
            return Err(QueueError::Validation("max_attempts must be at least 1".into()));
        }

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            queue_name: new_job.queue_name,
            job_type: new_job.job_type,
            payload: new_job.payload,
            priority: new_job.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new_job
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
            delay_until: new_job.delay_until,
            worker_id: None,
            lease_expires_at: None,
            result: None,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        let insert = job.clone();
        self.db
            .conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO jobs (id, queue_name, job_type, payload, priority, status, \
                     attempts, max_attempts, delay_until, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        insert.id.to_string(),
                        insert.queue_name,
                        insert.job_type,
                        insert.payload.to_string(),
                        insert.priority,
                        insert.status.as_str(),
                        insert.attempts,
                        insert.max_attempts,
                        insert.delay_until.map(|t| t.to_rfc3339()),
                        insert.created_at.to_rfc3339(),
                        insert.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        debug!(job.id = %job.id, queue = %job.queue_name, job_type = %job.job_type, "Job enqueued");
        Ok(job)
    }

    /// Atomically claim the best eligible job in a queue.
    ///
    /// Selection is highest priority first, oldest first within a priority
    /// band. The update is conditional on `status = 'pending'`, so two
    /// concurrent callers can never claim the same job; losing the race and
    /// finding no eligible job are the same outcome, `Ok(None)`.
    pub async fn claim(
        &self,
        queue_name: &str,
        worker_id: &str,
    ) -> Result<Option<Job>, QueueError> {
        let queue_name = queue_name.to_string();
        let worker_id = worker_id.to_string();
        let now = Utc::now();
        let now_ts = now.to_rfc3339();
        let lease_ts = (now + Duration::seconds(self.config.lease_secs as i64)).to_rfc3339();

        let claimed = self
            .db
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "UPDATE jobs
                     SET status = 'processing', worker_id = ?2, started_at = ?3,
                         lease_expires_at = ?4, updated_at = ?3
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE queue_name = ?1
                           AND status = 'pending'
                           AND (delay_until IS NULL OR delay_until <= ?3)
                         ORDER BY priority DESC, created_at ASC, id ASC
                         LIMIT 1
                     ) AND status = 'pending'
                     RETURNING {JOB_COLUMNS}"
                ))?;
                let job = stmt
                    .query_row(params![queue_name, worker_id, now_ts, lease_ts], row_to_job)
                    .optional()?;
                Ok(job)
            })
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        if let Some(ref job) = claimed {
            debug!(job.id = %job.id, worker = %worker_id_of(job), "Job claimed");
        }
        Ok(claimed)
    }

    /// Load a job by id.
    pub async fn get(&self, job_id: Uuid) -> Result<Job, QueueError> {
        let id = job_id.to_string();
        let job = self
            .db
            .conn()
            .call(move |conn| Ok(load_job(conn, &id)?))
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        job.ok_or(QueueError::NotFound(job_id))
    }

    /// Record a successful run. Valid only from `processing`; completing an
    /// already-completed job is a no-op success so duplicate completion
    /// reports are harmless.
    pub async fn complete(
        &self,
        job_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<Job, QueueError> {
        let id = job_id.to_string();
        let now_ts = Utc::now().to_rfc3339();
        let result_text = result.map(|v| v.to_string());

        let outcome = self
            .db
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let n = tx.execute(
                    "UPDATE jobs
                     SET status = 'completed', result = ?2, completed_at = ?3,
                         lease_expires_at = NULL, updated_at = ?3
                     WHERE id = ?1 AND status = 'processing'",
                    params![id, result_text, now_ts],
                )?;
                let outcome = if n == 0 {
                    match load_job(&tx, &id)? {
                        None => Gate::Missing,
                        Some(job) if job.status == JobStatus::Completed => Gate::Idempotent(job),
                        Some(job) => Gate::WrongState(job.status),
                    }
                } else {
                    match load_job(&tx, &id)? {
                        Some(job) => Gate::Done(job),
                        None => Gate::Missing,
                    }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        match outcome {
            Gate::Done(job) => {
                debug!(job.id = %job.id, "Job completed");
                Ok(job)
            }
            Gate::Idempotent(job) => Ok(job),
            Gate::Missing => Err(QueueError::NotFound(job_id)),
            Gate::WrongState(actual) => Err(QueueError::InvalidState {
                id: job_id,
                expected: JobStatus::Processing,
                actual,
            }),
        }
    }

    /// Record a failed run. Valid only from `processing`.
    ///
    /// Increments `attempts`; when `should_retry` is set and budget
    /// remains, the job goes back to `pending` with `delay_until` from the
    /// configured backoff. Otherwise it fails terminally.
    pub async fn fail(
        &self,
        job_id: Uuid,
        error_message: &str,
        should_retry: bool,
    ) -> Result<FailOutcome, QueueError> {
        let id = job_id.to_string();
        let error_message = error_message.to_string();
        let backoff = self.config.backoff;
        let now = Utc::now();

        let outcome = self
            .db
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let gate = match load_job(&tx, &id)? {
                    None => FailGate::Missing,
                    Some(job) if job.status != JobStatus::Processing => {
                        FailGate::WrongState(job.status)
                    }
                    Some(job) => {
                        let attempts = job.attempts + 1;
                        let will_retry = should_retry && attempts < job.max_attempts;
                        let now_ts = now.to_rfc3339();
                        if will_retry {
                            let delay_ts = backoff
                                .delay(attempts)
                                .map(|d| (now + Duration::seconds(d.as_secs() as i64)).to_rfc3339());
                            tx.execute(
                                "UPDATE jobs
                                 SET status = 'pending', attempts = ?2, last_error = ?3,
                                     worker_id = NULL, started_at = NULL,
                                     lease_expires_at = NULL, delay_until = ?4, updated_at = ?5
                                 WHERE id = ?1 AND status = 'processing'",
                                params![id, attempts, error_message, delay_ts, now_ts],
                            )?;
                        } else {
                            tx.execute(
                                "UPDATE jobs
                                 SET status = 'failed', attempts = ?2, last_error = ?3,
                                     lease_expires_at = NULL, updated_at = ?4
                                 WHERE id = ?1 AND status = 'processing'",
                                params![id, attempts, error_message, now_ts],
                            )?;
                        }
                        match load_job(&tx, &id)? {
                            Some(job) => FailGate::Done { job, will_retry },
                            None => FailGate::Missing,
                        }
                    }
                };
                tx.commit()?;
                Ok(gate)
            })
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        match outcome {
            FailGate::Done { job, will_retry } => {
                if will_retry {
                    debug!(job.id = %job.id, attempts = job.attempts, "Job failed, re-queued");
                } else {
                    warn!(job.id = %job.id, attempts = job.attempts, "Job failed terminally");
                }
                Ok(FailOutcome { job, will_retry })
            }
            FailGate::Missing => Err(QueueError::NotFound(job_id)),
            FailGate::WrongState(actual) => Err(QueueError::InvalidState {
                id: job_id,
                expected: JobStatus::Processing,
                actual,
            }),
        }
    }

    /// Cancel a job that has not been claimed yet. Valid only from
    /// `pending`; cancelling an already-cancelled job is a no-op success.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, QueueError> {
        let id = job_id.to_string();
        let now_ts = Utc::now().to_rfc3339();

        let outcome = self
            .db
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let n = tx.execute(
                    "UPDATE jobs SET status = 'cancelled', updated_at = ?2
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, now_ts],
                )?;
                let outcome = if n == 0 {
                    match load_job(&tx, &id)? {
                        None => Gate::Missing,
                        Some(job) if job.status == JobStatus::Cancelled => Gate::Idempotent(job),
                        Some(job) => Gate::WrongState(job.status),
                    }
                } else {
                    match load_job(&tx, &id)? {
                        Some(job) => Gate::Done(job),
                        None => Gate::Missing,
                    }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        match outcome {
            Gate::Done(job) => {
                info!(job.id = %job.id, "Job cancelled");
                Ok(job)
            }
            Gate::Idempotent(job) => Ok(job),
            Gate::Missing => Err(QueueError::NotFound(job_id)),
            Gate::WrongState(actual) => Err(QueueError::InvalidState {
                id: job_id,
                expected: JobStatus::Pending,
                actual,
            }),
        }
    }

    /// List jobs matching a filter, newest first.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, QueueError> {
        self.db
            .conn()
            .call(move |conn| {
                let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
                let mut clauses: Vec<String> = Vec::new();
                let mut args: Vec<String> = Vec::new();

                if let Some(queue_name) = filter.queue_name {
                    args.push(queue_name);
                    clauses.push(format!("queue_name = ?{}", args.len()));
                }
                if let Some(job_type) = filter.job_type {
                    args.push(job_type);
                    clauses.push(format!("job_type = ?{}", args.len()));
                }
                if let Some(status) = filter.status {
                    args.push(status.as_str().to_string());
                    clauses.push(format!("status = ?{}", args.len()));
                }
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                sql.push_str(" ORDER BY created_at DESC, id DESC");

                let mut stmt = conn.prepare(&sql)?;
                let jobs = stmt
                    .query_map(params_from_iter(args), row_to_job)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(jobs)
            })
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))
    }

    /// Aggregate job counts by status, optionally scoped to one queue.
    pub async fn stats(&self, queue_name: Option<&str>) -> Result<QueueStats, QueueError> {
        let queue_name = queue_name.map(str::to_string);
        self.db
            .conn()
            .call(move |conn| {
                let (sql, args) = match queue_name {
                    Some(q) => (
                        "SELECT status, COUNT(*) FROM jobs WHERE queue_name = ?1 GROUP BY status",
                        vec![q],
                    ),
                    None => ("SELECT status, COUNT(*) FROM jobs GROUP BY status", vec![]),
                };

                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map(params_from_iter(args), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })?;

                let mut stats = QueueStats::default();
                for row in rows {
                    let (status, count) = row?;
                    match JobStatus::parse(&status) {
                        Some(JobStatus::Pending) => stats.pending = count,
                        Some(JobStatus::Processing) => stats.processing = count,
                        Some(JobStatus::Completed) => stats.completed = count,
                        Some(JobStatus::Failed) => stats.failed = count,
                        Some(JobStatus::Cancelled) => stats.cancelled = count,
                        None => {}
                    }
                    stats.total += count;
                }
                Ok(stats)
            })
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))
    }

    /// Operator override: re-queue all terminally failed jobs with a fresh
    /// attempt budget. Returns how many jobs were re-queued.
    pub async fn retry_failed(&self, queue_name: Option<&str>) -> Result<u64, QueueError> {
        let queue_name = queue_name.map(str::to_string);
        let now_ts = Utc::now().to_rfc3339();

        let count = self
            .db
            .conn()
            .call(move |conn| {
                let n = match queue_name {
                    Some(q) => conn.execute(
                        "UPDATE jobs
                         SET status = 'pending', attempts = 0, last_error = NULL,
                             worker_id = NULL, started_at = NULL, delay_until = NULL,
                             updated_at = ?2
                         WHERE status = 'failed' AND queue_name = ?1",
                        params![q, now_ts],
                    )?,
                    None => conn.execute(
                        "UPDATE jobs
                         SET status = 'pending', attempts = 0, last_error = NULL,
                             worker_id = NULL, started_at = NULL, delay_until = NULL,
                             updated_at = ?1
                         WHERE status = 'failed'",
                        params![now_ts],
                    )?,
                };
                Ok(n as u64)
            })
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        info!(count, "Failed jobs re-queued");
        Ok(count)
    }

    /// Delete completed jobs older than the retention window. Jobs in any
    /// other status are never touched; failures must be triaged explicitly.
    /// Returns how many jobs were deleted.
    pub async fn purge_completed(
        &self,
        queue_name: Option<&str>,
        older_than_days: u32,
    ) -> Result<u64, QueueError> {
        let queue_name = queue_name.map(str::to_string);
        let cutoff = (Utc::now() - Duration::days(i64::from(older_than_days))).to_rfc3339();

        let count = self
            .db
            .conn()
            .call(move |conn| {
                let n = match queue_name {
                    Some(q) => conn.execute(
                        "DELETE FROM jobs
                         WHERE status = 'completed' AND completed_at IS NOT NULL
                           AND completed_at < ?1 AND queue_name = ?2",
                        params![cutoff, q],
                    )?,
                    None => conn.execute(
                        "DELETE FROM jobs
                         WHERE status = 'completed' AND completed_at IS NOT NULL
                           AND completed_at < ?1",
                        params![cutoff],
                    )?,
                };
                Ok(n as u64)
            })
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        info!(count, "Purged completed jobs");
        Ok(count)
    }

    /// Re-queue processing jobs whose lease has expired.
    ///
    /// A worker that dies between claim and its completion report would
    /// otherwise leave the job stuck in `processing` forever. The expired
    /// claim counts as an attempt; jobs out of budget fail terminally.
    /// Returns how many jobs were transitioned.
    pub async fn reap_expired(&self) -> Result<u64, QueueError> {
        let now_ts = Utc::now().to_rfc3339();

        let count = self
            .db
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let expired: Vec<(String, u32, u32)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, attempts, max_attempts FROM jobs
                         WHERE status = 'processing' AND lease_expires_at IS NOT NULL
                           AND lease_expires_at <= ?1",
                    )?;
                    let rows = stmt.query_map([&now_ts], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };

                let mut reaped = 0u64;
                for (id, attempts, max_attempts) in expired {
                    let attempts = attempts + 1;
                    let n = if attempts < max_attempts {
                        tx.execute(
                            "UPDATE jobs
                             SET status = 'pending', attempts = ?2, last_error = 'lease expired',
                                 worker_id = NULL, started_at = NULL, lease_expires_at = NULL,
                                 delay_until = NULL, updated_at = ?3
                             WHERE id = ?1 AND status = 'processing'",
                            params![id, attempts, now_ts],
                        )?
                    } else {
                        tx.execute(
                            "UPDATE jobs
                             SET status = 'failed', attempts = ?2, last_error = 'lease expired',
                                 lease_expires_at = NULL, updated_at = ?3
                             WHERE id = ?1 AND status = 'processing'",
                            params![id, attempts, now_ts],
                        )?
                    };
                    reaped += n as u64;
                }
                tx.commit()?;
                Ok(reaped)
            })
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        if count > 0 {
            warn!(count, "Reaped jobs with expired leases");
        }
        Ok(count)
    }
}

enum Gate {
    Done(Job),
    Idempotent(Job),
    Missing,
    WrongState(JobStatus),
}

enum FailGate {
    Done { job: Job, will_retry: bool },
    Missing,
    WrongState(JobStatus),
}

fn worker_id_of(job: &Job) -> &str {
    job.worker_id.as_deref().unwrap_or("")
}

fn load_job(conn: &Connection, id: &str) -> rusqlite::Result<Option<Job>> {
    let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))?;
    stmt.query_row([id], row_to_job).optional()
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;
    let payload: String = row.get(3)?;
    let status: String = row.get(5)?;
    let result: Option<String> = row.get(11)?;

    Ok(Job {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
        queue_name: row.get(1)?,
        job_type: row.get(2)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        priority: row.get(4)?,
        status: JobStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                format!("unknown job status: {status}").into(),
            )
        })?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        delay_until: opt_ts(row, 8)?,
        worker_id: row.get(9)?,
        lease_expires_at: opt_ts(row, 10)?,
        result: result.map(|r| serde_json::from_str(&r).unwrap_or(serde_json::Value::Null)),
        last_error: row.get(12)?,
        created_at: ts(row, 13)?,
        started_at: opt_ts(row, 14)?,
        completed_at: opt_ts(row, 15)?,
        updated_at: ts(row, 16)?,
    })
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
