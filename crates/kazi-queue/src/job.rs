//! Job definition and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job status.
///
/// `pending` and `processing` are the only states from which a job can
/// still execute; the other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempts or failed without retry.
    Failed,
    /// Cancelled before it was ever claimed.
    Cancelled,
}

impl JobStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether no further transitions can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID.
    pub id: Uuid,
    /// Logical partition; ordering never interleaves across queues.
    pub queue_name: String,
    /// Opaque string selecting the handler.
    pub job_type: String,
    /// Opaque payload for the handler.
    pub payload: serde_json::Value,
    /// Higher priority claims first.
    pub priority: i64,
    /// Current status.
    pub status: JobStatus,
    /// Executions so far (claims that ended in a fail report).
    pub attempts: u32,
    /// Total execution budget.
    pub max_attempts: u32,
    /// Earliest eligible claim time (None = eligible immediately).
    pub delay_until: Option<DateTime<Utc>>,
    /// Identity of the claiming worker while processing.
    pub worker_id: Option<String>,
    /// Ownership lease; a reaper may re-queue the job once this passes.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Outcome payload from a successful run.
    pub result: Option<serde_json::Value>,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the current (or last) claim happened.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether the job currently qualifies to be claimed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        match self.delay_until {
            Some(delay_until) => delay_until <= now,
            None => true,
        }
    }
}

/// Arguments for enqueueing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) queue_name: String,
    pub(crate) job_type: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) priority: i64,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) delay_until: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Create a new enqueue request with default priority and retry budget.
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            priority: 0,
            max_attempts: None,
            delay_until: None,
        }
    }

    /// Set the priority (higher claims first).
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the total execution budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the earliest eligible claim time.
    pub fn with_delay_until(mut self, delay_until: DateTime<Utc>) -> Self {
        self.delay_until = Some(delay_until);
        self
    }
}

/// Filters for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict to one queue.
    pub queue_name: Option<String>,
    /// Restrict to one job type.
    pub job_type: Option<String>,
    /// Restrict to one status.
    pub status: Option<JobStatus>,
}

/// Aggregate job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs waiting to be claimed.
    pub pending: u64,
    /// Jobs currently held by workers.
    pub processing: u64,
    /// Jobs finished successfully.
    pub completed: u64,
    /// Jobs failed terminally.
    pub failed: u64,
    /// Jobs cancelled before claim.
    pub cancelled: u64,
    /// All jobs.
    pub total: u64,
}

/// Result of a failure report.
#[derive(Debug, Clone)]
pub struct FailOutcome {
    /// The job after the transition.
    pub job: Job,
    /// Whether the job went back to the eligible pool.
    pub will_retry: bool,
}
