//! Schedule definition, kinds and run history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What makes a schedule fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Fire once at the schedule's start time.
    OneShot,
    /// Fire every N minutes.
    Interval {
        /// Minutes between firings.
        minutes: u32,
    },
    /// Fire per a cron expression, optionally restricted to certain days.
    Cron {
        /// Six-field cron expression with seconds, e.g. `0 0 9 * * *`.
        expression: String,
        /// Allowed days, 0 = Sunday through 6 = Saturday. `None` means
        /// every day the expression matches.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        days_of_week: Option<Vec<u8>>,
    },
}

impl ScheduleKind {
    /// Stable string form used in the database.
    pub fn as_type_str(&self) -> &'static str {
        match self {
            ScheduleKind::OneShot => "one_shot",
            ScheduleKind::Interval { .. } => "interval",
            ScheduleKind::Cron { .. } => "cron",
        }
    }
}

/// Outcome status of a single schedule firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The action ran to completion.
    Success,
    /// The action failed.
    Failed,
    /// The firing was skipped by the executor.
    Skipped,
}

impl RunStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recurring or one-shot trigger definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique schedule ID.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// What makes the schedule fire.
    pub kind: ScheduleKind,
    /// Earliest possible firing.
    pub start_time: DateTime<Utc>,
    /// No firings are proposed past this instant.
    pub end_time: Option<DateTime<Utc>>,
    /// IANA timezone the cron expression is evaluated in.
    pub timezone: String,
    /// Kind of thing the firing acts on.
    pub entity_type: String,
    /// Specific entity the firing acts on, if any.
    pub entity_id: Option<String>,
    /// What to do when the schedule fires, commonly enqueueing a job.
    pub action: String,
    /// Opaque configuration for the action.
    pub action_config: serde_json::Value,
    /// Whether the schedule appears in due-schedule polls.
    pub is_active: bool,
    /// Number of recorded firings.
    pub run_count: u64,
    /// When the schedule last fired.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Status of the last firing.
    pub last_status: Option<RunStatus>,
    /// When the schedule should fire next; `None` once exhausted.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Arguments for creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub(crate) name: String,
    pub(crate) kind: ScheduleKind,
    pub(crate) start_time: Option<DateTime<Utc>>,
    pub(crate) end_time: Option<DateTime<Utc>>,
    pub(crate) timezone: String,
    pub(crate) entity_type: String,
    pub(crate) entity_id: Option<String>,
    pub(crate) action: String,
    pub(crate) action_config: serde_json::Value,
}

impl NewSchedule {
    /// Create a schedule definition. The default target enqueues a job;
    /// the default start time is now.
    pub fn new(name: impl Into<String>, kind: ScheduleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            start_time: None,
            end_time: None,
            timezone: "UTC".to_string(),
            entity_type: "job".to_string(),
            entity_id: None,
            action: "enqueue".to_string(),
            action_config: serde_json::json!({}),
        }
    }

    /// Set the earliest possible firing.
    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Stop proposing firings past this instant.
    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    /// Set the IANA timezone cron expressions are evaluated in.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Set what the firing acts on and what it does.
    pub fn with_target(mut self, entity_type: impl Into<String>, action: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self.action = action.into();
        self
    }

    /// Bind the firing to one specific entity.
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Set the opaque action configuration.
    pub fn with_action_config(mut self, action_config: serde_json::Value) -> Self {
        self.action_config = action_config;
        self
    }
}

/// Immutable audit record of one schedule firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    /// Unique run ID.
    pub id: Uuid,
    /// The schedule that fired.
    pub schedule_id: Uuid,
    /// Outcome status.
    pub status: RunStatus,
    /// How long the action took.
    pub duration_ms: Option<u64>,
    /// Failure message, if any.
    pub error: Option<String>,
    /// Action output, if any.
    pub output: Option<serde_json::Value>,
    /// When the firing was recorded.
    pub executed_at: DateTime<Utc>,
}

/// What to record about one firing.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Outcome status.
    pub status: RunStatus,
    /// How long the action took.
    pub duration_ms: Option<u64>,
    /// Failure message, if any.
    pub error: Option<String>,
    /// Action output, if any.
    pub output: Option<serde_json::Value>,
}

impl RunOutcome {
    /// A successful firing.
    pub fn success(duration_ms: u64) -> Self {
        Self {
            status: RunStatus::Success,
            duration_ms: Some(duration_ms),
            error: None,
            output: None,
        }
    }

    /// A failed firing.
    pub fn failure(duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            duration_ms: Some(duration_ms),
            error: Some(error.into()),
            output: None,
        }
    }

    /// A firing the executor chose to skip.
    pub fn skipped() -> Self {
        Self {
            status: RunStatus::Skipped,
            duration_ms: None,
            error: None,
            output: None,
        }
    }

    /// Attach action output.
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}
