use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run status. The transition graph is acyclic: QUEUED -> RUNNING ->
/// {SUCCEEDED, FAILED, CANCELED}, or QUEUED -> CANCELED directly. Never
/// RUNNING -> QUEUED; retries are new runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "QUEUED" => Self::Queued,
            "RUNNING" => Self::Running,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "CANCELED" => Self::Canceled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Busy => "BUSY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "IDLE" => Self::Idle,
            "BUSY" => Self::Busy,
            _ => return None,
        })
    }
}

/// One execution attempt of a task with concrete parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub task_id: String,
    pub params: serde_json::Value,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub pgid: Option<i32>,
    pub cancel_requested: bool,
    pub cron_id: Option<String>,
}

/// A single structured event appended to a run's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: String,
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub data: serde_json::Value,
}

/// A file artifact produced by a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub run_id: String,
    pub file_id: String,
    pub title: String,
    pub kind: String,
    pub mime: String,
    pub path: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Soft-state registry entry for a live Worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub hostname: String,
    pub pid: i32,
    pub status: WorkerStatus,
    pub run_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
}

/// A stored schedule that materializes runs over time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronEntry {
    pub cron_id: String,
    pub task_id: String,
    pub cron_expression: String,
    pub params: serde_json::Value,
    pub name: String,
    pub is_enabled: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// A run returned by `reap_expired`: just enough to signal the orphaned
/// process group and then abandon the row.
#[derive(Debug, Clone)]
pub struct ExpiredLease {
    pub run_id: String,
    pub pgid: Option<i32>,
    pub lease_owner: String,
}

/// Filters accepted by `list_runs` (ambient CRUD surface for the HTTP API).
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub task_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: i64,
}
