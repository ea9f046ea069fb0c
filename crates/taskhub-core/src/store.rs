//! The Store trait (§4.1): a small, transactional interface. Each method
//! is a single transaction; concurrent callers are serialized by the
//! underlying database's writer lock. The Store is the sole source of
//! truth for ordering.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{Artifact, CronEntry, ExpiredLease, Run, RunFilter, RunStatus, WorkerRecord};
use crate::Result;

/// A snapshot of current per-task RUNNING counts, configured concurrency
/// limits, and which task ids are enabled, computed by the caller (the
/// Worker, from the task registry plus its own view of the world) and
/// handed to `claim_next` so the Store never needs to know about the
/// registry.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencySnapshot {
    /// task_id -> concurrency_limit (None = unbounded)
    pub limits: std::collections::HashMap<String, Option<u32>>,
    /// task ids currently enabled. `claim_next` skips any QUEUED run whose
    /// task is not in this set, per spec criterion (a).
    pub enabled: std::collections::HashSet<String>,
}

/// Restricts `claim_next` to a subset of task ids; empty means "any
/// enabled task".
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub task_ids: Vec<String>,
}

/// A snapshot of the task registry's known ids and enabled state, computed
/// by the caller and handed to `enqueue_run` so it can enforce
/// `UnknownTask`/`Disabled` without the Store depending on the
/// task-registry trait.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistrySnapshot {
    /// task_id -> is_enabled
    pub tasks: std::collections::HashMap<String, bool>,
}

impl TaskRegistrySnapshot {
    pub fn is_enabled(&self, task_id: &str) -> Option<bool> {
        self.tasks.get(task_id).copied()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn enqueue_run(
        &self,
        task_id: &str,
        params: Value,
        cron_id: Option<&str>,
        registry: &TaskRegistrySnapshot,
    ) -> Result<String>;

    async fn claim_next(
        &self,
        worker_id: &str,
        lease_duration: chrono::Duration,
        task_filter: &TaskFilter,
        concurrency: &ConcurrencySnapshot,
    ) -> Result<Option<Run>>;

    async fn renew_lease(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_duration: chrono::Duration,
    ) -> Result<()>;

    async fn set_pgid(&self, run_id: &str, worker_id: &str, pgid: i32) -> Result<()>;

    async fn append_event(&self, run_id: &str, event_type: &str, data: Value) -> Result<i64>;

    async fn finish_run(
        &self,
        run_id: &str,
        worker_id: &str,
        status: RunStatus,
        exit_code: Option<i32>,
        error: Option<&str>,
    ) -> Result<()>;

    async fn request_cancel(&self, run_id: &str) -> Result<()>;

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredLease>>;

    /// Transitions `run_id` to FAILED iff it is still RUNNING with an
    /// expired lease at call time; returns whether it actually matched,
    /// so callers don't log or emit events for a no-op (the lease may have
    /// been renewed between `reap_expired`'s listing and this call).
    async fn abandon_run(&self, run_id: &str, reason: &str) -> Result<bool>;

    async fn poll_due_cron(&self, now: DateTime<Utc>) -> Result<Vec<CronEntry>>;

    async fn advance_cron(
        &self,
        cron_id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn list_events(
        &self,
        run_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<(Vec<crate::model::Event>, i64)>;

    // --- Ambient CRUD surface, consumed by the HTTP API / CLI. ---

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>>;

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<()>;

    async fn register_worker(&self, worker_id: &str, hostname: &str, pid: i32) -> Result<()>;

    async fn heartbeat_worker(
        &self,
        worker_id: &str,
        status: crate::model::WorkerStatus,
        run_id: Option<&str>,
    ) -> Result<()>;

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>>;

    async fn prune_workers(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn insert_cron(&self, entry: &CronEntry) -> Result<()>;

    async fn list_cron(&self) -> Result<Vec<CronEntry>>;

    async fn delete_cron(&self, cron_id: &str) -> Result<()>;
}
