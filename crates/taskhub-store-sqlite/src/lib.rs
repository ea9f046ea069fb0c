//! SQLite-backed implementation of `taskhub_core::Store`.
//!
//! SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`; instead every
//! operation that needs an atomic read-decide-write sequence opens the
//! transaction with `BEGIN IMMEDIATE`, which acquires SQLite's single
//! writer lock up front. That is the direct analogue of the
//! `SELECT ... FOR UPDATE` + `UPDATE ... RETURNING` idiom this crate's
//! Postgres-backed sibling would use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration as StdDuration;
use taskhub_core::model::{
    Artifact, CronEntry, Event, ExpiredLease, Run, RunFilter, RunStatus, WorkerRecord,
    WorkerStatus,
};
use taskhub_core::store::{ConcurrencySnapshot, TaskFilter, TaskRegistrySnapshot};
use taskhub_core::{Error, ErrorKind, Result, Store};

/// Embedded migrations, applied idempotently by `SqliteStore::connect`.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database file at `db_path`, enables
    /// WAL journaling and foreign keys, and runs pending migrations.
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(|e| Error::new(ErrorKind::Store, anyhow::anyhow!(e)))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(StdDuration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| Error::new(ErrorKind::Store, anyhow::anyhow!(e)))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn begin_immediate(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(conn)
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::new(ErrorKind::Store, anyhow::anyhow!("bad timestamp {s:?}: {e}")))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

fn run_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Run> {
    let status: String = row.try_get("status")?;
    let params_text: String = row.try_get("params")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Run {
        run_id: row.try_get("run_id")?,
        task_id: row.try_get("task_id")?,
        params: serde_json::from_str(&params_text)?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| Error::new(ErrorKind::Store, anyhow::anyhow!("bad status {status:?}")))?,
        created_at: parse_ts(&created_at)?,
        started_at: parse_ts_opt(row.try_get("started_at")?)?,
        finished_at: parse_ts_opt(row.try_get("finished_at")?)?,
        exit_code: row.try_get("exit_code")?,
        error: row.try_get("error")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: parse_ts_opt(row.try_get("lease_expires_at")?)?,
        pgid: row.try_get("pgid")?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        cron_id: row.try_get("cron_id")?,
    })
}

fn event_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Event> {
    let ts_text: String = row.try_get("ts")?;
    let data_text: String = row.try_get("data")?;
    Ok(Event {
        run_id: row.try_get("run_id")?,
        seq: row.try_get("seq")?,
        ts: parse_ts(&ts_text)?,
        event_type: row.try_get("event_type")?,
        data: serde_json::from_str(&data_text)?,
    })
}

fn artifact_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Artifact> {
    let created_at: String = row.try_get("created_at")?;
    Ok(Artifact {
        artifact_id: row.try_get("artifact_id")?,
        run_id: row.try_get("run_id")?,
        file_id: row.try_get("file_id")?,
        title: row.try_get("title")?,
        kind: row.try_get("kind")?,
        mime: row.try_get("mime")?,
        path: row.try_get("path")?,
        size_bytes: row.try_get("size_bytes")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn worker_from_row(row: sqlx::sqlite::SqliteRow) -> Result<WorkerRecord> {
    let status: String = row.try_get("status")?;
    let last_heartbeat: String = row.try_get("last_heartbeat")?;
    Ok(WorkerRecord {
        worker_id: row.try_get("worker_id")?,
        hostname: row.try_get("hostname")?,
        pid: row.try_get("pid")?,
        status: WorkerStatus::parse(&status)
            .ok_or_else(|| Error::new(ErrorKind::Store, anyhow::anyhow!("bad status {status:?}")))?,
        run_id: row.try_get("run_id")?,
        last_heartbeat: parse_ts(&last_heartbeat)?,
    })
}

fn cron_from_row(row: sqlx::sqlite::SqliteRow) -> Result<CronEntry> {
    let next_run_at: String = row.try_get("next_run_at")?;
    let params_text: String = row.try_get("params")?;
    Ok(CronEntry {
        cron_id: row.try_get("cron_id")?,
        task_id: row.try_get("task_id")?,
        cron_expression: row.try_get("cron_expression")?,
        params: serde_json::from_str(&params_text)?,
        name: row.try_get("name")?,
        is_enabled: row.try_get::<i64, _>("is_enabled")? != 0,
        next_run_at: parse_ts(&next_run_at)?,
        last_run_at: parse_ts_opt(row.try_get("last_run_at")?)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn enqueue_run(
        &self,
        task_id: &str,
        params: Value,
        cron_id: Option<&str>,
        registry: &TaskRegistrySnapshot,
    ) -> Result<String> {
        match registry.is_enabled(task_id) {
            None => return Err(Error::unknown_task(task_id)),
            Some(false) => return Err(Error::disabled(task_id)),
            Some(true) => {}
        }

        let run_id = format!("r-{}", ulid::Ulid::new());
        let now = ts(Utc::now());
        sqlx::query(
            "INSERT INTO runs (run_id, task_id, params, status, created_at, cancel_requested, cron_id)
             VALUES (?1, ?2, ?3, 'QUEUED', ?4, 0, ?5)",
        )
        .bind(&run_id)
        .bind(task_id)
        .bind(params.to_string())
        .bind(&now)
        .bind(cron_id)
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease_duration: chrono::Duration,
        task_filter: &TaskFilter,
        concurrency: &ConcurrencySnapshot,
    ) -> Result<Option<Run>> {
        let mut conn = self.begin_immediate().await?;

        let candidates_sql = if task_filter.task_ids.is_empty() {
            "SELECT run_id, task_id FROM runs WHERE status = 'QUEUED' ORDER BY created_at, run_id"
                .to_string()
        } else {
            let placeholders: Vec<String> = (0..task_filter.task_ids.len())
                .map(|i| format!("?{}", i + 1))
                .collect();
            format!(
                "SELECT run_id, task_id FROM runs WHERE status = 'QUEUED' AND task_id IN ({}) ORDER BY created_at, run_id",
                placeholders.join(", ")
            )
        };

        let mut query = sqlx::query(&candidates_sql);
        for task_id in &task_filter.task_ids {
            query = query.bind(task_id);
        }
        let candidates: Vec<(String, String)> = query
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|row| {
                let run_id: String = row.get("run_id");
                let task_id: String = row.get("task_id");
                (run_id, task_id)
            })
            .collect();

        let mut chosen: Option<String> = None;
        for (run_id, task_id) in candidates {
            if !concurrency.enabled.contains(&task_id) {
                continue;
            }
            let limit = concurrency.limits.get(&task_id).copied().unwrap_or(None);
            if let Some(limit) = limit {
                let running: i64 =
                    sqlx::query("SELECT COUNT(*) AS n FROM runs WHERE task_id = ?1 AND status = 'RUNNING'")
                        .bind(&task_id)
                        .fetch_one(&mut *conn)
                        .await?
                        .get("n");
                if running as u32 >= limit {
                    continue;
                }
            }
            chosen = Some(run_id);
            break;
        }

        let Some(run_id) = chosen else {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            return Ok(None);
        };

        let now = Utc::now();
        let lease_expires_at = now + lease_duration;
        sqlx::query(
            "UPDATE runs SET status = 'RUNNING', started_at = ?2, lease_owner = ?3,
             lease_expires_at = ?4 WHERE run_id = ?1 AND status = 'QUEUED'",
        )
        .bind(&run_id)
        .bind(ts(now))
        .bind(worker_id)
        .bind(ts(lease_expires_at))
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?1")
            .bind(&run_id)
            .fetch_one(&mut *conn)
            .await?;
        let run = run_from_row(row)?;

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(Some(run))
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_duration: chrono::Duration,
    ) -> Result<()> {
        let new_expiry = ts(Utc::now() + lease_duration);
        let result = sqlx::query(
            "UPDATE runs SET lease_expires_at = ?3
             WHERE run_id = ?1 AND lease_owner = ?2 AND status = 'RUNNING'",
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(new_expiry)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::lost_lease(run_id));
        }
        Ok(())
    }

    async fn set_pgid(&self, run_id: &str, worker_id: &str, pgid: i32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE runs SET pgid = ?3 WHERE run_id = ?1 AND lease_owner = ?2 AND status = 'RUNNING'",
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(pgid)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::lost_lease(run_id));
        }
        Ok(())
    }

    async fn append_event(&self, run_id: &str, event_type: &str, data: Value) -> Result<i64> {
        let mut conn = self.begin_immediate().await?;
        let next_seq: i64 = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) + 1 AS next_seq FROM events WHERE run_id = ?1",
        )
        .bind(run_id)
        .fetch_one(&mut *conn)
        .await?
        .get("next_seq");

        sqlx::query(
            "INSERT INTO events (run_id, seq, ts, event_type, data) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(run_id)
        .bind(next_seq)
        .bind(ts(Utc::now()))
        .bind(event_type)
        .bind(data.to_string())
        .execute(&mut *conn)
        .await?;

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(next_seq)
    }

    async fn finish_run(
        &self,
        run_id: &str,
        worker_id: &str,
        status: RunStatus,
        exit_code: Option<i32>,
        error: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::new(
                ErrorKind::Other,
                anyhow::anyhow!("finish_run requires a terminal status, got {:?}", status),
            ));
        }
        let result = sqlx::query(
            "UPDATE runs SET status = ?3, finished_at = ?4, exit_code = ?5, error = ?6,
             lease_owner = NULL, lease_expires_at = NULL, pgid = NULL
             WHERE run_id = ?1 AND lease_owner = ?2 AND status = 'RUNNING'",
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(status.as_str())
        .bind(ts(Utc::now()))
        .bind(exit_code)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::lost_lease(run_id));
        }
        Ok(())
    }

    async fn request_cancel(&self, run_id: &str) -> Result<()> {
        let mut conn = self.begin_immediate().await?;
        let row = sqlx::query("SELECT status FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            sqlx::query("ROLLBACK").execute(&mut *conn).await?;
            return Err(Error::new(
                ErrorKind::Other,
                anyhow::anyhow!("no such run {run_id}"),
            ));
        };
        let status: String = row.get("status");

        if status == "QUEUED" {
            sqlx::query(
                "UPDATE runs SET status = 'CANCELED', cancel_requested = 1, finished_at = ?2
                 WHERE run_id = ?1",
            )
            .bind(run_id)
            .bind(ts(Utc::now()))
            .execute(&mut *conn)
            .await?;
        } else {
            sqlx::query("UPDATE runs SET cancel_requested = 1 WHERE run_id = ?1")
                .bind(run_id)
                .execute(&mut *conn)
                .await?;
        }
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredLease>> {
        let rows = sqlx::query(
            "SELECT run_id, pgid, lease_owner FROM runs
             WHERE status = 'RUNNING' AND lease_expires_at < ?1",
        )
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ExpiredLease {
                run_id: row.get("run_id"),
                pgid: row.get("pgid"),
                lease_owner: row.get::<Option<String>, _>("lease_owner").unwrap_or_default(),
            })
            .collect())
    }

    async fn abandon_run(&self, run_id: &str, reason: &str) -> Result<bool> {
        let mut conn = self.begin_immediate().await?;
        let result = sqlx::query(
            "UPDATE runs SET status = 'FAILED', finished_at = ?2, error = ?3,
             lease_owner = NULL, lease_expires_at = NULL, pgid = NULL
             WHERE run_id = ?1 AND status = 'RUNNING' AND lease_expires_at < ?2",
        )
        .bind(run_id)
        .bind(ts(Utc::now()))
        .bind(reason)
        .execute(&mut *conn)
        .await?;

        let transitioned = result.rows_affected() > 0;
        if transitioned {
            let next_seq: i64 = sqlx::query(
                "SELECT COALESCE(MAX(seq), 0) + 1 AS next_seq FROM events WHERE run_id = ?1",
            )
            .bind(run_id)
            .fetch_one(&mut *conn)
            .await?
            .get("next_seq");
            sqlx::query(
                "INSERT INTO events (run_id, seq, ts, event_type, data) VALUES (?1, ?2, ?3, 'system', ?4)",
            )
            .bind(run_id)
            .bind(next_seq)
            .bind(ts(Utc::now()))
            .bind(serde_json::json!({ "action": "reaped", "reason": reason }).to_string())
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(transitioned)
    }

    async fn poll_due_cron(&self, now: DateTime<Utc>) -> Result<Vec<CronEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM cron_entries WHERE is_enabled = 1 AND next_run_at <= ?1 ORDER BY cron_id",
        )
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(cron_from_row).collect()
    }

    async fn advance_cron(
        &self,
        cron_id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE cron_entries SET last_run_at = ?2, next_run_at = ?3 WHERE cron_id = ?1")
            .bind(cron_id)
            .bind(ts(last_run_at))
            .bind(ts(next_run_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_events(
        &self,
        run_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<(Vec<Event>, i64)> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE run_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
        )
        .bind(run_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let events: Vec<Event> = rows.into_iter().map(event_from_row).collect::<Result<_>>()?;
        let cursor = events.last().map(|e| e.seq).unwrap_or(after_seq);
        Ok((events, cursor))
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(run_from_row).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let mut sql = String::from("SELECT * FROM runs WHERE 1 = 1");
        if filter.task_id.is_some() {
            sql.push_str(" AND task_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, run_id DESC LIMIT ?");
        let limit = if filter.limit > 0 { filter.limit } else { 100 };

        let mut query = sqlx::query(&sql);
        if let Some(task_id) = &filter.task_id {
            query = query.bind(task_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        query = query.bind(limit);

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(run_from_row).collect()
    }

    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>> {
        let rows = sqlx::query("SELECT * FROM artifacts WHERE run_id = ?1 ORDER BY created_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(artifact_from_row).collect()
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            "INSERT INTO artifacts (artifact_id, run_id, file_id, title, kind, mime, path, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&artifact.artifact_id)
        .bind(&artifact.run_id)
        .bind(&artifact.file_id)
        .bind(&artifact.title)
        .bind(&artifact.kind)
        .bind(&artifact.mime)
        .bind(&artifact.path)
        .bind(artifact.size_bytes)
        .bind(ts(artifact.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn register_worker(&self, worker_id: &str, hostname: &str, pid: i32) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (worker_id, hostname, pid, status, run_id, last_heartbeat)
             VALUES (?1, ?2, ?3, 'IDLE', NULL, ?4)
             ON CONFLICT (worker_id) DO UPDATE SET hostname = excluded.hostname, pid = excluded.pid,
                last_heartbeat = excluded.last_heartbeat",
        )
        .bind(worker_id)
        .bind(hostname)
        .bind(pid)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat_worker(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        run_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET status = ?2, run_id = ?3, last_heartbeat = ?4 WHERE worker_id = ?1",
        )
        .bind(worker_id)
        .bind(status.as_str())
        .bind(run_id)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let rows = sqlx::query("SELECT * FROM workers ORDER BY worker_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(worker_from_row).collect()
    }

    async fn prune_workers(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM workers WHERE last_heartbeat < ?1")
            .bind(ts(older_than))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_cron(&self, entry: &CronEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO cron_entries (cron_id, task_id, cron_expression, params, name, is_enabled, next_run_at, last_run_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&entry.cron_id)
        .bind(&entry.task_id)
        .bind(&entry.cron_expression)
        .bind(entry.params.to_string())
        .bind(&entry.name)
        .bind(entry.is_enabled as i64)
        .bind(ts(entry.next_run_at))
        .bind(entry.last_run_at.map(ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_cron(&self) -> Result<Vec<CronEntry>> {
        let rows = sqlx::query("SELECT * FROM cron_entries ORDER BY cron_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(cron_from_row).collect()
    }

    async fn delete_cron(&self, cron_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cron_entries WHERE cron_id = ?1")
            .bind(cron_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
