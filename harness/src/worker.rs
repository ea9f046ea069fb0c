//! The Worker (spec §4.2): a long-lived process with a stable `worker_id`
//! that polls the Store for claimable runs, supervises each to
//! completion, and renews its lease via a companion heartbeat timer.

use std::collections::HashMap;
use std::sync::Arc;

use taskhub_core::model::{RunStatus, WorkerStatus};
use taskhub_core::store::{ConcurrencySnapshot, TaskFilter, TaskRegistrySnapshot};
use taskhub_core::task::TaskRegistry;
use taskhub_core::{ErrorKind, Store};
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tokio::time::Duration;

use crate::config::Config;
use crate::supervisor::Supervisor;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Drives the worker main loop until SIGTERM/ctrl-c. Never returns `Err`
/// for a single claimed run's failure — those are logged and the loop
/// continues; it only returns early on shutdown signal.
pub async fn run(
    cfg: &Config,
    store: Arc<dyn Store>,
    registry: Arc<dyn TaskRegistry>,
    worker_id: String,
) -> anyhow::Result<()> {
    store
        .register_worker(&worker_id, &hostname(), std::process::id() as i32)
        .await?;

    let lease_duration = cfg.lease_duration();
    let concurrency = concurrency_snapshot(&registry);

    // A single shutdown signal, observed both while idle-polling for work
    // (below) and mid-run (threaded into `Supervisor::supervise`), since
    // `ctrl_c()`/`sigterm.recv()` each resolve only once and can't be
    // raced from two places independently.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_worker_id = worker_id.clone();
    tokio::spawn(async move {
        match tokio::signal::unix::signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!(worker_id = %signal_worker_id, "worker shutting down (ctrl-c)");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!(worker_id = %signal_worker_id, "worker shutting down (sigterm)");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(worker_id = %signal_worker_id, error = %e, "failed to install sigterm handler; falling back to ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(worker_id = %worker_id, "worker started");

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                return Ok(());
            }
            claimed = store.claim_next(&worker_id, lease_duration, &TaskFilter::default(), &concurrency) => {
                match claimed {
                    Ok(Some(run)) => {
                        if let Err(e) = handle_run(cfg, &store, &registry, &worker_id, run, shutdown_rx.clone()).await {
                            tracing::warn!(worker_id = %worker_id, error = %e, "run handling failed");
                        }
                        let _ = store.heartbeat_worker(&worker_id, WorkerStatus::Idle, None).await;
                    }
                    Ok(None) => {
                        let _ = store.heartbeat_worker(&worker_id, WorkerStatus::Idle, None).await;
                        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                    }
                    Err(e) => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "claim_next failed");
                        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                    }
                }
            }
        }
    }
}

async fn handle_run(
    cfg: &Config,
    store: &Arc<dyn Store>,
    registry: &Arc<dyn TaskRegistry>,
    worker_id: &str,
    run: taskhub_core::model::Run,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let Some(task) = registry.get(&run.task_id) else {
        // The task registry is loaded once at startup; if a run was
        // enqueued against a task_id that's gone by the time it's
        // claimed, fail it rather than hold the lease indefinitely.
        store
            .finish_run(
                &run.run_id,
                worker_id,
                RunStatus::Failed,
                None,
                Some("unknown_task: task removed from registry after enqueue"),
            )
            .await?;
        return Ok(());
    };

    let _ = store
        .heartbeat_worker(worker_id, WorkerStatus::Busy, Some(&run.run_id))
        .await;

    let (lost_lease_tx, lost_lease_rx) = watch::channel(false);
    let heartbeat_handle = spawn_heartbeat(
        store.clone(),
        run.run_id.clone(),
        worker_id.to_string(),
        cfg.lease_duration(),
        lost_lease_tx,
    );

    let supervisor = Supervisor {
        store: store.clone(),
        data_dir: std::path::PathBuf::from(&cfg.data_dir),
        soft_grace: cfg.soft_grace(),
    };

    let result = supervisor
        .supervise(&run, task, worker_id, lost_lease_rx, shutdown_rx)
        .await;

    heartbeat_handle.abort();
    result
}

/// Renews the lease every `lease_duration / 3`. On `LostLease`, flips the
/// watch channel so the Supervisor hard-kills the child immediately and
/// stops touching the run row.
fn spawn_heartbeat(
    store: Arc<dyn Store>,
    run_id: String,
    worker_id: String,
    lease_duration: chrono::Duration,
    lost_lease_tx: watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval_ms = (lease_duration.num_milliseconds() / 3).max(100) as u64;
    let interval = Duration::from_millis(interval_ms);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match store.renew_lease(&run_id, &worker_id, lease_duration).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::LostLease => {
                    tracing::warn!(run_id = %run_id, worker_id = %worker_id, "lost lease during heartbeat");
                    let _ = lost_lease_tx.send(true);
                    return;
                }
                Err(e) => {
                    tracing::warn!(run_id = %run_id, worker_id = %worker_id, error = %e, "heartbeat renew_lease failed");
                }
            }
        }
    })
}

fn concurrency_snapshot(registry: &Arc<dyn TaskRegistry>) -> ConcurrencySnapshot {
    let tasks = registry.all();
    let limits: HashMap<String, Option<u32>> = tasks
        .iter()
        .map(|t| (t.task_id.clone(), t.concurrency_limit))
        .collect();
    let enabled = tasks
        .iter()
        .filter(|t| t.is_enabled)
        .map(|t| t.task_id.clone())
        .collect();
    ConcurrencySnapshot { limits, enabled }
}

/// Builds the registry snapshot `enqueue_run` needs to enforce
/// `UnknownTask`/`Disabled` itself.
pub fn registry_snapshot(registry: &dyn TaskRegistry) -> TaskRegistrySnapshot {
    TaskRegistrySnapshot {
        tasks: registry
            .all()
            .into_iter()
            .map(|t| (t.task_id.clone(), t.is_enabled))
            .collect(),
    }
}

/// Best-effort hostname for the worker registry row; `register_worker`
/// treats this purely as display metadata, so any fallback is fine.
fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}
