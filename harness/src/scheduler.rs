//! The Scheduler (spec §4.4): a singleton loop that ticks every
//! `scheduler_tick` seconds, materializes due cron entries into runs, and
//! advances each entry's `next_run_at`. Structured like the teacher's
//! background lease-reaper loop so it can run embedded or standalone.

use std::sync::Arc;

use taskhub_core::cron;
use taskhub_core::task::TaskRegistry;
use taskhub_core::{ErrorKind, Store};
use tokio::sync::watch;
use tokio::time::Duration;

use crate::worker::registry_snapshot;

pub async fn run(
    store: Arc<dyn Store>,
    registry: Arc<dyn TaskRegistry>,
    tick_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(interval_secs = tick_interval.as_secs(), "scheduler started");

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        if let Err(e) = tick_once(&store, &registry).await {
            tracing::warn!(error = %e, "scheduler tick failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(tick_interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

/// One scheduler tick: enqueue every due cron entry, then advance it.
/// Missed ticks are coalesced — at most one run is enqueued per entry per
/// tick regardless of how many occurrences fell behind.
async fn tick_once(store: &Arc<dyn Store>, registry: &Arc<dyn TaskRegistry>) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    let due = store.poll_due_cron(now).await?;
    let registry_snap = registry_snapshot(registry.as_ref());

    for entry in due {
        if !entry.is_enabled {
            continue;
        }

        let run_id = match store
            .enqueue_run(&entry.task_id, entry.params.clone(), Some(&entry.cron_id), &registry_snap)
            .await
        {
            Ok(run_id) => run_id,
            Err(e) if matches!(e.kind(), ErrorKind::UnknownTask | ErrorKind::Disabled) => {
                tracing::warn!(cron_id = %entry.cron_id, task_id = %entry.task_id, error = %e, "skipping cron fire for unknown/disabled task");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            cron_id = %entry.cron_id,
            task_id = %entry.task_id,
            run_id = %run_id,
            "cron fired"
        );

        let next_run_at = match cron::next_after(&entry.cron_expression, now) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(cron_id = %entry.cron_id, error = %e, "failed to compute next occurrence; disabling advance this tick");
                continue;
            }
        };

        store
            .advance_cron(&entry.cron_id, now, next_run_at)
            .await?;
    }

    Ok(())
}
