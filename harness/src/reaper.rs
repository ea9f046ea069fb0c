//! The Reaper (spec §4.5): a periodic sweeper that reclaims leases
//! abandoned by dead Workers and prunes stale worker registry entries.
//! Never touches a run whose lease is still valid.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use taskhub_core::Store;
use tokio::sync::watch;
use tokio::time::Duration;

/// How long to wait between SIGTERM and SIGKILL when cleaning up an
/// orphaned process group whose parent Worker died.
const ORPHAN_GRACE: StdDuration = StdDuration::from_secs(1);

pub async fn run(
    store: Arc<dyn Store>,
    sweep_interval: Duration,
    lease_duration: chrono::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(interval_secs = sweep_interval.as_secs(), "reaper started");

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        if let Err(e) = sweep_once(&store, lease_duration).await {
            tracing::warn!(error = %e, "reaper sweep failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(sweep_interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

async fn sweep_once(store: &Arc<dyn Store>, lease_duration: chrono::Duration) -> anyhow::Result<()> {
    let now = chrono::Utc::now();

    let expired = store.reap_expired(now).await?;
    for lease in expired {
        if let Some(pgid) = lease.pgid {
            reap_process_group(&lease.run_id, pgid).await;
        }

        let reason = format!(
            "lease_expired by reaper, original_owner={}",
            lease.lease_owner
        );
        if store.abandon_run(&lease.run_id, &reason).await? {
            store
                .append_event(
                    &lease.run_id,
                    "system",
                    serde_json::json!({ "message": "reaper reclaimed expired lease", "reason": reason }),
                )
                .await?;
            tracing::warn!(run_id = %lease.run_id, owner = %lease.lease_owner, "reaped expired lease");
        }
    }

    let prune_cutoff = now - (lease_duration * 3);
    let pruned = store.prune_workers(prune_cutoff).await?;
    if pruned > 0 {
        tracing::info!(count = pruned, "pruned stale worker registry entries");
    }

    Ok(())
}

/// Best-effort orphan cleanup: SIGTERM the group, wait briefly, then
/// SIGKILL. Signaling a process group that no longer exists is not an
/// error here — the Worker may have already reaped its own child.
async fn reap_process_group(run_id: &str, pgid: i32) {
    if kill(Pid::from_raw(-pgid), None).is_err() {
        return;
    }

    tracing::warn!(run_id = %run_id, pgid, "signaling orphaned process group: SIGTERM");
    let _ = kill(Pid::from_raw(-pgid), Signal::SIGTERM);
    tokio::time::sleep(ORPHAN_GRACE).await;

    if kill(Pid::from_raw(-pgid), None).is_ok() {
        tracing::warn!(run_id = %run_id, pgid, "process group survived SIGTERM: SIGKILL");
        let _ = kill(Pid::from_raw(-pgid), Signal::SIGKILL);
    }
}
