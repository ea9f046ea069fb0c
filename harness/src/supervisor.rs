//! Given a claimed run, spawns the child in its own process group, drains
//! stdout/stderr into per-run logs and the structured event stream,
//! enforces the cancellation escalation (SIGTERM -> soft_grace -> SIGKILL),
//! and finalizes the run via `Store::finish_run`.
//!
//! State machine: CLAIMED -> SPAWNED -> DRAINING -> EXITED -> FINALIZED.
//! Failure at any state routes straight to FINALIZED(FAILED).

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use taskhub_core::model::{Artifact, Run, RunStatus};
use taskhub_core::task::Task;
use taskhub_core::wire::{classify_line, EventKind};
use taskhub_core::Store;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Per-stream bounded queue depth (spec §4.3: "e.g. 4096 lines").
const STREAM_QUEUE_CAPACITY: usize = 4096;
/// How often the cancellation flag is polled while the child is running.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Supervisor {
    pub store: Arc<dyn Store>,
    pub data_dir: PathBuf,
    pub soft_grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn fallback_event_type(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

struct LineMsg {
    kind: StreamKind,
    line: String,
}

impl Supervisor {
    /// Drives `run` to a terminal state. Returns once `finish_run` has
    /// been called; errors here are always swallowed into a FAILED
    /// finalization by the caller (the Worker) rather than propagated —
    /// a poisoned run must never crash the Worker's main loop.
    pub async fn supervise(
        &self,
        run: &Run,
        task: &Task,
        worker_id: &str,
        mut lost_lease_rx: tokio::sync::watch::Receiver<bool>,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let run_dir = self.data_dir.join("runs").join(&run.run_id);
        tokio::fs::create_dir_all(run_dir.join("artifacts")).await?;

        let command = match task.build_command(&run.params) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.store
                    .finish_run(
                        &run.run_id,
                        worker_id,
                        RunStatus::Failed,
                        None,
                        Some(&e.to_string()),
                    )
                    .await?;
                return Ok(());
            }
        };

        let Some((program, args)) = command.split_first() else {
            self.store
                .finish_run(
                    &run.run_id,
                    worker_id,
                    RunStatus::Failed,
                    None,
                    Some("build_command_failed: empty command"),
                )
                .await?;
            return Ok(());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&run_dir)
            .env("TASKHUB_RUN_ID", &run.run_id)
            .env("TASKHUB_ARTIFACTS_DIR", run_dir.join("artifacts"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0); // new session/process-group leader (setsid equivalent)

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.store
                    .finish_run(
                        &run.run_id,
                        worker_id,
                        RunStatus::Failed,
                        None,
                        Some(&format!("spawn_error: {e}")),
                    )
                    .await?;
                return Ok(());
            }
        };

        let pid = child.id().context_or("child has no pid (already reaped)")?;
        // On Unix, `process_group(0)` makes the child its own group leader,
        // so its PGID equals its PID.
        let pgid = pid as i32;
        self.store.set_pgid(&run.run_id, worker_id, pgid).await?;
        tracing::info!(run_id = %run.run_id, pgid, "SPAWNED");

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (tx, mut rx) = mpsc::channel::<LineMsg>(STREAM_QUEUE_CAPACITY);
        let stdout_task = tokio::spawn(drain_stream(
            StreamKind::Stdout,
            stdout,
            run_dir.join("stdout.log"),
            tx.clone(),
        ));
        let stderr_task = tokio::spawn(drain_stream(
            StreamKind::Stderr,
            stderr,
            run_dir.join("stderr.log"),
            tx.clone(),
        ));
        drop(tx);

        let store = self.store.clone();
        let run_id = run.run_id.clone();
        let run_dir_for_writer = run_dir.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let classified = classify_line(&msg.line, msg.kind.fallback_event_type());
                if let Err(e) = store
                    .append_event(&run_id, classified.kind.as_str(), classified.data.clone())
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to append event");
                    continue;
                }
                if classified.kind == EventKind::Artifact {
                    if let Err(e) =
                        record_artifact(&store, &run_id, &run_dir_for_writer, &classified.data).await
                    {
                        tracing::warn!(run_id = %run_id, error = %e, "failed to record artifact");
                    }
                }
            }
        });

        tracing::info!(run_id = %run.run_id, "DRAINING");

        let mut reason = TerminationReason::None;
        let mut term_sent_at: Option<Instant> = None;
        let mut lost_lease = false;
        let exit_status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status;
                }
                changed = lost_lease_rx.changed() => {
                    if changed.is_ok() && *lost_lease_rx.borrow() {
                        lost_lease = true;
                        tracing::warn!(run_id = %run.run_id, pgid, "lease lost; hard-killing child without writing to run row");
                        let _ = kill(Pid::from_raw(-pgid), Signal::SIGKILL);
                    }
                }
                changed = shutdown_rx.changed(), if reason == TerminationReason::None => {
                    if changed.is_ok() && *shutdown_rx.borrow() {
                        reason = TerminationReason::WorkerShutdown;
                        tracing::info!(run_id = %run.run_id, pgid, "worker shutting down; sending SIGTERM to process group");
                        let _ = kill(Pid::from_raw(-pgid), Signal::SIGTERM);
                        term_sent_at = Some(Instant::now());
                    }
                }
                _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {
                    if reason == TerminationReason::None {
                        if let Ok(Some(current)) = self.store.get_run(&run.run_id).await {
                            if current.cancel_requested {
                                reason = TerminationReason::Canceled;
                                tracing::info!(run_id = %run.run_id, pgid, "cancel requested; sending SIGTERM to process group");
                                let _ = kill(Pid::from_raw(-pgid), Signal::SIGTERM);
                                term_sent_at = Some(Instant::now());
                            }
                        }
                    } else if let Some(sent_at) = term_sent_at {
                        if sent_at.elapsed() >= self.soft_grace {
                            tracing::warn!(run_id = %run.run_id, pgid, "soft_grace elapsed; sending SIGKILL to process group");
                            let _ = kill(Pid::from_raw(-pgid), Signal::SIGKILL);
                            // Keep polling via child.wait(); SIGKILL is not
                            // catchable so the child must exit shortly.
                        }
                    }
                }
            }

            if lost_lease {
                // Drain until the child actually exits, then stop: the
                // Reaper now owns this run, so we must not touch the row.
                let _ = child.wait().await;
                break Ok(std::process::ExitStatus::from_raw(0));
            }
        };

        // Stop stream drains: EOF on the child's pipes happens naturally
        // once the process has exited, so just wait for the readers to
        // observe EOF and the writer to drain the queue.
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let _ = writer_task.await;

        tracing::info!(run_id = %run.run_id, "EXITED");

        if lost_lease {
            tracing::warn!(run_id = %run.run_id, "not finalizing run: lease was lost to the Reaper");
            return Ok(());
        }

        let (status, exit_code, error) = classify_exit(exit_status, reason);
        self.store
            .finish_run(&run.run_id, worker_id, status, exit_code, error.as_deref())
            .await?;
        tracing::info!(run_id = %run.run_id, status = status.as_str(), "FINALIZED");

        Ok(())
    }
}

/// Why the child's process group was signaled before it exited on its own,
/// if at all. Both cases finalize as CANCELED but carry a different
/// `error` value (spec §4.1 vs §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminationReason {
    None,
    Canceled,
    WorkerShutdown,
}

fn classify_exit(
    status: std::io::Result<std::process::ExitStatus>,
    reason: TerminationReason,
) -> (RunStatus, Option<i32>, Option<String>) {
    match status {
        Err(e) => (RunStatus::Failed, None, Some(format!("wait_error: {e}"))),
        Ok(status) => {
            match reason {
                TerminationReason::Canceled => {
                    return (RunStatus::Canceled, status.code(), Some("canceled".to_string()));
                }
                TerminationReason::WorkerShutdown => {
                    return (
                        RunStatus::Canceled,
                        status.code(),
                        Some("worker_shutdown".to_string()),
                    );
                }
                TerminationReason::None => {}
            }
            if let Some(signal) = status.signal() {
                return (
                    RunStatus::Failed,
                    None,
                    Some(format!("killed_by_signal={signal}")),
                );
            }
            match status.code() {
                Some(0) => (RunStatus::Succeeded, Some(0), None),
                Some(code) => (
                    RunStatus::Failed,
                    Some(code),
                    Some(format!("exit_code={code}")),
                ),
                None => (RunStatus::Failed, None, Some("unknown exit status".to_string())),
            }
        }
    }
}

async fn drain_stream(
    kind: StreamKind,
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    log_path: PathBuf,
    tx: mpsc::Sender<LineMsg>,
) {
    let mut log_file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = ?log_path, error = %e, "failed to open stream log");
            return;
        }
    };

    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let _ = log_file.write_all(line.as_bytes()).await;
                let _ = log_file.write_all(b"\n").await;
                // `send` (not `try_send`) applies backpressure: if the
                // writer task is behind, this await pauses further reads
                // from the pipe rather than dropping the line.
                if tx.send(LineMsg { kind, line }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(stream = ?kind, error = %e, "stream read error");
                break;
            }
        }
    }
}

async fn record_artifact(
    store: &Arc<dyn Store>,
    run_id: &str,
    run_dir: &Path,
    data: &serde_json::Value,
) -> anyhow::Result<()> {
    let title = data
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("untitled")
        .to_string();
    let kind = data
        .get("kind")
        .and_then(|v| v.as_str())
        .unwrap_or("binary")
        .to_string();
    let mime = data
        .get("mime")
        .and_then(|v| v.as_str())
        .unwrap_or("application/octet-stream")
        .to_string();
    let rel_path = data
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("artifact event missing path"))?
        .to_string();
    let file_id = data
        .get("file_id")
        .and_then(|v| v.as_str())
        .unwrap_or(&rel_path)
        .to_string();

    let abs_path = run_dir.join(&rel_path);
    let canonical_run_dir = tokio::fs::canonicalize(run_dir).await?;
    let canonical_abs_path = tokio::fs::canonicalize(&abs_path)
        .await
        .map_err(|e| anyhow::anyhow!("artifact path {rel_path:?} does not exist: {e}"))?;
    if !canonical_abs_path.starts_with(&canonical_run_dir) {
        return Err(anyhow::anyhow!(
            "artifact path {rel_path:?} escapes run directory"
        ));
    }

    let metadata = tokio::fs::metadata(&canonical_abs_path).await?;
    let artifact = Artifact {
        artifact_id: format!("a-{}", ulid::Ulid::new()),
        run_id: run_id.to_string(),
        file_id,
        title,
        kind,
        mime,
        path: rel_path,
        size_bytes: metadata.len() as i64,
        created_at: chrono::Utc::now(),
    };
    store.insert_artifact(&artifact).await?;
    Ok(())
}

trait OptionExt<T> {
    fn context_or(self, msg: &str) -> anyhow::Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn context_or(self, msg: &str) -> anyhow::Result<T> {
        self.ok_or_else(|| anyhow::anyhow!(msg.to_string()))
    }
}
