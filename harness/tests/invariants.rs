//! End-to-end scenarios (E1-E6) and cross-cutting invariants, run against
//! a real SQLite file and real `sh` subprocesses. Each test gets its own
//! temp DB and temp data dir so they can run concurrently.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration as StdDuration;

use chrono::Duration;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use taskhub::supervisor::Supervisor;
use taskhub_core::fixtures;
use taskhub_core::model::RunStatus;
use taskhub_core::store::{ConcurrencySnapshot, TaskFilter, TaskRegistrySnapshot};
use taskhub_core::{ErrorKind, Store};
use taskhub_store_sqlite::SqliteStore;
use tokio::sync::watch;

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

struct TestEnv {
    store: Arc<dyn Store>,
    data_dir: PathBuf,
    _db_dir: tempfile::TempDir,
    _data_tempdir: tempfile::TempDir,
}

async fn test_env() -> TestEnv {
    init_tracing();
    let db_dir = tempfile::tempdir().expect("tempdir");
    let data_tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = db_dir.path().join("taskhub.db");

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::connect(db_path.to_str().expect("utf8 path"))
            .await
            .expect("connect sqlite store"),
    );

    TestEnv {
        store,
        data_dir: data_tempdir.path().to_path_buf(),
        _db_dir: db_dir,
        _data_tempdir: data_tempdir,
    }
}

fn supervisor(env: &TestEnv, soft_grace: StdDuration) -> Supervisor {
    Supervisor {
        store: env.store.clone(),
        data_dir: env.data_dir.clone(),
        soft_grace,
    }
}

fn enabled_registry(task_id: &str) -> TaskRegistrySnapshot {
    let mut tasks = std::collections::HashMap::new();
    tasks.insert(task_id.to_string(), true);
    TaskRegistrySnapshot { tasks }
}

fn enabled_snapshot(task_id: &str) -> ConcurrencySnapshot {
    ConcurrencySnapshot {
        limits: std::collections::HashMap::new(),
        enabled: std::iter::once(task_id.to_string()).collect(),
    }
}

async fn claim(env: &TestEnv, worker_id: &str, lease: Duration, task_id: &str) -> taskhub_core::model::Run {
    env.store
        .claim_next(worker_id, lease, &TaskFilter::default(), &enabled_snapshot(task_id))
        .await
        .expect("claim_next")
        .expect("a run should be claimable")
}

#[tokio::test]
async fn e1_happy_path_echo_ok() {
    let env = test_env().await;
    let task = fixtures::echo_ok();

    let run_id = env
        .store
        .enqueue_run(&task.task_id, serde_json::json!({}), None, &enabled_registry(&task.task_id))
        .await
        .expect("enqueue_run");

    let run = claim(&env, "worker-1", Duration::seconds(30), &task.task_id).await;
    assert_eq!(run.run_id, run_id);

    let (_tx, rx) = watch::channel(false);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let sup = supervisor(&env, StdDuration::from_secs(5));
    sup.supervise(&run, &task, "worker-1", rx, shutdown_rx)
        .await
        .expect("supervise");

    let finished = env
        .store
        .get_run(&run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert_eq!(finished.exit_code, Some(0));

    let (events, _) = env
        .store
        .list_events(&run_id, 0, 500)
        .await
        .expect("list_events");
    assert!(events
        .iter()
        .any(|e| e.event_type == "stdout" && e.data.get("line").and_then(|v| v.as_str()) == Some("hi")));
}

#[tokio::test]
async fn e2_failure_echo_fail() {
    let env = test_env().await;
    let task = fixtures::echo_fail();

    let run_id = env
        .store
        .enqueue_run(&task.task_id, serde_json::json!({}), None, &enabled_registry(&task.task_id))
        .await
        .expect("enqueue_run");

    let run = claim(&env, "worker-1", Duration::seconds(30), &task.task_id).await;
    let (_tx, rx) = watch::channel(false);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let sup = supervisor(&env, StdDuration::from_secs(5));
    sup.supervise(&run, &task, "worker-1", rx, shutdown_rx)
        .await
        .expect("supervise");

    let finished = env
        .store
        .get_run(&run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.exit_code, Some(7));

    let (events, _) = env
        .store
        .list_events(&run_id, 0, 500)
        .await
        .expect("list_events");
    assert!(events.iter().any(|e| e.event_type == "stderr"));
}

#[tokio::test]
async fn e3_structured_progress_events_in_order() {
    let env = test_env().await;
    let task = fixtures::progress_emitter();

    let run_id = env
        .store
        .enqueue_run(&task.task_id, serde_json::json!({}), None, &enabled_registry(&task.task_id))
        .await
        .expect("enqueue_run");

    let run = claim(&env, "worker-1", Duration::seconds(30), &task.task_id).await;
    let (_tx, rx) = watch::channel(false);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let sup = supervisor(&env, StdDuration::from_secs(5));
    sup.supervise(&run, &task, "worker-1", rx, shutdown_rx)
        .await
        .expect("supervise");

    let (events, _) = env
        .store
        .list_events(&run_id, 0, 500)
        .await
        .expect("list_events");
    let mut progress: Vec<_> = events.iter().filter(|e| e.event_type == "progress").collect();
    progress.sort_by_key(|e| e.seq);
    assert_eq!(progress.len(), 2);
    assert_eq!(progress[0].data.get("pct").and_then(|v| v.as_i64()), Some(50));
    assert_eq!(progress[1].data.get("pct").and_then(|v| v.as_i64()), Some(100));
    assert!(progress[0].seq < progress[1].seq);
}

#[tokio::test]
async fn e4_cancel_mid_run_within_soft_grace() {
    let env = test_env().await;
    let task = fixtures::sleep_catchable();

    let run_id = env
        .store
        .enqueue_run(&task.task_id, serde_json::json!({}), None, &enabled_registry(&task.task_id))
        .await
        .expect("enqueue_run");

    let run = claim(&env, "worker-1", Duration::seconds(30), &task.task_id).await;
    let (_tx, rx) = watch::channel(false);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let sup = supervisor(&env, StdDuration::from_secs(2));

    let store_for_cancel = env.store.clone();
    let run_id_for_cancel = run_id.clone();
    let started = tokio::time::Instant::now();
    let sup_handle = tokio::spawn(async move { sup.supervise(&run, &task, "worker-1", rx, shutdown_rx).await });

    tokio::time::sleep(StdDuration::from_millis(300)).await;
    store_for_cancel
        .request_cancel(&run_id_for_cancel)
        .await
        .expect("request_cancel");

    sup_handle.await.expect("join").expect("supervise");
    let elapsed = started.elapsed();
    assert!(elapsed <= StdDuration::from_secs(4), "elapsed={elapsed:?}");

    let finished = env
        .store
        .get_run(&run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    assert_eq!(finished.status, RunStatus::Canceled);
}

#[tokio::test]
async fn worker_shutdown_cancels_in_flight_run_within_soft_grace() {
    let env = test_env().await;
    let task = fixtures::sleep_catchable();

    let run_id = env
        .store
        .enqueue_run(&task.task_id, serde_json::json!({}), None, &enabled_registry(&task.task_id))
        .await
        .expect("enqueue_run");

    let run = claim(&env, "worker-1", Duration::seconds(30), &task.task_id).await;
    let (_lost_lease_tx, lost_lease_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sup = supervisor(&env, StdDuration::from_secs(2));

    let started = tokio::time::Instant::now();
    let sup_handle =
        tokio::spawn(async move { sup.supervise(&run, &task, "worker-1", lost_lease_rx, shutdown_rx).await });

    tokio::time::sleep(StdDuration::from_millis(300)).await;
    let _ = shutdown_tx.send(true);

    sup_handle.await.expect("join").expect("supervise");
    let elapsed = started.elapsed();
    assert!(elapsed <= StdDuration::from_secs(4), "elapsed={elapsed:?}");

    let finished = env
        .store
        .get_run(&run_id)
        .await
        .expect("get_run")
        .expect("run exists");
    assert_eq!(finished.status, RunStatus::Canceled);
    assert_eq!(finished.error.as_deref(), Some("worker_shutdown"));
}

#[tokio::test]
async fn e5_worker_death_reaps_orphan() {
    let env = test_env().await;
    let task = fixtures::sleep_orphan();

    let run_id = env
        .store
        .enqueue_run(&task.task_id, serde_json::json!({}), None, &enabled_registry(&task.task_id))
        .await
        .expect("enqueue_run");

    let lease = Duration::milliseconds(300);
    let run = claim(&env, "dead-worker", lease, &task.task_id).await;

    let argv = task.build_command(&run.params).expect("build_command");
    let (program, args) = argv.split_first().expect("non-empty command");
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args).process_group(0);
    let mut child = cmd.spawn().expect("spawn orphan");
    let pid = child.id().expect("pid") as i32;
    env.store
        .set_pgid(&run_id, "dead-worker", pid)
        .await
        .expect("set_pgid");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let store_for_reaper = env.store.clone();
    let reaper_handle = tokio::spawn(taskhub::reaper::run(
        store_for_reaper,
        StdDuration::from_millis(100),
        lease,
        shutdown_rx,
    ));

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    loop {
        let finished = env.store.get_run(&run_id).await.expect("get_run").expect("exists");
        if finished.status == RunStatus::Failed {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for reaper to reclaim lease");
        }
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }

    let _ = shutdown_tx.send(true);
    let _ = reaper_handle.await;

    tokio::time::sleep(StdDuration::from_millis(200)).await;
    assert!(
        kill(Pid::from_raw(-pid), None).is_err(),
        "orphaned process group should have been signaled away"
    );
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[tokio::test]
async fn e6_concurrency_cap_is_enforced_across_workers() {
    let env = test_env().await;
    let task = fixtures::capped_sleep(2);

    for _ in 0..5 {
        env.store
            .enqueue_run(&task.task_id, serde_json::json!({"seconds": 2}), None, &enabled_registry(&task.task_id))
            .await
            .expect("enqueue_run");
    }

    let mut limits = std::collections::HashMap::new();
    limits.insert(task.task_id.clone(), task.concurrency_limit);
    let mut enabled = std::collections::HashSet::new();
    enabled.insert(task.task_id.clone());
    let snapshot = ConcurrencySnapshot { limits, enabled };

    let mut claimed = Vec::new();
    for i in 0..4 {
        let worker_id = format!("worker-{i}");
        let result = env
            .store
            .claim_next(&worker_id, Duration::seconds(30), &TaskFilter::default(), &snapshot)
            .await
            .expect("claim_next");
        if let Some(run) = result {
            claimed.push(run);
        }
    }

    assert!(claimed.len() <= 2, "expected at most 2 claimable under the cap, got {}", claimed.len());

    let running = env
        .store
        .list_runs(&taskhub_core::model::RunFilter {
            task_id: Some(task.task_id.clone()),
            status: Some(RunStatus::Running),
            limit: 100,
        })
        .await
        .expect("list_runs");
    assert!(running.len() <= 2);
}

#[tokio::test]
async fn at_most_one_claim_races_two_workers() {
    let env = test_env().await;
    let task = fixtures::echo_ok();

    env.store
        .enqueue_run(&task.task_id, serde_json::json!({}), None, &enabled_registry(&task.task_id))
        .await
        .expect("enqueue_run");

    let store_a = env.store.clone();
    let store_b = env.store.clone();
    let (a, b) = tokio::join!(
        store_a.claim_next("worker-a", Duration::seconds(30), &TaskFilter::default(), &enabled_snapshot(&task.task_id)),
        store_b.claim_next("worker-b", Duration::seconds(30), &TaskFilter::default(), &enabled_snapshot(&task.task_id)),
    );

    let a_some = a.expect("claim_next a").is_some();
    let b_some = b.expect("claim_next b").is_some();
    assert_eq!(a_some as u8 + b_some as u8, 1, "exactly one worker should win the claim");
}

#[tokio::test]
async fn event_sequence_has_no_gaps_or_duplicates() {
    let env = test_env().await;
    let task = fixtures::progress_emitter();

    let run_id = env
        .store
        .enqueue_run(&task.task_id, serde_json::json!({}), None, &enabled_registry(&task.task_id))
        .await
        .expect("enqueue_run");
    let run = claim(&env, "worker-1", Duration::seconds(30), &task.task_id).await;
    let (_tx, rx) = watch::channel(false);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let sup = supervisor(&env, StdDuration::from_secs(5));
    sup.supervise(&run, &task, "worker-1", rx, shutdown_rx).await.expect("supervise");

    let (events, _) = env.store.list_events(&run_id, 0, 500).await.expect("list_events");
    let mut seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    seqs.sort_unstable();
    let expected: Vec<i64> = (1..=seqs.len() as i64).collect();
    assert_eq!(seqs, expected);
}

#[tokio::test]
async fn finish_run_rejects_mismatched_lease_owner() {
    let env = test_env().await;
    let task = fixtures::echo_ok();

    let run_id = env
        .store
        .enqueue_run(&task.task_id, serde_json::json!({}), None, &enabled_registry(&task.task_id))
        .await
        .expect("enqueue_run");
    let _run = claim(&env, "real-owner", Duration::seconds(30), &task.task_id).await;

    let err = env
        .store
        .finish_run(&run_id, "impostor", RunStatus::Succeeded, Some(0), None)
        .await
        .expect_err("finish_run from a non-owning worker must fail");
    assert_eq!(err.kind(), ErrorKind::LostLease);

    let run = env.store.get_run(&run_id).await.expect("get_run").expect("exists");
    assert_eq!(run.status, RunStatus::Running);
}

#[tokio::test]
async fn cancel_on_queued_run_is_instant() {
    let env = test_env().await;
    let task = fixtures::sleep_catchable();

    let run_id = env
        .store
        .enqueue_run(&task.task_id, serde_json::json!({}), None, &enabled_registry(&task.task_id))
        .await
        .expect("enqueue_run");

    env.store.request_cancel(&run_id).await.expect("request_cancel");

    let run = env.store.get_run(&run_id).await.expect("get_run").expect("exists");
    assert_eq!(run.status, RunStatus::Canceled);
}
