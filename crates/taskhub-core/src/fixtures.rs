//! Fixture tasks used by the end-to-end test scenarios (E1–E6) and by
//! `taskhub tasks seed` for local experimentation. None of these are
//! registered by default in a production deployment — the real registry is
//! loaded from `TASKHUB_TASKS_DIR` (see the `taskhub` binary crate).

use serde_json::json;

use crate::task::Task;

/// `echo_ok`: command is `["sh","-c","echo hi; exit 0"]` (E1 happy path).
pub fn echo_ok() -> Task {
    Task::new(
        "echo_ok",
        "Echo OK",
        "1",
        true,
        None,
        json!({ "type": "object", "properties": {} }),
        vec!["sh".into(), "-c".into(), "echo hi; exit 0".into()],
    )
}

/// `echo_fail`: command is `["sh","-c","echo nope 1>&2; exit 7"]` (E2 failure).
pub fn echo_fail() -> Task {
    Task::new(
        "echo_fail",
        "Echo Fail",
        "1",
        true,
        None,
        json!({ "type": "object", "properties": {} }),
        vec!["sh".into(), "-c".into(), "echo nope 1>&2; exit 7".into()],
    )
}

/// `progress_emitter`: emits two structured `progress` events (E3).
pub fn progress_emitter() -> Task {
    Task::new(
        "progress_emitter",
        "Progress Emitter",
        "1",
        true,
        None,
        json!({ "type": "object", "properties": {} }),
        vec![
            "sh".into(),
            "-c".into(),
            r#"echo '{"type":"progress","data":{"pct":50}}'; echo '{"type":"progress","data":{"pct":100}}'"#
                .into(),
        ],
    )
}

/// `sleep_catchable`: sleeps 300s but exits 0 on SIGTERM (E4 cancel mid-run).
pub fn sleep_catchable() -> Task {
    Task::new(
        "sleep_catchable",
        "Sleep (catches TERM)",
        "1",
        true,
        None,
        json!({ "type": "object", "properties": {} }),
        vec![
            "sh".into(),
            "-c".into(),
            "trap 'exit 0' TERM; sleep 300".into(),
        ],
    )
}

/// `sleep_orphan`: sleeps 300s with no signal handling (E5 worker death).
pub fn sleep_orphan() -> Task {
    Task::new(
        "sleep_orphan",
        "Sleep (orphan-able)",
        "1",
        true,
        None,
        json!({ "type": "object", "properties": {} }),
        vec!["sh".into(), "-c".into(), "sleep 300".into()],
    )
}

/// `capped_sleep`: `concurrency_limit=2`, used by E6.
pub fn capped_sleep(limit: u32) -> Task {
    Task::new(
        "capped_sleep",
        "Capped Sleep",
        "1",
        true,
        Some(limit),
        json!({ "type": "object", "properties": {} }),
        vec!["sh".into(), "-c".into(), "sleep 2".into()],
    )
}
