//! Task registry loader: scans `TASKHUB_TASKS_DIR` for `*.json` manifests
//! and builds a read-only, process-wide `TaskRegistry`. This is the
//! external collaborator named in the task registry contract; its own
//! internals are not held to the same rigor as the five core components.

use serde::Deserialize;
use std::path::Path;
use taskhub_core::task::{InMemoryTaskRegistry, Task};

#[derive(Debug, Deserialize)]
struct TaskManifest {
    task_id: String,
    name: String,
    version: String,
    #[serde(default = "default_true")]
    is_enabled: bool,
    concurrency_limit: Option<u32>,
    #[serde(default)]
    params_schema: serde_json::Value,
    command: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Scans `dir` for `*.json` task manifests. A missing directory yields an
/// empty registry rather than an error, since a fresh deployment may not
/// have any tasks configured yet.
pub fn load_registry(dir: &str) -> anyhow::Result<InMemoryTaskRegistry> {
    let path = Path::new(dir);
    if !path.is_dir() {
        tracing::warn!(tasks_dir = %dir, "tasks directory does not exist; registry is empty");
        return Ok(InMemoryTaskRegistry::new(Vec::new()));
    }

    let mut tasks = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_path = entry.path();
        if file_path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let contents = std::fs::read_to_string(&file_path)?;
        let manifest: TaskManifest = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("invalid task manifest {file_path:?}: {e}"))?;
        tracing::info!(task_id = %manifest.task_id, file = ?file_path, "loaded task");
        tasks.push(Task::new(
            manifest.task_id,
            manifest.name,
            manifest.version,
            manifest.is_enabled,
            manifest.concurrency_limit,
            manifest.params_schema,
            manifest.command,
        ));
    }

    Ok(InMemoryTaskRegistry::new(tasks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhub_core::task::TaskRegistry;

    #[test]
    fn missing_dir_yields_empty_registry() {
        let registry = load_registry("/does/not/exist").unwrap();
        assert!(registry.all().is_empty());
    }

    #[test]
    fn loads_manifest_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("echo_ok.json"),
            r#"{
                "task_id": "echo_ok",
                "name": "Echo OK",
                "version": "1",
                "is_enabled": true,
                "concurrency_limit": null,
                "params_schema": {},
                "command": ["sh", "-c", "echo hi; exit 0"]
            }"#,
        )
        .unwrap();

        let registry = load_registry(dir.path().to_str().unwrap()).unwrap();
        let task = registry.get("echo_ok").unwrap();
        assert_eq!(task.build_command(&serde_json::json!({})).unwrap(), vec!["sh", "-c", "echo hi; exit 0"]);
    }
}
