//! The task registry contract (§6): an external collaborator's read-only,
//! process-wide view of `{task_id -> (param schema, build_command)}`. This
//! crate only defines the contract; `taskhub` (the binary crate) owns the
//! concrete manifest-scanning loader.

use serde_json::Value;
use std::collections::HashMap;

/// One registered task definition.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub name: String,
    pub version: String,
    pub is_enabled: bool,
    /// `None` means unbounded concurrency.
    pub concurrency_limit: Option<u32>,
    pub params_schema: Value,
    /// The command template, e.g. `["sh", "-c", "{{script}}"]`. Interpolated
    /// against `params` by `build_command`.
    command_template: Vec<String>,
}

/// Raised by `Task::build_command` when a param fails to satisfy the
/// command template (e.g. a required placeholder missing from `params`).
#[derive(Debug)]
pub struct BuildCommandError(pub String);

impl std::fmt::Display for BuildCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "build_command_failed: {}", self.0)
    }
}

impl std::error::Error for BuildCommandError {}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        is_enabled: bool,
        concurrency_limit: Option<u32>,
        params_schema: Value,
        command_template: Vec<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            version: version.into(),
            is_enabled,
            concurrency_limit,
            params_schema,
            command_template,
        }
    }

    /// Renders the command template against `params`, substituting
    /// `{{key}}` placeholders with the corresponding scalar value from
    /// `params` (string, number, or bool; arrays/objects are rejected).
    pub fn build_command(&self, params: &Value) -> Result<Vec<String>, BuildCommandError> {
        self.command_template
            .iter()
            .map(|arg| render_placeholder(arg, params))
            .collect()
    }
}

fn render_placeholder(arg: &str, params: &Value) -> Result<String, BuildCommandError> {
    if !arg.starts_with("{{") || !arg.ends_with("}}") {
        return Ok(arg.to_string());
    }
    let key = arg.trim_start_matches("{{").trim_end_matches("}}").trim();
    let value = params
        .get(key)
        .ok_or_else(|| BuildCommandError(format!("missing param {key:?} for command template")))?;
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(BuildCommandError(format!(
            "param {key:?} must be a scalar, got {other}"
        ))),
    }
}

/// Read-only, process-wide registry of task definitions. Implementations
/// are expected to load once at startup and never mutate afterwards —
/// hot-reload is explicitly out of scope.
pub trait TaskRegistry: Send + Sync {
    fn get(&self, task_id: &str) -> Option<&Task>;
    fn all(&self) -> Vec<&Task>;
}

/// A simple in-memory registry, sufficient for the built-in registry and
/// for tests.
#[derive(Debug, Default)]
pub struct InMemoryTaskRegistry {
    tasks: HashMap<String, Task>,
}

impl InMemoryTaskRegistry {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect(),
        }
    }
}

impl TaskRegistry for InMemoryTaskRegistry {
    fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    fn all(&self) -> Vec<&Task> {
        self.tasks.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_command_substitutes_scalar_params() {
        let task = Task::new(
            "echo_ok",
            "Echo OK",
            "1",
            true,
            None,
            json!({}),
            vec!["sh".into(), "-c".into(), "{{script}}".into()],
        );
        let cmd = task
            .build_command(&json!({ "script": "echo hi; exit 0" }))
            .unwrap();
        assert_eq!(cmd, vec!["sh", "-c", "echo hi; exit 0"]);
    }

    #[test]
    fn missing_param_is_build_command_error() {
        let task = Task::new(
            "echo_ok",
            "Echo OK",
            "1",
            true,
            None,
            json!({}),
            vec!["sh".into(), "-c".into(), "{{script}}".into()],
        );
        let err = task.build_command(&json!({})).unwrap_err();
        assert!(err.to_string().contains("missing param"));
    }
}
