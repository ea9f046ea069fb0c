//! The structured event wire format a child process may emit on stdout:
//! lines of the shape `{"type":"<T>","data":<JSON>}`.

use serde::Deserialize;
use serde_json::Value;

/// Recognized event types. `Other` carries any type string outside the
/// fixed vocabulary; its `data` is stored opaquely, untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Log,
    Progress,
    Artifact,
    Metric,
    Stdout,
    Stderr,
    System,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Log => "log",
            Self::Progress => "progress",
            Self::Artifact => "artifact",
            Self::Metric => "metric",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
            Self::Other(s) => s,
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "log" => Self::Log,
            "progress" => Self::Progress,
            "artifact" => Self::Artifact,
            "metric" => Self::Metric,
            "stdout" => Self::Stdout,
            "stderr" => Self::Stderr,
            "system" => Self::System,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    event_type: String,
    data: Value,
}

/// A line a child wrote to stdout/stderr, classified per spec §4.3.
#[derive(Debug)]
pub struct ClassifiedLine {
    pub kind: EventKind,
    pub data: Value,
}

/// Maximum accepted raw-line length before truncation. Oversize lines are
/// wrapped as `stdout`/`stderr` with a `truncated: true` flag rather than
/// rejected outright — the Supervisor must never drop output silently.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Classify one line of stdout. `fallback` names the event type used when
/// the line is not a recognized `{"type":...,"data":...}` JSON object
/// (`"stdout"` or `"stderr"` depending on the stream).
pub fn classify_line(line: &str, fallback: &str) -> ClassifiedLine {
    let (line, truncated) = if line.len() > MAX_LINE_BYTES {
        let mut end = MAX_LINE_BYTES;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        (&line[..end], true)
    } else {
        (line, false)
    };

    if let Ok(raw) = serde_json::from_str::<RawLine>(line) {
        return ClassifiedLine {
            kind: EventKind::from_str(&raw.event_type),
            data: raw.data,
        };
    }

    ClassifiedLine {
        kind: EventKind::from_str(fallback),
        data: serde_json::json!({ "line": line, "truncated": truncated }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_line_wraps_as_fallback() {
        let classified = classify_line("hi", "stdout");
        assert_eq!(classified.kind, EventKind::Stdout);
        assert_eq!(classified.data["line"], "hi");
    }

    #[test]
    fn structured_progress_line_classified() {
        let classified = classify_line(r#"{"type":"progress","data":{"pct":50}}"#, "stdout");
        assert_eq!(classified.kind, EventKind::Progress);
        assert_eq!(classified.data["pct"], 50);
    }

    #[test]
    fn unknown_type_is_stored_opaquely() {
        let classified = classify_line(r#"{"type":"checkpoint","data":{"n":1}}"#, "stdout");
        assert_eq!(classified.kind, EventKind::Other("checkpoint".into()));
        assert_eq!(classified.data["n"], 1);
    }

    #[test]
    fn oversize_line_is_truncated_not_dropped() {
        let huge = "x".repeat(MAX_LINE_BYTES + 10);
        let classified = classify_line(&huge, "stdout");
        assert_eq!(classified.data["truncated"], true);
    }

    #[test]
    fn oversize_multibyte_line_does_not_panic_on_char_boundary() {
        // "é" is 2 bytes; repeated enough times the naive MAX_LINE_BYTES
        // byte cut lands mid-character.
        let huge = "é".repeat(MAX_LINE_BYTES);
        let classified = classify_line(&huge, "stdout");
        assert_eq!(classified.data["truncated"], true);
    }
}
