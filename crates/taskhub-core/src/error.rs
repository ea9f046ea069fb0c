use std::fmt;

/// Error taxonomy surfaced across Store, Worker, Supervisor, Scheduler and
/// Reaper. The taxonomy is what callers branch on; the wrapped `anyhow::Error`
/// carries the human-readable detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownTask,
    Disabled,
    BuildCommandError,
    SpawnError,
    ChildNonZeroExit,
    ChildKilledBySignal,
    LostLease,
    Reaped,
    WorkerShutdown,
    Store,
    Io,
    Other,
}

/// Crate-local error type. Mirrors the wrap-anyhow-with-a-kind shape used
/// throughout the rest of this workspace, so `?` keeps working everywhere
/// while call sites that care can still match on `kind()`.
pub struct Error {
    kind: ErrorKind,
    inner: anyhow::Error,
}

impl Error {
    pub fn new(kind: ErrorKind, inner: anyhow::Error) -> Self {
        Self { kind, inner }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn unknown_task(task_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::UnknownTask,
            anyhow::anyhow!("unknown task_id: {}", task_id.into()),
        )
    }

    pub fn disabled(task_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Disabled,
            anyhow::anyhow!("task is disabled: {}", task_id.into()),
        )
    }

    pub fn lost_lease(run_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::LostLease,
            anyhow::anyhow!("lease no longer held for run {}", run_id.into()),
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {{ kind: {:?}, inner: {:?} }}", self.kind, self.inner)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(inner: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Other,
            inner,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            kind: ErrorKind::Store,
            inner: anyhow::Error::new(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            inner: anyhow::Error::new(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Other,
            inner: anyhow::Error::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_task_carries_kind() {
        let err = Error::unknown_task("nope");
        assert_eq!(err.kind(), ErrorKind::UnknownTask);
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn wraps_sqlx_error_as_store_kind() {
        let sqlx_err = sqlx::Error::RowNotFound;
        let err: Error = sqlx_err.into();
        assert_eq!(err.kind(), ErrorKind::Store);
    }
}
