use clap::Parser;

/// TaskHub configuration.
///
/// Idiomatic Rust notes:
/// - Prefer explicit types over loosely-typed maps for config.
/// - Parse once at startup; pass `&Config` through.
/// - Avoid global mutable state.
#[derive(Parser, Debug, Clone)]
pub struct Config {
    /// Path to the single embedded database file.
    #[arg(long, env = "TASKHUB_DB_PATH", default_value = "data/taskhub.db")]
    pub db_path: String,

    /// Root of the on-disk run-directory tree (`<data_dir>/runs/<run_id>/...`).
    #[arg(long, env = "TASKHUB_DATA_DIR", default_value = "data")]
    pub data_dir: String,

    /// Default lease duration handed to `claim_next`.
    #[arg(long, env = "TASKHUB_LEASE_SECONDS", default_value_t = 60)]
    pub lease_seconds: u64,

    /// Grace period between SIGTERM and SIGKILL during cancellation.
    #[arg(long, env = "TASKHUB_SOFT_GRACE_SECONDS", default_value_t = 10)]
    pub soft_grace_seconds: u64,

    /// Reaper sweep interval.
    #[arg(long, env = "TASKHUB_REAPER_INTERVAL_SECONDS", default_value_t = 60)]
    pub reaper_interval_seconds: u64,

    /// Scheduler tick interval.
    #[arg(long, env = "TASKHUB_SCHEDULER_TICK_SECONDS", default_value_t = 1)]
    pub scheduler_tick_seconds: u64,

    /// Directory scanned at startup for task manifest files.
    #[arg(long, env = "TASKHUB_TASKS_DIR", default_value = "tasks")]
    pub tasks_dir: String,

    /// Bind address for the HTTP API.
    #[arg(long, env = "TASKHUB_BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: String,

    /// Stable worker id; generated at startup if not supplied.
    #[arg(long, env = "TASKHUB_WORKER_ID")]
    pub worker_id: Option<String>,
}

impl Config {
    /// Parse config from environment only (no CLI parsing).
    ///
    /// We intentionally parse from a single fake argv element so clap
    /// doesn't try to interpret the real subcommand flags here.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["taskhub"]))
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_seconds as i64)
    }

    pub fn soft_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.soft_grace_seconds)
    }

    pub fn reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reaper_interval_seconds)
    }

    pub fn scheduler_tick(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scheduler_tick_seconds)
    }

    pub fn run_dir(&self, run_id: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("runs").join(run_id)
    }
}
