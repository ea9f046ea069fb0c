use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use taskhub::config::Config;
use taskhub::{api, reaper, scheduler, tasks, worker};
use taskhub_core::Store;
use taskhub_store_sqlite::SqliteStore;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taskhub")]
#[command(about = "Single-host asynchronous task execution platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API.
    Api,

    /// Run a Worker: claims and supervises runs.
    Worker,

    /// Run the Scheduler: materializes due cron entries into runs.
    Scheduler,

    /// Run the Reaper: reclaims leases abandoned by dead Workers.
    Reaper {
        /// Override the sweep interval in seconds.
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env().context("load taskhub config")?;

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::connect(&cfg.db_path)
            .await
            .context("connect sqlite store")?,
    );

    match cli.command {
        Command::Api => {
            let registry = Arc::new(
                tasks::load_registry(&cfg.tasks_dir).context("load task registry")?,
            );
            api::run(
                store,
                registry,
                std::path::PathBuf::from(&cfg.data_dir),
                &cfg.bind_addr,
            )
            .await
        }
        Command::Worker => {
            let registry = Arc::new(
                tasks::load_registry(&cfg.tasks_dir).context("load task registry")?,
            );
            let worker_id = cfg
                .worker_id
                .clone()
                .unwrap_or_else(|| format!("w-{}", ulid::Ulid::new()));
            worker::run(&cfg, store, registry, worker_id).await
        }
        Command::Scheduler => {
            let registry = Arc::new(
                tasks::load_registry(&cfg.tasks_dir).context("load task registry")?,
            );
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(scheduler::run(store, registry, cfg.scheduler_tick(), shutdown_rx));
            run_until_ctrl_c(shutdown_tx, handle).await
        }
        Command::Reaper { interval } => {
            let sweep_interval = interval
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| cfg.reaper_interval());
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(reaper::run(
                store,
                sweep_interval,
                cfg.lease_duration(),
                shutdown_rx,
            ));
            run_until_ctrl_c(shutdown_tx, handle).await
        }
    }
}

/// Waits for ctrl-c, signals the background loop to stop, then joins it.
async fn run_until_ctrl_c(
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    handle.await.context("join background loop")?
}
