//! # Case Poller
//!
//! `serve` runs the timer trigger until Ctrl-C. `poll-once` runs a single cycle and
//! prints its summary, optionally moving the run window start first. `enqueue-task`
//! places one task on the live queue. `health` checks every dependency and exits
//! non-zero when one is down.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use case_poller::config::ConfigManager;
use case_poller::health::HealthChecker;
use case_poller::logging::init_structured_logging;
use case_poller::models::Task;
use case_poller::orchestration::PollerSystem;
use case_poller::run_window::RunWindowGuard;

#[derive(Parser, Debug)]
#[command(name = "case-poller")]
#[command(about = "Polls the case store and queues changed cases as tasks")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Directory holding poller.toml and its environment overlays
    #[arg(short, long, env = "POLLER_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run cycles on the configured trigger interval until interrupted
    Serve,
    /// Run one cycle and print its summary
    PollOnce {
        /// Reset the window start first: an RFC 3339 timestamp, or `min` for the default
        #[arg(long, value_name = "RFC3339|min")]
        from: Option<String>,
    },
    /// Queue a single task, given as JSON in the queue's task shape
    EnqueueTask {
        /// e.g. {"id":"1569408870830254","state":"Submitted","jurisdiction":"DIVORCE",
        /// "case_type_id":"DIVORCE","last_modified_date":"2019-09-25T12:10:00"}
        task: String,
    },
    /// Check the database, identity services and case store
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let manager = ConfigManager::load_from_directory(cli.config_dir)
        .context("Failed to load poller configuration")?;
    init_structured_logging(&manager.config().logging);

    if matches!(cli.command, Commands::Health) {
        let report = HealthChecker::from_config(manager.config())?.run().await;
        println!("{}", report.summary());
        if !report.is_healthy() {
            anyhow::bail!("{} dependencies are down", report.unhealthy().count());
        }
        return Ok(());
    }

    let system = PollerSystem::bootstrap(manager.config())
        .await
        .context("Failed to start the poller")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, shutting down");
            signal.cancel();
        }
    });

    match cli.command {
        Commands::Serve => {
            system.scheduler().run(shutdown).await;
        }
        Commands::PollOnce { from } => {
            if let Some(from) = from {
                let start = parse_window_start(&from, system.guard())?;
                system.guard().reset_to(start).await?;
            }
            let report = system.orchestrator().run_cycle(&shutdown).await?;
            println!("{}", report.summary());
        }
        Commands::EnqueueTask { task } => {
            let task: Task = serde_json::from_str(&task).context("Task is not valid JSON")?;
            system.enqueuer().enqueue(&task).await?;
            println!("Queued task {}", task.id());
        }
        Commands::Health => {}
    }

    system.shutdown().await;
    info!("Case poller exited");
    Ok(())
}

fn parse_window_start(value: &str, guard: &RunWindowGuard) -> anyhow::Result<DateTime<Utc>> {
    if value.eq_ignore_ascii_case("min") {
        return Ok(guard.default_window_start());
    }
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("--from must be RFC 3339 or `min`, got {value:?}"))?;
    Ok(parsed.with_timezone(&Utc))
}
