// dispatcher - distributed download orchestration cluster
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use dispatcher::api::{build_router, AppState};
use dispatcher::config::{Config, DatabaseType};
use dispatcher::liveness::LivenessMonitor;
use dispatcher::registry::Registry;
use dispatcher::retry::RetryController;
use dispatcher::scheduler::Scheduler;
use dispatcher::store::{migrate, MemoryStore, SqliteStore, Store};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "dispatcher")]
#[command(about = "Distributed download orchestration dispatcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the JSON config file (overrides CONFIG_PATH)
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher server (default if no subcommand is given)
    Serve,
    /// Copy all tasks and workers from one backend to another
    Migrate {
        #[arg(long, value_enum)]
        source: BackendArg,
        #[arg(long, value_enum)]
        target: BackendArg,
        #[arg(long, default_value = "data/dispatcher.db")]
        sqlite_path: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum BackendArg {
    Memory,
    Sqlite,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_from_env(),
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Migrate {
            source,
            target,
            sqlite_path,
        } => run_migration(source, target, sqlite_path).await,
    }
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    Ok(match config.database.kind {
        DatabaseType::Memory => Arc::new(MemoryStore::new()),
        DatabaseType::Sqlite => Arc::new(SqliteStore::new(&config.database.path).await?),
    })
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("starting dispatcher");

    let store = build_store(&config).await?;
    let registry = Arc::new(Registry::new());
    let config = Arc::new(config);

    let cancel = CancellationToken::new();

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry.clone(),
        config.task_assignment.strategy,
    ));
    let liveness = Arc::new(LivenessMonitor::new(
        store.clone(),
        config.worker_management.heartbeat_interval,
        config.worker_management.heartbeat_timeout,
        config.worker_management.auto_remove_offline,
        config.worker_management.offline_threshold,
    ));
    let retry = Arc::new(RetryController::new(
        store.clone(),
        config.task_assignment.max_retries,
        config.task_assignment.retry_delay,
    ));

    let scheduler_handle = tokio::spawn(scheduler.run(cancel.clone()));
    let liveness_handle = tokio::spawn(liveness.run(cancel.clone()));
    let retry_handle = tokio::spawn(retry.run(cancel.clone()));

    let state = AppState {
        store,
        registry,
        config: config.clone(),
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "dispatcher listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let _ = tokio::join!(scheduler_handle, liveness_handle, retry_handle);

    tracing::info!("dispatcher stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

async fn run_migration(source: BackendArg, target: BackendArg, sqlite_path: String) -> anyhow::Result<()> {
    if matches!(
        (source, target),
        (BackendArg::Memory, BackendArg::Memory) | (BackendArg::Sqlite, BackendArg::Sqlite)
    ) {
        anyhow::bail!("source and target backends must differ");
    }

    let source_store: Arc<dyn Store> = match source {
        BackendArg::Memory => Arc::new(MemoryStore::new()),
        BackendArg::Sqlite => Arc::new(SqliteStore::new(&sqlite_path).await?),
    };
    let target_store: Arc<dyn Store> = match target {
        BackendArg::Memory => Arc::new(MemoryStore::new()),
        BackendArg::Sqlite => Arc::new(SqliteStore::new(&sqlite_path).await?),
    };

    let report = migrate(source_store.as_ref(), target_store.as_ref()).await?;
    println!(
        "migrated {} tasks, {} workers, {} errors",
        report.tasks_migrated, report.workers_migrated, report.errors
    );
    Ok(())
}
