mod clock;
mod config;
mod error;
mod repository;
mod schemas;
mod services;
mod state;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use clock::SystemClock;
use config::AppConfig;
use error::AppError;
use repository::ledger_store::PgLedgerStore;
use services::scheduler::{log_tick, LedgerScheduler, SchedulerOptions};
use state::AppState;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rent-ledger-worker", version, about = "Rent ledger scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate rent payments and send reminders once a day until stopped.
    Run {
        /// Process a single tick, wait for it to settle, then exit.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    let state = AppState::build(config)?;

    let store = Arc::new(PgLedgerStore::new(state.require_pool()?));
    let gateway = Arc::new(state.notification_gateway()?);
    let scheduler = LedgerScheduler::new(
        store,
        gateway,
        Arc::new(SystemClock),
        SchedulerOptions::from_config(&state.config),
    );

    tracing::info!(
        app_name = %state.config.app_name,
        environment = %state.config.environment,
        production = state.config.is_production(),
        delivery_mode = state.config.notification_delivery_mode.as_str(),
        "Rent ledger worker starting"
    );

    match cli.command {
        Command::Run { once: true } => {
            let timeout = state.config.run_once_timeout();
            let result = tokio::time::timeout(timeout, scheduler.run_tick())
                .await
                .map_err(|_| {
                    AppError::Internal(format!(
                        "Single tick did not finish within {} seconds.",
                        timeout.as_secs()
                    ))
                })?;
            log_tick(&result);
            result?;
        }
        Command::Run { once: false } => {
            let handle = scheduler.start();
            shutdown_signal().await;
            handle.shutdown().await;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to register SIGTERM handler, listening for Ctrl-C only");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, finishing in-flight tick");
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
