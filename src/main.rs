//! Periodic PostgreSQL snapshots to S3-compatible storage
//!
//! Provides CLI interface for one-shot backups, the scheduled backup daemon
//! and listing stored artifacts

// dbsnapshot/src/main.rs
mod backup;
mod config;
mod errors;
mod scheduler;

use anyhow::{Context, Result};
use config::AppConfig;
use scheduler::{Task, TaskGroup};
use std::env;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "config.json";
const USAGE: &str = "usage: dbsnapshot [--config <path>] <backup|run|list>";

/// Main entry point for the snapshot tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbsnapshot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run_app().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}

struct CliArgs {
    config_path: PathBuf,
    command: String,
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut command = None;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config requires a path")?;
                config_path = PathBuf::from(path);
            }
            other if command.is_none() => command = Some(other.trim().to_string()),
            other => anyhow::bail!("Unexpected argument '{}'\n{}", other, USAGE),
        }
    }

    Ok(CliArgs {
        config_path,
        command: command.context(USAGE)?,
    })
}

async fn run_app() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let cli = parse_args(&args)?;

    let app_config = AppConfig::load_from_json(&cli.config_path, |key| env::var(key).ok())
        .with_context(|| {
            format!(
                "Failed to load application configuration from {}",
                cli.config_path.display()
            )
        })?;

    match cli.command.as_str() {
        "backup" => {
            tracing::info!("🚀 Starting one-off backup cycle");
            let pipeline = backup::build_pipeline(&app_config).await?;
            // A failure is logged once, by `main`.
            backup::run_backup_cycle(&pipeline).await?;
        }
        "run" => run_scheduled(&app_config).await?,
        "list" => backup::run_list_flow(&app_config).await?,
        other => anyhow::bail!("Invalid command '{}'\n{}", other, USAGE),
    }
    Ok(())
}

/// Submits every configured task, then waits for SIGINT/SIGTERM.
async fn run_scheduled(app_config: &AppConfig) -> Result<()> {
    // Installed before any work so a broken signal setup fails the start.
    let shutdown = shutdown_signal()?;

    let cancel = CancellationToken::new();
    let mut group = TaskGroup::new(cancel.clone());

    let toggle = app_config.tasks.db_backup;
    let pipeline = Arc::new(backup::build_pipeline(app_config).await?);
    let db_backup = Task::new("db_backup", toggle.enabled, toggle.interval(), move || {
        let pipeline = pipeline.clone();
        async move { backup::run_backup_cycle(&pipeline).await.map(|_| ()) }
    });
    tracing::info!(
        task = db_backup.name(),
        enabled = toggle.enabled,
        interval_minutes = toggle.interval_minutes,
        "Submitting task"
    );

    // A signal during the initial run stops further scheduling.
    let signals = tokio::spawn(async move {
        let listened = shutdown.await;
        cancel.cancel();
        listened
    });

    group.submit(db_backup).await;

    if group.active_loops() == 0 {
        tracing::info!("No repeating tasks scheduled, exiting");
        signals.abort();
        return Ok(());
    }

    stop_on_shutdown(group, signals).await
}

/// Waits for the signal listener to finish, then stops the group. A listener
/// that failed makes the daemon exit with an error instead of quietly.
async fn stop_on_shutdown(group: TaskGroup, signals: JoinHandle<Result<()>>) -> Result<()> {
    let listened = signals.await.context("Shutdown signal listener panicked")?;
    tracing::info!("Shutdown requested, waiting for in-flight runs");
    group.shutdown().await;
    listened.context("Stopped scheduling because shutdown signals could not be received")
}

#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = Result<()>> + Send + 'static> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        Ok(())
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = Result<()>> + Send + 'static> {
    Ok(async {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("dbsnapshot")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_command_with_default_config() {
        let cli = parse_args(&args(&["backup"])).unwrap();
        assert_eq!(cli.command, "backup");
        assert_eq!(cli.config_path, PathBuf::from("config.json"));
    }

    #[test]
    fn test_parse_config_flag_in_any_position() {
        let cli = parse_args(&args(&["run", "--config", "/etc/dbsnapshot.json"])).unwrap();
        assert_eq!(cli.command, "run");
        assert_eq!(cli.config_path, PathBuf::from("/etc/dbsnapshot.json"));
    }

    #[tokio::test]
    async fn test_failed_signal_listener_is_returned() {
        let cancel = CancellationToken::new();
        let mut group = TaskGroup::new(cancel.clone());
        group
            .submit(Task::new("tick", true, Some(std::time::Duration::from_secs(60)), || async {
                Ok::<(), anyhow::Error>(())
            }))
            .await;

        let listener_cancel = cancel.clone();
        let signals = tokio::spawn(async move {
            listener_cancel.cancel();
            Err::<(), _>(anyhow::anyhow!("signal driver unavailable"))
        });

        let err = stop_on_shutdown(group, signals).await.unwrap_err();
        assert!(format!("{:#}", err).contains("signal driver unavailable"));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_clean_signal_stops_group_without_error() {
        let cancel = CancellationToken::new();
        let mut group = TaskGroup::new(cancel.clone());
        group
            .submit(Task::new("tick", true, Some(std::time::Duration::from_secs(60)), || async {
                Ok::<(), anyhow::Error>(())
            }))
            .await;
        assert_eq!(group.active_loops(), 1);

        let signals = tokio::spawn(async { Ok::<(), anyhow::Error>(()) });

        assert!(stop_on_shutdown(group, signals).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_signal_installs_handlers() {
        assert!(shutdown_signal().is_ok());
    }

    #[test]
    fn test_missing_command_is_an_error() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["--config"])).is_err());
        assert!(parse_args(&args(&["backup", "extra"])).is_err());
    }
}
