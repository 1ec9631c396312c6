// src/cli.rs

use crate::{run, setup_configuration, storage::KeyStatus, AppState};
use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const LIST_PAGE_SIZE: usize = 500;

#[derive(Parser, Debug)]
#[command(
    name = "keypool-proxy",
    version,
    about = "API key pool with health testing and pluggable rotation, behind an HTTP proxy"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CONFIG_PATH", global = true)]
    pub config: Option<PathBuf>,

    /// JSON log lines; `--json-logs false` for human-readable output
    #[arg(long, env = "KEYPOOL_JSON_LOGS", default_value_t = true, action = ArgAction::Set, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the proxy server (default)
    Serve,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Key pool commands, run against the pool file
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Load and validate the configuration, then print it
    Check,
}

#[derive(Subcommand, Debug)]
pub enum KeyCommands {
    /// Print keys as JSON
    List {
        /// Only keys with this status (active, disabled, banned)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Import credentials from a file, one per line
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Health-test one key, or every non-banned key
    Test {
        /// Key id; omit to test all
        id: Option<String>,
    },

    /// Print pool and per-group statistics
    Stats,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Dispatches a parsed command line.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.config).await,
        Commands::Config {
            action: ConfigCommands::Check,
        } => check_config(cli.config),
        Commands::Keys { action } => run_key_command(cli.config, action).await,
    }
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (app, state) = run(config_path).await.context("application setup failed")?;

    let cancel = CancellationToken::new();
    let flusher = state
        .pool
        .spawn_flusher(state.config.storage.debounce(), cancel.clone());

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!(server.address = %addr, error = ?e, "Failed to bind to address. Exiting.");
        e
    })?;
    info!(server.address = %addr, "Server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server run loop failed")?;

    info!("Flushing key pool before exit");
    cancel.cancel();
    if let Err(e) = flusher.await {
        error!(error = %e, "Key pool flusher task panicked");
    }
    state.pool.flush().await.context("final key pool flush failed")?;

    info!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!(signal = "Ctrl+C", "Received signal. Initiating graceful shutdown...") },
        () = terminate => { info!(signal = "Terminate", "Received signal. Initiating graceful shutdown...") },
    }
}

fn check_config(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = setup_configuration(config_path).context("configuration is invalid")?;
    println!("Configuration OK");
    println!("{}", serde_yaml::to_string(&redacted(config))?);
    Ok(())
}

fn redacted(mut config: crate::AppConfig) -> crate::AppConfig {
    if config.server.admin_token.is_some() {
        config.server.admin_token = Some("***".to_string());
    }
    config
}

async fn run_key_command(config_path: Option<PathBuf>, action: KeyCommands) -> anyhow::Result<()> {
    let config = setup_configuration(config_path).context("configuration is invalid")?;
    let state = Arc::new(AppState::new(config).await.context("failed to open key pool")?);

    match action {
        KeyCommands::List { status } => {
            let status = status.as_deref().map(str::parse::<KeyStatus>).transpose()?;
            let mut keys = Vec::new();
            let mut page = 1;
            loop {
                let batch = state.pool.get_keys(page, LIST_PAGE_SIZE, status);
                keys.extend(batch.items);
                if page >= batch.pagination.total_pages {
                    break;
                }
                page += 1;
            }
            print_json(&keys)?;
        }
        KeyCommands::Import { file } => {
            let lines = read_lines(&file).await?;
            let summary = state.pool.import_keys(&lines).await?;
            print_json(&summary)?;
        }
        KeyCommands::Test { id: Some(id) } => {
            let report = state.probe.test_key(&id).await?;
            print_json(&report)?;
            if !report.success {
                bail!("key {id} failed its health test");
            }
        }
        KeyCommands::Test { id: None } => {
            print_json(&state.probe.test_all_keys().await)?;
        }
        KeyCommands::Stats => {
            print_json(&serde_json::json!({
                "keys": state.pool.stats(),
                "poolGroups": state.pool.pool_group_stats(),
            }))?;
        }
    }

    state.pool.flush().await?;
    Ok(())
}

async fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(content.lines().map(str::to_string).collect())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli::try_parse_from(["keypool-proxy"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.json_logs);
    }

    #[test]
    fn test_keys_subcommands() {
        let cli = Cli::try_parse_from(["keypool-proxy", "--json-logs", "false", "keys", "list", "--status", "banned"]).unwrap();
        assert!(!cli.json_logs);
        match cli.command {
            Some(Commands::Keys {
                action: KeyCommands::List { status },
            }) => assert_eq!(status.as_deref(), Some("banned")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
