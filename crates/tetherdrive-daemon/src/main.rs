//! TetherDrive Daemon - Background synchronization service
//!
//! This binary runs as a systemd user service and:
//! - Loads the configured sync roots
//! - Starts one sync session per root in the sync root pool
//! - Stops every session on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! Sessions are created by an [`EngineLauncher`] whose factories pick the
//! remote store adapter from the root's connection and put an extended
//! attribute placeholder host on its mount directory. The main task only
//! waits for a shutdown signal, so a failing root never takes the daemon
//! down with it.
//!
//! Content is fetched for pinned entries only; each session's remote poll
//! expands pinned directories and hydrates pinned files.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tetherdrive_core::config::{Config, LoggingConfig};
use tetherdrive_core::domain::SyncRoot;
use tetherdrive_core::ports::{IPlaceholderHost, IRemoteStore};
use tetherdrive_host::XattrPlaceholderHost;
use tetherdrive_sync::pool::{EngineLauncher, HostFactory, RemoteFactory, SyncRootPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tetherdrived", version, about = "TetherDrive synchronization daemon")]
struct Cli {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// ============================================================================
// Startup
// ============================================================================

/// Loads the configuration
///
/// An explicitly given file must exist; the default location falls back to
/// built-in defaults when it is missing or unreadable.
fn load_config(explicit: Option<&PathBuf>) -> Result<Config> {
    let config = match explicit {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        anyhow::bail!("Invalid configuration: {joined}");
    }
    Ok(config)
}

/// Filter directive: `RUST_LOG` wins, then `-v` flags, then the config level
fn filter_directive(logging: &LoggingConfig, verbose: u8) -> String {
    match verbose {
        0 => logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn init_tracing(logging: &LoggingConfig, verbose: u8) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(logging, verbose)));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

/// Builds the pool with the production adapters
fn build_pool(config: &Config) -> SyncRootPool {
    let remote_factory: RemoteFactory =
        Arc::new(|root: &SyncRoot| -> Result<Arc<dyn IRemoteStore>> {
            tetherdrive_remote::open_store(&root.connection)
                .with_context(|| format!("Failed to open remote store of {}", root.id))
        });
    let host_factory: HostFactory =
        Arc::new(|root: &SyncRoot| -> Result<Arc<dyn IPlaceholderHost>> {
            Ok(Arc::new(XattrPlaceholderHost::new(root.mount_dir())))
        });

    let launcher = EngineLauncher::new(config.sync.clone(), remote_factory, host_factory);
    SyncRootPool::new(Arc::new(launcher))
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging, cli.verbose);

    info!(roots = config.roots.len(), "TetherDrive daemon starting (tetherdrived)");

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let pool = build_pool(&config);
    for root in &config.roots {
        if let Err(e) = pool.start(root.clone()).await {
            error!(root = %root.id, error = %format!("{e:#}"), "Failed to start sync root");
        }
    }
    if pool.is_empty() {
        warn!("No sync roots running; waiting for shutdown");
    }

    shutdown_token.cancelled().await;
    pool.stop_all().await;

    info!("TetherDrive daemon shut down gracefully");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
