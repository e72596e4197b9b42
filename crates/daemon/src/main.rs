//! LanShare Daemon
//!
//! Serves a shared folder to the local network.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use lanshare_daemon::audit::AuditLog;
use lanshare_daemon::config::{default_config_path, Config};
use lanshare_daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use lanshare_daemon::pidfile;
use lanshare_daemon::server_log::ServerLogBuffer;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// LanShare Daemon - shared folder service for the local network.
#[derive(Parser, Debug)]
#[command(name = "lanshare")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve the shared folder until Ctrl-C or SIGTERM
    Start,

    /// Run one expiry sweep and report what was removed.
    ///
    /// Offline maintenance: refuses while a daemon serves the same data
    /// directory, since that daemon already sweeps on its own schedule.
    Sweep,

    /// Print the most recent audit log lines, newest first
    Logs {
        /// Number of lines (1-1000, default 300)
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    let server_logs = Arc::new(ServerLogBuffer::default());
    let _log_guard = init_logging(&config, cli.verbose, &server_logs);
    tracing::debug!("Using config file: {:?}", config_path);

    config.validate()?;

    match cli.command {
        Commands::Start => {
            tracing::info!("LanShare daemon starting...");
            let orchestrator = DaemonOrchestrator::with_server_logs(config, server_logs)?;

            let mut events = orchestrator.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        OrchestratorEvent::StateChanged(state) => {
                            tracing::info!("Orchestrator state: {:?}", state);
                        }
                        OrchestratorEvent::Listening { addr } => {
                            tracing::debug!("Accepting connections on {}", addr);
                        }
                        OrchestratorEvent::Error { message } => {
                            tracing::error!("Orchestrator error: {}", message);
                        }
                    }
                }
            });

            let token = orchestrator.shutdown_token();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                token.cancel();
            });

            orchestrator.run().await?;
        }
        Commands::Sweep => {
            pidfile::ensure_not_running(&config.daemon.pid_path())?;
            let orchestrator = DaemonOrchestrator::new(config)?;
            let report = orchestrator.sweep_once().await?;

            if report.removed.is_empty() {
                println!("Nothing expired");
            } else {
                println!("Removed {} expired files:", report.removed.len());
                for path in &report.removed {
                    println!("  {}", path);
                }
            }
            if !report.retained.is_empty() {
                println!("Could not delete {} files:", report.retained.len());
                for path in &report.retained {
                    println!("  {}", path);
                }
            }
        }
        Commands::Logs { limit } => {
            let audit = AuditLog::new(config.daemon.audit_log_path());
            for line in audit.read_recent(limit).await? {
                println!("{}", line);
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Install the tracing subscriber.
///
/// `--verbose` forces debug; otherwise `RUST_LOG` wins over the configured
/// level. Events at INFO and above are also copied into `server_logs`.
/// The returned guard flushes the log file and must be held.
fn init_logging(
    config: &Config,
    verbose: bool,
    server_logs: &Arc<ServerLogBuffer>,
) -> Option<WorkerGuard> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.to_lowercase()))
    };
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match &config.daemon.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lanshare.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(server_logs.layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(server_logs.layer())
                .init();
            None
        }
    }
}

/// Wait for a shutdown signal (Ctrl-C or SIGTERM).
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
