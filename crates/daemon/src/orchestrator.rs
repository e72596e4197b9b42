//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that initializes and coordinates
//! all daemon subsystems: the shared folder, the archive service, the
//! background sweepers and the HTTP server.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::ArchiveService;
use crate::audit::AuditLog;
use crate::config::Config;
use crate::files::{MetadataStore, PathResolver, SharedFolder, SweepReport};
use crate::identity::StaticIdentities;
use crate::pidfile::PidFile;
use crate::router::{build_router, AppState};
use crate::server_log::ServerLogBuffer;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The HTTP server is accepting connections.
    Listening { addr: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// File operations.
    folder: Arc<SharedFolder>,
    /// Directory archives.
    archives: Arc<ArchiveService>,
    /// Handler state.
    app_state: Arc<AppState>,
    /// Background sweepers.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Held while started.
    pid_file: Mutex<Option<PidFile>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    ///
    /// Creates the data directory and storage root and loads the metadata
    /// snapshot. Nothing runs until [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        Self::with_server_logs(config, Arc::new(ServerLogBuffer::default()))
    }

    /// Like [`new`](Self::new), serving `server_logs` on the log endpoint.
    ///
    /// The buffer is normally fed by the [`ServerLogLayer`](crate::server_log::ServerLogLayer)
    /// installed with the global subscriber.
    pub fn with_server_logs(config: Config, server_logs: Arc<ServerLogBuffer>) -> Result<Self> {
        let data_dir = &config.daemon.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let resolver = Arc::new(PathResolver::new(&config.storage.root).with_context(|| {
            format!("Failed to prepare storage root: {}", config.storage.root.display())
        })?);
        info!("Serving {:?}", resolver.root());

        let metadata = Arc::new(MetadataStore::new(config.daemon.metadata_path()));
        metadata.load().context("Failed to load file metadata")?;

        let audit = Arc::new(AuditLog::new(config.daemon.audit_log_path()));
        let folder = Arc::new(SharedFolder::new(
            Arc::clone(&resolver),
            metadata,
            audit,
            config.storage.temp_ttl(),
            config.storage.max_file_size,
        ));

        let archives = Arc::new(
            ArchiveService::new(
                resolver,
                config.daemon.scratch_dir(),
                config.archive.token_ttl(),
                ArchiveService::default_strategies(config.archive.external_tool),
            )
            .context("Failed to prepare archive scratch directory")?,
        );

        let identities = Arc::new(StaticIdentities::new(
            &config.identity.names,
            config.identity.fallback_name.clone(),
        ));
        let app_state = Arc::new(AppState {
            folder: Arc::clone(&folder),
            archives: Arc::clone(&archives),
            identities,
            host_address: config.server.host_address.clone(),
            port: config.server.port,
            trust_forwarded: config.server.trust_forwarded,
            server_logs,
        });

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            folder,
            archives,
            app_state,
            tasks: Mutex::new(Vec::new()),
            pid_file: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the background work.
    ///
    /// Claims the PID file, purges scratch archives left by a previous
    /// process, runs one expiry sweep and spawns the periodic sweepers.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        match PidFile::acquire(self.config.daemon.pid_path()) {
            Ok(pid_file) => *self.pid_file.lock().await = Some(pid_file),
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e);
            }
        }

        if let Err(e) = self.archives.purge_stale() {
            warn!("Failed to purge stale archives: {}", e);
        }

        match self.sweep_once().await {
            Ok(report) if report.changed() => {
                info!("Startup sweep removed {} expired files", report.removed.len())
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Startup sweep failed: {:#}", e);
                self.emit_event(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
            }
        }

        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(Arc::clone(self.folder.sweeper()).spawn(
                self.config.storage.sweep_interval(),
                self.shutdown_token.clone(),
            ));
            tasks.push(Arc::clone(&self.archives).spawn_sweeper(
                self.config.archive.sweep_interval(),
                self.shutdown_token.clone(),
            ));
        }
        debug!("Started expiry and token sweepers");

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Address from the server configuration.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .config
            .server
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.config.server.bind_address))?;
        Ok(SocketAddr::new(ip, self.config.server.port))
    }

    /// Serve HTTP on `listener` until the shutdown token fires.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("Listener has no local address")?;
        info!("Listening on http://{}", addr);
        self.emit_event(OrchestratorEvent::Listening { addr });

        let token = self.shutdown_token.clone();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("HTTP server failed")
    }

    /// Start, bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        let listener = match self.bind_addr() {
            Ok(addr) => TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr)),
            Err(e) => Err(e),
        };
        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                self.stop().await?;
                return Err(e);
            }
        };
        let served = self.serve(listener).await;
        self.stop().await?;
        served
    }

    /// Run one expiry sweep now.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.folder.sweeper().sweep_now().await
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        if let Err(e) = self.folder.metadata().save() {
            warn!("Error saving file metadata: {:#}", e);
        }
        self.pid_file.lock().await.take();

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the HTTP router.
    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.app_state))
    }

    /// Returns the shared folder.
    pub fn folder(&self) -> &Arc<SharedFolder> {
        &self.folder
    }

    /// Returns the archive service.
    pub fn archives(&self) -> &Arc<ArchiveService> {
        &self.archives
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
