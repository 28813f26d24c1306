//! Stock Analysis Orchestration Server
//!
//! Accepts stock-analysis job submissions, schedules them across a bounded
//! worker pool under per-user and global concurrency caps, tracks live
//! progress for streaming clients, and persists authoritative task and batch
//! state in SQLite.
// This is the main entry point. It is responsible for:
// - Initializing logging and configuration.
// - Building the shared collaborators (database, cache, queue, executor).
// - Starting the scheduler loop, the cache sweeper, and the REST API.
// - Handling graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

mod api;
mod cache;
mod config;
mod database;
mod executor;
mod models;
mod queue;
mod scheduler;
mod stream;
mod submission;
#[cfg(test)]
mod test_support;
mod worker;

use api::AppState;
use cache::LiveCache;
use config::ConfigManager;
use database::AnalysisDatabase;
use executor::{AnalysisExecutor, SimulatedExecutor};
use models::ModelRegistry;
use queue::{QueueSettings, TaskQueue};
use scheduler::AnalysisScheduler;
use shared::config::ServiceConfig;
use submission::SubmissionService;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Stock analysis task orchestration server", long_about = None)]
struct CliArgs {
    /// Path to the server configuration file (server.toml); defaults apply
    /// when omitted
    #[arg(value_name = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Override the listen address from the config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the data directory from the config file
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<String>,

    /// Override the node id used as the reservation owner for leases
    #[arg(long = "node-id", value_name = "ID")]
    node_id: Option<String>,

    /// Override the global concurrency cap from the config file
    #[arg(long = "max-concurrent-tasks", value_name = "N")]
    max_concurrent_tasks: Option<usize>,
}

/// The main application structure for the server. Owns the shared
/// collaborators and the handles of the background loops.
pub struct Server {
    config: Arc<ServiceConfig>,
    listen_address: SocketAddr,
    node_id: String,
    database: Arc<Mutex<AnalysisDatabase>>,
    cache: LiveCache,
    queue: TaskQueue,
    submission: SubmissionService,
    executor: Arc<dyn AnalysisExecutor>,
    submit_notify: Arc<Notify>,
    scheduler_running: Arc<AtomicBool>,
    /// Handle to the scheduler loop for graceful shutdown.
    scheduler_handle: Option<JoinHandle<()>>,
    /// Handle to the cache sweeper for graceful shutdown.
    sweeper_handle: Option<JoinHandle<()>>,
    /// Shutdown signal sender for notifying background tasks.
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl Server {
    /// Builds the server: validates configuration, initializes the database,
    /// and wires the shared collaborators. Nothing runs yet.
    pub async fn new(config: ServiceConfig, executor: Arc<dyn AnalysisExecutor>) -> Result<Self> {
        config.validate()?;

        let listen_address: SocketAddr = config
            .listen_address
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", config.listen_address))?;

        let node_id = config.node_id.clone().unwrap_or_else(|| {
            let generated = format!("node-{}", &Uuid::new_v4().to_string()[..8]);
            info!(node_id = %generated, "Generated node id");
            generated
        });

        let mut database =
            AnalysisDatabase::new(&config.data_dir, config.database_busy_timeout_seconds)?;
        database.initialize().await?;
        let database = Arc::new(Mutex::new(database));

        let config = Arc::new(config);
        let cache = LiveCache::new(
            Duration::from_secs(config.progress_ttl_seconds),
            Duration::from_secs(config.cancel_ttl_seconds),
        );
        let queue = TaskQueue::new(database.clone(), QueueSettings::from_config(&config));
        let submit_notify = Arc::new(Notify::new());
        let submission = SubmissionService::new(
            config.clone(),
            database.clone(),
            queue.clone(),
            ModelRegistry,
            submit_notify.clone(),
        );

        Ok(Self {
            config,
            listen_address,
            node_id,
            database,
            cache,
            queue,
            submission,
            executor,
            submit_notify,
            scheduler_running: Arc::new(AtomicBool::new(false)),
            scheduler_handle: None,
            sweeper_handle: None,
            shutdown_tx: None,
        })
    }

    /// Starts the scheduler loop, the cache sweeper, and the REST API, then
    /// serves until the shutdown broadcast fires.
    pub async fn run(&mut self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(4);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Scheduler loop. Expired leases from a previous run are picked up
        // by its first reclaim sweep, so there is no separate crash
        // recovery step.
        let mut scheduler = AnalysisScheduler::new(
            self.config.clone(),
            self.database.clone(),
            self.queue.clone(),
            self.cache.clone(),
            self.executor.clone(),
            self.node_id.clone(),
            self.submit_notify.clone(),
            self.scheduler_running.clone(),
        );
        let scheduler_shutdown = shutdown_tx.subscribe();
        self.scheduler_handle = Some(tokio::spawn(async move {
            if let Err(e) = scheduler.run(scheduler_shutdown).await {
                error!(error = %e, "Scheduler loop failed");
            }
        }));

        // Periodic eviction of expired progress records and cancel flags.
        let sweeper_cache = self.cache.clone();
        let mut sweeper_shutdown = shutdown_tx.subscribe();
        self.sweeper_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweeper_cache.sweep_expired(),
                    _ = sweeper_shutdown.recv() => break,
                }
            }
        }));

        let state = AppState {
            config: self.config.clone(),
            database: self.database.clone(),
            cache: self.cache.clone(),
            queue: self.queue.clone(),
            submission: self.submission.clone(),
            scheduler_running: self.scheduler_running.clone(),
        };
        let router = api::create_router(state);

        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| format!("Failed to bind {}", self.listen_address))?;
        info!(
            listen_address = %self.listen_address,
            node_id = %self.node_id,
            "API server listening"
        );

        let mut serve_shutdown = shutdown_tx.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = serve_shutdown.recv().await;
            })
            .await
            .context("API server failed")?;

        Ok(())
    }

    /// Broadcast shutdown and wait for the scheduler to drain its workers.
    pub async fn shutdown(&mut self) {
        info!("Starting graceful shutdown");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(handle) = self.scheduler_handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task did not shut down cleanly");
            }
        }
        if let Some(handle) = self.sweeper_handle.take() {
            handle.abort();
        }

        info!("Server shutdown complete");
    }
}

/// Sets up signal handlers for graceful shutdown.
/// Returns a future that completes when a shutdown signal is received.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

/// Build the tracing filter; RUST_LOG wins over the built-in directives.
fn build_env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info"))
}

/// Initialize logging: a daily-rolling JSON file when `log_file` is
/// configured, plain stdout otherwise. Returns the appender guard that must
/// stay alive for the lifetime of the process.
fn init_logging(log_file: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    match log_file {
        Some(log_file) => {
            let path = std::path::Path::new(log_file);
            let directory = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => std::path::Path::new("."),
            };
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "server.log".to_string());

            let file_appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::fmt()
                .with_env_filter(build_env_filter())
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(non_blocking)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(build_env_filter())
                .init();
            None
        }
    }
}

/// Server entry point
///
/// Loads configuration, initializes logging, creates the server instance,
/// and runs until a shutdown signal is received.
#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    // Configuration comes first because it decides where logs go; failures
    // this early can only be reported on stderr.
    let mut config_manager = match ConfigManager::new(cli_args.config_file) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config_manager.apply_overrides(
        cli_args.listen_address,
        cli_args.data_dir,
        cli_args.node_id,
        cli_args.max_concurrent_tasks,
    ) {
        eprintln!("Failed to apply configuration overrides: {:#}", e);
        std::process::exit(1);
    }

    let _guard = init_logging(config_manager.service_config.log_file.as_deref());

    // The configuration was loaded before the subscriber existed, so record
    // its source now.
    match &config_manager.config_path {
        Some(path) => info!(
            config_file = %path.display(),
            "Stock Analysis Orchestration Server starting up"
        ),
        None => info!("Stock Analysis Orchestration Server starting up with default configuration"),
    }

    // The analysis pipeline is pluggable; until a real one is linked in, the
    // simulated executor walks the step table and returns a canned report.
    let executor: Arc<dyn AnalysisExecutor> = Arc::new(SimulatedExecutor::new());
    info!("Using simulated analysis executor");

    let mut server = match Server::new(config_manager.service_config, executor).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    // Run the server and the shutdown signal handler concurrently.
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    server.shutdown().await;
    Ok(())
}
