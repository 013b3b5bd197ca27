//! Workroom session manager
//!
//! WebSocket manager for coding-agent sessions. Provisions git-backed
//! workspaces (bare mirrors plus per-session worktrees) and streams
//! agent output to clients over one persistent connection each.

#[allow(dead_code)]
mod client;
mod config;
mod engine;
mod git;
mod server;
mod session;
mod store;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::ManagerConfig;
use engine::{AgentEngine, ClaudeEngine};
use git::WorkspaceManager;
use server::WebSocketServer;
use session::SessionOrchestrator;
use store::{HistoryIndexer, MemoryRepoStore, NullIndexer, RepoStore};

/// Workroom session manager
///
/// WebSocket manager for coding-agent sessions with git-backed workspaces
#[derive(Parser, Debug)]
#[command(name = "workroom")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "workroom.toml")]
    config: PathBuf,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Root directory for mirrors and worktrees (overrides the config file)
    #[arg(long)]
    projects_dir: Option<PathBuf>,

    /// Authentication token for remote connections
    #[arg(long)]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Workroom v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ManagerConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(projects_dir) = args.projects_dir {
        config.projects_dir = projects_dir;
    }
    if let Some(token) = args.token {
        config.token = Some(token);
    }

    if config.token.is_some() {
        info!("Token authentication enabled");
    }
    info!("Projects directory: {}", config.projects_dir.display());

    let workspace = Arc::new(WorkspaceManager::new(
        config.projects_dir.clone(),
        config.git_timeout(),
    ));
    let repos: Arc<dyn RepoStore> = Arc::new(MemoryRepoStore::new());
    let indexer: Arc<dyn HistoryIndexer> = Arc::new(NullIndexer);
    let engine: Arc<dyn AgentEngine> = Arc::new(ClaudeEngine::new());
    let orchestrator = Arc::new(SessionOrchestrator::new(
        workspace,
        repos,
        indexer,
        engine,
        config.default_cwd.clone(),
    ));

    let server = Arc::new(WebSocketServer::new(config, orchestrator));
    let server_handle = Arc::clone(&server);

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
}
