mod config;
mod health;
mod metrics;
mod shutdown;
mod ssh;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::shutdown::ShutdownListener;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", about = "SSH gateway for Git transport commands")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply when omitted.
    #[arg(short, long, env = "GITGATE_CONFIG")]
    config: Option<String>,

    /// Override the SSH listen address from the configuration file.
    #[arg(short, long)]
    listen: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared by the SSH and metrics servers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub shutdown: ShutdownListener,
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

async fn run_ssh_server(state: AppState) -> Result<()> {
    crate::ssh::start_ssh_server(Arc::new(state)).await
}

async fn run_metrics_server(state: AppState) -> Result<()> {
    let Some(listen_addr) = state.config.metrics_addr()? else {
        return Ok(());
    };
    let health_state = health::HealthState {
        metrics: state.metrics.clone(),
        shutdown: state.shutdown.clone(),
    };
    health::run_metrics_server(listen_addr, health_state).await
}

/// Create the repository root if needed, owner-only.
fn prepare_repository_root(config: &Config) -> Result<()> {
    let root = &config.repository_root;
    if root.is_dir() {
        return Ok(());
    }

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(root)
        .with_context(|| format!("failed to create repository root: {}", root.display()))?;
    tracing::info!(path = %root.display(), "created repository root");
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    config::validate_config(&config)?;
    let config = Arc::new(config);

    tracing::info!(
        config_path = cli.config.as_deref().unwrap_or("<defaults>"),
        listen = %config.listen,
        repository_root = %config.repository_root.display(),
        "starting gitgate"
    );

    prepare_repository_root(&config)?;

    // ---- App state ----
    let (trigger, shutdown) = shutdown::channel();
    let state = AppState {
        config,
        metrics: MetricsRegistry::new(),
        shutdown,
    };

    // ---- Spawn services ----
    let mut ssh_handle = tokio::spawn({
        let s = state.clone();
        async move {
            if let Err(e) = run_ssh_server(s).await {
                tracing::error!(error = %e, "SSH server failed");
            }
        }
    });

    let metrics_handle = tokio::spawn({
        let s = state.clone();
        async move {
            if let Err(e) = run_metrics_server(s).await {
                tracing::error!(error = %e, "metrics server failed");
            }
        }
    });

    // ---- Await shutdown ----
    // The SSH server only returns on its own when it failed to start.
    let ssh_stopped = tokio::select! {
        () = shutdown::os_signal() => false,
        _ = &mut ssh_handle => true,
    };
    trigger.trigger();
    if !ssh_stopped {
        let _ = ssh_handle.await;
    }
    let _ = metrics_handle.await;

    tracing::info!("gitgate shut down cleanly");
    Ok(())
}
