//! Control-plane entrypoint. Wiring mirrors the teacher's `hub` binary:
//! structured logging first, env-driven config next, then spawn the
//! long-running tasks and wait on a signal-aware `tokio::select!` loop
//! before shutting down gracefully.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use irrigation_core::clock::SystemClock;
use irrigation_core::config_store::FileConfigStore;
use irrigation_core::host_client::HttpHostClient;
use irrigation_core::supervisor::Supervisor;
use tracing::{error, info};

fn init_logging() {
    let filter = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received sigterm"),
    }
}

/// Reloads `config` every time the process receives SIGHUP (§4.3: "an
/// operator edits `config.toml` and signals the process rather than
/// restarting it"). Runs until the process exits; never resolves on its own.
#[cfg(unix)]
async fn reload_on_sighup(config: Arc<FileConfigStore>) {
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .expect("failed to install SIGHUP handler");
    loop {
        hangup.recv().await;
        info!("received sighup, reloading configuration");
        config.reload();
    }
}

#[cfg(not(unix))]
async fn reload_on_sighup(_config: Arc<FileConfigStore>) {
    std::future::pending::<()>().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| ".".to_string());
    let config_path = format!("{data_dir}/config.toml");

    // §6: HOST_BASE_URL defaults to the host's own supervisor-core endpoint;
    // only deployments proxying to a different host need to override it.
    const DEFAULT_HOST_BASE_URL: &str = "http://supervisor/core/api";
    let base_url = env::var("HOST_BASE_URL").unwrap_or_else(|_| DEFAULT_HOST_BASE_URL.to_string());
    let token = env::var("HOST_SUPERVISOR_TOKEN").context("HOST_SUPERVISOR_TOKEN must be set")?;

    let clock = Arc::new(SystemClock);
    let host = Arc::new(HttpHostClient::new(base_url, token));
    let config = Arc::new(
        FileConfigStore::load(&config_path)
            .with_context(|| format!("loading configuration from {config_path}"))?,
    );

    let mut supervisor = Supervisor::new(clock, host, config.clone());
    supervisor.start();

    let sighup_task = tokio::spawn(reload_on_sighup(config.clone()));

    info!("irrigation control plane started");

    let mut reap_interval = tokio::time::interval(std::time::Duration::from_secs(5));
    reap_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown requested, tearing down");
                break;
            }
            _ = supervisor_watch(&mut supervisor) => {
                error!("supervisor exited on its own — a safety-critical task must have died");
                break;
            }
            _ = reap_interval.tick() => {
                supervisor.reap_dead_pumps().await;
            }
        }
    }

    sighup_task.abort();
    supervisor.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn supervisor_watch(supervisor: &mut Supervisor) {
    supervisor.run().await;
}
