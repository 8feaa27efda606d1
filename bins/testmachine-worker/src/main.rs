mod config;
mod connection;
mod docker;
mod engine;
mod evaluator;
mod executor;
mod health;
mod runner;


use config::WorkerConfig;
use connection::{ConnectionManager, RetryPolicy, WsConnector};
use docker::{BollardBackend, ContainerExecutor};
use executor::TaskDispatcher;
use runner::LocalExecutor;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("TestMachine worker booting...");

    let config = WorkerConfig::from_env().map_err(|e| {
        error!(error = %format!("{:#}", e), "Invalid worker configuration");
        e
    })?;

    info!(
        server_url = %config.server_url,
        timeout_secs = config.test_timeout.as_secs(),
        reconnect_delay_secs = config.reconnect_delay.as_secs(),
        max_concurrent = config.max_concurrent_executions,
        "Worker configured"
    );
    info!(
        base_image = %config.container.base_image,
        memory_mb = config.container.memory_limit_mb,
        cpu_limit = config.container.cpu_limit,
        local_command = ?config.local_test_command,
        "Execution strategies"
    );

    let local = LocalExecutor::new(config.local_test_command.clone(), config.test_timeout);
    let docker = ContainerExecutor::new(BollardBackend::new(), config.container.clone(), config.test_timeout);
    let dispatcher = TaskDispatcher::new(
        Arc::new(local),
        Arc::new(docker),
        config.max_concurrent_executions,
    );

    let manager = ConnectionManager::new(
        WsConnector::new(config.server_url.clone()),
        dispatcher,
        RetryPolicy::fixed(config.reconnect_delay),
    );

    let shutdown = CancellationToken::new();

    // The probe is not load-bearing; the worker keeps running without it
    let health_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let addr = config.health_addr;
        async move {
            if let Err(e) = health::serve(addr, shutdown).await {
                warn!(error = %format!("{:#}", e), "Health endpoint unavailable");
            }
        }
    });
    let connection_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { manager.run(shutdown).await }
    });

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    warn!("Received shutdown signal, closing connection...");
    shutdown.cancel();

    if let Err(e) = connection_task.await {
        error!(error = %e, "Connection task ended abnormally");
    }
    if let Err(e) = health_task.await {
        error!(error = %e, "Health task ended abnormally");
    }

    info!("Worker shutdown complete");
    Ok(())
}
