//! Windlass engine server: control-plane HTTP plus the background services
//! (scheduler poll, retry poll, timer sweeper, lease reaper, embedded
//! worker).

mod app;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use windlass::{
    scheduler, EngineConfig, PeriodicService, ServiceHost, Store, TaskExecutor,
    UnconfiguredInvoker, WorkerConfig, WorkerService,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,windlass=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting windlass engine server");

    let config = EngineConfig::from_env().context("failed to load configuration")?;
    let store = Store::open(&config.storage_dir)
        .await
        .context("failed to open store")?;

    // Background services.
    let executor = Arc::new(TaskExecutor::new(
        store.clone(),
        Arc::new(UnconfiguredInvoker),
        config.clone(),
    ));
    let mut worker_config = WorkerConfig::default();
    if let Ok(queues) = std::env::var("WINDLASS_WORKER_QUEUES") {
        worker_config.queues = queues.split(',').map(|q| q.trim().to_string()).collect();
    }

    let scheduler_store = store.clone();
    let retry_store = store.clone();
    let sweeper_store = store.clone();
    let reaper_store = store.clone();
    let lease_timeout = config.lease_timeout;

    let host = ServiceHost::new()
        .with_service(PeriodicService::new(
            "scheduler",
            config.scheduler_interval,
            move || {
                let store = scheduler_store.clone();
                async move { scheduler::run_scheduler_pass(&store).await.map(|_| ()) }
            },
        ))
        .with_service(PeriodicService::new(
            "retry",
            config.retry_interval,
            move || {
                let store = retry_store.clone();
                async move { scheduler::run_retry_pass(&store).await.map(|_| ()) }
            },
        ))
        .with_service(PeriodicService::new(
            "timer-sweeper",
            config.sweeper_interval,
            move || {
                let store = sweeper_store.clone();
                async move { windlass::awakeable::sweep_timers(&store).await.map(|_| ()) }
            },
        ))
        .with_service(PeriodicService::new(
            "lease-reaper",
            config.reaper_interval,
            move || {
                let store = reaper_store.clone();
                async move { windlass::queue::reap(lease_timeout, &store).await.map(|_| ()) }
            },
        ))
        .with_service(WorkerService::new(store.clone(), executor, worker_config));

    let shutdown = host.shutdown_token();
    let host_handle = tokio::spawn(host.run());

    // Control plane.
    let app = app::build_app(store);
    let addr = format!("0.0.0.0:{}", config.http_port);
    tracing::info!(addr = %addr, "control plane listening");
    tracing::info!("health check: http://localhost:{}/health", config.http_port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind control-plane address")?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = serve_shutdown.cancelled() => {},
            }
        })
        .await
        .context("server error")?;

    // HTTP is down; stop the background services too.
    shutdown.cancel();
    let _ = host_handle.await;

    Ok(())
}
