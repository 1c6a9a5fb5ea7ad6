//! Long-running engine services with cooperative shutdown.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;

/// A named long-running service. Runs until the shutdown token fires.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Wraps a periodic engine pass (scheduler poll, retry poll, timer sweep,
/// lease reap) as a service. A failing tick is logged and retried next tick;
/// the passes are best-effort by design.
pub struct PeriodicService<F> {
    name: &'static str,
    interval: Duration,
    tick: F,
}

impl<F, Fut> PeriodicService<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    pub fn new(name: &'static str, interval: Duration, tick: F) -> Self {
        Self {
            name,
            interval,
            tick,
        }
    }
}

#[async_trait]
impl<F, Fut> Service for PeriodicService<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(service = self.name, interval_ms = self.interval.as_millis() as u64, "service starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = (self.tick)().await {
                        error!(service = self.name, error = %e, "tick failed");
                    }
                }
            }
        }
        info!(service = self.name, "service stopped");
        Ok(())
    }
}

/// Runs a set of services until shutdown is requested.
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Token other components can use to observe or trigger shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn every service and wait for all of them to stop.
    pub async fn run(self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.services.len());
        for service in self.services {
            let name = service.name();
            let token = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = service.run(token).await {
                    error!(service = name, error = %e, "service exited with error");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Run until Ctrl+C, then cancel every service and wait for them.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            token.cancel();
        });
        self.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn periodic_service_ticks_until_cancelled() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let service = PeriodicService::new("test", Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let host = ServiceHost::new().with_service(service);
        let token = host.shutdown_token();
        let runner = tokio::spawn(host.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        runner.await.unwrap().unwrap();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }
}
