use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiServer;
use crate::app::core::Application;
use crate::metrics::create_encoder;
use crate::scheduler::TickScheduler;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) {
        let scheduler_task = self.spawn_scheduler_task(app);
        self.tasks.push(scheduler_task);

        let api_server_task = self.spawn_api_server_task(app);
        self.tasks.push(api_server_task);
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(10)).await;
            }
            // A task ending on its own is fatal for the daemon
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_scheduler_task(&self, app: &Application) -> JoinHandle<()> {
        let services = app.services();
        let scheduler = TickScheduler::new(
            services.registry.clone(),
            services.market.clone(),
            services.sink.clone(),
            services.scheduler_settings.clone(),
            create_encoder(&app.daemon_args().metrics_format),
            services.status.clone(),
        );
        let token = self.cancellation_token.child_token();

        tokio::spawn(async move {
            tracing::info!("Starting tick scheduler task");
            scheduler.run(token).await;
            tracing::info!("Tick scheduler task completed");
        })
    }

    fn spawn_api_server_task(&self, app: &Application) -> JoinHandle<()> {
        let services = app.services();
        let api_server = ApiServer::new(
            services.registry.clone(),
            services.market.clone(),
            services.status.clone(),
            app.daemon_args().api_listen_addr.clone(),
        );
        let token = self.cancellation_token.child_token();

        tokio::spawn(async move {
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server failed: {e:?}");
            } else {
                tracing::info!("API server completed");
            }
        })
    }
}
