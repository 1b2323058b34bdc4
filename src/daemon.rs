use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{serve_api, ApiState};
use crate::config::DaemonConfig;
use crate::db::Database;
use crate::error::Result;
use crate::queue::{EntryId, EntryStore, QueueScheduler};
use crate::stats::StatsService;
use crate::store::{RunStore, SampleStore, Stores};
use crate::worker::{CommandRunner, Worker};

pub type SharedScheduler = QueueScheduler<Arc<dyn EntryStore>>;
pub type SharedStats = StatsService<Arc<dyn SampleStore>, Arc<dyn RunStore>>;

/// The scheduler, stats service and raw stores, shared by workers and the API.
#[derive(Clone)]
pub struct Services {
    pub stores: Stores,
    pub scheduler: Arc<SharedScheduler>,
    pub stats: Arc<SharedStats>,
}

impl Services {
    pub fn new(stores: Stores) -> Self {
        Self {
            scheduler: Arc::new(QueueScheduler::new(stores.entries.clone())),
            stats: Arc::new(StatsService::new(
                stores.samples.clone(),
                stores.runs.clone(),
            )),
            stores,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Stores::in_memory())
    }

    /// Run synchronous store work on the blocking pool so a busy SQLite lock
    /// never stalls the async runtime.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Services) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let services = self.clone();
        tokio::task::spawn_blocking(move || f(&services)).await?
    }

    /// Delete configurations with their runs and samples. Runs go first so a
    /// failure never leaves runs pointing at a missing configuration.
    pub fn delete_configs(&self, ids: &[EntryId]) -> Result<DeletedConfigs> {
        let runs = self.stores.runs.delete_runs_for_configs(ids)?;
        let configs = self.scheduler.delete_configs(ids)?;
        tracing::info!(configs, runs, "Deleted configurations with their runs");
        Ok(DeletedConfigs { configs, runs })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedConfigs {
    pub configs: u64,
    pub runs: u64,
}

/// Owns the worker pool and the HTTP API for one process.
pub struct Daemon {
    config: DaemonConfig,
    services: Services,
}

impl Daemon {
    /// Open the configured database, or in-memory stores when none is set.
    pub fn open(config: DaemonConfig) -> Result<Self> {
        let stores = match &config.database {
            Some(path) => {
                let db = Database::open(path)?;
                tracing::info!(path = %path.display(), "Opened database");
                Stores::sqlite(&db)
            }
            None => {
                tracing::info!("No database configured, using in-memory stores");
                Stores::in_memory()
            }
        };
        Ok(Self::with_services(config, Services::new(stores)))
    }

    pub fn with_services(config: DaemonConfig, services: Services) -> Self {
        Self { config, services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Run until `token` is cancelled.
    ///
    /// 1. Releases entries a previous process left claimed (when enabled)
    /// 2. Spawns `workers` worker loops sharing one command runner
    /// 3. Serves the HTTP API if an address is configured
    ///
    /// # Errors
    ///
    /// Fails before spawning anything if recovery or binding the API
    /// listener fails. Errors inside spawned tasks are logged by the tasks.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        if self.config.release_on_start {
            let filter = self.config.worker.filter.clone();
            let released = self
                .services
                .blocking(move |s| s.scheduler.release_all(&filter))
                .await?;
            tracing::info!(released, "Released entries left running by a previous process");
        }

        let listener = match self.config.api_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let runner = Arc::new(CommandRunner::new(self.config.runner.clone()));
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.config.workers + 1);

        for id in 0..self.config.workers {
            let worker = Worker::new(
                id,
                self.services.clone(),
                runner.clone(),
                self.config.worker.clone(),
            );
            handles.push(tokio::spawn(worker.run(token.clone())));
        }

        if let Some(listener) = listener {
            let state = ApiState::new(self.services.clone());
            let api_token = token.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = serve_api(listener, state, api_token).await {
                    tracing::error!(error = %e, "API server failed");
                }
            }));
        }

        tracing::info!(workers = self.config.workers, "Daemon running");
        token.cancelled().await;
        tracing::info!("Shutting down, waiting for in-flight runs");

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Task panicked during shutdown");
            }
        }

        tracing::info!("Daemon stopped");
        Ok(())
    }
}
