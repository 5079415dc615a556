//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mockcloud_common::config::AppConfig;
use mockcloud_metrics::{LifecycleMetrics, SharedRegistry};
use mockcloud_persistence::PersistenceMetrics;
use tracing::{info, warn};

use crate::dispatcher::ChannelDispatcher;
use crate::jobs::JobLedger;
use crate::journal::JournalBridge;
use crate::service::ResourceService;
use crate::store::ResourceStore;
use crate::worker::{LifecycleWorker, WorkerPool};

/// Grace period granted to in-flight jobs on shutdown, beyond the longest delay.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Assembles the store, dispatcher, worker pool and service from configuration.
#[derive(Debug)]
pub struct ControlPlane {
    config: Arc<AppConfig>,
    metrics_registry: Option<SharedRegistry>,
}

impl ControlPlane {
    pub fn new(config: AppConfig, metrics: Option<SharedRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            metrics_registry: metrics,
        }
    }

    /// Restore state, start the worker pool and return a running handle.
    pub async fn start(self) -> Result<ControlPlaneHandle> {
        let lifecycle_metrics = match &self.metrics_registry {
            Some(registry) => Some(LifecycleMetrics::new(registry.clone())?),
            None => None,
        };
        let persistence_metrics = match &self.metrics_registry {
            Some(registry) => Some(Arc::new(PersistenceMetrics::new(registry.clone())?)),
            None => None,
        };

        let journal = match &self.config.storage.journal_path {
            Some(path) => Some(Arc::new(
                JournalBridge::open(path.clone(), persistence_metrics).with_context(|| {
                    format!("failed to open resource journal {}", path.display())
                })?,
            )),
            None => None,
        };

        let store = Arc::new(match &journal {
            Some(journal) => ResourceStore::with_journal(journal.clone()),
            None => ResourceStore::new(),
        });
        let replay = self.config.storage.replay_on_start && journal.is_some();
        if replay {
            let replayed = store
                .restore_from_journal()
                .context("failed to replay resource journal")?;
            info!(replayed, "resource store restored from journal");
        }

        let ledger = Arc::new(JobLedger::new());
        let (dispatcher, receiver) = ChannelDispatcher::new(ledger.clone(), lifecycle_metrics.clone());
        let dispatcher = Arc::new(dispatcher);
        let worker = Arc::new(
            LifecycleWorker::new(
                self.config.worker.clone(),
                store.clone(),
                ledger.clone(),
                lifecycle_metrics,
            )
            .context("failed to configure lifecycle worker")?,
        );
        let pool = WorkerPool::spawn(worker, receiver);

        let service = Arc::new(ResourceService::new(
            store,
            dispatcher.clone(),
            ledger,
            self.config.catalog.clone(),
        ));
        if replay {
            service
                .resume_in_flight()
                .context("failed to re-dispatch in-flight jobs")?;
        }

        let worker = &self.config.worker;
        info!(
            failure_probability = worker.failure_probability,
            vm_delay_secs = ?(worker.vm.min.as_secs_f64(), worker.vm.max.as_secs_f64()),
            volume_delay_secs = ?(worker.volume.min.as_secs_f64(), worker.volume.max.as_secs_f64()),
            delete_delay_secs = ?(worker.delete.min.as_secs_f64(), worker.delete.max.as_secs_f64()),
            journal = journal.is_some(),
            "control plane started"
        );

        Ok(ControlPlaneHandle {
            config: self.config,
            service,
            dispatcher,
            pool,
            journal,
            metrics_registry: self.metrics_registry,
        })
    }
}

/// Running control plane, used by the daemon and by tests.
#[derive(Debug)]
pub struct ControlPlaneHandle {
    config: Arc<AppConfig>,
    service: Arc<ResourceService>,
    dispatcher: Arc<ChannelDispatcher>,
    pool: WorkerPool,
    journal: Option<Arc<JournalBridge>>,
    metrics_registry: Option<SharedRegistry>,
}

impl ControlPlaneHandle {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn service(&self) -> Arc<ResourceService> {
        self.service.clone()
    }

    pub fn metrics(&self) -> Option<SharedRegistry> {
        self.metrics_registry.clone()
    }

    /// Store mutations that never reached the journal and would be lost on
    /// restart.
    pub fn journal_failures(&self) -> u64 {
        self.service.store().journal_failures()
    }

    /// Stop accepting jobs, let in-flight jobs settle and flush the journal.
    pub async fn shutdown(self) -> Result<()> {
        self.dispatcher.close();
        self.pool
            .shutdown(self.config.worker.longest_delay() + SHUTDOWN_SLACK)
            .await;
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.flush() {
                warn!(path = %journal.path().display(), error = %err, "failed to flush journal");
            }
        }
        info!("control plane shutdown complete");
        Ok(())
    }
}
