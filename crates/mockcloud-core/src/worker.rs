//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated provisioning worker and its task pool."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use mockcloud_common::config::WorkerConfig;
use mockcloud_metrics::LifecycleMetrics;
use parking_lot::Mutex;
use rand::distributions::{Bernoulli, BernoulliError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cidr;
use crate::error::StoreError;
use crate::jobs::{Job, JobKind, JobLedger, JobStatus};
use crate::model::{LifecycleRecord, LifecycleState, ResourceKind};
use crate::store::{ResourceStore, StateChange, Transition};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid failure probability: {0}")]
    FailureProbability(#[from] BernoulliError),
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// The resource was moved to `error`; carries the stored message.
    Failed(String),
    /// Nothing was written; the resource was not in the state the job expects.
    Skipped(String),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded => JobStatus::Succeeded,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Skipped(_) => JobStatus::Skipped,
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            JobOutcome::Succeeded => None,
            JobOutcome::Failed(detail) | JobOutcome::Skipped(detail) => Some(detail.clone()),
        }
    }
}

/// Drives VMs and Volumes out of `pending` and `deleting`.
///
/// Each job sleeps for a random delay, rolls for failure and then writes the
/// terminal state with a compare-and-set on the state the job started from.
pub struct LifecycleWorker {
    store: Arc<ResourceStore>,
    ledger: Arc<JobLedger>,
    config: WorkerConfig,
    failure: Bernoulli,
    rng: Mutex<StdRng>,
    metrics: Option<LifecycleMetrics>,
}

impl LifecycleWorker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<ResourceStore>,
        ledger: Arc<JobLedger>,
        metrics: Option<LifecycleMetrics>,
    ) -> Result<Self, WorkerError> {
        let failure = Bernoulli::new(config.failure_probability)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            store,
            ledger,
            config,
            failure,
            rng: Mutex::new(rng),
            metrics,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn sample_delay(&self, job: &Job) -> Duration {
        let window = match (job.kind, job.resource) {
            (JobKind::Delete, _) => self.config.delete,
            (JobKind::Create, ResourceKind::Volume) => self.config.volume,
            (JobKind::Create, _) => self.config.vm,
        };
        if window.min >= window.max {
            return window.min;
        }
        self.rng.lock().gen_range(window.min..=window.max)
    }

    fn roll_failure(&self) -> bool {
        self.rng.lock().sample(self.failure)
    }

    /// Run one job to completion, including its simulated delay.
    pub async fn process(&self, job: Job) -> JobOutcome {
        self.ledger.mark_running(job.id);
        if let Some(metrics) = &self.metrics {
            metrics.job_started();
        }

        let delay = self.sample_delay(&job);
        if let Some(metrics) = &self.metrics {
            metrics.observe_delay(&job.kind.to_string(), delay.as_secs_f64());
        }
        debug!(
            job_id = %job.id,
            kind = %job.kind,
            resource = %job.resource,
            resource_id = %job.resource_id,
            delay_ms = delay.as_millis() as u64,
            "lifecycle job sleeping"
        );
        tokio::time::sleep(delay).await;

        let failed = self.roll_failure();
        let outcome = match self.complete(&job, failed) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(job_id = %job.id, resource_id = %job.resource_id, error = %err, "lifecycle job could not be applied");
                JobOutcome::Failed(err.to_string())
            }
        };

        match &outcome {
            JobOutcome::Succeeded => info!(
                job_id = %job.id,
                kind = %job.kind,
                resource = %job.resource,
                resource_id = %job.resource_id,
                "lifecycle job succeeded"
            ),
            JobOutcome::Failed(message) => warn!(
                job_id = %job.id,
                kind = %job.kind,
                resource = %job.resource,
                resource_id = %job.resource_id,
                %message,
                "lifecycle job failed"
            ),
            JobOutcome::Skipped(reason) => debug!(
                job_id = %job.id,
                resource_id = %job.resource_id,
                %reason,
                "lifecycle job skipped"
            ),
        }

        self.ledger
            .finish(job.id, outcome.status(), outcome.detail());
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(
                &job.kind.to_string(),
                &job.resource.to_string(),
                &outcome.status().to_string(),
            );
            metrics.job_finished();
        }
        outcome
    }

    /// Write the terminal state for `job` after its delay has elapsed.
    ///
    /// Writes are guarded on both the source state and the job that owns the
    /// record. Redelivered jobs that lost either are reported as
    /// [`JobOutcome::Skipped`].
    pub fn complete(&self, job: &Job, failed: bool) -> Result<JobOutcome, StoreError> {
        let id = job.resource_id;
        let label = job.resource.label();
        let result = match (job.kind, job.resource) {
            (JobKind::Create, ResourceKind::Vm) if failed => self
                .store
                .update_vm_state(
                    id,
                    StateChange::to(LifecycleState::Error)
                        .expecting(LifecycleState::Pending)
                        .for_job(job.id)
                        .with_error(format!("simulated failure while provisioning {label} {id}")),
                )
                .map(|transition| settle(transition, LifecycleState::Pending, job.id)),
            (JobKind::Create, ResourceKind::Vm) => {
                let retry_limit = self.config.address_retry_limit;
                self.store
                    .activate_vm(id, job.id, |network, taken| {
                        let mut rng = self.rng.lock();
                        cidr::allocate(network, taken, &mut *rng, retry_limit)
                    })
                    .map(|transition| settle(transition, LifecycleState::Pending, job.id))
            }
            (JobKind::Create, ResourceKind::Volume) => {
                let change = if failed {
                    StateChange::to(LifecycleState::Error)
                        .with_error(format!("simulated failure while provisioning {label} {id}"))
                } else {
                    StateChange::to(LifecycleState::Active)
                };
                self.store
                    .update_volume_state(
                        id,
                        change.expecting(LifecycleState::Pending).for_job(job.id),
                    )
                    .map(|transition| settle(transition, LifecycleState::Pending, job.id))
            }
            (JobKind::Delete, ResourceKind::Vm) if failed => self
                .store
                .update_vm_state(
                    id,
                    StateChange::to(LifecycleState::Error)
                        .expecting(LifecycleState::Deleting)
                        .for_job(job.id)
                        .with_error(format!("simulated failure while deleting {label} {id}")),
                )
                .map(|transition| settle(transition, LifecycleState::Deleting, job.id)),
            (JobKind::Delete, ResourceKind::Vm) => self
                .store
                .soft_delete_vm(id, job.id)
                .map(|transition| settle(transition, LifecycleState::Deleting, job.id)),
            (JobKind::Delete, ResourceKind::Volume) if failed => self
                .store
                .update_volume_state(
                    id,
                    StateChange::to(LifecycleState::Error)
                        .expecting(LifecycleState::Deleting)
                        .for_job(job.id)
                        .with_error(format!("simulated failure while deleting {label} {id}")),
                )
                .map(|transition| settle(transition, LifecycleState::Deleting, job.id)),
            (JobKind::Delete, ResourceKind::Volume) => self
                .store
                .soft_delete_volume(id, job.id)
                .map(|transition| settle(transition, LifecycleState::Deleting, job.id)),
            (_, other) => Ok(JobOutcome::Skipped(format!(
                "{} records have no asynchronous lifecycle",
                other.label()
            ))),
        };

        match result {
            Err(StoreError::NotFound { kind, id }) => Ok(JobOutcome::Skipped(format!(
                "{} {id} no longer exists",
                kind.label()
            ))),
            other => other,
        }
    }
}

fn settle<R: LifecycleRecord>(
    transition: Transition<R>,
    source: LifecycleState,
    job_id: Uuid,
) -> JobOutcome {
    match transition {
        Transition::Unchanged(record)
            if record.state() == source && record.lifecycle_job_id() != Some(job_id) =>
        {
            JobOutcome::Skipped(format!(
                "{} {} now belongs to job {}",
                R::KIND.label(),
                record.id(),
                record
                    .lifecycle_job_id()
                    .map_or_else(|| "unknown".to_owned(), |owner| owner.to_string())
            ))
        }
        Transition::Unchanged(record) => JobOutcome::Skipped(format!(
            "{} {} is {}, not {source}",
            R::KIND.label(),
            record.id(),
            record.state()
        )),
        Transition::Applied(record) if record.state() == LifecycleState::Error => {
            JobOutcome::Failed(
                record
                    .error_message()
                    .unwrap_or("lifecycle job failed")
                    .to_owned(),
            )
        }
        Transition::Applied(_) => JobOutcome::Succeeded,
    }
}

impl std::fmt::Debug for LifecycleWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle to the task draining the job channel.
#[derive(Debug)]
pub struct WorkerPool {
    task: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn the pool. Each job runs as its own task, at most
    /// `max_concurrent_jobs` at a time.
    pub fn spawn(worker: Arc<LifecycleWorker>, mut receiver: mpsc::UnboundedReceiver<Job>) -> Self {
        let limit = worker.config().max_concurrent_jobs.max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let task = tokio::spawn(async move {
            let mut running = JoinSet::new();
            while let Some(job) = receiver.recv().await {
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let worker = worker.clone();
                running.spawn(async move {
                    let _permit = permit;
                    worker.process(job).await;
                });
                while let Some(joined) = running.try_join_next() {
                    if let Err(err) = joined {
                        error!(error = %err, "lifecycle job task panicked");
                    }
                }
            }
            debug!(in_flight = running.len(), "job channel closed; draining worker pool");
            while let Some(joined) = running.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "lifecycle job task panicked");
                }
            }
            info!("worker pool drained");
        });
        info!(max_concurrent_jobs = limit, "worker pool started");
        Self { task }
    }

    /// Wait for queued and in-flight jobs to finish once the dispatcher is
    /// closed. Jobs still running after `grace` are abandoned.
    pub async fn shutdown(mut self, grace: Duration) {
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "worker pool task failed"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs_f64(), "worker pool did not drain in time; abandoning jobs");
                self.task.abort();
            }
        }
    }
}
