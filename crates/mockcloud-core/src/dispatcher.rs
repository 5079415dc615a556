//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Hands lifecycle jobs to the worker pool."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use mockcloud_metrics::LifecycleMetrics;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jobs::{Job, JobLedger, JobStatus};

/// Receipt for a job accepted by a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("job queue is closed")]
    Closed,
}

/// Accepts lifecycle jobs for asynchronous execution.
///
/// Delivery is at-least-once; workers tolerate redelivered jobs.
pub trait JobDispatcher: Send + Sync + fmt::Debug {
    fn submit(&self, job: Job) -> Result<JobHandle, DispatchError>;
}

/// Dispatcher feeding an in-process channel drained by the worker pool.
pub struct ChannelDispatcher {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    ledger: Arc<JobLedger>,
    metrics: Option<LifecycleMetrics>,
}

impl ChannelDispatcher {
    pub fn new(
        ledger: Arc<JobLedger>,
        metrics: Option<LifecycleMetrics>,
    ) -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let dispatcher = Self {
            sender: Mutex::new(Some(sender)),
            ledger,
            metrics,
        };
        (dispatcher, receiver)
    }

    /// Stop accepting jobs. Jobs already queued are still delivered.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            debug!("job dispatcher closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .map_or(true, |sender| sender.is_closed())
    }
}

impl JobDispatcher for ChannelDispatcher {
    fn submit(&self, job: Job) -> Result<JobHandle, DispatchError> {
        let handle = JobHandle { job_id: job.id };
        self.ledger.enqueue(&job);
        let kind = job.kind;
        let resource = job.resource;
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            warn!(job_id = %handle.job_id, %kind, %resource, "job rejected; dispatcher closed");
            self.ledger.finish(
                handle.job_id,
                JobStatus::Failed,
                Some(DispatchError::Closed.to_string()),
            );
            return Err(DispatchError::Closed);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch(&kind.to_string(), &resource.to_string());
        }
        debug!(job_id = %handle.job_id, %kind, %resource, "job dispatched");
        Ok(handle)
    }
}

impl fmt::Debug for ChannelDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelDispatcher")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
