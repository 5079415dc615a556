//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Lifecycle jobs and the in-memory job ledger."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::model::{Page, ResourceKind};

/// Finished jobs kept before the oldest are evicted.
pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobKind {
    Create,
    Delete,
}

/// Asynchronous lifecycle work for one VM or Volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub resource: ResourceKind,
    pub resource_id: Uuid,
}

impl Job {
    pub fn new(kind: JobKind, resource: ResourceKind, resource_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            resource,
            resource_id,
        }
    }

    pub fn create(resource: ResourceKind, resource_id: Uuid) -> Self {
        Self::new(JobKind::Create, resource, resource_id)
    }

    pub fn delete(resource: ResourceKind, resource_id: Uuid) -> Self {
        Self::new(JobKind::Delete, resource, resource_id)
    }

    /// Reuse an id already bound to the resource, as after a restart.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Another delivery of the same job, as an at-least-once broker produces.
    pub fn redelivered(&self) -> Self {
        self.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    /// The resource had already left the state the job expects.
    Skipped,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub resource_type: ResourceKind,
    pub resource_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Observability record of submitted jobs. Never consulted for correctness.
#[derive(Debug)]
pub struct JobLedger {
    jobs: RwLock<IndexMap<Uuid, JobRecord>>,
    capacity: usize,
}

impl Default for JobLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: RwLock::new(IndexMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn enqueue(&self, job: &Job) {
        let mut jobs = self.jobs.write();
        jobs.insert(
            job.id,
            JobRecord {
                id: job.id,
                kind: job.kind,
                resource_type: job.resource,
                resource_id: job.resource_id,
                status: JobStatus::Queued,
                detail: None,
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
            },
        );
        while jobs.len() > self.capacity {
            let Some(oldest) = jobs.values().position(|record| record.status.is_finished()) else {
                break;
            };
            jobs.shift_remove_index(oldest);
        }
    }

    pub fn mark_running(&self, id: Uuid) {
        if let Some(record) = self.jobs.write().get_mut(&id) {
            record.status = JobStatus::Running;
            record.started_at = Some(Utc::now());
        }
    }

    pub fn finish(&self, id: Uuid, status: JobStatus, detail: Option<String>) {
        if let Some(record) = self.jobs.write().get_mut(&id) {
            record.status = status;
            record.detail = detail;
            record.finished_at = Some(Utc::now());
        }
    }

    pub fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.read().get(&id).cloned()
    }

    pub fn list(&self, resource_id: Option<Uuid>, skip: usize, limit: usize) -> Page<JobRecord> {
        let jobs = self.jobs.read();
        let matching = jobs
            .values()
            .filter(|record| resource_id.map_or(true, |id| record.resource_id == id));
        let mut total = 0usize;
        let mut items = Vec::new();
        for record in matching {
            if total >= skip && items.len() < limit {
                items.push(record.clone());
            }
            total += 1;
        }
        Page { items, total }
    }
}
