//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bridges store mutations onto the persistence journal."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mockcloud_persistence::metrics::PersistenceMetrics;
use mockcloud_persistence::{replay_journal, JournalEntry, JournalWriter};
use mockcloud_persistence::Result as PersistenceResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;
use tracing::debug;
use uuid::Uuid;

use crate::model::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JournalOp {
    Upsert,
    Remove,
}

/// Payload of a single journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEvent {
    pub op: JournalOp,
    pub resource: ResourceKind,
    pub id: Uuid,
    /// Full record after the mutation; absent for removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
}

/// Serialises store mutations into the append-only journal.
pub struct JournalBridge {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
    metrics: Option<Arc<PersistenceMetrics>>,
    failed_appends: AtomicU64,
}

impl JournalBridge {
    pub fn open(path: PathBuf, metrics: Option<Arc<PersistenceMetrics>>) -> PersistenceResult<Self> {
        let writer = JournalWriter::open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            metrics,
            failed_appends: AtomicU64::new(0),
        })
    }

    pub fn record_upsert<T: Serialize>(
        &self,
        resource: ResourceKind,
        id: Uuid,
        record: &T,
    ) -> PersistenceResult<u64> {
        let event = serde_json::to_value(record).map(|record| JournalEvent {
            op: JournalOp::Upsert,
            resource,
            id,
            record: Some(record),
        });
        self.record_event(resource, JournalOp::Upsert, event.map_err(Into::into))
    }

    pub fn record_remove(&self, resource: ResourceKind, id: Uuid) -> PersistenceResult<u64> {
        let event = JournalEvent {
            op: JournalOp::Remove,
            resource,
            id,
            record: None,
        };
        self.record_event(resource, JournalOp::Remove, Ok(event))
    }

    /// Append `event`. Any failure, including serialisation, is counted.
    fn record_event(
        &self,
        resource: ResourceKind,
        op: JournalOp,
        event: PersistenceResult<JournalEvent>,
    ) -> PersistenceResult<u64> {
        let appended = event
            .and_then(|event| Ok(serde_json::to_value(&event)?))
            .and_then(|payload| self.writer.lock().append(JournalEntry::new(payload)));
        match appended {
            Ok((sequence, bytes)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_append(&resource.to_string(), &op.to_string(), bytes);
                }
                Ok(sequence)
            }
            Err(err) => {
                self.failed_appends.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(&resource.to_string());
                }
                Err(err)
            }
        }
    }

    /// Mutations that reached memory but not the journal since start-up.
    pub fn failed_appends(&self) -> u64 {
        self.failed_appends.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> PersistenceResult<()> {
        self.writer.lock().flush()
    }

    /// Replay every event in append order.
    pub fn replay<F>(&self, mut handler: F) -> PersistenceResult<usize>
    where
        F: FnMut(JournalEvent) -> PersistenceResult<()>,
    {
        self.flush()?;
        let started = Instant::now();
        let result = replay_journal(&self.path, |entry| {
            debug!(sequence = entry.sequence, "replaying journal entry");
            let event: JournalEvent = serde_json::from_value(entry.payload)?;
            handler(event)
        });
        if let Some(metrics) = &self.metrics {
            metrics.observe_replay_duration(started.elapsed().as_secs_f64());
        }
        result
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for JournalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalBridge")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
