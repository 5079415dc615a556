//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Journal storage bindings for the resource store."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{self, CounterVec, Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by the journal.
#[derive(Clone)]
pub struct PersistenceMetrics {
    journal_entries: IntCounterVec,
    journal_bytes: CounterVec,
    journal_failures: IntCounterVec,
    replay_duration: Histogram,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let journal_entries = IntCounterVec::new(
            Opts::new(
                "mockcloud_journal_entries_total",
                "Total number of store mutations appended to the journal",
            ),
            &["resource", "op"],
        )?;
        registry.register(Box::new(journal_entries.clone()))?;

        let journal_bytes = CounterVec::new(
            Opts::new(
                "mockcloud_journal_bytes_total",
                "Total bytes appended to the journal",
            ),
            &["resource"],
        )?;
        registry.register(Box::new(journal_bytes.clone()))?;

        let journal_failures = IntCounterVec::new(
            Opts::new(
                "mockcloud_journal_failures_total",
                "Journal appends that failed and left the mutation in memory only",
            ),
            &["resource"],
        )?;
        registry.register(Box::new(journal_failures.clone()))?;

        let replay_duration = Histogram::with_opts(
            HistogramOpts::new(
                "mockcloud_journal_replay_duration_seconds",
                "Time spent rebuilding the store from the journal",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 12)?),
        )?;
        registry.register(Box::new(replay_duration.clone()))?;

        Ok(Self {
            journal_entries,
            journal_bytes,
            journal_failures,
            replay_duration,
        })
    }

    /// Record a successful append.
    pub fn record_append(&self, resource: &str, op: &str, bytes: usize) {
        self.journal_entries
            .with_label_values(&[resource, op])
            .inc();
        self.journal_bytes
            .with_label_values(&[resource])
            .inc_by(bytes as f64);
    }

    /// Record a failed append.
    pub fn record_failure(&self, resource: &str) {
        self.journal_failures.with_label_values(&[resource]).inc();
    }

    /// Observe the duration of a journal replay.
    pub fn observe_replay_duration(&self, seconds: f64) {
        self.replay_duration.observe(seconds);
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}
