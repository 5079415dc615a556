//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Journal storage bindings for the resource store."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Append-only journal used to make the in-memory resource store durable.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing journal files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The journal header carries a format version this build cannot read.
    #[error("unsupported journal version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the header line.
        found: u16,
        /// Version written by this build.
        expected: u16,
    },
    /// The journal header failed integrity verification.
    #[error("journal header hash mismatch")]
    HashMismatch,
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub mod event_log;
pub mod metrics;

pub use event_log::replay as replay_journal;
pub use event_log::{JournalEntry, JournalReader, JournalWriter, JOURNAL_VERSION};
pub use metrics::PersistenceMetrics;
