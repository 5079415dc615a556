//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the mock cloud workspace: configuration loading and
//! tracing initialisation consumed by the daemon and library crates.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, CatalogConfig, DelayWindow, LoadedAppConfig, LoggingConfig, MetricsConfig,
    StorageConfig, WorkerConfig,
};
pub use logging::{init_test_tracing, init_tracing, LogFormat};

/// Crate version reported by binaries and the API root endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
