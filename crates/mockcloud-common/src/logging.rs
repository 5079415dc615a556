//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing subscriber setup for the daemon and tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "MOCKCLOUD_LOG";

static GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Where the active filter directive came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterSource {
    Override(String),
    RustLog(String),
    Config(String),
}

impl FilterSource {
    fn resolve(config_level: &str) -> Self {
        let from_env = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
        };
        if let Some(directive) = from_env(LOG_ENV) {
            return FilterSource::Override(directive);
        }
        if let Some(directive) = from_env("RUST_LOG") {
            return FilterSource::RustLog(directive);
        }
        FilterSource::Config(config_level.to_owned())
    }

    fn directive(&self) -> &str {
        match self {
            FilterSource::Override(d) | FilterSource::RustLog(d) | FilterSource::Config(d) => d,
        }
    }
}

fn build_filter(source: &FilterSource) -> Result<EnvFilter> {
    EnvFilter::try_new(source.directive())
        .with_context(|| format!("invalid log filter {:?}", source))
}

/// Install the global subscriber: stdout in the configured [`LogFormat`] plus
/// a daily rolling JSON file named after `service_name` (or `file_prefix`).
///
/// The filter comes from `MOCKCLOUD_LOG`, then `RUST_LOG`, then
/// `logging.level`. A second call keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let source = FilterSource::resolve(&config.level);
    let filter = build_filter(&source)?;

    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file_layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set((file_guard, stdout_guard));
        info!(
            service = %service_name,
            log_dir = %config.directory.display(),
            format = ?config.format,
            filter = source.directive(),
            "tracing initialised"
        );
    }
    Ok(())
}

/// Route logs through the test writer; repeated calls are no-ops.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
