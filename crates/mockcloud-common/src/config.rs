//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_failure_probability() -> f64 {
    0.1
}

fn default_create_window() -> DelayWindow {
    DelayWindow::new(Duration::from_secs(30), Duration::from_secs(60))
}

fn default_delete_window() -> DelayWindow {
    DelayWindow::fixed(Duration::from_secs(5))
}

fn default_max_concurrent_jobs() -> usize {
    256
}

fn default_address_retry_limit() -> u32 {
    64
}

fn default_instance_types() -> Vec<String> {
    [
        "t3.nano",
        "t3.micro",
        "t3.small",
        "t3.medium",
        "t3.large",
        "m5.large",
        "m5.xlarge",
        "c5.large",
    ]
    .iter()
    .map(|name| (*name).to_owned())
    .collect()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the control plane daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no candidate existed and built-in defaults were used.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "MOCKCLOUD_CONFIG";

    /// Load configuration from disk, respecting the `MOCKCLOUD_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// An explicit `MOCKCLOUD_CONFIG` path must exist. Otherwise the first
    /// existing candidate wins, and defaults are used when none exist.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.catalog.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

/// Bounds of the simulated delay for one kind of lifecycle job.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayWindow {
    #[serde(rename = "min_delay_secs")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub min: Duration,
    #[serde(rename = "max_delay_secs")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max: Duration,
}

impl DelayWindow {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub const fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.min > self.max {
            return Err(anyhow!(
                "worker.{section}.min_delay_secs ({:?}) exceeds worker.{section}.max_delay_secs ({:?})",
                self.min,
                self.max
            ));
        }
        Ok(())
    }
}

/// Simulation parameters for the lifecycle worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Probability in `[0, 1]` that a job ends in `error`.
    #[serde(default = "default_failure_probability")]
    pub failure_probability: f64,
    /// Delay before a VM create job settles.
    #[serde(default = "default_create_window")]
    pub vm: DelayWindow,
    #[serde(default = "default_create_window")]
    pub volume: DelayWindow,
    /// Delay before any delete job settles.
    #[serde(default = "default_delete_window")]
    pub delete: DelayWindow,
    /// Fixed RNG seed for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_address_retry_limit")]
    pub address_retry_limit: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            failure_probability: default_failure_probability(),
            vm: default_create_window(),
            volume: default_create_window(),
            delete: default_delete_window(),
            seed: None,
            max_concurrent_jobs: default_max_concurrent_jobs(),
            address_retry_limit: default_address_retry_limit(),
        }
    }
}

impl WorkerConfig {
    /// Use `window` for every kind of job.
    pub fn with_uniform_delay(mut self, window: DelayWindow) -> Self {
        self.vm = window;
        self.volume = window;
        self.delete = window;
        self
    }

    /// Upper bound on how long any single job sleeps.
    pub fn longest_delay(&self) -> Duration {
        self.vm.max.max(self.volume.max).max(self.delete.max)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.failure_probability.is_finite()
            || !(0.0..=1.0).contains(&self.failure_probability)
        {
            return Err(anyhow!(
                "worker.failure_probability must be within [0, 1], got {}",
                self.failure_probability
            ));
        }
        self.vm.validate("vm")?;
        self.volume.validate("volume")?;
        self.delete.validate("delete")?;
        if self.max_concurrent_jobs == 0 {
            return Err(anyhow!("worker.max_concurrent_jobs must be at least 1"));
        }
        if self.address_retry_limit == 0 {
            return Err(anyhow!("worker.address_retry_limit must be at least 1"));
        }
        Ok(())
    }
}

/// Offerings accepted by the resource service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_instance_types")]
    pub instance_types: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            instance_types: default_instance_types(),
        }
    }
}

impl CatalogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.instance_types.is_empty() {
            return Err(anyhow!("catalog.instance_types must not be empty"));
        }
        if let Some(blank) = self.instance_types.iter().find(|t| t.trim().is_empty()) {
            return Err(anyhow!("catalog.instance_types contains a blank entry {blank:?}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Append-only journal of store mutations. In-memory only when unset.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
    #[serde(default)]
    pub replay_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Filter directive used when neither `MOCKCLOUD_LOG` nor `RUST_LOG` is set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
