//! Engine configuration.
//!
//! Layering (later wins): built-in defaults, an optional TOML file, then
//! `HARVEST_*` environment variables with `__` between section and key
//! (`HARVEST_WORKER__CONCURRENCY=8`). The result is validated once and then
//! passed around by reference; nothing reads configuration globally.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::task::is_ocr_language;
use crate::domain::{HarvestError, HarvestResult, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    /// Max tasks dispatched per pass.
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Dispatch channel capacity; a full channel leaves tasks pending.
    pub queue_capacity: usize,
    pub processor_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 64,
            processor_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_secs: u64,
    /// A running task whose heartbeat is older than this is requeued.
    pub stale_after_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stale_after_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: PathBuf::from("./harvest-data/objects"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            root: PathBuf::from("./harvest-data/records"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorsConfig {
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub tesseract_binary: String,
    pub ocr_language: String,
}

impl Default for ProcessorsConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            user_agent: concat!("harvest/", env!("CARGO_PKG_VERSION")).to_string(),
            tesseract_binary: "tesseract".to_string(),
            ocr_language: "eng".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(HarvestError::Config(format!("unsupported log format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub reaper: ReaperConfig,
    pub storage: StorageConfig,
    pub store: StoreConfig,
    pub processors: ProcessorsConfig,
    pub logging: LoggingConfig,
}

impl HarvestConfig {
    /// Defaults, then `path` (if given; must exist), then environment.
    pub fn load(path: Option<&Path>) -> HarvestResult<Self> {
        let defaults = Config::try_from(&HarvestConfig::default()).map_err(config_error)?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.exists() {
                return Err(HarvestError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("HARVEST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: HarvestConfig = builder
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> HarvestResult<Self> {
        let config: HarvestConfig = toml::from_str(toml_str)
            .map_err(|e| HarvestError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> HarvestResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| HarvestError::Config(format!("cannot render TOML: {e}")))
    }

    pub fn validate(&self) -> HarvestResult<()> {
        let fail = |msg: String| -> HarvestResult<()> { Err(HarvestError::Config(msg)) };

        if self.scheduler.poll_interval_ms == 0 {
            return fail("scheduler.poll_interval_ms must be positive".into());
        }
        if self.scheduler.batch_size == 0 {
            return fail("scheduler.batch_size must be positive".into());
        }
        if self.worker.concurrency == 0 {
            return fail("worker.concurrency must be positive".into());
        }
        if self.worker.queue_capacity == 0 {
            return fail("worker.queue_capacity must be positive".into());
        }
        if self.worker.processor_timeout_secs == 0 {
            return fail("worker.processor_timeout_secs must be positive".into());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1".into());
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return fail(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return fail("retry.base_delay_ms must not exceed retry.max_delay_ms".into());
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return fail(format!(
                "retry.jitter must be in [0, 1), got {}",
                self.retry.jitter
            ));
        }
        if self.reaper.interval_secs == 0 {
            return fail("reaper.interval_secs must be positive".into());
        }
        // A healthy worker heartbeats before each attempt and each artifact
        // write, so the longest silence is one processor timeout plus one
        // jittered backoff sleep.
        let longest_silence = self.processor_timeout() + self.retry_policy().longest_delay();
        if self.stale_after() <= longest_silence {
            return fail(format!(
                "reaper.stale_after_secs ({}s) must exceed worker.processor_timeout_secs + jittered retry.max_delay_ms ({}s)",
                self.reaper.stale_after_secs,
                longest_silence.as_secs_f64()
            ));
        }
        if self.processors.http_timeout_secs == 0 {
            return fail("processors.http_timeout_secs must be positive".into());
        }
        if self.processors.tesseract_binary.trim().is_empty() {
            return fail("processors.tesseract_binary must not be empty".into());
        }
        if !is_ocr_language(&self.processors.ocr_language) {
            return fail(format!(
                "processors.ocr_language must be a tesseract language such as \"eng+deu\", got '{}'",
                self.processors.ocr_language
            ));
        }
        if self.logging.level.trim().is_empty() {
            return fail("logging.level must not be empty".into());
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.poll_interval_ms)
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.processor_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.reaper.stale_after_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    /// Audit line for the effective configuration. Call after validation.
    pub fn log_summary(&self) {
        info!(
            poll_interval_ms = self.scheduler.poll_interval_ms,
            batch_size = self.scheduler.batch_size,
            concurrency = self.worker.concurrency,
            queue_capacity = self.worker.queue_capacity,
            processor_timeout_secs = self.worker.processor_timeout_secs,
            max_attempts = self.retry.max_attempts,
            base_delay_ms = self.retry.base_delay_ms,
            max_delay_ms = self.retry.max_delay_ms,
            stale_after_secs = self.reaper.stale_after_secs,
            storage = ?self.storage.backend,
            storage_root = %self.storage.root.display(),
            store = ?self.store.backend,
            store_root = %self.store.root.display(),
            "effective configuration"
        );
    }
}

fn config_error(err: config::ConfigError) -> HarvestError {
    HarvestError::Config(err.to_string())
}
