//! Pipeline configuration, loaded from TOML and passed explicitly to every
//! component.
//!
//! ```toml
//! [storage]
//! bronze_root = "data/bronze"
//! silver_root = "data/silver"
//! scratch_root = "data/scratch"
//!
//! [universe]
//! path = "universe.csv"
//!
//! [ingest]
//! start = "2015-01-01"
//! granularity = "year"
//! workers = 4
//!
//! [fetch]
//! provider = "yahoo"
//! ```

use crate::fetch::RetryPolicy;
use crate::period::Granularity;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("storage root {} is unusable: {message}", path.display())]
    StorageRoot { path: PathBuf, message: String },

    #[error("universe: {0}")]
    Universe(#[from] crate::universe::UniverseError),

    #[error(
        "bronze store {} holds {found:?} partitions but ingest.granularity is {configured:?}",
        path.display()
    )]
    GranularityMismatch {
        path: PathBuf,
        found: Granularity,
        configured: Granularity,
    },

    #[error("unknown sector '{0}'")]
    UnknownSector(String),

    #[error("price source: {0}")]
    Source(String),

    #[error("worker pool: {0}")]
    WorkerPool(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub universe: UniverseConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Raw price partitions.
    pub bronze_root: PathBuf,
    /// Derived feature datasets.
    pub silver_root: PathBuf,
    /// Scratch area for exports and format experiments.
    pub scratch_root: PathBuf,
    #[serde(default = "default_rows_per_file")]
    pub rows_per_file: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UniverseConfig {
    /// `.csv` (symbol[,sector]) or `.toml` (`[sectors]`).
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestConfig {
    /// Floor date: no history before this is requested.
    pub start: NaiveDate,
    /// Last date to request. Defaults to today.
    #[serde(default)]
    pub end: Option<NaiveDate>,
    /// Overrides "today" (reproducible backfills, tests).
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Re-fetch every period, not just missing and current ones.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Yahoo,
    CsvDir,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    /// Directory for the `csv_dir` provider.
    #[serde(default)]
    pub csv_dir: Option<PathBuf>,
    /// Upper bound on symbols per request; the provider may allow fewer.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub breaker_failure_threshold: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            csv_dir: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            timeout_secs: default_timeout_secs(),
            breaker_cooldown_secs: default_cooldown_secs(),
            breaker_failure_threshold: default_failure_threshold(),
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeaturesConfig {
    /// Dataset directory name under `silver_root`.
    #[serde(default = "default_dataset")]
    pub dataset: String,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_rows_per_file() -> usize {
    crate::store::DEFAULT_ROWS_PER_FILE
}
fn default_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cooldown_secs() -> u64 {
    30 * 60
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_dataset() -> String {
    "returns".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal config rooted at `data_dir` (bronze/silver/scratch below it).
    pub fn rooted_at(data_dir: &Path, universe: &Path, start: NaiveDate) -> Self {
        Self {
            storage: StorageConfig {
                bronze_root: data_dir.join("bronze"),
                silver_root: data_dir.join("silver"),
                scratch_root: data_dir.join("scratch"),
                rows_per_file: default_rows_per_file(),
            },
            universe: UniverseConfig {
                path: universe.to_path_buf(),
            },
            ingest: IngestConfig {
                start,
                end: None,
                as_of: None,
                granularity: Granularity::default(),
                workers: default_workers(),
                force: false,
            },
            fetch: FetchConfig::default(),
            features: FeaturesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let roots = [
            &self.storage.bronze_root,
            &self.storage.silver_root,
            &self.storage.scratch_root,
        ];
        if roots.iter().any(|r| r.as_os_str().is_empty()) {
            return Err(ConfigError::Invalid("storage roots must be set".into()));
        }
        if self.storage.bronze_root == self.storage.silver_root {
            return Err(ConfigError::Invalid(
                "bronze_root and silver_root must differ".into(),
            ));
        }
        if self.storage.rows_per_file == 0 {
            return Err(ConfigError::Invalid("rows_per_file must be positive".into()));
        }
        if self.ingest.workers == 0 {
            return Err(ConfigError::Invalid("workers must be positive".into()));
        }
        if let Some(end) = self.ingest.end {
            if end < self.ingest.start {
                return Err(ConfigError::Invalid(format!(
                    "ingest.end {end} is before ingest.start {}",
                    self.ingest.start
                )));
            }
        }
        if self.fetch.batch_size == 0 {
            return Err(ConfigError::Invalid("fetch.batch_size must be positive".into()));
        }
        if self.fetch.provider == ProviderKind::CsvDir && self.fetch.csv_dir.is_none() {
            return Err(ConfigError::Invalid(
                "fetch.csv_dir is required for the csv_dir provider".into(),
            ));
        }
        let dataset = &self.features.dataset;
        if dataset.is_empty() || dataset.starts_with('.') || dataset.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "features.dataset '{dataset}' must be a plain directory name"
            )));
        }
        Ok(())
    }

    /// The date treated as "today".
    pub fn today(&self) -> NaiveDate {
        self.ingest
            .as_of
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }
}
