//! Pipeline manager: One configuration, two stages.
//!
//! `download_all` brings the bronze store up to date; `featurize` rebuilds
//! the silver returns dataset from it. Everything that can be wrong with the
//! configuration is reported by [`DataManager::new`] before any work starts.

use crate::config::{ConfigError, PipelineConfig, ProviderKind};
use crate::features::{FeatureBuilder, FeatureError, FeatureSummary};
use crate::fetch::PriceFetcher;
use crate::ingest::{self, DownloadSummary, IngestOptions};
use crate::schema::{FeatureRow, PriceRow};
use crate::source::{CircuitBreaker, CsvDirSource, PriceSource, YahooSource};
use crate::store::{PartitionKey, PartitionStore, StorageError};
use crate::universe::Universe;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Build the price source named by the config.
pub fn source_from_config(config: &PipelineConfig) -> Result<Arc<dyn PriceSource>, ConfigError> {
    let fetch = &config.fetch;
    match fetch.provider {
        ProviderKind::Yahoo => {
            let breaker = Arc::new(CircuitBreaker::new(
                Duration::from_secs(fetch.breaker_cooldown_secs),
                fetch.breaker_failure_threshold,
            ));
            let source = YahooSource::new(breaker, Duration::from_secs(fetch.timeout_secs))
                .map_err(|e| ConfigError::Source(format!("failed to build HTTP client: {e}")))?;
            Ok(Arc::new(source))
        }
        ProviderKind::CsvDir => {
            let dir = fetch.csv_dir.as_ref().ok_or_else(|| {
                ConfigError::Invalid("fetch.csv_dir is required for the csv_dir provider".into())
            })?;
            Ok(Arc::new(CsvDirSource::new(dir.clone())))
        }
    }
}

pub struct DataManager {
    config: PipelineConfig,
    universe: Universe,
    bronze: PartitionStore,
    features: FeatureBuilder,
    fetcher: PriceFetcher,
    pool: rayon::ThreadPool,
}

impl DataManager {
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        let source = source_from_config(&config)?;
        Self::with_source(config, source)
    }

    /// Like [`DataManager::new`] with an explicit price source.
    pub fn with_source(
        config: PipelineConfig,
        source: Arc<dyn PriceSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let universe = Universe::from_file(&config.universe.path)?;

        let storage = &config.storage;
        let root_err = |path: &Path| {
            let path = path.to_path_buf();
            move |e: StorageError| ConfigError::StorageRoot {
                path,
                message: e.to_string(),
            }
        };
        let bronze = PartitionStore::open(&storage.bronze_root, storage.rows_per_file)
            .map_err(root_err(&storage.bronze_root))?;
        let configured = config.ingest.granularity;
        if let Some(stray) = bronze
            .list_partitions(None)
            .map_err(root_err(&storage.bronze_root))?
            .into_iter()
            .find(|key| key.period.granularity() != configured)
        {
            return Err(ConfigError::GranularityMismatch {
                path: storage.bronze_root.clone(),
                found: stray.period.granularity(),
                configured,
            });
        }
        let features = FeatureBuilder::open(
            &storage.silver_root,
            config.features.dataset.clone(),
            storage.rows_per_file,
        )
        .map_err(root_err(&storage.silver_root))?;
        fs::create_dir_all(&storage.scratch_root).map_err(|e| ConfigError::StorageRoot {
            path: storage.scratch_root.clone(),
            message: e.to_string(),
        })?;

        let fetcher = PriceFetcher::new(source, config.fetch.retry_policy())
            .with_batch_size(config.fetch.batch_size);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.ingest.workers)
            .thread_name(|i| format!("pricelake-worker-{i}"))
            .build()
            .map_err(|e| ConfigError::WorkerPool(e.to_string()))?;

        tracing::info!(
            symbols = universe.len(),
            source = fetcher.source_name(),
            bronze = %storage.bronze_root.display(),
            silver = %storage.silver_root.display(),
            workers = config.ingest.workers,
            "pipeline ready"
        );

        Ok(Self {
            config,
            universe,
            bronze,
            features,
            fetcher,
            pool,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    pub fn bronze(&self) -> &PartitionStore {
        &self.bronze
    }

    fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            start: self.config.ingest.start,
            end: self.config.ingest.end,
            today: self.config.today(),
            granularity: self.config.ingest.granularity,
            force: self.config.ingest.force,
        }
    }

    /// Fetch what is missing or stale for every symbol of the universe.
    pub fn download_all(&self) -> DownloadSummary {
        self.download_symbols(&self.universe.symbols())
    }

    /// Same as [`download_all`](Self::download_all), restricted to one sector.
    pub fn download_sector(&self, sector: &str) -> Result<DownloadSummary, ConfigError> {
        let symbols = self
            .universe
            .sector_symbols(sector)
            .ok_or_else(|| ConfigError::UnknownSector(sector.to_string()))?;
        Ok(self.download_symbols(&symbols))
    }

    pub fn download_symbols(&self, symbols: &[String]) -> DownloadSummary {
        ingest::download_symbols(
            &self.fetcher,
            &self.bronze,
            symbols,
            &self.ingest_options(),
            &self.pool,
        )
    }

    /// Rebuild the silver dataset if bronze changed since the last build.
    pub fn featurize(&self) -> Result<FeatureSummary, FeatureError> {
        self.featurize_with(false)
    }

    pub fn featurize_with(&self, force: bool) -> Result<FeatureSummary, FeatureError> {
        self.features.build(&self.bronze, force, &self.pool)
    }

    pub fn partitions(&self, symbol: Option<&str>) -> Result<BTreeSet<PartitionKey>, StorageError> {
        self.bronze.list_partitions(symbol)
    }

    pub fn read_prices(&self, symbol: Option<&str>) -> Result<Vec<PriceRow>, StorageError> {
        self.bronze.read_all(symbol)
    }

    pub fn read_features(&self) -> Result<Vec<FeatureRow>, FeatureError> {
        self.features.read()
    }

    /// Write the silver dataset to `<scratch_root>/<dataset>.csv`.
    pub fn export_features_csv(&self) -> Result<(PathBuf, usize), FeatureError> {
        let path = self
            .config
            .storage
            .scratch_root
            .join(format!("{}.csv", self.features.dataset()));
        let rows = self.features.export_csv(&path)?;
        Ok((path, rows))
    }
}
