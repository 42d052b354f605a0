//! Feature builder: Derives the silver returns dataset from bronze prices.
//!
//! Every run rebuilds the whole dataset from the full bronze history and
//! swaps it in with one directory rename. A `_manifest.json` inside the
//! dataset records the fingerprint of the bronze files it was built from, so
//! an unchanged bronze store is not recomputed.

use crate::schema::{FeatureRow, PriceRow};
use crate::store::{atomic, parquet, PartitionStore, StorageError};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MANIFEST_FILE: &str = "_manifest.json";

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("feature dataset {} has not been built", path.display())]
    NotBuilt { path: PathBuf },

    #[error("manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },

    #[error("export to {}: {message}", path.display())]
    Export { path: PathBuf, message: String },
}

/// Sidecar describing the committed silver dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureManifest {
    pub bronze_fingerprint: String,
    pub symbol_count: usize,
    pub row_count: usize,
    pub file_count: usize,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub symbols: usize,
    pub rows_written: usize,
    pub files_written: usize,
    /// Bronze was unchanged since the last build; nothing was written.
    pub skipped: bool,
}

/// Lag and return features for one symbol's series (date ascending).
///
/// `returns` is only set when the lag is finite and non-zero and the result
/// is finite.
pub fn compute_features(series: &[PriceRow]) -> Vec<FeatureRow> {
    let mut prev: Option<f64> = None;
    series
        .iter()
        .map(|row| {
            let lag = prev.replace(row.close);
            let returns = lag
                .filter(|l| l.is_finite() && *l != 0.0)
                .map(|l| row.close / l - 1.0)
                .filter(|r| r.is_finite());
            FeatureRow {
                symbol: row.symbol.clone(),
                date: row.date,
                close: row.close,
                close_lag_1: lag,
                returns,
            }
        })
        .collect()
}

/// Features for rows sorted by (symbol, date). Symbols are computed in
/// parallel; output keeps the input order.
pub fn compute_all(prices: &[PriceRow], pool: &rayon::ThreadPool) -> Vec<FeatureRow> {
    let mut groups: Vec<&[PriceRow]> = Vec::new();
    let mut begin = 0;
    for i in 1..=prices.len() {
        if i == prices.len() || prices[i].symbol != prices[begin].symbol {
            groups.push(&prices[begin..i]);
            begin = i;
        }
    }

    let per_symbol: Vec<Vec<FeatureRow>> =
        pool.install(|| groups.par_iter().map(|g| compute_features(g)).collect());
    per_symbol.into_iter().flatten().collect()
}

/// BLAKE3 over every committed bronze partition: key, file names and bytes.
pub fn bronze_fingerprint(store: &PartitionStore) -> Result<String, StorageError> {
    let mut hasher = blake3::Hasher::new();
    for key in store.list_partitions(None)? {
        let key_text = key.to_string();
        hasher.update(&(key_text.len() as u64).to_le_bytes());
        hasher.update(key_text.as_bytes());

        for file in parquet::part_files(&store.partition_path(&key))? {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let bytes = fs::read(&file).map_err(|e| StorageError::Read {
                path: file.clone(),
                message: format!("read for fingerprint: {e}"),
            })?;
            hasher.update(name.as_bytes());
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Builds and reads one silver dataset.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    silver_root: PathBuf,
    dataset: String,
    rows_per_file: usize,
}

impl FeatureBuilder {
    /// Open the silver root, repairing an interrupted swap of any dataset.
    pub fn open(
        silver_root: impl Into<PathBuf>,
        dataset: impl Into<String>,
        rows_per_file: usize,
    ) -> Result<Self, StorageError> {
        let builder = Self {
            silver_root: silver_root.into(),
            dataset: dataset.into(),
            rows_per_file: rows_per_file.max(1),
        };
        fs::create_dir_all(&builder.silver_root).map_err(|e| StorageError::Write {
            path: builder.silver_root.clone(),
            message: format!("failed to create root: {e}"),
        })?;
        let report = atomic::recover(&builder.silver_root).map_err(|e| StorageError::Write {
            path: builder.silver_root.clone(),
            message: format!("recovery failed: {e}"),
        })?;
        if !report.is_clean() {
            tracing::warn!(
                root = %builder.silver_root.display(),
                staging_removed = report.staging_removed,
                backups_restored = report.backups_restored,
                "recovered silver dataset from an interrupted run"
            );
        }
        Ok(builder)
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.silver_root.join(&self.dataset)
    }

    fn manifest_path(&self) -> PathBuf {
        self.dataset_dir().join(MANIFEST_FILE)
    }

    /// Manifest of the committed dataset, if one exists and parses.
    pub fn manifest(&self) -> Option<FeatureManifest> {
        let content = fs::read_to_string(self.manifest_path()).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Rebuild the dataset from `bronze` unless it is already current.
    pub fn build(
        &self,
        bronze: &PartitionStore,
        force: bool,
        pool: &rayon::ThreadPool,
    ) -> Result<FeatureSummary, FeatureError> {
        let fingerprint = bronze_fingerprint(bronze)?;

        if !force {
            if let Some(manifest) = self.manifest() {
                if manifest.bronze_fingerprint == fingerprint {
                    tracing::info!(
                        dataset = %self.dataset,
                        "bronze unchanged, features are current"
                    );
                    return Ok(FeatureSummary {
                        symbols: manifest.symbol_count,
                        rows_written: 0,
                        files_written: 0,
                        skipped: true,
                    });
                }
            }
        }

        let prices = bronze.read_all(None)?;
        let features = compute_all(&prices, pool);
        let symbols = count_symbols(&features);

        let target = self.dataset_dir();
        let staged = atomic::staging_dir(&target).map_err(|e| StorageError::Write {
            path: target.clone(),
            message: format!("failed to create staging dir: {e}"),
        })?;

        let manifest = match self.write_staged(&staged, &features, symbols, fingerprint) {
            Ok(manifest) => manifest,
            Err(e) => {
                atomic::discard(&staged);
                return Err(e);
            }
        };

        if let Err(e) = atomic::replace_dir(&staged, &target) {
            atomic::discard(&staged);
            return Err(StorageError::Write {
                path: target,
                message: format!("atomic swap failed: {e}"),
            }
            .into());
        }

        tracing::info!(
            dataset = %self.dataset,
            symbols,
            rows = manifest.row_count,
            files = manifest.file_count,
            "features rebuilt"
        );

        Ok(FeatureSummary {
            symbols,
            rows_written: manifest.row_count,
            files_written: manifest.file_count,
            skipped: false,
        })
    }

    fn write_staged(
        &self,
        staged: &Path,
        features: &[FeatureRow],
        symbol_count: usize,
        bronze_fingerprint: String,
    ) -> Result<FeatureManifest, FeatureError> {
        let file_count = parquet::write_parts(
            staged,
            features,
            self.rows_per_file,
            parquet::features_to_frame,
        )?;

        let manifest = FeatureManifest {
            bronze_fingerprint,
            symbol_count,
            row_count: features.len(),
            file_count,
            built_at: Utc::now(),
        };
        let path = staged.join(MANIFEST_FILE);
        let manifest_err = |message: String| FeatureError::Manifest {
            path: path.clone(),
            message,
        };
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| manifest_err(format!("serialization: {e}")))?;
        fs::write(&path, json).map_err(|e| manifest_err(format!("write: {e}")))?;
        Ok(manifest)
    }

    /// Rows of the committed dataset, in (symbol, date) order.
    pub fn read(&self) -> Result<Vec<FeatureRow>, FeatureError> {
        let dir = self.dataset_dir();
        if !dir.is_dir() {
            return Err(FeatureError::NotBuilt { path: dir });
        }
        let files = parquet::part_files(&dir)?;
        Ok(parquet::read_features(&files)?)
    }

    /// Write the committed dataset as one CSV file. Returns the row count.
    pub fn export_csv(&self, path: &Path) -> Result<usize, FeatureError> {
        let rows = self.read()?;
        let export_err = |message: String| FeatureError::Export {
            path: path.to_path_buf(),
            message,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| export_err(format!("create dir: {e}")))?;
        }
        let tmp = path.with_extension("csv.tmp");
        let mut writer =
            csv::Writer::from_path(&tmp).map_err(|e| export_err(format!("create: {e}")))?;
        for row in &rows {
            writer
                .serialize(row)
                .map_err(|e| export_err(format!("write row: {e}")))?;
        }
        writer.flush().map_err(|e| export_err(format!("flush: {e}")))?;
        drop(writer);
        fs::rename(&tmp, path).map_err(|e| export_err(format!("rename: {e}")))?;

        tracing::info!(path = %path.display(), rows = rows.len(), "features exported");
        Ok(rows.len())
    }
}

fn count_symbols(features: &[FeatureRow]) -> usize {
    let mut count = 0;
    let mut last: Option<&str> = None;
    for row in features {
        if last != Some(row.symbol.as_str()) {
            count += 1;
            last = Some(row.symbol.as_str());
        }
    }
    count
}
