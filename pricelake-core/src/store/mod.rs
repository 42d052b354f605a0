//! Partition store: immutable, atomically replaced partitions keyed by
//! (symbol, period).
//!
//! Layout: `{root}/{SYM}/{SYM}_{period}/part-NNNNN.parquet`
//!
//! - Writes stage into a hidden sibling directory and swap it in with renames
//! - A partition may span several files; they are always replaced together
//! - The directory scan is the only index; nothing else records what exists
//! - Hidden entries (`.tmp-*`, `.old-*`) are never reported as partitions
//! - A partition fetched over less than its whole period carries a
//!   `_coverage.json` sidecar with the span it actually holds

pub mod atomic;
pub mod layout;
pub mod parquet;

use crate::period::Period;
use crate::schema::PriceRow;
pub use atomic::RecoveryReport;
use chrono::NaiveDate;
pub use layout::PartitionKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default upper bound on rows per Parquet file within a partition.
pub const DEFAULT_ROWS_PER_FILE: usize = 100_000;

const COVERAGE_FILE: &str = "_coverage.json";

/// Inclusive date span a partition's rows were fetched over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Coverage {
    pub fn full(period: Period) -> Self {
        Self {
            start: period.first_day(),
            end: period.last_day(),
        }
    }

    /// `period` clipped to `[start, end]`.
    pub fn clipped(period: Period, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: period.first_day().max(start),
            end: period.last_day().min(end),
        }
    }

    pub fn covers(&self, other: &Coverage) -> bool {
        self.start <= other.start && self.end >= other.end
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage write failed at {}: {message}", path.display())]
    Write { path: PathBuf, message: String },

    #[error("storage read failed at {}: {message}", path.display())]
    Read { path: PathBuf, message: String },
}

/// Bronze partition store rooted at one directory.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
    rows_per_file: usize,
}

impl PartitionStore {
    /// Open (creating if needed) a store and repair interrupted swaps.
    pub fn open(root: impl Into<PathBuf>, rows_per_file: usize) -> Result<Self, StorageError> {
        let store = Self {
            root: root.into(),
            rows_per_file: rows_per_file.max(1),
        };
        fs::create_dir_all(&store.root).map_err(|e| StorageError::Write {
            path: store.root.clone(),
            message: format!("failed to create root: {e}"),
        })?;
        let report = store.recover()?;
        if !report.is_clean() {
            tracing::warn!(
                root = %store.root.display(),
                staging_removed = report.staging_removed,
                backups_restored = report.backups_restored,
                backups_removed = report.backups_removed,
                "recovered partitions from an interrupted run"
            );
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a partition is committed to.
    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        layout::partition_dir(&self.root, key)
    }

    /// Write `rows` as the complete content of partition (symbol, period),
    /// replacing any previous version atomically.
    ///
    /// Rows must belong to `symbol` and fall inside `period`. An empty slice
    /// commits an empty partition. Returns the number of files written.
    pub fn write_partition(
        &self,
        symbol: &str,
        period: Period,
        rows: &[PriceRow],
    ) -> Result<usize, StorageError> {
        self.write_partition_covering(symbol, period, rows, Coverage::full(period))
    }

    /// Like [`write_partition`](Self::write_partition), for rows fetched over
    /// `coverage` only. A span narrower than the period is recorded next to
    /// the data so later runs know the partition is incomplete.
    pub fn write_partition_covering(
        &self,
        symbol: &str,
        period: Period,
        rows: &[PriceRow],
        coverage: Coverage,
    ) -> Result<usize, StorageError> {
        let key = PartitionKey::new(symbol, period);
        let target = self.partition_path(&key);

        if let Some(stray) = rows
            .iter()
            .find(|r| r.symbol != symbol || !period.contains(r.date))
        {
            return Err(StorageError::Write {
                path: target,
                message: format!(
                    "row {}@{} does not belong to partition {key}",
                    stray.symbol, stray.date
                ),
            });
        }

        let mut sorted = rows.to_vec();
        sorted.sort_by_key(|r| r.date);

        let staged = atomic::staging_dir(&target).map_err(|e| StorageError::Write {
            path: target.clone(),
            message: format!("failed to create staging dir: {e}"),
        })?;

        let written = parquet::write_parts(
            &staged,
            &sorted,
            self.rows_per_file,
            parquet::prices_to_frame,
        )
        .and_then(|files| {
            if coverage != Coverage::full(period) {
                write_coverage(&staged, &coverage)?;
            }
            Ok(files)
        });
        let files = match written {
            Ok(files) => files,
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
            });
        }

        tracing::debug!(partition = %key, rows = sorted.len(), files, "partition committed");
        Ok(files)
    }

    /// Committed partition keys, optionally restricted to one symbol.
    pub fn list_partitions(
        &self,
        symbol: Option<&str>,
    ) -> Result<BTreeSet<PartitionKey>, StorageError> {
        let mut keys = BTreeSet::new();

        let symbol_dirs: Vec<String> = match symbol {
            Some(symbol) => vec![layout::encode_symbol(symbol)],
            None => self.visible_children(&self.root)?,
        };

        for component in symbol_dirs {
            let dir = self.root.join(&component);
            if !dir.is_dir() || layout::decode_symbol(&component).is_none() {
                continue;
            }
            for name in self.visible_children(&dir)? {
                if let Some(key) = layout::parse_partition_dir_name(&component, &name) {
                    keys.insert(key);
                }
            }
        }

        Ok(keys)
    }

    /// Symbols with at least one committed partition.
    pub fn symbols(&self) -> Result<BTreeSet<String>, StorageError> {
        Ok(self
            .list_partitions(None)?
            .into_iter()
            .map(|k| k.symbol)
            .collect())
    }

    /// Rows of one partition, sorted by date.
    pub fn read_partition(&self, key: &PartitionKey) -> Result<Vec<PriceRow>, StorageError> {
        let files = parquet::part_files(&self.partition_path(key))?;
        parquet::read_prices(&files)
    }

    /// Span a committed partition holds. Partitions without a sidecar hold
    /// their whole period.
    pub fn partition_coverage(&self, key: &PartitionKey) -> Result<Coverage, StorageError> {
        let path = self.partition_path(key).join(COVERAGE_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Read {
                path,
                message: format!("coverage sidecar: {e}"),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Coverage::full(key.period)),
            Err(e) => Err(StorageError::Read {
                path,
                message: format!("coverage sidecar: {e}"),
            }),
        }
    }

    /// Every committed row, optionally restricted to one symbol, sorted by
    /// (symbol, date) with duplicate keys removed.
    pub fn read_all(&self, symbol: Option<&str>) -> Result<Vec<PriceRow>, StorageError> {
        let mut files = Vec::new();
        for key in self.list_partitions(symbol)? {
            files.extend(parquet::part_files(&self.partition_path(&key))?);
        }
        parquet::read_prices(&files)
    }

    /// Repair whatever interrupted swaps left behind under every symbol dir.
    pub fn recover(&self) -> Result<RecoveryReport, StorageError> {
        let mut report = RecoveryReport::default();
        for component in self.visible_children(&self.root)? {
            let dir = self.root.join(component);
            if dir.is_dir() {
                let dir_report = atomic::recover(&dir).map_err(|e| StorageError::Write {
                    path: dir.clone(),
                    message: format!("recovery failed: {e}"),
                })?;
                report.merge(dir_report);
            }
        }
        Ok(report)
    }

    /// Names of non-hidden entries in `dir`.
    fn visible_children(&self, dir: &Path) -> Result<Vec<String>, StorageError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(dir).map_err(|e| StorageError::Read {
            path: dir.to_path_buf(),
            message: format!("read dir: {e}"),
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::Read {
                path: dir.to_path_buf(),
                message: format!("dir entry: {e}"),
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn write_coverage(dir: &Path, coverage: &Coverage) -> Result<(), StorageError> {
    let path = dir.join(COVERAGE_FILE);
    let body = serde_json::to_vec(coverage).map_err(|e| StorageError::Write {
        path: path.clone(),
        message: format!("encode coverage: {e}"),
    })?;
    fs::write(&path, body).map_err(|e| StorageError::Write {
        path,
        message: format!("write coverage: {e}"),
    })
}
