//! Offline price source backed by a directory of per-symbol CSV files.
//!
//! File layout: `{dir}/{SYMBOL}.csv` with a header row
//! `date,open,high,low,close,volume` (dates as `YYYY-MM-DD`). Empty cells are
//! missing values. A symbol without a file is unknown to this source.

use super::{PriceSource, QuoteColumns, SourceBatch, SourceError, SymbolSeries};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct CsvQuote {
    date: NaiveDate,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<u64>,
}

pub struct CsvDirSource {
    dir: PathBuf,
}

impl CsvDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", crate::store::layout::encode_symbol(symbol)))
    }

    fn load(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SymbolSeries, SourceError> {
        let path = self.file_for(symbol);
        if !path.exists() {
            return Ok(SymbolSeries::Unknown {
                reason: format!("no file {}", path.display()),
            });
        }

        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| SourceError::Unreachable(format!("open {}: {e}", path.display())))?;

        let mut columns = QuoteColumns::default();
        for record in reader.deserialize::<CsvQuote>() {
            let q = record
                .map_err(|e| SourceError::Rejected(format!("parse {}: {e}", path.display())))?;
            if q.date < start || q.date > end {
                continue;
            }
            columns.push(q.date, q.open, q.high, q.low, q.close, q.volume);
        }
        Ok(SymbolSeries::Quotes(columns))
    }
}

impl PriceSource for CsvDirSource {
    fn name(&self) -> &str {
        "csv_dir"
    }

    fn max_batch_size(&self) -> usize {
        usize::MAX
    }

    fn fetch_prices(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SourceBatch, SourceError> {
        if !self.dir.is_dir() {
            return Err(SourceError::Unreachable(format!(
                "price directory {} is missing",
                self.dir.display()
            )));
        }

        let mut batch = SourceBatch::default();
        for symbol in symbols {
            batch.insert(symbol.clone(), self.load(symbol, start, end)?);
        }
        Ok(batch)
    }
}
