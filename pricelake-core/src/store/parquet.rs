//! Parquet I/O helpers: row/frame conversion, multi-file writes, validated reads.

use super::StorageError;
use crate::schema::{self, FeatureRow, FeatureSchema, PriceRow, PriceSchema};
use chrono::NaiveDate;
use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

fn epoch() -> NaiveDate {
    NaiveDate::default()
}

fn to_epoch_days(date: NaiveDate) -> i32 {
    (date - epoch()).num_days() as i32
}

fn from_epoch_days(days: i32) -> NaiveDate {
    epoch() + chrono::Duration::days(days as i64)
}

fn polars_err(path: &Path) -> impl Fn(PolarsError) -> StorageError + '_ {
    move |e| StorageError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

fn date_column(dates: Vec<i32>) -> PolarsResult<Column> {
    Column::new("date".into(), dates).cast(&DataType::Date)
}

pub fn prices_to_frame(rows: &[PriceRow]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Column::new(
            "symbol".into(),
            rows.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>(),
        ),
        date_column(rows.iter().map(|r| to_epoch_days(r.date)).collect())?,
        Column::new("open".into(), rows.iter().map(|r| r.open).collect::<Vec<_>>()),
        Column::new("high".into(), rows.iter().map(|r| r.high).collect::<Vec<_>>()),
        Column::new("low".into(), rows.iter().map(|r| r.low).collect::<Vec<_>>()),
        Column::new("close".into(), rows.iter().map(|r| r.close).collect::<Vec<_>>()),
        Column::new("volume".into(), rows.iter().map(|r| r.volume).collect::<Vec<_>>()),
    ])
}

pub fn features_to_frame(rows: &[FeatureRow]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Column::new(
            "symbol".into(),
            rows.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>(),
        ),
        date_column(rows.iter().map(|r| to_epoch_days(r.date)).collect())?,
        Column::new("close".into(), rows.iter().map(|r| r.close).collect::<Vec<_>>()),
        Column::new(
            "close_lag_1".into(),
            rows.iter().map(|r| r.close_lag_1).collect::<Vec<_>>(),
        ),
        Column::new(
            "returns".into(),
            rows.iter().map(|r| r.returns).collect::<Vec<_>>(),
        ),
    ])
}

/// Sort by (symbol, date) and drop duplicate keys, keeping the first.
pub fn canonicalize(df: DataFrame) -> PolarsResult<DataFrame> {
    df.lazy()
        .sort(
            ["symbol", "date"],
            SortMultipleOptions::default()
                .with_order_descending_multi([false, false])
                .with_maintain_order(true),
        )
        .unique_stable(
            Some(vec!["symbol".into(), "date".into()]),
            UniqueKeepStrategy::First,
        )
        .collect()
}

pub fn frame_to_prices(df: &DataFrame) -> PolarsResult<Vec<PriceRow>> {
    let symbols = df.column("symbol")?.str()?;
    let dates = df.column("date")?.date()?;
    let opens = df.column("open")?.f64()?;
    let highs = df.column("high")?.f64()?;
    let lows = df.column("low")?.f64()?;
    let closes = df.column("close")?.f64()?;
    let volumes = df.column("volume")?.u64()?;

    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let (Some(symbol), Some(days)) = (symbols.get(i), dates.get(i)) else {
            return Err(PolarsError::ComputeError(
                format!("null key at row {i}").into(),
            ));
        };
        rows.push(PriceRow {
            symbol: symbol.to_string(),
            date: from_epoch_days(days),
            open: opens.get(i).unwrap_or(f64::NAN),
            high: highs.get(i).unwrap_or(f64::NAN),
            low: lows.get(i).unwrap_or(f64::NAN),
            close: closes.get(i).unwrap_or(f64::NAN),
            volume: volumes.get(i).unwrap_or(0),
        });
    }
    Ok(rows)
}

pub fn frame_to_features(df: &DataFrame) -> PolarsResult<Vec<FeatureRow>> {
    let symbols = df.column("symbol")?.str()?;
    let dates = df.column("date")?.date()?;
    let closes = df.column("close")?.f64()?;
    let lags = df.column("close_lag_1")?.f64()?;
    let returns = df.column("returns")?.f64()?;

    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let (Some(symbol), Some(days)) = (symbols.get(i), dates.get(i)) else {
            return Err(PolarsError::ComputeError(
                format!("null key at row {i}").into(),
            ));
        };
        rows.push(FeatureRow {
            symbol: symbol.to_string(),
            date: from_epoch_days(days),
            close: closes.get(i).unwrap_or(f64::NAN),
            close_lag_1: lags.get(i),
            returns: returns.get(i),
        });
    }
    Ok(rows)
}

/// Write `rows` into `dir` as `part-NNNNN.parquet` files of at most
/// `rows_per_file` rows each. Returns the number of files written.
pub fn write_parts<T>(
    dir: &Path,
    rows: &[T],
    rows_per_file: usize,
    to_frame: fn(&[T]) -> PolarsResult<DataFrame>,
) -> Result<usize, StorageError> {
    let mut written = 0;
    for (index, chunk) in rows.chunks(rows_per_file.max(1)).enumerate() {
        let path = dir.join(super::layout::part_file_name(index));
        let write_err = |message: String| StorageError::Write {
            path: path.clone(),
            message,
        };
        let mut df = to_frame(chunk).map_err(|e| write_err(format!("dataframe creation: {e}")))?;
        let file = fs::File::create(&path).map_err(|e| write_err(format!("create file: {e}")))?;
        ParquetWriter::new(file)
            .finish(&mut df)
            .map_err(|e| write_err(format!("write parquet: {e}")))?;
        written += 1;
    }
    Ok(written)
}

/// Parquet files of a committed directory, in name order.
pub fn part_files(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let entries = fs::read_dir(dir).map_err(|e| StorageError::Read {
        path: dir.to_path_buf(),
        message: format!("read dir: {e}"),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| StorageError::Read {
                path: dir.to_path_buf(),
                message: format!("dir entry: {e}"),
            })?
            .path();
        if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_validated(path: &Path, expected: &Schema) -> Result<DataFrame, StorageError> {
    let file = fs::File::open(path).map_err(|e| StorageError::Read {
        path: path.to_path_buf(),
        message: format!("open: {e}"),
    })?;
    let df = ParquetReader::new(file).finish().map_err(polars_err(path))?;
    schema::validate(&df, expected).map_err(|e| StorageError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(df)
}

/// Read and stack every file; `None` when there are no files.
fn read_stacked(files: &[PathBuf], expected: &Schema) -> Result<Option<DataFrame>, StorageError> {
    let mut stacked: Option<DataFrame> = None;
    for path in files {
        let df = read_validated(path, expected)?;
        match stacked.as_mut() {
            Some(acc) => {
                acc.vstack_mut(&df).map_err(polars_err(path))?;
            }
            None => stacked = Some(df),
        }
    }
    Ok(stacked)
}

pub fn read_prices(files: &[PathBuf]) -> Result<Vec<PriceRow>, StorageError> {
    let Some(df) = read_stacked(files, &PriceSchema::schema())? else {
        return Ok(Vec::new());
    };
    let context = files.first().map(PathBuf::as_path).unwrap_or(Path::new(""));
    let df = canonicalize(df).map_err(polars_err(context))?;
    frame_to_prices(&df).map_err(polars_err(context))
}

pub fn read_features(files: &[PathBuf]) -> Result<Vec<FeatureRow>, StorageError> {
    let Some(df) = read_stacked(files, &FeatureSchema::schema())? else {
        return Ok(Vec::new());
    };
    let context = files.first().map(PathBuf::as_path).unwrap_or(Path::new(""));
    frame_to_features(&df).map_err(polars_err(context))
}
