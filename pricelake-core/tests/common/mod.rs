//! Shared fixtures: a scripted in-memory price source and pipeline setup.

#![allow(dead_code)]

use chrono::{Datelike, NaiveDate, Weekday};
use pricelake_core::config::PipelineConfig;
use pricelake_core::source::{
    PriceSource, QuoteColumns, SourceBatch, SourceError, SymbolSeries,
};
use pricelake_core::DataManager;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// One recorded `fetch_prices` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub symbols: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Deterministic source: every known symbol trades on weekdays with a close
/// that depends only on (symbol, date).
pub struct MockSource {
    known: BTreeSet<String>,
    /// Known but silently left out of responses.
    omitted: BTreeSet<String>,
    max_batch: usize,
    reject_batches: bool,
    /// Fail this many calls with `Unreachable` before answering.
    fail_first: AtomicUsize,
    /// Any call carrying one of these fails with `Unreachable`.
    down: BTreeSet<String>,
    calls: Mutex<Vec<Call>>,
}

impl MockSource {
    pub fn new(known: &[&str]) -> Self {
        Self {
            known: known.iter().map(|s| s.to_string()).collect(),
            omitted: BTreeSet::new(),
            max_batch: 50,
            reject_batches: false,
            fail_first: AtomicUsize::new(0),
            down: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn omitting(mut self, symbol: &str) -> Self {
        self.omitted.insert(symbol.to_string());
        self
    }

    pub fn max_batch(mut self, n: usize) -> Self {
        self.max_batch = n;
        self
    }

    pub fn rejecting_batches(mut self) -> Self {
        self.reject_batches = true;
        self
    }

    pub fn failing_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn unreachable_for(mut self, symbol: &str) -> Self {
        self.down.insert(symbol.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn close_for(symbol: &str, date: NaiveDate) -> f64 {
        let base = symbol.bytes().map(f64::from).sum::<f64>();
        base + f64::from(date.ordinal()) / 10.0
    }

    fn series_for(symbol: &str, start: NaiveDate, end: NaiveDate) -> QuoteColumns {
        let mut cols = QuoteColumns::default();
        let mut date = start;
        while date <= end {
            if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                let close = Self::close_for(symbol, date);
                cols.push(
                    date,
                    Some(close - 0.5),
                    Some(close + 1.0),
                    Some(close - 1.0),
                    Some(close),
                    Some(1_000 + u64::from(date.ordinal())),
                );
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        cols
    }
}

impl PriceSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    fn fetch_prices(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SourceBatch, SourceError> {
        self.calls.lock().unwrap().push(Call {
            symbols: symbols.to_vec(),
            start,
            end,
        });

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::Unreachable("connection refused".into()));
        }
        if self.reject_batches && symbols.len() > 1 {
            return Err(SourceError::Rejected("batch requests unsupported".into()));
        }
        if symbols.iter().any(|s| self.down.contains(s)) {
            return Err(SourceError::Unreachable("connection timed out".into()));
        }

        let mut batch = SourceBatch::default();
        for symbol in symbols {
            if self.omitted.contains(symbol) {
                continue;
            }
            let series = if self.known.contains(symbol) {
                SymbolSeries::Quotes(Self::series_for(symbol, start, end))
            } else {
                SymbolSeries::Unknown {
                    reason: format!("no data for {symbol}"),
                }
            };
            batch.insert(symbol.clone(), series);
        }
        Ok(batch)
    }
}

/// Config rooted at `dir` with the given universe, a floor date of
/// 2020-01-01, fast retries and `as_of` pinned.
pub fn config(dir: &Path, symbols: &[&str], as_of: NaiveDate) -> PipelineConfig {
    let universe = dir.join("universe.csv");
    let mut csv = String::from("symbol,sector\n");
    for (i, symbol) in symbols.iter().enumerate() {
        let sector = if i % 2 == 0 { "Even" } else { "Odd" };
        csv.push_str(&format!("{symbol},{sector}\n"));
    }
    fs::write(&universe, csv).unwrap();

    let mut config = PipelineConfig::rooted_at(dir, &universe, d(2020, 1, 1));
    config.ingest.as_of = Some(as_of);
    config.ingest.workers = 2;
    config.fetch.base_delay_ms = 1;
    config
}

pub fn manager(config: PipelineConfig, source: Arc<MockSource>) -> DataManager {
    DataManager::with_source(config, source).unwrap()
}

/// BLAKE3 of every file under `root`, keyed by relative path.
pub fn tree_hashes(root: &Path) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            walk(root, &path, out);
        } else {
            let rel = path.strip_prefix(root).unwrap().display().to_string();
            let hash = blake3::hash(&fs::read(&path).unwrap()).to_hex().to_string();
            out.insert(rel, hash);
        }
    }
}
