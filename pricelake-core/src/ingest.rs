//! Ingestion controller: Brings the bronze store up to date for a set of
//! symbols while fetching as little as possible.
//!
//! Per symbol, the target periods run from the floor date through the period
//! containing `min(end, today)`. Materialized periods are skipped, except the
//! current one, which is always re-fetched because it may still be growing,
//! and any whose recorded coverage falls short of what this run asks for.
//! Contiguous runs of needed periods become fetch windows, and symbols that
//! need the identical window share one batched fetch.
//!
//! One bad symbol never aborts the run: fetch, partial and storage failures
//! are collected in the [`DownloadSummary`].

use crate::fetch::{FetchError, PriceFetcher};
use crate::period::{Granularity, Period};
use crate::schema::PriceRow;
use crate::store::{Coverage, PartitionStore, StorageError};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Date bounds and staleness policy for one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngestOptions {
    /// Floor date; nothing earlier is requested.
    pub start: NaiveDate,
    /// Last date to request; clamped to `today`.
    pub end: Option<NaiveDate>,
    pub today: NaiveDate,
    pub granularity: Granularity,
    /// Re-fetch every target period.
    pub force: bool,
}

impl IngestOptions {
    /// Last date any fetch may cover.
    pub fn effective_end(&self) -> NaiveDate {
        self.end.map_or(self.today, |end| end.min(self.today))
    }

    /// Every period the store should hold for each symbol.
    pub fn target_periods(&self) -> Vec<Period> {
        Period::range(self.start, self.effective_end(), self.granularity)
    }

    /// The period that may still receive new rows.
    pub fn current_period(&self) -> Period {
        Period::containing(self.today, self.granularity)
    }

    /// Span of `period` a committed partition must hold to be skipped.
    pub fn required_coverage(&self, period: Period) -> Coverage {
        Coverage::clipped(period, self.start, self.effective_end())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The provider was unreachable or blocked for this symbol's window.
    Fetch,
    /// The provider did not recognize or dropped the symbol.
    PartialSymbol,
    /// Listing existing partitions failed.
    StorageRead,
    /// A partition could not be committed.
    StorageWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFailure {
    pub symbol: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub symbols_total: usize,
    pub symbols_succeeded: usize,
    pub partitions_written: usize,
    /// Target partitions left untouched because they were already complete.
    pub partitions_skipped: usize,
    pub rows_written: usize,
    /// External provider calls, retries included.
    pub fetch_calls: usize,
    pub failures: Vec<SymbolFailure>,
}

impl DownloadSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_symbols(&self) -> BTreeSet<&str> {
        self.failures.iter().map(|f| f.symbol.as_str()).collect()
    }
}

/// A contiguous run of periods fetched with one date range.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub periods: Vec<Period>,
}

impl FetchWindow {
    fn key(&self) -> (NaiveDate, NaiveDate) {
        (self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolPlan {
    pub symbol: String,
    pub windows: Vec<FetchWindow>,
    pub skipped: usize,
}

/// Decide which of `targets` a symbol needs, given the periods it already
/// has and the span each holds, and group them into fetch windows clipped
/// to `[start, end]`.
pub fn plan_symbol(
    symbol: &str,
    existing: &BTreeMap<Period, Coverage>,
    targets: &[Period],
    options: &IngestOptions,
) -> SymbolPlan {
    let current = options.current_period();
    let complete = |p: &Period| {
        existing
            .get(p)
            .is_some_and(|held| held.covers(&options.required_coverage(*p)))
    };
    let needed: Vec<Period> = targets
        .iter()
        .copied()
        .filter(|p| options.force || *p == current || !complete(p))
        .collect();

    let end = options.effective_end();
    let mut windows: Vec<FetchWindow> = Vec::new();
    for period in needed.iter().copied() {
        let extends = windows
            .last()
            .and_then(|w| w.periods.last())
            .map(Period::succ)
            == Some(period);
        if let Some(w) = windows.last_mut().filter(|_| extends) {
            w.periods.push(period);
            w.end = period.last_day().min(end);
        } else {
            windows.push(FetchWindow {
                start: period.first_day().max(options.start),
                end: period.last_day().min(end),
                periods: vec![period],
            });
        }
    }

    SymbolPlan {
        symbol: symbol.to_string(),
        windows,
        skipped: targets.len() - needed.len(),
    }
}

/// Rows and per-symbol failures of one fetched window.
struct WindowData {
    rows: BTreeMap<String, Vec<PriceRow>>,
    failures: BTreeMap<String, String>,
    errors: BTreeMap<String, FetchError>,
}

#[derive(Default)]
struct SymbolReport {
    partitions_written: usize,
    rows_written: usize,
    failures: Vec<SymbolFailure>,
}

/// Bring the bronze store up to date for `symbols`.
///
/// Fetch groups and per-symbol writes run on `pool`.
pub fn download_symbols(
    fetcher: &PriceFetcher,
    store: &PartitionStore,
    symbols: &[String],
    options: &IngestOptions,
    pool: &rayon::ThreadPool,
) -> DownloadSummary {
    let mut seen = BTreeSet::new();
    let symbols: Vec<&String> = symbols.iter().filter(|s| seen.insert(*s)).collect();

    let mut summary = DownloadSummary {
        symbols_total: symbols.len(),
        ..Default::default()
    };
    let targets = options.target_periods();

    let mut plans = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        match existing_coverage(store, symbol) {
            Ok(existing) => plans.push(plan_symbol(symbol, &existing, &targets, options)),
            Err(e) => {
                tracing::warn!(%symbol, error = %e, "could not list partitions, skipping symbol");
                summary.failures.push(SymbolFailure {
                    symbol: symbol.clone(),
                    kind: FailureKind::StorageRead,
                    message: e.to_string(),
                });
            }
        }
    }

    let mut groups: BTreeMap<(NaiveDate, NaiveDate), Vec<String>> = BTreeMap::new();
    for plan in &plans {
        summary.partitions_skipped += plan.skipped;
        for window in &plan.windows {
            groups
                .entry(window.key())
                .or_default()
                .push(plan.symbol.clone());
        }
    }

    tracing::info!(
        source = fetcher.source_name(),
        symbols = summary.symbols_total,
        target_periods = targets.len(),
        fetch_groups = groups.len(),
        skipped = summary.partitions_skipped,
        "ingestion planned"
    );

    let calls_before = fetcher.total_calls();
    let fetched: Vec<((NaiveDate, NaiveDate), Result<WindowData, FetchError>)> =
        pool.install(|| {
            groups
                .par_iter()
                .map(|(&(start, end), group)| match fetcher.fetch(group, start, end) {
                    Ok(outcome) => {
                        let data = WindowData {
                            rows: outcome.rows_by_symbol(group),
                            failures: outcome
                                .failures
                                .into_iter()
                                .map(|f| (f.symbol, f.reason))
                                .collect(),
                            errors: outcome.errors.into_iter().collect(),
                        };
                        ((start, end), Ok(data))
                    }
                    Err(e) => {
                        tracing::warn!(
                            %start, %end,
                            symbols = group.len(),
                            error = %e,
                            "fetch failed for window"
                        );
                        ((start, end), Err(e))
                    }
                })
                .collect()
        });

    summary.fetch_calls = fetcher.total_calls() - calls_before;
    let windows: BTreeMap<(NaiveDate, NaiveDate), Result<WindowData, FetchError>> =
        fetched.into_iter().collect();

    let reports: Vec<SymbolReport> = pool.install(|| {
        plans
            .par_iter()
            .map(|plan| write_symbol(store, plan, &windows, options.granularity))
            .collect()
    });

    for (plan, report) in plans.iter().zip(reports) {
        summary.partitions_written += report.partitions_written;
        summary.rows_written += report.rows_written;
        if report.failures.is_empty() {
            summary.symbols_succeeded += 1;
        } else {
            tracing::debug!(
                symbol = %plan.symbol,
                failures = report.failures.len(),
                "symbol incomplete"
            );
        }
        summary.failures.extend(report.failures);
    }

    tracing::info!(
        succeeded = summary.symbols_succeeded,
        failed = summary.failed_symbols().len(),
        partitions_written = summary.partitions_written,
        rows_written = summary.rows_written,
        fetch_calls = summary.fetch_calls,
        "ingestion complete"
    );

    summary
}

/// Committed periods of `symbol` with the span each holds.
fn existing_coverage(
    store: &PartitionStore,
    symbol: &str,
) -> Result<BTreeMap<Period, Coverage>, StorageError> {
    store
        .list_partitions(Some(symbol))?
        .iter()
        .map(|key| store.partition_coverage(key).map(|held| (key.period, held)))
        .collect()
}

/// Split one symbol's fetched rows by period and commit every planned
/// period, empty ones included, with the span its window covered.
fn write_symbol(
    store: &PartitionStore,
    plan: &SymbolPlan,
    windows: &BTreeMap<(NaiveDate, NaiveDate), Result<WindowData, FetchError>>,
    granularity: Granularity,
) -> SymbolReport {
    let mut report = SymbolReport::default();
    let symbol = plan.symbol.as_str();
    let mut fail = |kind, message: String| {
        report.failures.push(SymbolFailure {
            symbol: symbol.to_string(),
            kind,
            message,
        })
    };

    let mut to_write: Vec<(Period, Coverage, Vec<PriceRow>)> = Vec::new();
    for window in &plan.windows {
        let data = match windows.get(&window.key()) {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                fail(FailureKind::Fetch, e.to_string());
                continue;
            }
            None => continue,
        };
        if let Some(e) = data.errors.get(symbol) {
            fail(FailureKind::Fetch, e.to_string());
            continue;
        }
        if let Some(reason) = data.failures.get(symbol) {
            fail(FailureKind::PartialSymbol, reason.clone());
            continue;
        }

        let mut by_period: BTreeMap<Period, Vec<PriceRow>> =
            window.periods.iter().map(|p| (*p, Vec::new())).collect();
        for row in data.rows.get(symbol).into_iter().flatten() {
            if let Some(rows) = by_period.get_mut(&Period::containing(row.date, granularity)) {
                rows.push(row.clone());
            }
        }
        to_write.extend(by_period.into_iter().map(|(period, rows)| {
            let coverage = Coverage::clipped(period, window.start, window.end);
            (period, coverage, rows)
        }));
    }

    for (period, coverage, rows) in to_write {
        match store.write_partition_covering(symbol, period, &rows, coverage) {
            Ok(_) => {
                report.partitions_written += 1;
                report.rows_written += rows.len();
            }
            Err(e) => {
                tracing::warn!(%symbol, %period, error = %e, "partition write failed");
                report.failures.push(SymbolFailure {
                    symbol: symbol.to_string(),
                    kind: FailureKind::StorageWrite,
                    message: e.to_string(),
                });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn options(force: bool) -> IngestOptions {
        IngestOptions {
            start: d(2020, 3, 15),
            end: None,
            today: d(2024, 6, 10),
            granularity: Granularity::Year,
            force,
        }
    }

    fn years(ys: &[i32]) -> BTreeMap<Period, Coverage> {
        ys.iter()
            .map(|y| (Period::Year(*y), Coverage::full(Period::Year(*y))))
            .collect()
    }

    #[test]
    fn targets_run_from_floor_through_today() {
        let opts = options(false);
        assert_eq!(
            opts.target_periods(),
            (2020..=2024).map(Period::Year).collect::<Vec<_>>()
        );

        let future_end = IngestOptions {
            end: Some(d(2030, 1, 1)),
            ..opts
        };
        assert_eq!(future_end.effective_end(), d(2024, 6, 10));
    }

    #[test]
    fn empty_store_needs_one_clipped_window() {
        let opts = options(false);
        let plan = plan_symbol("SPY", &BTreeMap::new(), &opts.target_periods(), &opts);

        assert_eq!(plan.skipped, 0);
        assert_eq!(plan.windows.len(), 1);
        assert_eq!(plan.windows[0].start, d(2020, 3, 15));
        assert_eq!(plan.windows[0].end, d(2024, 6, 10));
        assert_eq!(plan.windows[0].periods.len(), 5);
    }

    #[test]
    fn only_current_period_is_refetched_when_history_exists() {
        let opts = options(false);
        let existing = years(&[2020, 2021, 2022, 2023, 2024]);
        let plan = plan_symbol("SPY", &existing, &opts.target_periods(), &opts);

        assert_eq!(plan.skipped, 4);
        assert_eq!(
            plan.windows,
            vec![FetchWindow {
                start: d(2024, 1, 1),
                end: d(2024, 6, 10),
                periods: vec![Period::Year(2024)],
            }]
        );
    }

    #[test]
    fn gaps_split_into_separate_windows() {
        let opts = options(false);
        let existing = years(&[2021, 2022]);
        let plan = plan_symbol("SPY", &existing, &opts.target_periods(), &opts);

        let ranges: Vec<_> = plan.windows.iter().map(|w| (w.start, w.end)).collect();
        assert_eq!(
            ranges,
            vec![(d(2020, 3, 15), d(2020, 12, 31)), (d(2023, 1, 1), d(2024, 6, 10))]
        );
        assert_eq!(plan.skipped, 2);
    }

    #[test]
    fn force_refetches_everything() {
        let opts = options(true);
        let existing = years(&[2020, 2021, 2022, 2023]);
        let plan = plan_symbol("SPY", &existing, &opts.target_periods(), &opts);
        assert_eq!(plan.skipped, 0);
        assert_eq!(plan.windows.len(), 1);
    }

    #[test]
    fn floor_after_today_plans_nothing() {
        let opts = IngestOptions {
            start: d(2025, 1, 1),
            ..options(false)
        };
        let plan = plan_symbol("SPY", &BTreeMap::new(), &opts.target_periods(), &opts);
        assert!(plan.windows.is_empty());
        assert_eq!(plan.skipped, 0);
    }

    #[test]
    fn month_granularity_windows() {
        let opts = IngestOptions {
            start: d(2024, 1, 1),
            granularity: Granularity::Month,
            ..options(false)
        };
        let existing: BTreeMap<Period, Coverage> = (1..=5)
            .map(|month| Period::Month { year: 2024, month })
            .map(|p| (p, Coverage::full(p)))
            .collect();
        let plan = plan_symbol("SPY", &existing, &opts.target_periods(), &opts);

        assert_eq!(plan.skipped, 5);
        assert_eq!(plan.windows[0].start, d(2024, 6, 1));
        assert_eq!(plan.windows[0].end, d(2024, 6, 10));
    }

    #[test]
    fn partition_cut_short_by_end_is_refetched_once_end_moves() {
        let mut existing = years(&[2020, 2021]);
        let cut = Coverage::clipped(Period::Year(2022), d(2022, 1, 1), d(2022, 6, 30));
        existing.insert(Period::Year(2022), cut);

        // Same end as the run that wrote it: nothing to do.
        let bounded = IngestOptions {
            end: Some(d(2022, 6, 30)),
            ..options(false)
        };
        let plan = plan_symbol("SPY", &existing, &bounded.target_periods(), &bounded);
        assert!(plan.windows.is_empty());
        assert_eq!(plan.skipped, 3);

        let open = options(false);
        let plan = plan_symbol("SPY", &existing, &open.target_periods(), &open);
        assert_eq!(plan.skipped, 2);
        assert_eq!(
            plan.windows,
            vec![FetchWindow {
                start: d(2022, 1, 1),
                end: d(2024, 6, 10),
                periods: vec![Period::Year(2022), Period::Year(2023), Period::Year(2024)],
            }]
        );
    }

    #[test]
    fn earlier_floor_refetches_the_clipped_first_period() {
        let mut existing = years(&[2021, 2022, 2023]);
        let opts = options(false);
        existing.insert(
            Period::Year(2020),
            Coverage::clipped(Period::Year(2020), opts.start, d(2020, 12, 31)),
        );
        let plan = plan_symbol("SPY", &existing, &opts.target_periods(), &opts);
        assert_eq!(plan.skipped, 4);

        let earlier = IngestOptions {
            start: d(2020, 1, 1),
            ..opts
        };
        let plan = plan_symbol("SPY", &existing, &earlier.target_periods(), &earlier);
        assert_eq!(plan.windows[0].start, d(2020, 1, 1));
        assert_eq!(plan.windows[0].periods[0], Period::Year(2020));
    }
}
