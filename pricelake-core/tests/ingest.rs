//! Ingestion controller integration tests: staleness, idempotence, batching
//! and per-symbol failure isolation.

mod common;

use common::{config, d, manager, tree_hashes, MockSource};
use pricelake_core::{ConfigError, DataManager, FailureKind, Granularity, Period};
use std::sync::Arc;

#[test]
fn first_run_materializes_every_target_period() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(&["SPY", "QQQ"]));
    let mgr = manager(config(tmp.path(), &["SPY", "QQQ"], d(2024, 6, 10)), source.clone());

    let summary = mgr.download_all();

    assert!(summary.all_succeeded(), "{:?}", summary.failures);
    assert_eq!(summary.symbols_total, 2);
    assert_eq!(summary.symbols_succeeded, 2);
    assert_eq!(summary.partitions_written, 10);
    assert_eq!(summary.partitions_skipped, 0);
    // Identical windows share one batched call.
    assert_eq!(source.call_count(), 1);
    assert_eq!(summary.fetch_calls, 1);

    let call = &source.calls()[0];
    assert_eq!(call.symbols, vec!["QQQ".to_string(), "SPY".to_string()]);
    assert_eq!((call.start, call.end), (d(2020, 1, 1), d(2024, 6, 10)));

    let periods: Vec<_> = mgr
        .partitions(Some("SPY"))
        .unwrap()
        .into_iter()
        .map(|k| k.period)
        .collect();
    assert_eq!(periods, (2020..=2024).map(Period::Year).collect::<Vec<_>>());

    let rows = mgr.read_prices(Some("SPY")).unwrap();
    assert_eq!(summary.rows_written, rows.len() * 2);
    assert_eq!(rows.first().unwrap().date, d(2020, 1, 1));
    assert_eq!(rows.last().unwrap().date, d(2024, 6, 10));
}

#[test]
fn second_run_only_refetches_current_period_and_keeps_history_bytes() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(&["SPY", "QQQ"]));
    let cfg = config(tmp.path(), &["SPY", "QQQ"], d(2024, 6, 10));
    let bronze_root = cfg.storage.bronze_root.clone();
    let mgr = manager(cfg, source.clone());

    mgr.download_all();
    let historical = |root: &std::path::Path| {
        tree_hashes(root)
            .into_iter()
            .filter(|(path, _)| !path.contains("_2024"))
            .collect::<Vec<_>>()
    };
    let before = historical(bronze_root.as_path());
    assert_eq!(before.len(), 8);
    source.reset_calls();

    let summary = mgr.download_all();

    assert!(summary.all_succeeded());
    assert_eq!(summary.partitions_skipped, 8);
    assert_eq!(summary.partitions_written, 2);
    let calls = source.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!((calls[0].start, calls[0].end), (d(2024, 1, 1), d(2024, 6, 10)));
    assert_eq!(historical(bronze_root.as_path()), before);
}

#[test]
fn period_written_while_current_is_completed_after_a_year_rolls_over() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(&["SPY"]));

    let first = manager(config(tmp.path(), &["SPY"], d(2023, 12, 27)), source.clone());
    let summary = first.download_all();
    assert_eq!(summary.partitions_written, 4);
    drop(first);
    source.reset_calls();

    let second = manager(config(tmp.path(), &["SPY"], d(2024, 3, 1)), source.clone());
    let summary = second.download_all();

    // 2023 was fetched only through Dec 27, so it is refetched with 2024.
    assert_eq!(summary.partitions_skipped, 3);
    assert_eq!(summary.partitions_written, 2);
    let calls = source.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!((calls[0].start, calls[0].end), (d(2023, 1, 1), d(2024, 3, 1)));
    assert_eq!(second.partitions(Some("SPY")).unwrap().len(), 5);
    let late_december = second
        .read_prices(Some("SPY"))
        .unwrap()
        .into_iter()
        .filter(|r| r.date > d(2023, 12, 27) && r.date <= d(2023, 12, 31))
        .count();
    assert_eq!(late_december, 2);
    source.reset_calls();

    // Now only the current period remains stale.
    let summary = second.download_all();
    assert_eq!(summary.partitions_skipped, 4);
    assert_eq!(source.calls()[0].start, d(2024, 1, 1));
}

#[test]
fn force_refetches_history() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(&["SPY"]));
    let mut cfg = config(tmp.path(), &["SPY"], d(2024, 6, 10));
    manager(cfg.clone(), source.clone()).download_all();

    cfg.ingest.force = true;
    let summary = manager(cfg, source.clone()).download_all();

    assert_eq!(summary.partitions_skipped, 0);
    assert_eq!(summary.partitions_written, 5);
}

#[test]
fn one_unknown_symbol_does_not_stop_the_rest() {
    let tmp = tempfile::tempdir().unwrap();
    let symbols = ["AAA", "BBB", "CCC", "DDD", "ZZZZ"];
    let source = Arc::new(MockSource::new(&["AAA", "BBB", "CCC", "DDD"]));
    let mgr = manager(config(tmp.path(), &symbols, d(2024, 6, 10)), source);

    let summary = mgr.download_all();

    assert_eq!(summary.symbols_total, 5);
    assert_eq!(summary.symbols_succeeded, 4);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].symbol, "ZZZZ");
    assert_eq!(summary.failures[0].kind, FailureKind::PartialSymbol);
    assert!(mgr.partitions(Some("ZZZZ")).unwrap().is_empty());
    for symbol in &symbols[..4] {
        assert_eq!(mgr.partitions(Some(*symbol)).unwrap().len(), 5);
    }
}

#[test]
fn symbol_dropped_from_response_is_a_partial_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(&["SPY", "QQQ"]).omitting("QQQ"));
    let mgr = manager(config(tmp.path(), &["SPY", "QQQ"], d(2024, 6, 10)), source);

    let summary = mgr.download_all();

    assert_eq!(summary.symbols_succeeded, 1);
    assert_eq!(summary.failed_symbols().into_iter().collect::<Vec<_>>(), vec!["QQQ"]);
    assert!(mgr.partitions(Some("QQQ")).unwrap().is_empty());
}

#[test]
fn rejected_batch_falls_back_to_single_symbol_calls() {
    let tmp = tempfile::tempdir().unwrap();
    let symbols = ["AAA", "BBB", "CCC"];
    let source = Arc::new(MockSource::new(&symbols).rejecting_batches());
    let mgr = manager(config(tmp.path(), &symbols, d(2024, 6, 10)), source.clone());

    let summary = mgr.download_all();

    assert!(summary.all_succeeded());
    assert_eq!(source.call_count(), 4);
    assert_eq!(summary.fetch_calls, 4);
    assert!(source.calls()[1..].iter().all(|c| c.symbols.len() == 1));
}

#[test]
fn batch_size_is_capped_by_the_source() {
    let tmp = tempfile::tempdir().unwrap();
    let symbols = ["AAA", "BBB", "CCC"];
    let source = Arc::new(MockSource::new(&symbols).max_batch(2));
    let mgr = manager(config(tmp.path(), &symbols, d(2024, 6, 10)), source.clone());

    mgr.download_all();

    let sizes: Vec<_> = source.calls().iter().map(|c| c.symbols.len()).collect();
    assert_eq!(sizes, vec![2, 1]);
}

#[test]
fn transient_failures_are_retried() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(&["SPY"]).failing_first(2));
    let mut cfg = config(tmp.path(), &["SPY"], d(2024, 6, 10));
    cfg.fetch.max_retries = 3;
    let mgr = manager(cfg, source.clone());

    let summary = mgr.download_all();

    assert!(summary.all_succeeded());
    assert_eq!(summary.fetch_calls, 3);
    assert_eq!(mgr.partitions(Some("SPY")).unwrap().len(), 5);
}

#[test]
fn exhausted_retries_record_fetch_failures_and_write_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(&["SPY", "QQQ"]).failing_first(100));
    let mut cfg = config(tmp.path(), &["SPY", "QQQ"], d(2024, 6, 10));
    cfg.fetch.max_retries = 2;
    let mgr = manager(cfg, source.clone());

    let summary = mgr.download_all();

    assert_eq!(summary.symbols_succeeded, 0);
    assert_eq!(summary.fetch_calls, 3);
    assert_eq!(summary.failures.len(), 2);
    assert!(summary.failures.iter().all(|f| f.kind == FailureKind::Fetch));
    assert!(mgr.partitions(None).unwrap().is_empty());
}

#[test]
fn sector_download_touches_only_that_sector() {
    let tmp = tempfile::tempdir().unwrap();
    // config() assigns alternating Even/Odd sectors.
    let symbols = ["AAA", "BBB", "CCC"];
    let source = Arc::new(MockSource::new(&symbols));
    let mgr = manager(config(tmp.path(), &symbols, d(2024, 6, 10)), source);

    let summary = mgr.download_sector("even").unwrap();

    assert_eq!(summary.symbols_total, 2);
    let stored: Vec<_> = mgr.bronze().symbols().unwrap().into_iter().collect();
    assert_eq!(stored, vec!["AAA".to_string(), "CCC".to_string()]);
}

#[test]
fn end_date_bounds_targets_and_current_period_still_refreshes() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(&["SPY"]));
    let mut cfg = config(tmp.path(), &["SPY"], d(2024, 6, 10));
    cfg.ingest.end = Some(d(2022, 6, 30));
    let mgr = manager(cfg, source.clone());

    let summary = mgr.download_all();

    assert_eq!(summary.partitions_written, 3);
    assert_eq!(source.calls()[0].end, d(2022, 6, 30));
    source.reset_calls();

    // 2022 is not the current period, so a rerun fetches nothing.
    let summary = mgr.download_all();
    assert_eq!(summary.partitions_skipped, 3);
    assert_eq!(source.call_count(), 0);
}

#[test]
fn period_cut_short_by_end_is_completed_by_an_unbounded_run() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(&["SPY"]));
    let mut cfg = config(tmp.path(), &["SPY"], d(2024, 6, 10));
    cfg.ingest.end = Some(d(2022, 6, 30));
    manager(cfg.clone(), source.clone()).download_all();
    source.reset_calls();

    cfg.ingest.end = None;
    let mgr = manager(cfg, source.clone());
    let summary = mgr.download_all();

    assert!(summary.all_succeeded());
    assert_eq!(summary.partitions_skipped, 2);
    assert_eq!(summary.partitions_written, 3);
    let calls = source.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!((calls[0].start, calls[0].end), (d(2022, 1, 1), d(2024, 6, 10)));

    let second_half = mgr
        .read_prices(Some("SPY"))
        .unwrap()
        .into_iter()
        .filter(|r| r.date >= d(2022, 7, 1) && r.date <= d(2022, 12, 31))
        .count();
    assert!(second_half > 100, "only {second_half} rows in 2022-07..12");
}

#[test]
fn unreachable_symbol_fails_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let symbols = ["AAA", "BBB", "CCC"];
    let source = Arc::new(MockSource::new(&symbols).max_batch(1).unreachable_for("BBB"));
    let mut cfg = config(tmp.path(), &symbols, d(2024, 6, 10));
    cfg.fetch.max_retries = 1;
    let mgr = manager(cfg, source.clone());

    let summary = mgr.download_all();

    assert_eq!(summary.symbols_succeeded, 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].symbol, "BBB");
    assert_eq!(summary.failures[0].kind, FailureKind::Fetch);
    // AAA and CCC once each, BBB once plus one retry.
    assert_eq!(summary.fetch_calls, 4);
    assert_eq!(mgr.partitions(Some("AAA")).unwrap().len(), 5);
    assert_eq!(mgr.partitions(Some("CCC")).unwrap().len(), 5);
    assert!(mgr.partitions(Some("BBB")).unwrap().is_empty());
}

#[test]
fn unreachable_symbol_after_batch_fallback_fails_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let symbols = ["AAA", "BBB", "CCC"];
    let source = Arc::new(
        MockSource::new(&symbols)
            .rejecting_batches()
            .unreachable_for("CCC"),
    );
    let mut cfg = config(tmp.path(), &symbols, d(2024, 6, 10));
    cfg.fetch.max_retries = 0;
    let mgr = manager(cfg, source);

    let summary = mgr.download_all();

    assert_eq!(summary.failed_symbols().into_iter().collect::<Vec<_>>(), vec!["CCC"]);
    assert_eq!(summary.symbols_succeeded, 2);
    assert_eq!(mgr.partitions(Some("AAA")).unwrap().len(), 5);
}

#[test]
fn switching_granularity_over_existing_bronze_is_a_config_error() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(MockSource::new(&["SPY"]));
    let mut cfg = config(tmp.path(), &["SPY"], d(2024, 6, 10));
    manager(cfg.clone(), source.clone()).download_all();

    cfg.ingest.granularity = Granularity::Month;
    let result = DataManager::with_source(cfg, source);

    assert!(matches!(
        result,
        Err(ConfigError::GranularityMismatch {
            found: Granularity::Year,
            ..
        })
    ));
}
