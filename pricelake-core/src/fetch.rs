//! Price fetcher: Turns a symbol set and date range into normalized
//! [`PriceRow`]s using a [`PriceSource`].
//!
//! - Symbols are batched up to the source's `max_batch_size`
//! - A rejected multi-symbol batch falls back to one call per symbol
//! - Transient network failures are retried with exponential backoff
//! - Unknown or dropped symbols become [`PartialSymbolFailure`]s, not errors
//! - A request that still fails after retries fails only the symbols it
//!   carried; later requests go ahead

use crate::schema::PriceRow;
use crate::source::{PriceSource, QuoteColumns, SourceBatch, SourceError, SymbolSeries};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The provider could not be used at all for this request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("price source unreachable after {attempts} attempt(s): {message}")]
    Unreachable { attempts: u32, message: String },

    #[error("price source blocked (circuit breaker open)")]
    CircuitOpen,
}

/// One symbol the provider could not serve; the rest of the batch is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialSymbolFailure {
    pub symbol: String,
    pub reason: String,
}

/// Rows and per-symbol failures of one `fetch` call.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Sorted by (symbol, date), unique per (symbol, date).
    pub rows: Vec<PriceRow>,
    pub failures: Vec<PartialSymbolFailure>,
    /// Symbols whose request failed outright, with the error it failed on.
    pub errors: Vec<(String, FetchError)>,
    /// External calls made, retries included.
    pub calls: usize,
}

impl FetchOutcome {
    /// Rows grouped per symbol. Symbols that returned no rows but did not
    /// fail are present with an empty vector.
    pub fn rows_by_symbol(&self, requested: &[String]) -> BTreeMap<String, Vec<PriceRow>> {
        let mut grouped: BTreeMap<String, Vec<PriceRow>> = requested
            .iter()
            .filter(|s| !self.failures.iter().any(|f| &f.symbol == *s))
            .filter(|s| !self.errors.iter().any(|(symbol, _)| symbol == *s))
            .map(|s| (s.clone(), Vec::new()))
            .collect();
        for row in &self.rows {
            grouped.entry(row.symbol.clone()).or_default().push(row.clone());
        }
        grouped
    }
}

/// Bounded retry with exponential backoff: `base_delay * 2^(attempt - 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt - 1))
    }
}

/// Wraps a price source with batching, retries and normalization.
#[derive(Clone)]
pub struct PriceFetcher {
    source: Arc<dyn PriceSource>,
    retry: RetryPolicy,
    batch_size: usize,
    calls: Arc<AtomicUsize>,
}

impl PriceFetcher {
    pub fn new(source: Arc<dyn PriceSource>, retry: RetryPolicy) -> Self {
        let batch_size = source.max_batch_size().max(1);
        Self {
            source,
            retry,
            batch_size,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cap the batch size below what the source allows.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, self.source.max_batch_size().max(1));
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Total external calls made through this fetcher.
    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Fetch every symbol over `[start, end]`.
    ///
    /// Fails only when no request got an answer; otherwise per-symbol
    /// problems are reported in [`FetchOutcome::failures`] and
    /// [`FetchOutcome::errors`]. Once the circuit breaker opens, the
    /// remaining symbols are failed without calling the source.
    pub fn fetch(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchOutcome, FetchError> {
        let mut outcome = FetchOutcome::default();
        if symbols.is_empty() || start > end {
            return Ok(outcome);
        }

        let mut unique: Vec<String> = symbols.to_vec();
        unique.sort();
        unique.dedup();

        let mut answered = false;
        let mut blocked = false;
        for chunk in unique.chunks(self.batch_size) {
            if blocked {
                self.record_error(&mut outcome, chunk, SourceError::CircuitOpen);
                continue;
            }
            match self.call_with_retry(chunk, start, end, &mut outcome.calls) {
                Ok(batch) => {
                    answered = true;
                    normalize_into(&mut outcome, chunk, batch, start, end);
                }
                Err(SourceError::Rejected(reason)) if chunk.len() > 1 => {
                    tracing::warn!(
                        source = self.source.name(),
                        symbols = chunk.len(),
                        %reason,
                        "batch rejected, falling back to per-symbol requests"
                    );
                    for symbol in chunk {
                        let single = std::slice::from_ref(symbol);
                        if blocked {
                            self.record_error(&mut outcome, single, SourceError::CircuitOpen);
                            continue;
                        }
                        match self.call_with_retry(single, start, end, &mut outcome.calls) {
                            Ok(batch) => {
                                answered = true;
                                normalize_into(&mut outcome, single, batch, start, end);
                            }
                            Err(SourceError::Rejected(reason)) => {
                                answered = true;
                                record_partial(&mut outcome, symbol, reason);
                            }
                            Err(e) => {
                                blocked |= matches!(e, SourceError::CircuitOpen);
                                self.record_error(&mut outcome, single, e);
                            }
                        }
                    }
                }
                Err(SourceError::Rejected(reason)) => {
                    answered = true;
                    record_partial(&mut outcome, &chunk[0], reason);
                }
                Err(e) => {
                    blocked |= matches!(e, SourceError::CircuitOpen);
                    self.record_error(&mut outcome, chunk, e);
                }
            }
        }

        if !answered {
            if let Some((_, e)) = outcome.errors.first() {
                return Err(e.clone());
            }
        }

        outcome
            .rows
            .sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.date.cmp(&b.date)));
        Ok(outcome)
    }

    fn call_with_retry(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        calls: &mut usize,
    ) -> Result<SourceBatch, SourceError> {
        let mut attempt = 0;
        loop {
            *calls += 1;
            self.calls.fetch_add(1, Ordering::Relaxed);

            match self.source.fetch_prices(symbols, start, end) {
                Ok(batch) => return Ok(batch),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    tracing::debug!(
                        source = self.source.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying price request"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_error(&self, outcome: &mut FetchOutcome, symbols: &[String], e: SourceError) {
        let error = self.to_fetch_error(e);
        tracing::warn!(
            source = self.source.name(),
            symbols = ?symbols,
            %error,
            "price request failed"
        );
        outcome
            .errors
            .extend(symbols.iter().map(|s| (s.clone(), error.clone())));
    }

    fn to_fetch_error(&self, e: SourceError) -> FetchError {
        match e {
            SourceError::CircuitOpen => FetchError::CircuitOpen,
            other => FetchError::Unreachable {
                attempts: self.retry.max_retries + 1,
                message: other.to_string(),
            },
        }
    }
}

fn record_partial(outcome: &mut FetchOutcome, symbol: &str, reason: String) {
    tracing::warn!(%symbol, %reason, "symbol skipped by price source");
    outcome.failures.push(PartialSymbolFailure {
        symbol: symbol.to_string(),
        reason,
    });
}

/// Flatten the grouped response for `requested` into rows.
fn normalize_into(
    outcome: &mut FetchOutcome,
    requested: &[String],
    mut batch: SourceBatch,
    start: NaiveDate,
    end: NaiveDate,
) {
    for symbol in requested {
        match batch.series.remove(symbol) {
            Some(SymbolSeries::Quotes(columns)) => {
                outcome.rows.extend(quotes_to_rows(symbol, &columns, start, end));
            }
            Some(SymbolSeries::Unknown { reason }) => record_partial(outcome, symbol, reason),
            None => record_partial(outcome, symbol, "omitted from provider response".into()),
        }
    }
    for extra in batch.series.keys() {
        tracing::debug!(symbol = %extra, "ignoring unrequested symbol in response");
    }
}

/// One row per trading day: all-missing days and days outside the range are
/// dropped, and a repeated date keeps its last observation.
pub fn quotes_to_rows(
    symbol: &str,
    columns: &QuoteColumns,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<PriceRow> {
    let mut by_date: BTreeMap<NaiveDate, PriceRow> = BTreeMap::new();

    for (i, &date) in columns.dates.iter().enumerate() {
        if date < start || date > end {
            continue;
        }
        let open = columns.open.get(i).copied().flatten();
        let high = columns.high.get(i).copied().flatten();
        let low = columns.low.get(i).copied().flatten();
        let close = columns.close.get(i).copied().flatten();
        let volume = columns.volume.get(i).copied().flatten();

        // Holidays and halted days come back as all-null rows.
        if open.is_none()
            && high.is_none()
            && low.is_none()
            && close.is_none()
            && volume.is_none()
        {
            continue;
        }

        by_date.insert(
            date,
            PriceRow {
                symbol: symbol.to_string(),
                date,
                open: open.unwrap_or(f64::NAN),
                high: high.unwrap_or(f64::NAN),
                low: low.unwrap_or(f64::NAN),
                close: close.unwrap_or(f64::NAN),
                volume: volume.unwrap_or(0),
            },
        );
    }

    by_date.into_values().collect()
}
