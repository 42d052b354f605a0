//! Price source trait and the raw response shapes sources produce.
//!
//! The PriceSource trait abstracts over data sources (Yahoo Finance, a CSV
//! directory) so the fetcher can be pointed at any of them and mocked in tests.
//! Sources return data grouped per symbol in columnar form; turning that into
//! one row per observation is the fetcher's job.

pub mod circuit_breaker;
pub mod csv_dir;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use csv_dir::CsvDirSource;
pub use yahoo::YahooSource;

use chrono::NaiveDate;
use std::collections::BTreeMap;
use thiserror::Error;

/// Column-per-field quotes for one symbol, as providers return them.
///
/// All vectors are expected to have the length of `dates`; shorter ones are
/// padded with missing values during normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteColumns {
    pub dates: Vec<NaiveDate>,
    pub open: Vec<Option<f64>>,
    pub high: Vec<Option<f64>>,
    pub low: Vec<Option<f64>>,
    pub close: Vec<Option<f64>>,
    pub volume: Vec<Option<u64>>,
}

impl QuoteColumns {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn push(
        &mut self,
        date: NaiveDate,
        open: Option<f64>,
        high: Option<f64>,
        low: Option<f64>,
        close: Option<f64>,
        volume: Option<u64>,
    ) {
        self.dates.push(date);
        self.open.push(open);
        self.high.push(high);
        self.low.push(low);
        self.close.push(close);
        self.volume.push(volume);
    }
}

/// What a source knows about one requested symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolSeries {
    /// Recognized; may hold zero observations for the range.
    Quotes(QuoteColumns),
    /// The provider does not know this symbol.
    Unknown { reason: String },
}

/// Response to one `fetch_prices` call, keyed by symbol.
///
/// Requested symbols missing from the map were silently dropped by the provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBatch {
    pub series: BTreeMap<String, SymbolSeries>,
}

impl SourceBatch {
    pub fn insert(&mut self, symbol: impl Into<String>, series: SymbolSeries) {
        self.series.insert(symbol.into(), series);
    }
}

/// Failures of a whole `fetch_prices` call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitOpen,

    /// The provider answered but refused or garbled this request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl SourceError {
    /// Whether repeating the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unreachable(_) | SourceError::RateLimited { .. })
    }
}

/// Trait for price providers.
///
/// Implementations handle the specifics of talking to one provider. The
/// fetcher sits above this trait and owns retries, batching and normalization.
pub trait PriceSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Largest number of symbols one `fetch_prices` call may carry.
    fn max_batch_size(&self) -> usize {
        1
    }

    /// Fetch daily quotes for `symbols` over `[start, end]`.
    fn fetch_prices(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SourceBatch, SourceError>;
}
