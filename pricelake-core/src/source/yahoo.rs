//! Yahoo Finance price source.
//!
//! Fetches daily OHLCV quotes from Yahoo's v8 chart API, one symbol per call.
//! Maps HTTP outcomes onto [`SourceError`] and feeds the shared circuit
//! breaker; retries are left to the fetcher.
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes. [`super::CsvDirSource`] is the offline fallback.

use super::circuit_breaker::CircuitBreaker;
use super::{PriceSource, QuoteColumns, SourceBatch, SourceError, SymbolSeries};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com/v8/finance/chart";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

pub struct YahooSource {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    base_url: String,
}

impl YahooSource {
    pub fn new(
        circuit_breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()?;

        Ok(Self {
            client,
            circuit_breaker,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point the source at a different chart endpoint (mirrors, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    fn chart_url(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> String {
        let start_ts = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
        // period2 is exclusive; ask up to the start of the following day.
        let end_ts = end
            .succ_opt()
            .unwrap_or(end)
            .and_time(chrono::NaiveTime::MIN)
            .and_utc()
            .timestamp();
        format!(
            "{}/{}?period1={start_ts}&period2={end_ts}&interval=1d&events=history",
            self.base_url,
            urlencoding::encode(symbol)
        )
    }

    /// Turn a chart response into the series for one symbol.
    fn parse_response(symbol: &str, resp: ChartResponse) -> Result<SymbolSeries, SourceError> {
        let Some(results) = resp.chart.result else {
            return match resp.chart.error {
                Some(err) if err.code == "Not Found" => Ok(SymbolSeries::Unknown {
                    reason: err.description,
                }),
                Some(err) => Err(SourceError::Rejected(format!(
                    "{}: {}",
                    err.code, err.description
                ))),
                None => Err(SourceError::Rejected(format!(
                    "empty result with no error for {symbol}"
                ))),
            };
        };

        let Some(data) = results.into_iter().next() else {
            return Ok(SymbolSeries::Quotes(QuoteColumns::default()));
        };

        // No timestamps: the symbol exists but has no bars in range.
        let Some(timestamps) = data.timestamp else {
            return Ok(SymbolSeries::Quotes(QuoteColumns::default()));
        };

        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::Rejected(format!("no quote data for {symbol}")))?;

        let mut columns = QuoteColumns::default();
        for (i, &ts) in timestamps.iter().enumerate() {
            let date = chrono::DateTime::from_timestamp(ts, 0)
                .map(|dt| dt.naive_utc().date())
                .ok_or_else(|| SourceError::Rejected(format!("invalid timestamp: {ts}")))?;

            columns.push(
                date,
                quote.open.get(i).copied().flatten(),
                quote.high.get(i).copied().flatten(),
                quote.low.get(i).copied().flatten(),
                quote.close.get(i).copied().flatten(),
                quote.volume.get(i).copied().flatten(),
            );
        }

        Ok(SymbolSeries::Quotes(columns))
    }

    fn fetch_one(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SymbolSeries, SourceError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(SourceError::CircuitOpen);
        }

        let url = self.chart_url(symbol, start, end);
        let resp = self.client.get(&url).send().map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                self.circuit_breaker.record_failure();
            }
            SourceError::Unreachable(e.to_string())
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            self.circuit_breaker.trip();
            return Err(SourceError::CircuitOpen);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.circuit_breaker.record_failure();
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(SourceError::RateLimited { retry_after_secs });
        }
        if status.is_server_error() {
            self.circuit_breaker.record_failure();
            return Err(SourceError::Unreachable(format!("HTTP {status} for {symbol}")));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SourceError::Rejected("Yahoo Finance requires authentication".into()));
        }

        // 404 still carries a chart error body ("Not Found").
        let chart: ChartResponse = resp.json().map_err(|e| {
            SourceError::Rejected(format!("failed to parse response for {symbol}: {e}"))
        })?;

        let series = Self::parse_response(symbol, chart)?;
        self.circuit_breaker.record_success();
        Ok(series)
    }
}

impl PriceSource for YahooSource {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch_prices(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SourceBatch, SourceError> {
        let mut batch = SourceBatch::default();
        for symbol in symbols {
            let series = self.fetch_one(symbol, start, end)?;
            batch.insert(symbol.clone(), series);
        }
        Ok(batch)
    }
}
