//! pricelake core: Partitioned price storage, fetching, ingestion and features.
//!
//! This crate contains the whole pipeline:
//! - Row types and columnar schemas for the bronze and silver layers
//! - Period bucketing and the atomically replaced partition store
//! - Price sources (Yahoo Finance, CSV directory) behind one trait
//! - The fetcher (batching, retries, normalization)
//! - The ingestion controller, which only fetches missing and current periods
//! - The feature builder (lagged close and returns)
//! - The pipeline manager tying both stages to one configuration

pub mod config;
pub mod features;
pub mod fetch;
pub mod ingest;
pub mod manager;
pub mod period;
pub mod schema;
pub mod source;
pub mod store;
pub mod universe;

pub use config::{ConfigError, PipelineConfig};
pub use features::{FeatureError, FeatureSummary};
pub use fetch::{FetchError, PartialSymbolFailure, PriceFetcher, RetryPolicy};
pub use ingest::{DownloadSummary, FailureKind, SymbolFailure};
pub use manager::DataManager;
pub use period::{Granularity, Period};
pub use schema::{FeatureRow, PriceRow};
pub use source::{PriceSource, SourceError};
pub use store::{Coverage, PartitionKey, PartitionStore, StorageError};
pub use universe::Universe;
