//! Row types for the bronze (prices) and silver (features) layers, and the
//! columnar schemas they are persisted with.

use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Daily OHLCV observation for one symbol. Unique per (symbol, date).
///
/// Missing provider values are stored as NaN (prices) or 0 (volume).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Lagged close and simple return for one (symbol, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub symbol: String,
    pub date: NaiveDate,
    pub close: f64,
    pub close_lag_1: Option<f64>,
    pub returns: Option<f64>,
}

/// Expected columns of a bronze partition file.
pub struct PriceSchema;

impl PriceSchema {
    pub fn schema() -> Schema {
        Schema::from_iter(vec![
            Field::new("symbol".into(), DataType::String),
            Field::new("date".into(), DataType::Date),
            Field::new("open".into(), DataType::Float64),
            Field::new("high".into(), DataType::Float64),
            Field::new("low".into(), DataType::Float64),
            Field::new("close".into(), DataType::Float64),
            Field::new("volume".into(), DataType::UInt64),
        ])
    }
}

/// Expected columns of a silver dataset file.
pub struct FeatureSchema;

impl FeatureSchema {
    pub fn schema() -> Schema {
        Schema::from_iter(vec![
            Field::new("symbol".into(), DataType::String),
            Field::new("date".into(), DataType::Date),
            Field::new("close".into(), DataType::Float64),
            Field::new("close_lag_1".into(), DataType::Float64),
            Field::new("returns".into(), DataType::Float64),
        ])
    }
}

/// Check that `df` carries every column of `expected` with the right type.
pub fn validate(df: &DataFrame, expected: &Schema) -> Result<(), SchemaError> {
    let actual = df.schema();

    for field in expected.iter_fields() {
        let actual_dtype = actual
            .get(field.name())
            .ok_or_else(|| SchemaError::MissingColumn(field.name().to_string()))?;
        if actual_dtype != field.dtype() {
            return Err(SchemaError::TypeMismatch {
                column: field.name().to_string(),
                expected: field.dtype().clone(),
                actual: actual_dtype.clone(),
            });
        }
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },
}
