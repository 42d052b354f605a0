//! Symbol universe: The tradable symbols and their optional sectors.
//!
//! Two on-disk formats are accepted, chosen by file extension:
//! - CSV with a `symbol` column and an optional `sector` column
//! - TOML with a `[sectors]` table mapping sector names to ticker lists
//!
//! Symbols are trimmed and upper-cased; a symbol listed twice keeps its first
//! sector.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("read universe file {path}: {message}")]
    Read { path: String, message: String },

    #[error("parse universe: {0}")]
    Parse(String),

    #[error("universe is empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseEntry {
    pub symbol: String,
    pub sector: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Universe {
    entries: Vec<UniverseEntry>,
}

#[derive(Debug, Deserialize)]
struct CsvEntry {
    symbol: String,
    #[serde(default)]
    sector: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TomlUniverse {
    sectors: BTreeMap<String, Vec<String>>,
}

fn normalize_symbol(raw: &str) -> Option<String> {
    let symbol = raw.trim().to_ascii_uppercase();
    (!symbol.is_empty()).then_some(symbol)
}

impl Universe {
    pub fn from_entries(entries: impl IntoIterator<Item = UniverseEntry>) -> Self {
        let mut seen = BTreeSet::new();
        let entries = entries
            .into_iter()
            .filter_map(|e| {
                let symbol = normalize_symbol(&e.symbol)?;
                let sector = e
                    .sector
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
                seen.insert(symbol.clone())
                    .then_some(UniverseEntry { symbol, sector })
            })
            .collect();
        Self { entries }
    }

    /// Load a universe from a `.csv` or `.toml` file.
    pub fn from_file(path: &Path) -> Result<Self, UniverseError> {
        let content = std::fs::read_to_string(path).map_err(|e| UniverseError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let universe = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content)?,
            _ => Self::from_csv(&content)?,
        };
        if universe.is_empty() {
            return Err(UniverseError::Empty);
        }
        Ok(universe)
    }

    pub fn from_csv(content: &str) -> Result<Self, UniverseError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());
        let entries = reader
            .deserialize::<CsvEntry>()
            .map(|record| {
                record
                    .map(|r| UniverseEntry {
                        symbol: r.symbol,
                        sector: r.sector,
                    })
                    .map_err(|e| UniverseError::Parse(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_entries(entries))
    }

    pub fn from_toml(content: &str) -> Result<Self, UniverseError> {
        let parsed: TomlUniverse =
            toml::from_str(content).map_err(|e| UniverseError::Parse(e.to_string()))?;
        Ok(Self::from_entries(parsed.sectors.into_iter().flat_map(
            |(sector, tickers)| {
                tickers.into_iter().map(move |symbol| UniverseEntry {
                    symbol,
                    sector: Some(sector.clone()),
                })
            },
        )))
    }

    pub fn entries(&self) -> &[UniverseEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every symbol, in file order.
    pub fn symbols(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.symbol.clone()).collect()
    }

    /// Symbols of one sector (case-insensitive match). `None` if no symbol
    /// carries that sector.
    pub fn sector_symbols(&self, sector: &str) -> Option<Vec<String>> {
        let symbols: Vec<String> = self
            .entries
            .iter()
            .filter(|e| {
                e.sector
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(sector))
            })
            .map(|e| e.symbol.clone())
            .collect();
        (!symbols.is_empty()).then_some(symbols)
    }

    pub fn sector_names(&self) -> BTreeSet<&str> {
        self.entries
            .iter()
            .filter_map(|e| e.sector.as_deref())
            .collect()
    }
}
