//! Partition key to directory mapping.
//!
//! Layout: `{root}/{SYM}/{SYM}_{period}/part-NNNNN.parquet` where `SYM` is the
//! percent-encoded symbol. Encoding is injective, and a leading `.` is escaped
//! so no symbol can collide with the hidden staging entries.

use crate::period::Period;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifies one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub symbol: String,
    #[serde(with = "period_text")]
    pub period: Period,
}

impl PartitionKey {
    pub fn new(symbol: impl Into<String>, period: Period) -> Self {
        Self {
            symbol: symbol.into(),
            period,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.period)
    }
}

/// Encode a symbol into a single safe path component.
pub fn encode_symbol(symbol: &str) -> String {
    let encoded = urlencoding::encode(symbol);
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{rest}"),
        None => encoded.into_owned(),
    }
}

/// Inverse of [`encode_symbol`]. Returns `None` for names that no symbol maps to.
pub fn decode_symbol(component: &str) -> Option<String> {
    if component.is_empty() || component.starts_with('.') {
        return None;
    }
    let decoded: Cow<'_, str> = urlencoding::decode(component).ok()?;
    // Reject non-canonical spellings so the mapping stays one-to-one.
    (encode_symbol(&decoded) == component).then(|| decoded.into_owned())
}

/// Directory holding every partition of a symbol.
pub fn symbol_dir(root: &Path, symbol: &str) -> PathBuf {
    root.join(encode_symbol(symbol))
}

/// Name of a partition directory inside its symbol directory.
pub fn partition_dir_name(key: &PartitionKey) -> String {
    format!("{}_{}", encode_symbol(&key.symbol), key.period)
}

pub fn partition_dir(root: &Path, key: &PartitionKey) -> PathBuf {
    symbol_dir(root, &key.symbol).join(partition_dir_name(key))
}

/// Parse a partition directory name found under the symbol directory named
/// `symbol_component`.
pub fn parse_partition_dir_name(symbol_component: &str, name: &str) -> Option<PartitionKey> {
    let symbol = decode_symbol(symbol_component)?;
    let period = name
        .strip_prefix(symbol_component)?
        .strip_prefix('_')?
        .parse()
        .ok()?;
    Some(PartitionKey { symbol, period })
}

/// File name of the `index`-th file of a multi-file write.
pub fn part_file_name(index: usize) -> String {
    format!("part-{index:05}.parquet")
}

mod period_text {
    use crate::period::Period;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(period: &Period, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(period)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Period, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
