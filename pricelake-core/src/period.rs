//! Periods: The fixed time buckets a symbol's history is partitioned into.
//!
//! A period's text form (`2024`, `2024-03`) is used verbatim in partition
//! directory names and parses back without knowing the granularity.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Partition granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Year,
    Month,
}

/// A single time bucket.
///
/// Ordering is chronological for periods of the same granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    Year(i32),
    Month { year: i32, month: u32 },
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid period '{0}'")]
pub struct ParsePeriodError(pub String);

impl Period {
    /// The period of the given granularity that contains `date`.
    pub fn containing(date: NaiveDate, granularity: Granularity) -> Self {
        match granularity {
            Granularity::Year => Period::Year(date.year()),
            Granularity::Month => Period::Month {
                year: date.year(),
                month: date.month(),
            },
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Period::Year(_) => Granularity::Year,
            Period::Month { .. } => Granularity::Month,
        }
    }

    /// First calendar day of the period.
    pub fn first_day(&self) -> NaiveDate {
        let (year, month) = match *self {
            Period::Year(year) => (year, 1),
            Period::Month { year, month } => (year, month),
        };
        NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Last calendar day of the period.
    pub fn last_day(&self) -> NaiveDate {
        self.succ()
            .first_day()
            .pred_opt()
            .unwrap_or(NaiveDate::MAX)
    }

    /// The next period of the same granularity.
    pub fn succ(&self) -> Self {
        match *self {
            Period::Year(year) => Period::Year(year + 1),
            Period::Month { year, month: 12 } => Period::Month {
                year: year + 1,
                month: 1,
            },
            Period::Month { year, month } => Period::Month {
                year,
                month: month + 1,
            },
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        Period::containing(date, self.granularity()) == *self
    }

    /// Every period of `granularity` from the one containing `from` through
    /// the one containing `to`, inclusive. Empty when `from > to`.
    pub fn range(from: NaiveDate, to: NaiveDate, granularity: Granularity) -> Vec<Period> {
        if from > to {
            return Vec::new();
        }
        let last = Period::containing(to, granularity);
        let mut current = Period::containing(from, granularity);
        let mut periods = vec![current];
        while current != last {
            current = current.succ();
            periods.push(current);
        }
        periods
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Year(year) => write!(f, "{year:04}"),
            Period::Month { year, month } => write!(f, "{year:04}-{month:02}"),
        }
    }
}

impl FromStr for Period {
    type Err = ParsePeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePeriodError(s.to_string());
        let digits = |part: &str, len: usize| {
            part.len() == len && part.bytes().all(|b| b.is_ascii_digit())
        };

        match s.split_once('-') {
            None if digits(s, 4) => s.parse().map(Period::Year).map_err(|_| err()),
            Some((year, month)) if digits(year, 4) && digits(month, 2) => {
                let year: i32 = year.parse().map_err(|_| err())?;
                let month: u32 = month.parse().map_err(|_| err())?;
                if !(1..=12).contains(&month) {
                    return Err(err());
                }
                Ok(Period::Month { year, month })
            }
            _ => Err(err()),
        }
    }
}
