//! Retention policy for finished recordings.
//!
//! A policy is a single number interpreted in exactly one unit, days or
//! months. The cutoff is computed from a caller-supplied "now"; month
//! arithmetic is calendar aware (31 March minus one month is 28/29 February).

use chrono::{DateTime, Duration, Months, TimeZone};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::RetentionError;

pub const MAX_RETENTION_DAYS: u32 = 30;
pub const MAX_RETENTION_MONTHS: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RetentionUnit {
    Days,
    Months,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "lowercase")]
pub enum RetentionPolicy {
    Days(u32),
    Months(u32),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Days(7)
    }
}

impl RetentionPolicy {
    pub fn new(value: u32, unit: RetentionUnit) -> Result<Self, RetentionError> {
        let (max, name) = match unit {
            RetentionUnit::Days => (MAX_RETENTION_DAYS, "days"),
            RetentionUnit::Months => (MAX_RETENTION_MONTHS, "months"),
        };
        if value == 0 || value > max {
            return Err(RetentionError::OutOfRange {
                value,
                unit: name,
                max,
            });
        }
        Ok(match unit {
            RetentionUnit::Days => RetentionPolicy::Days(value),
            RetentionUnit::Months => RetentionPolicy::Months(value),
        })
    }

    /// Parse the unit from text, as it arrives from the command layer.
    pub fn from_parts(value: u32, unit: &str) -> Result<Self, RetentionError> {
        let unit: RetentionUnit = unit
            .trim()
            .parse()
            .map_err(|_| RetentionError::UnknownUnit(unit.to_string()))?;
        Self::new(value, unit)
    }

    pub fn value(&self) -> u32 {
        match self {
            RetentionPolicy::Days(v) | RetentionPolicy::Months(v) => *v,
        }
    }

    pub fn unit(&self) -> RetentionUnit {
        match self {
            RetentionPolicy::Days(_) => RetentionUnit::Days,
            RetentionPolicy::Months(_) => RetentionUnit::Months,
        }
    }

    /// Recordings created strictly before this instant are expired.
    ///
    /// Returns `None` only when the subtraction leaves chrono's representable
    /// range, in which case nothing is old enough to delete.
    pub fn cutoff<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match *self {
            RetentionPolicy::Days(days) => now
                .clone()
                .checked_sub_signed(Duration::days(i64::from(days))),
            RetentionPolicy::Months(months) => now.clone().checked_sub_months(Months::new(months)),
        }
    }

    pub fn is_expired<Tz: TimeZone>(&self, created: &DateTime<Tz>, now: &DateTime<Tz>) -> bool {
        match self.cutoff(now) {
            Some(cutoff) => *created < cutoff,
            None => false,
        }
    }
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.value(), self.unit())
    }
}
