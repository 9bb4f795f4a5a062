//! Calendar-month keys and minute/hour conversion.
//!
//! Minutes are the integer source of truth for logged work. Hours only appear
//! at reporting boundaries and in retainer arithmetic, always as `Decimal`.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::BillingError;

const MINUTES_PER_HOUR: i64 = 60;

/// A calendar month, stored as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth(NaiveDate);

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(Self)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        // Day 1 exists for every month a valid date can fall in.
        Self(date.with_day(1).unwrap_or(date))
    }

    pub fn year(self) -> i32 {
        self.0.year()
    }

    pub fn month(self) -> u32 {
        self.0.month()
    }

    pub fn first_day(self) -> NaiveDate {
        self.0
    }

    /// Last calendar day of the month.
    pub fn last_day(self) -> NaiveDate {
        self.next()
            .and_then(|next| next.0.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn next(self) -> Option<Self> {
        self.add_months(1)
    }

    pub fn add_months(self, months: u32) -> Option<Self> {
        self.0.checked_add_months(Months::new(months)).map(Self)
    }

    /// True when any day of this month lies in `[from, until)`.
    pub fn intersects(self, from: NaiveDate, until: Option<NaiveDate>) -> bool {
        let starts_before_month_ends = from <= self.last_day();
        let ends_after_month_starts = until.is_none_or(|end| end > self.first_day());
        starts_before_month_ends && ends_after_month_starts
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let (year, month) = trimmed
            .split_once('-')
            .ok_or_else(|| format!("invalid month '{}': expected YYYY-MM", trimmed))?;
        let year: i32 = year
            .parse()
            .map_err(|_| format!("invalid year in '{}'", trimmed))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("invalid month in '{}'", trimmed))?;
        Self::new(year, month).ok_or_else(|| format!("month out of range: '{}'", trimmed))
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An inclusive date range billed by one invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BillingPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, BillingError> {
        if end < start {
            return Err(BillingError::Validation(format!(
                "period end {} is before period start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn first_month(&self) -> YearMonth {
        YearMonth::from_date(self.start)
    }

    pub fn last_month(&self) -> YearMonth {
        YearMonth::from_date(self.end)
    }

    /// True when any day of `month` falls inside the period.
    pub fn touches(&self, month: YearMonth) -> bool {
        self.start <= month.last_day() && month.first_day() <= self.end
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Every month from `start` through `end`, inclusive. Empty when `end < start`.
pub fn month_range(start: YearMonth, end: YearMonth) -> Vec<YearMonth> {
    let mut out = Vec::new();
    let mut cursor = Some(start);
    while let Some(month) = cursor {
        if month > end {
            break;
        }
        out.push(month);
        cursor = month.next();
    }
    out
}

/// Exact decimal conversion used at reporting boundaries.
pub fn minutes_to_hours(minutes: i64) -> Decimal {
    Decimal::from(minutes) / Decimal::from(MINUTES_PER_HOUR)
}

/// Hours to whole minutes, rounded to the nearest minute.
pub fn hours_to_minutes(hours: Decimal) -> i64 {
    (hours * Decimal::from(MINUTES_PER_HOUR))
        .round()
        .to_i64()
        .unwrap_or(if hours.is_sign_negative() { i64::MIN } else { i64::MAX })
}
