//! Year-month values as the archive addresses them

use chrono::{Datelike, FixedOffset, Utc};
use histfx_common::HistfxError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// First year the archive carries data for.
pub const FIRST_YEAR: i32 = 2000;

const SEPARATORS: [char; 5] = ['-', '_', '.', ':', ' '];

/// A calendar year with an optional month. `month == None` means the whole year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: Option<u32>,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self {
            year,
            month: Some(month),
        }
    }

    pub fn year(year: i32) -> Self {
        Self { year, month: None }
    }

    /// `2000-01`, the oldest period the archive serves.
    pub fn earliest() -> Self {
        Self::new(FIRST_YEAR, 1)
    }

    /// Current month on the archive's clock (EST, no daylight saving).
    pub fn now_est() -> Self {
        let today = match FixedOffset::west_opt(5 * 3600) {
            Some(est) => Utc::now().with_timezone(&est).date_naive(),
            None => Utc::now().date_naive(),
        };
        Self::new(today.year(), today.month())
    }

    /// Parse user input, resolving `now` against the given clock.
    ///
    /// Accepts `YYYY`, `YYYYMM`, `YYYY<sep>MM` (separators `- _ . : space`),
    /// `now` and `start`.
    pub fn parse_with_now(input: &str, now: YearMonth) -> Result<Self, HistfxError> {
        let trimmed = input.trim();
        let invalid = || HistfxError::InvalidYearMonth(input.to_string());

        match trimmed.to_lowercase().as_str() {
            "now" => return Ok(now),
            "start" => return Ok(Self::earliest()),
            _ => {},
        }

        if !trimmed.is_ascii() {
            return Err(invalid());
        }

        let (year, month) = match trimmed.split_once(SEPARATORS) {
            Some((year, month)) => (year, Some(month)),
            None if trimmed.len() == 4 => (trimmed, None),
            None if trimmed.len() == 6 => (&trimmed[..4], Some(&trimmed[4..])),
            None => return Err(invalid()),
        };

        if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;

        let month = match month {
            None => None,
            Some(m) => {
                let m: u32 = m.parse().map_err(|_| invalid())?;
                if !(1..=12).contains(&m) {
                    return Err(invalid());
                }
                Some(m)
            },
        };

        Ok(Self { year, month })
    }

    /// `YYYYMM` key; whole-year values use month `00`.
    pub fn datemonth(&self) -> String {
        format!("{:04}{:02}", self.year, self.month.unwrap_or(0))
    }

    /// Earliest month this value covers.
    pub fn first_month(&self) -> u32 {
        self.month.unwrap_or(1)
    }

    /// Latest month this value covers, never past `now`.
    pub fn last_month(&self, now: YearMonth) -> u32 {
        match self.month {
            Some(month) => month,
            None if self.year == now.year => now.first_month(),
            None => 12,
        }
    }

    fn ordinal(year: i32, month: u32) -> i64 {
        i64::from(year) * 12 + i64::from(month)
    }

    /// Whether any part of this value lies after `now`.
    pub fn is_after(&self, now: YearMonth) -> bool {
        Self::ordinal(self.year, self.first_month()) > Self::ordinal(now.year, now.first_month())
    }

    pub fn is_before_archive(&self) -> bool {
        self.year < FIRST_YEAR
    }

    /// Whether a range starting at `self` and ending at `end` runs backwards.
    pub fn starts_after(&self, end: &YearMonth, now: YearMonth) -> bool {
        Self::ordinal(self.year, self.first_month())
            > Self::ordinal(end.year, end.last_month(now))
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.month {
            Some(month) => write!(f, "{:04}-{:02}", self.year, month),
            None => write!(f, "{:04}", self.year),
        }
    }
}

impl FromStr for YearMonth {
    type Err = HistfxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_now(s, Self::now_est())
    }
}
