//! Request expansion: date ranges to archive page URLs
//!
//! histdata.com serves one download page per (platform, timeframe, pair,
//! period). Finished years of bar data are published as a single yearly
//! archive, while tick data and the still-running year are published per
//! month. [`RequestExpander`] turns a user request into exactly the set of
//! pages that exist under those rules, without touching the network.

use crate::instruments::{Format, Granularity};
use crate::yearmonth::YearMonth;
use histfx_common::HistfxError;
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_URL: &str = "http://www.histdata.com/download-free-forex-data/";

/// One addressable archive period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    Year(i32),
    Month(i32, u32),
}

impl Period {
    pub fn year(&self) -> i32 {
        match *self {
            Period::Year(year) | Period::Month(year, _) => year,
        }
    }

    pub fn month(&self) -> Option<u32> {
        match *self {
            Period::Year(_) => None,
            Period::Month(_, month) => Some(month),
        }
    }

    pub fn as_year_month(&self) -> YearMonth {
        YearMonth {
            year: self.year(),
            month: self.month(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Year(year) => write!(f, "{}", year),
            Period::Month(year, month) => write!(f, "{}/{}", year, month),
        }
    }
}

/// Everything an archive URL encodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UrlParts {
    pub format: Format,
    pub granularity: Granularity,
    pub instrument: String,
    pub period: Period,
}

impl UrlParts {
    pub fn to_url(&self, base_url: &str) -> String {
        format!(
            "{}?/{}/{}/{}/{}",
            base_url,
            self.format.slug(),
            self.granularity.slug(),
            self.instrument,
            self.period
        )
    }

    /// `base/<FORMAT>/<GRANULARITY>/<instrument>/<year>/[<month>/]`
    pub fn dir(&self, base_dir: &Path) -> PathBuf {
        let mut dir = base_dir
            .join(self.format.key())
            .join(self.granularity.key())
            .join(&self.instrument)
            .join(self.period.year().to_string());
        if let Some(month) = self.period.month() {
            dir.push(month.to_string());
        }
        dir
    }
}

/// Parse an archive URL back into its parts.
///
/// Only the query after `?` matters, so URLs built against a different base
/// (a local mock server, say) classify the same way.
pub fn classify(url: &str) -> Result<UrlParts, HistfxError> {
    let invalid = |why: &str| HistfxError::InvalidUrl(format!("{} ({})", url, why));

    let (_, query) = url.split_once('?').ok_or_else(|| invalid("no query"))?;
    let segments: Vec<&str> = query.split('/').filter(|s| !s.is_empty()).collect();

    let (format, granularity, instrument, year, month) = match segments.as_slice() {
        [format, granularity, instrument, year] => (format, granularity, instrument, year, None),
        [format, granularity, instrument, year, month] => {
            (format, granularity, instrument, year, Some(month))
        },
        _ => return Err(invalid("expected format/timeframe/pair/year[/month]")),
    };

    let format = Format::from_slug(format).ok_or_else(|| invalid("unknown format"))?;
    let granularity =
        Granularity::from_slug(granularity).ok_or_else(|| invalid("unknown timeframe"))?;
    let year: i32 = year.parse().map_err(|_| invalid("bad year"))?;

    let period = match month {
        None => Period::Year(year),
        Some(month) => {
            let month: u32 = month.parse().map_err(|_| invalid("bad month"))?;
            if !(1..=12).contains(&month) {
                return Err(invalid("month out of range"));
            }
            Period::Month(year, month)
        },
    };

    Ok(UrlParts {
        format,
        granularity,
        instrument: instrument.to_lowercase(),
        period,
    })
}

/// Generates the archive page URLs for a request.
///
/// `urls()` can be called any number of times; each call walks the same
/// finite sequence in format → timeframe → instrument → period order.
#[derive(Debug, Clone)]
pub struct RequestExpander {
    start: Option<YearMonth>,
    end: Option<YearMonth>,
    formats: Vec<Format>,
    instruments: Vec<String>,
    granularities: Vec<Granularity>,
    now: YearMonth,
    base_url: String,
}

impl RequestExpander {
    pub fn new(
        start: Option<YearMonth>,
        end: Option<YearMonth>,
        formats: impl IntoIterator<Item = Format>,
        instruments: impl IntoIterator<Item = String>,
        granularities: impl IntoIterator<Item = Granularity>,
    ) -> Self {
        Self {
            start,
            end,
            formats: formats.into_iter().collect(),
            instruments: instruments.into_iter().collect(),
            granularities: granularities.into_iter().collect(),
            now: YearMonth::now_est(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Pin the clock, so "current year" rules are reproducible.
    pub fn with_now(mut self, now: YearMonth) -> Self {
        self.now = now;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Valid (format, granularity, instrument) combinations, in request order.
    pub fn combinations(&self) -> impl Iterator<Item = (Format, Granularity, &str)> + '_ {
        self.formats.iter().flat_map(move |&format| {
            self.granularities
                .iter()
                .filter(move |&&granularity| format.supports(granularity))
                .flat_map(move |&granularity| {
                    self.instruments
                        .iter()
                        .map(move |instrument| (format, granularity, instrument.as_str()))
                })
        })
    }

    pub fn parts(&self) -> impl Iterator<Item = UrlParts> + '_ {
        self.combinations()
            .flat_map(move |(format, granularity, instrument)| {
                self.periods(granularity)
                    .into_iter()
                    .map(move |period| UrlParts {
                        format,
                        granularity,
                        instrument: instrument.to_string(),
                        period,
                    })
            })
    }

    pub fn urls(&self) -> impl Iterator<Item = String> + '_ {
        self.parts().map(move |parts| parts.to_url(&self.base_url))
    }

    /// Periods to request for one granularity.
    pub fn periods(&self, granularity: Granularity) -> Vec<Period> {
        match (self.start, self.end) {
            (Some(start), None) => self.single_point(start, granularity),
            (start, end) => {
                let start = start.unwrap_or_else(YearMonth::earliest);
                let end = end.unwrap_or(self.now);
                self.range(start, end, granularity)
            },
        }
    }

    fn single_point(&self, start: YearMonth, granularity: Granularity) -> Vec<Period> {
        let year = start.year;
        match start.month {
            None if year == self.now.year => months(year, 1, self.now.first_month()),
            None => whole_year(year, granularity),
            Some(month) if year == self.now.year => vec![Period::Month(year, month)],
            Some(_) if granularity.is_bar() => vec![Period::Year(year)],
            Some(month) => vec![Period::Month(year, month)],
        }
    }

    fn range(&self, start: YearMonth, end: YearMonth, granularity: Granularity) -> Vec<Period> {
        let first = start.first_month();
        let last = end.last_month(self.now);
        let bar = granularity.is_bar();

        let mut periods = Vec::new();
        for year in start.year..=end.year {
            let same_year = start.year == end.year;
            let chunk = if year == self.now.year {
                months(year, if same_year { first } else { 1 }, last)
            } else if bar {
                vec![Period::Year(year)]
            } else if same_year {
                months(year, first, last)
            } else if year == start.year {
                months(year, first, 12)
            } else if year == end.year {
                months(year, 1, last)
            } else {
                months(year, 1, 12)
            };
            periods.extend(chunk);
        }
        periods
    }
}

fn months(year: i32, from: u32, to: u32) -> Vec<Period> {
    (from..=to).map(|month| Period::Month(year, month)).collect()
}

fn whole_year(year: i32, granularity: Granularity) -> Vec<Period> {
    if granularity.is_bar() {
        vec![Period::Year(year)]
    } else {
        months(year, 1, 12)
    }
}
