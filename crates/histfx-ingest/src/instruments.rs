//! Formats, granularities and instruments published by histdata.com

use histfx_common::HistfxError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Download platform of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Format {
    #[serde(rename = "MT")]
    MetaTrader,
    #[serde(rename = "NT")]
    NinjaTrader,
    #[serde(rename = "MS")]
    MetaStock,
    #[serde(rename = "ASCII")]
    Ascii,
    #[serde(rename = "XLSX")]
    Excel,
}

impl Format {
    pub const ALL: [Format; 5] = [
        Format::MetaTrader,
        Format::NinjaTrader,
        Format::MetaStock,
        Format::Ascii,
        Format::Excel,
    ];

    /// Path segment used in archive URLs
    pub fn slug(self) -> &'static str {
        match self {
            Format::MetaTrader => "metatrader",
            Format::NinjaTrader => "ninjatrader",
            Format::MetaStock => "metastock",
            Format::Ascii => "ascii",
            Format::Excel => "excel",
        }
    }

    /// Directory name under the data directory
    pub fn key(self) -> &'static str {
        match self {
            Format::MetaTrader => "MT",
            Format::NinjaTrader => "NT",
            Format::MetaStock => "MS",
            Format::Ascii => "ASCII",
            Format::Excel => "XLSX",
        }
    }

    /// Granularities the site publishes for this platform
    pub fn granularities(self) -> &'static [Granularity] {
        match self {
            Format::MetaTrader | Format::MetaStock | Format::Excel => &[Granularity::M1],
            Format::NinjaTrader => &[
                Granularity::M1,
                Granularity::TickLast,
                Granularity::TickBid,
                Granularity::TickAsk,
            ],
            Format::Ascii => &[Granularity::M1, Granularity::Tick],
        }
    }

    pub fn supports(self, granularity: Granularity) -> bool {
        self.granularities().contains(&granularity)
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.slug() == slug)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Format {
    type Err = HistfxError;

    /// Accepts either the URL slug or the directory key, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.slug() == lower || f.key().eq_ignore_ascii_case(&lower))
            .ok_or_else(|| HistfxError::config(format!("Unknown format: {}", s)))
    }
}

/// Time resolution of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "M1")]
    M1,
    #[serde(rename = "T")]
    Tick,
    #[serde(rename = "T_LAST")]
    TickLast,
    #[serde(rename = "T_BID")]
    TickBid,
    #[serde(rename = "T_ASK")]
    TickAsk,
}

impl Granularity {
    pub const ALL: [Granularity; 5] = [
        Granularity::M1,
        Granularity::Tick,
        Granularity::TickLast,
        Granularity::TickBid,
        Granularity::TickAsk,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Granularity::M1 => "1-minute-bar-quotes",
            Granularity::Tick => "tick-data-quotes",
            Granularity::TickLast => "tick-last-quotes",
            Granularity::TickBid => "tick-bid-quotes",
            Granularity::TickAsk => "tick-ask-quotes",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Granularity::M1 => "M1",
            Granularity::Tick => "T",
            Granularity::TickLast => "T_LAST",
            Granularity::TickBid => "T_BID",
            Granularity::TickAsk => "T_ASK",
        }
    }

    /// Bars are published per year once the year is over; ticks always per month.
    pub fn is_bar(self) -> bool {
        matches!(self, Granularity::M1)
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.slug() == slug)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Granularity {
    type Err = HistfxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.key().eq_ignore_ascii_case(s) || g.slug() == s)
            .ok_or_else(|| HistfxError::config(format!("Unknown timeframe: {}", s)))
    }
}

/// Every instrument histdata.com publishes, as lowercase URL keys.
pub const INSTRUMENTS: [&str; 66] = [
    "eurusd", "eurchf", "eurgbp", "eurjpy", "euraud", "usdcad", "usdchf", "usdjpy", "usdmxn",
    "gbpchf", "gbpjpy", "gbpusd", "audjpy", "audusd", "chfjpy", "nzdjpy", "nzdusd", "xauusd",
    "eurcad", "audcad", "cadjpy", "eurnzd", "grxeur", "nzdcad", "sgdjpy", "usdhkd", "usdnok",
    "usdtry", "xauaud", "audchf", "auxaud", "eurhuf", "eurpln", "frxeur", "hkxhkd", "nzdchf",
    "spxusd", "usdhuf", "usdpln", "usdzar", "xauchf", "zarjpy", "bcousd", "etxeur", "eurczk",
    "eursek", "gbpaud", "gbpnzd", "jpxjpy", "udxusd", "usdczk", "usdsek", "wtiusd", "xaueur",
    "audnzd", "cadchf", "eurdkk", "eurnok", "eurtry", "gbpcad", "nsxusd", "ukxgbp", "usddkk",
    "usdsgd", "xagusd", "xaugbp",
];

/// Normalize a user-supplied instrument (`EUR/USD`, `eur_usd`, `EURUSD`) to its URL key.
pub fn normalize_instrument(raw: &str) -> Result<String, HistfxError> {
    let key: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    if INSTRUMENTS.contains(&key.as_str()) {
        Ok(key)
    } else {
        Err(HistfxError::config(format!("Unknown instrument: {}", raw)))
    }
}
