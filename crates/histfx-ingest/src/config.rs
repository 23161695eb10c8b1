//! Pipeline configuration
//!
//! [`PipelineConfig`] is built once by the CLI and passed explicitly to every
//! stage. It is also the first message a stage worker process receives, so it
//! round-trips through JSON.

use crate::instruments::{Format, Granularity, INSTRUMENTS};
use crate::urls::DEFAULT_BASE_URL;
use crate::yearmonth::YearMonth;
use histfx_common::HistfxError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ============================================================================
// Defaults
// ============================================================================

/// Lines per upload slice.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Root of the per-unit directory tree.
pub const DEFAULT_DATA_DIRECTORY: &str = "data";

/// Form submission endpoint that answers with the zip archive.
pub const DEFAULT_POST_URL: &str = "http://www.histdata.com/get.php";

/// InfluxDB connection file looked up in the working directory.
pub const DEFAULT_INFLUX_FILE: &str = "influxdb.yaml";

// ============================================================================
// CPU utilization
// ============================================================================

/// How much of the machine a stage pool may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CpuUtilization {
    Low,
    #[default]
    Medium,
    High,
    /// Percentage of available cores, 1..=200.
    Percent(u32),
}

impl CpuUtilization {
    /// Worker count for `cores` logical cores.
    ///
    /// One core is left for the orchestrator once the raw count exceeds two;
    /// below that the count is halved, rounding up.
    pub fn worker_count(self, cores: usize) -> usize {
        let n = cores.max(1) as f64;
        let raw = match self {
            CpuUtilization::Low => (n / 2.5).ceil(),
            CpuUtilization::Medium => (n / 1.5).ceil(),
            CpuUtilization::High => n,
            CpuUtilization::Percent(p) => (n * f64::from(p) / 100.0).ceil(),
        } as usize;

        let count = if raw > 2 { raw - 1 } else { raw.div_ceil(2) };
        count.max(1)
    }

    /// Worker count for this machine.
    pub fn workers(self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.worker_count(cores)
    }
}

impl fmt::Display for CpuUtilization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuUtilization::Low => write!(f, "low"),
            CpuUtilization::Medium => write!(f, "medium"),
            CpuUtilization::High => write!(f, "high"),
            CpuUtilization::Percent(p) => write!(f, "{}", p),
        }
    }
}

impl FromStr for CpuUtilization {
    type Err = HistfxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(CpuUtilization::Low),
            "medium" => Ok(CpuUtilization::Medium),
            "high" => Ok(CpuUtilization::High),
            other => match other.trim_end_matches('%').parse::<u32>() {
                Ok(p) if (1..=200).contains(&p) => Ok(CpuUtilization::Percent(p)),
                _ => Err(HistfxError::config(format!(
                    "Invalid CPU utilization '{}': expected low, medium, high or 1-200",
                    s
                ))),
            },
        }
    }
}

impl TryFrom<String> for CpuUtilization {
    type Error = HistfxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CpuUtilization> for String {
    fn from(value: CpuUtilization) -> Self {
        value.to_string()
    }
}

// ============================================================================
// Summary ordering
// ============================================================================

/// Row order of the available-data table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    PairAsc,
    PairDsc,
    StartAsc,
    StartDsc,
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SortBy::PairAsc => "pair_asc",
            SortBy::PairDsc => "pair_dsc",
            SortBy::StartAsc => "start_asc",
            SortBy::StartDsc => "start_dsc",
        };
        f.write_str(name)
    }
}

impl FromStr for SortBy {
    type Err = HistfxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pair_asc" => Ok(SortBy::PairAsc),
            "pair_dsc" => Ok(SortBy::PairDsc),
            "start_asc" => Ok(SortBy::StartAsc),
            "start_dsc" => Ok(SortBy::StartDsc),
            _ => Err(HistfxError::config(format!(
                "Invalid sort order '{}': expected pair_asc, pair_dsc, start_asc or start_dsc",
                s
            ))),
        }
    }
}

// ============================================================================
// InfluxDB
// ============================================================================

/// Connection settings for the InfluxDB v2 write API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfluxConfig {
    pub org: String,
    pub bucket: String,
    pub url: String,
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
struct InfluxFile {
    #[serde(default)]
    influxdb: PartialInflux,
}

#[derive(Debug, Default, Deserialize)]
struct PartialInflux {
    org: Option<String>,
    bucket: Option<String>,
    url: Option<String>,
    token: Option<String>,
}

impl InfluxConfig {
    /// Load from a YAML file with an `influxdb:` root key, then apply
    /// `INFLUX_ORG`, `INFLUX_BUCKET`, `INFLUX_URL` and `INFLUX_TOKEN`.
    ///
    /// A missing file is fine as long as the environment fills every field.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut partial = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            serde_yaml::from_str::<InfluxFile>(&text)
                .map_err(|e| HistfxError::config(format!("{}: {}", path.display(), e)))?
                .influxdb
        } else {
            PartialInflux::default()
        };

        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        if let Some(v) = env("INFLUX_ORG") {
            partial.org = Some(v);
        }
        if let Some(v) = env("INFLUX_BUCKET") {
            partial.bucket = Some(v);
        }
        if let Some(v) = env("INFLUX_URL") {
            partial.url = Some(v);
        }
        if let Some(v) = env("INFLUX_TOKEN") {
            partial.token = Some(v);
        }

        let missing = |field: &str| {
            HistfxError::config(format!(
                "InfluxDB {} is not set in {} or INFLUX_{}",
                field,
                path.display(),
                field.to_uppercase()
            ))
        };

        Ok(Self {
            org: partial.org.ok_or_else(|| missing("org"))?,
            bucket: partial.bucket.ok_or_else(|| missing("bucket"))?,
            url: partial.url.ok_or_else(|| missing("url"))?,
            token: partial.token.ok_or_else(|| missing("token"))?,
        })
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Everything a pipeline run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub instruments: Vec<String>,
    pub formats: Vec<Format>,
    pub granularities: Vec<Granularity>,
    pub start: Option<YearMonth>,
    pub end: Option<YearMonth>,

    pub cpu_utilization: CpuUtilization,
    pub batch_size: usize,
    /// Minimum spacing between database writes; 0 disables throttling.
    pub flush_interval_ms: u64,
    pub data_directory: PathBuf,

    pub keep_archive: bool,
    pub delete_after_upload: bool,

    pub validate: bool,
    pub download: bool,
    pub extract: bool,
    pub convert: bool,
    pub merge: bool,
    pub upload: bool,
    pub available_remote_data: bool,

    pub by: SortBy,
    pub process_isolation: bool,

    pub base_url: String,
    pub post_url: String,

    pub influx: Option<InfluxConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            instruments: INSTRUMENTS.iter().map(|s| s.to_string()).collect(),
            formats: vec![Format::Ascii],
            granularities: vec![Granularity::M1],
            start: None,
            end: None,
            cpu_utilization: CpuUtilization::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: 0,
            data_directory: PathBuf::from(DEFAULT_DATA_DIRECTORY),
            keep_archive: false,
            delete_after_upload: false,
            validate: false,
            download: false,
            extract: false,
            convert: false,
            merge: false,
            upload: false,
            available_remote_data: false,
            by: SortBy::default(),
            process_isolation: true,
            base_url: DEFAULT_BASE_URL.to_string(),
            post_url: DEFAULT_POST_URL.to_string(),
            influx: None,
        }
    }
}

impl PipelineConfig {
    /// Apply the stage implications.
    ///
    /// `upload` needs `convert`, which needs `extract`, which needs
    /// `download`, which needs `validate`; `merge` needs `convert`. With no
    /// mode flag at all the run validates, downloads and extracts.
    pub fn resolve_flags(&mut self) {
        let any_mode = self.validate
            || self.download
            || self.extract
            || self.convert
            || self.merge
            || self.upload
            || self.available_remote_data;

        if !any_mode {
            self.validate = true;
            self.download = true;
            self.extract = true;
            return;
        }

        self.convert |= self.upload || self.merge;
        self.extract |= self.convert;
        self.download |= self.extract;
        self.validate |= self.download;
    }

    /// Reject configurations a run cannot honor.
    pub fn validate(&self, now: YearMonth) -> anyhow::Result<()> {
        if (self.convert || self.merge || self.upload)
            && self.formats.iter().any(|&f| f != Format::Ascii)
        {
            anyhow::bail!("Converting, merging and uploading are only supported for the ascii format");
        }

        for (name, value) in [("start", self.start), ("end", self.end)] {
            if let Some(ym) = value {
                if ym.is_before_archive() {
                    anyhow::bail!("The {} date {} is before the archive begins (2000-01)", name, ym);
                }
                if ym.is_after(now) {
                    anyhow::bail!("The {} date {} is in the future (now is {})", name, ym, now);
                }
            }
        }

        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start.starts_after(&end, now) {
                anyhow::bail!("The end date {} is before the start date {}", end, start);
            }
        }

        if self.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.upload && self.influx.is_none() {
            anyhow::bail!("Uploading requires an InfluxDB configuration");
        }

        if self.instruments.is_empty() || self.formats.is_empty() || self.granularities.is_empty() {
            anyhow::bail!("At least one pair, format and timeframe is required");
        }

        Ok(())
    }

    /// Worker count for a pool, before thread multiplication.
    pub fn workers(&self) -> usize {
        self.cpu_utilization.workers()
    }
}
