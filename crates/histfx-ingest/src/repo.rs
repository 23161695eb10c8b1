//! Available-data summary
//!
//! Scans the archive pages of every requested pair (ascii, 1-minute bars,
//! 2000-01 to now) and records the first and last month each pair has data
//! for. Results persist in `<data>/.repo`:
//!
//! ```json
//! {"eurusd": {"start": "200005", "end": "202405"}, "hash": "…", "hash_utc": 1716912000.0}
//! ```
//!
//! Pairs already in the file are not rescanned.

use crate::config::{PipelineConfig, SortBy};
use crate::influx::LineWriter;
use crate::instruments::{Format, Granularity};
use crate::pipeline::{LineWriterFactory, Pipeline};
use crate::queue::Records;
use crate::record::Record;
use crate::source::SourceClient;
use crate::stage::StageKind;
use crate::yearmonth::YearMonth;
use anyhow::{Context, Result};
use chrono::Utc;
use comfy_table::{presets::ASCII_MARKDOWN, Table};
use histfx_common::checksum::json_sha256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const REPO_FILE: &str = ".repo";

/// Units validated per page.
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// First and last month (`YYYYMM`) a pair has data for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRange {
    pub start: String,
    pub end: String,
}

impl PairRange {
    fn widen(&mut self, datemonth: &str) {
        if datemonth < self.start.as_str() {
            self.start = datemonth.to_string();
        }
        if datemonth > self.end.as_str() {
            self.end = datemonth.to_string();
        }
    }
}

/// `YYYY-MM` for display.
fn dashed(datemonth: &str) -> String {
    match (datemonth.get(..4), datemonth.get(4..)) {
        (Some(year), Some(month)) if !month.is_empty() => format!("{}-{}", year, month),
        _ => datemonth.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// UTC seconds of the last write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_utc: Option<f64>,
    #[serde(flatten)]
    pub pairs: BTreeMap<String, PairRange>,
}

impl RepoData {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let data = serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(data))
    }

    /// Rehash and write to `path`, creating parent directories.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.hash = Some(json_sha256(&self.pairs)?);
        self.hash_utc = Some(Utc::now().timestamp_millis() as f64 / 1000.0);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(self)?).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Widen the range of the unit's pair to cover its period.
    ///
    /// Whole-year units count as January of that year.
    pub fn record(&mut self, unit: &Record) {
        let pair = unit.instrument.to_lowercase();
        let datemonth = YearMonth::new(unit.year, unit.month.unwrap_or(1)).datemonth();

        match self.pairs.get_mut(&pair) {
            Some(range) => range.widen(&datemonth),
            None => {
                self.pairs.insert(
                    pair,
                    PairRange {
                        start: datemonth.clone(),
                        end: datemonth,
                    },
                );
            },
        }
    }

    /// Rows restricted to `pairs` (all rows when empty), in `by` order.
    pub fn rows(&self, by: SortBy, pairs: &[String]) -> Vec<(&str, &PairRange)> {
        let mut rows: Vec<(&str, &PairRange)> = self
            .pairs
            .iter()
            .filter(|(pair, _)| pairs.is_empty() || pairs.iter().any(|p| p == *pair))
            .map(|(pair, range)| (pair.as_str(), range))
            .collect();

        match by {
            SortBy::PairAsc => rows.sort_by(|a, b| a.0.cmp(b.0)),
            SortBy::PairDsc => rows.sort_by(|a, b| b.0.cmp(a.0)),
            SortBy::StartAsc => rows.sort_by(|a, b| a.1.start.cmp(&b.1.start)),
            SortBy::StartDsc => rows.sort_by(|a, b| b.1.start.cmp(&a.1.start)),
        }
        rows
    }

    pub fn table(&self, by: SortBy, pairs: &[String]) -> Table {
        let mut table = Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_header(vec!["Pair -p", "Start -s", "End -e"]);
        for (pair, range) in self.rows(by, pairs) {
            table.add_row(vec![pair.to_string(), dashed(&range.start), dashed(&range.end)]);
        }
        table
    }
}

/// Builds or refreshes the summary for the configured pairs.
pub struct AvailableData {
    config: PipelineConfig,
    source: Arc<dyn SourceClient>,
    page_size: usize,
    now: YearMonth,
}

impl AvailableData {
    pub fn new(config: PipelineConfig, source: Arc<dyn SourceClient>) -> Self {
        Self {
            config,
            source,
            page_size: DEFAULT_PAGE_SIZE,
            now: YearMonth::now_est(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_now(mut self, now: YearMonth) -> Self {
        self.now = now;
        self
    }

    pub fn path(&self) -> PathBuf {
        self.config.data_directory.join(REPO_FILE)
    }

    /// Load `.repo`, scan the pairs it lacks, and write it back if anything changed.
    pub fn collect(&self) -> Result<RepoData> {
        let path = self.path();
        let existing = RepoData::load(&path)?;
        let file_exists = existing.is_some();
        let mut repo = existing.unwrap_or_default();

        let missing: Vec<String> = self
            .config
            .instruments
            .iter()
            .filter(|pair| !repo.pairs.contains_key(pair.as_str()))
            .cloned()
            .collect();
        if file_exists && missing.is_empty() {
            debug!(path = %path.display(), "Summary is current");
            return Ok(repo);
        }

        self.scan(&missing, &mut repo)?;
        repo.save(&path)?;
        info!(path = %path.display(), pairs = repo.pairs.len(), "Summary written");
        Ok(repo)
    }

    fn scan(&self, pairs: &[String], repo: &mut RepoData) -> Result<()> {
        let config = PipelineConfig {
            instruments: pairs.to_vec(),
            formats: vec![Format::Ascii],
            granularities: vec![Granularity::M1],
            start: None,
            end: None,
            validate: true,
            ..self.config.clone()
        };
        let no_upload: LineWriterFactory = Box::new(|_: &PipelineConfig| -> Result<Box<dyn LineWriter>> {
            anyhow::bail!("The available-data scan does not upload")
        });
        let pipeline = Pipeline::new(config, Arc::clone(&self.source), no_upload).with_now(self.now);

        let pending = Records::new();
        pipeline.seed(&pending)?;
        let page = Records::new();
        let validated = Records::new();

        while pending.dump(&page, Some(self.page_size)) > 0 {
            pipeline.run_stage(StageKind::Validate, &page, &validated)?;
            for unit in page.drain() {
                repo.record(&unit);
            }
        }
        Ok(())
    }

    /// Print the table for the configured pairs and order.
    pub fn print(&self, repo: &RepoData) {
        println!("Data and date ranges available from HistData.com");
        println!("{}", repo.table(self.config.by, &self.config.instruments));
    }
}
