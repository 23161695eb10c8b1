//! Pipeline stages
//!
//! A [`Stage`] mutates one [`Record`] and says where it goes next. It never
//! touches the queues itself: [`execute_unit`] owns the queue contract, so a
//! stage behaves identically on the thread pool and inside a worker process.
//!
//! | Stage | Input status | Output status |
//! |---|---|---|
//! | validate | `NEW` | `VALIDATED` or `NO_SOURCE_DATA` |
//! | download | `VALIDATED` | `ARCHIVE_FETCHED` |
//! | extract | `ARCHIVE_FETCHED` | `EXTRACTED` |
//! | convert | `EXTRACTED` | `CONVERTED` |
//! | upload | `CONVERTED` | `UPLOADED` |

use crate::config::PipelineConfig;
use crate::convert;
use crate::extract::extract_csv;
use crate::influx;
use crate::queue::QueueHandle;
use crate::record::{Record, Status, COLUMNAR_FILE};
use crate::source::{HistdataClient, PageLookup, SourceClient};
use crate::writer::LineSink;
use anyhow::{Context, Result};
use histfx_common::HistfxError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happens to a unit after a stage has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Put into `next`.
    Forward,
    /// Leave the pipeline.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Validate,
    #[serde(rename = "download")]
    Fetch,
    Extract,
    Convert,
    Upload,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Validate,
        StageKind::Fetch,
        StageKind::Extract,
        StageKind::Convert,
        StageKind::Upload,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Validate => "validate",
            StageKind::Fetch => "download",
            StageKind::Extract => "extract",
            StageKind::Convert => "convert",
            StageKind::Upload => "upload",
        }
    }

    /// Status a unit must have for this stage to work on it.
    pub fn input(self) -> Status {
        match self {
            StageKind::Validate => Status::New,
            StageKind::Fetch => Status::Validated,
            StageKind::Extract => Status::ArchiveFetched,
            StageKind::Convert => Status::Extracted,
            StageKind::Upload => Status::Converted,
        }
    }

    /// Status a forwarded unit leaves with.
    pub fn output(self) -> Status {
        match self {
            StageKind::Validate => Status::Validated,
            StageKind::Fetch => Status::ArchiveFetched,
            StageKind::Extract => Status::Extracted,
            StageKind::Convert => Status::Converted,
            StageKind::Upload => Status::Uploaded,
        }
    }

    /// Progress bar text, e.g. "Validating 12 URLs...".
    pub fn progress_message(self, units: usize) -> String {
        let verb = match self {
            StageKind::Validate => "Validating",
            StageKind::Fetch => "Downloading",
            StageKind::Extract => "Extracting",
            StageKind::Convert => "Converting",
            StageKind::Upload => "Uploading",
        };
        format!("{} {} URLs...", verb, units)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = HistfxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.name() == lower || (lower == "fetch" && *k == StageKind::Fetch))
            .ok_or_else(|| HistfxError::config(format!("Unknown stage: {}", s)))
    }
}

/// Everything a stage may read besides the unit itself.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub config: &'a PipelineConfig,
    /// Destination of formatted lines; only the upload stage uses it.
    pub lines: Option<&'a dyn LineSink>,
}

impl<'a> StageContext<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config, lines: None }
    }

    pub fn with_lines(mut self, lines: &'a dyn LineSink) -> Self {
        self.lines = Some(lines);
        self
    }
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Work on a unit whose status is `kind().input()`.
    fn process(&self, record: &mut Record, ctx: &StageContext<'_>) -> Result<Route>;
}

/// Marks the unit done on `current` however the stage ends.
struct TaskDone<'a>(&'a dyn QueueHandle);

impl Drop for TaskDone<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.0.task_done() {
            warn!(error = %err, "task_done failed");
        }
    }
}

/// Run one unit through a stage.
///
/// Exactly one `task_done` is sent to `current`, after the unit (if routed
/// forward) has been put into `next`. Units not at the stage's input status
/// pass through untouched. On failure the unit's checkpoint is deleted; a
/// malformed response drops the unit and the run carries on, anything else
/// is returned.
pub fn execute_unit(
    stage: &dyn Stage,
    mut record: Record,
    ctx: &StageContext<'_>,
    current: &dyn QueueHandle,
    next: &dyn QueueHandle,
) -> Result<Route> {
    let _done = TaskDone(current);
    let kind = stage.kind();

    if record.status != kind.input() {
        debug!(url = %record.url, stage = %kind, status = %record.status, "Passing through");
        next.put(record)?;
        return Ok(Route::Forward);
    }

    match stage.process(&mut record, ctx) {
        Ok(Route::Forward) => {
            next.put(record)?;
            Ok(Route::Forward)
        },
        Ok(Route::Drop) => Ok(Route::Drop),
        Err(err) => {
            if let Err(cleanup) = record.delete_checkpoint() {
                warn!(url = %record.url, error = %cleanup, "Failed to delete checkpoint");
            }

            let malformed = err
                .downcast_ref::<HistfxError>()
                .is_some_and(HistfxError::is_malformed_response);
            if malformed {
                warn!(url = %record.url, stage = %kind, error = %format!("{:#}", err), "Dropping unit");
                return Ok(Route::Drop);
            }

            error!(url = %record.url, stage = %kind, error = %format!("{:#}", err), "Stage failed");
            Err(err.context(format!("{} failed for {}", kind, record.url)))
        },
    }
}

// ============================================================================
// Stage implementations
// ============================================================================

/// Scrapes the download form; pages without a token become `NO_SOURCE_DATA`.
pub struct ValidateStage {
    source: Arc<dyn SourceClient>,
}

impl ValidateStage {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        Self { source }
    }
}

impl Stage for ValidateStage {
    fn kind(&self) -> StageKind {
        StageKind::Validate
    }

    fn process(&self, record: &mut Record, ctx: &StageContext<'_>) -> Result<Route> {
        let base = &ctx.config.data_directory;
        match self.source.fetch_form(&record.url)? {
            PageLookup::NotFound => {
                record.advance(Status::NoSourceData)?;
                record.write_checkpoint(base)?;
                info!(url = %record.url, "No source data");
                Ok(Route::Drop)
            },
            PageLookup::Found(page) => {
                record.form = page.form;
                record.encoding = page.encoding;
                record.page_bytes = page.page_bytes;
                record.advance(Status::Validated)?;
                record.write_checkpoint(base)?;
                Ok(Route::Forward)
            },
        }
    }
}

/// Submits the form and stores the returned zip in the unit's directory.
pub struct FetchStage {
    source: Arc<dyn SourceClient>,
}

impl FetchStage {
    pub fn new(source: Arc<dyn SourceClient>) -> Self {
        Self { source }
    }
}

impl Stage for FetchStage {
    fn kind(&self) -> StageKind {
        StageKind::Fetch
    }

    fn process(&self, record: &mut Record, ctx: &StageContext<'_>) -> Result<Route> {
        if record.form.is_empty() {
            return Err(HistfxError::malformed(&record.url, "no download token recorded").into());
        }

        let archive = self.source.fetch_archive(record)?;
        std::fs::create_dir_all(&record.dir)?;
        let path = record.dir.join(&archive.filename);
        std::fs::write(&path, &archive.bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        record.archive_filename = archive.filename;
        record.advance(Status::ArchiveFetched)?;
        record.write_checkpoint(&ctx.config.data_directory)?;
        Ok(Route::Forward)
    }
}

/// Pulls the CSV out of the zip.
pub struct ExtractStage;

impl Stage for ExtractStage {
    fn kind(&self) -> StageKind {
        StageKind::Extract
    }

    fn process(&self, record: &mut Record, ctx: &StageContext<'_>) -> Result<Route> {
        record.keep_archive = ctx.config.keep_archive;
        let archive = record
            .archive_path()
            .ok_or_else(|| HistfxError::malformed(&record.url, "no archive recorded"))?;
        if !archive.exists() {
            anyhow::bail!("Archive {} is missing", archive.display());
        }

        record.extracted_filename = extract_csv(&archive, &record.dir, &record.url)?;
        if !record.keep_archive {
            std::fs::remove_file(&archive)
                .with_context(|| format!("Failed to remove {}", archive.display()))?;
        }

        record.advance(Status::Extracted)?;
        record.write_checkpoint(&ctx.config.data_directory)?;
        Ok(Route::Forward)
    }
}

/// Converts the extracted CSV into the unit's Parquet file.
pub struct ConvertStage;

impl Stage for ConvertStage {
    fn kind(&self) -> StageKind {
        StageKind::Convert
    }

    fn process(&self, record: &mut Record, ctx: &StageContext<'_>) -> Result<Route> {
        let parquet = record.dir.join(COLUMNAR_FILE);
        let summary = match record.extracted_path() {
            Some(csv) if csv.exists() => convert::csv_to_parquet(&csv, &parquet, record.granularity)?,
            _ if parquet.exists() => convert::summarize(&parquet)?,
            _ => anyhow::bail!("No extracted CSV to convert in {}", record.dir.display()),
        };

        record.columnar_filename = COLUMNAR_FILE.to_string();
        record.row_count = Some(summary.rows);
        record.range_start = summary.range_start;
        record.range_end = summary.range_end;
        record.advance(Status::Converted)?;
        record.write_checkpoint(&ctx.config.data_directory)?;
        debug!(url = %record.url, rows = summary.rows, "Converted");
        Ok(Route::Forward)
    }
}

/// Formats the Parquet file as line protocol for the Batch Writer.
///
/// The unit is checkpointed `UPLOADED` once its slices are queued, not once
/// the writer has acknowledged them. A slice whose write fails is counted
/// and not retried, and a rerun skips the unit, so delivery of failed writes
/// is at-most-once.
pub struct UploadStage;

impl Stage for UploadStage {
    fn kind(&self) -> StageKind {
        StageKind::Upload
    }

    fn process(&self, record: &mut Record, ctx: &StageContext<'_>) -> Result<Route> {
        let sink = ctx
            .lines
            .ok_or_else(|| anyhow::anyhow!("Upload stage started without a batch writer"))?;
        let parquet = record
            .columnar_path()
            .filter(|p| p.exists())
            .ok_or_else(|| anyhow::anyhow!("No columnar file to upload in {}", record.dir.display()))?;

        let lines = influx::for_each_slice(record, &parquet, ctx.config.batch_size, |slice| {
            sink.send(slice)
        })?;

        record.advance(Status::Uploaded)?;
        record.write_checkpoint(&ctx.config.data_directory)?;

        if ctx.config.delete_after_upload {
            for path in [record.archive_path(), Some(parquet)].into_iter().flatten() {
                match std::fs::remove_file(&path) {
                    Ok(()) => {},
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                    Err(err) => {
                        return Err(err).with_context(|| format!("Failed to remove {}", path.display()))
                    },
                }
            }
        }

        info!(url = %record.url, lines, "Queued for upload");
        Ok(Route::Forward)
    }
}

/// Build a stage the way a worker process does, from configuration alone.
pub fn build_stage(kind: StageKind, config: &PipelineConfig) -> Result<Box<dyn Stage>> {
    let stage: Box<dyn Stage> = match kind {
        StageKind::Validate => Box::new(ValidateStage::new(Arc::new(HistdataClient::new(&config.post_url)?))),
        StageKind::Fetch => Box::new(FetchStage::new(Arc::new(HistdataClient::new(&config.post_url)?))),
        StageKind::Extract => Box::new(ExtractStage),
        StageKind::Convert => Box::new(ConvertStage),
        StageKind::Upload => Box::new(UploadStage),
    };
    Ok(stage)
}
