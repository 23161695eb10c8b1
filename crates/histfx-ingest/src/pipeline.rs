//! Pipeline orchestrator
//!
//! Seeds the queue pair from the request expander and runs each enabled stage
//! over it in order, blocking on the handoff between stages:
//!
//! ```text
//! seed → validate → download → extract → convert → merge → upload
//!        (threads)  (threads)  (processes)          (in-process) (processes + batch writer)
//! ```

use crate::config::PipelineConfig;
use crate::influx::{InfluxClient, LineWriter};
use crate::merge::{merge_records, MergeOutput};
use crate::pool::{Executor, PoolOptions, PoolReport, ProcessPool, ThreadPool};
use crate::progress::format_elapsed;
use crate::queue::Records;
use crate::record::{Record, Status};
use crate::source::SourceClient;
use crate::stage::{build_stage, FetchStage, Stage, StageContext, StageKind, UploadStage, ValidateStage};
use crate::urls::RequestExpander;
use crate::writer::{BatchWriter, WriterStats};
use crate::yearmonth::YearMonth;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Builds the destination of the upload stage's lines.
pub type LineWriterFactory = Box<dyn Fn(&PipelineConfig) -> Result<Box<dyn LineWriter>> + Send + Sync>;

/// The InfluxDB writer named by the configuration.
pub fn influx_writer(config: &PipelineConfig) -> Result<Box<dyn LineWriter>> {
    let influx = config
        .influx
        .as_ref()
        .context("Uploading requires an InfluxDB configuration")?;
    Ok(Box::new(InfluxClient::new(influx)?))
}

/// Outcome of seeding the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Units put into the queue
    pub queued: usize,
    /// Units resumed from a checkpoint
    pub restored: usize,
    /// Units skipped because the source has nothing for them
    pub no_source_data: usize,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub seed: SeedReport,
    pub stages: Vec<(StageKind, PoolReport)>,
    pub merged: Vec<MergeOutput>,
    pub writer: Option<WriterStats>,
    /// Units left in the queue when the run ended
    pub remaining: usize,
    /// A stage reached the closed sentinel and the run stopped there.
    pub closed: bool,
}

impl RunSummary {
    pub fn report(&self, stage: StageKind) -> Option<&PoolReport> {
        self.stages.iter().find(|(k, _)| *k == stage).map(|(_, r)| r)
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn SourceClient>,
    line_writer: LineWriterFactory,
    worker_program: Option<PathBuf>,
    now: YearMonth,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, source: Arc<dyn SourceClient>, line_writer: LineWriterFactory) -> Self {
        Self {
            config,
            source,
            line_writer,
            worker_program: None,
            now: YearMonth::now_est(),
        }
    }

    /// Executable the process pool starts workers from; defaults to this one.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Pin the clock used for request expansion.
    pub fn with_now(mut self, now: YearMonth) -> Self {
        self.now = now;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn enabled(&self, kind: StageKind) -> bool {
        match kind {
            StageKind::Validate => self.config.validate,
            StageKind::Fetch => self.config.download,
            StageKind::Extract => self.config.extract,
            StageKind::Convert => self.config.convert,
            StageKind::Upload => self.config.upload,
        }
    }

    /// Expand the request into `current`, resuming units from their checkpoints.
    ///
    /// Units without a checkpoint get their first one here.
    pub fn seed(&self, current: &Records) -> Result<SeedReport> {
        let base = &self.config.data_directory;
        let expander = RequestExpander::new(
            self.config.start,
            self.config.end,
            self.config.formats.iter().copied(),
            self.config.instruments.iter().cloned(),
            self.config.granularities.iter().copied(),
        )
        .with_now(self.now)
        .with_base_url(self.config.base_url.as_str());

        let mut report = SeedReport::default();
        for url in expander.urls() {
            let mut record = Record::new(url, base)?;
            if record.restore(base)? {
                report.restored += 1;
            } else {
                record.write_checkpoint(base)?;
            }

            if record.status == Status::NoSourceData {
                report.no_source_data += 1;
                continue;
            }
            current.put(record);
            report.queued += 1;
        }

        info!(
            queued = report.queued,
            restored = report.restored,
            no_source_data = report.no_source_data,
            "Queue seeded"
        );
        Ok(report)
    }

    pub fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        std::fs::create_dir_all(&self.config.data_directory).with_context(|| {
            format!("Failed to create data directory {}", self.config.data_directory.display())
        })?;

        let current = Records::new();
        let next = Records::new();
        let mut summary = RunSummary {
            seed: self.seed(&current)?,
            ..Default::default()
        };

        for kind in [StageKind::Validate, StageKind::Fetch, StageKind::Extract, StageKind::Convert] {
            if !self.enabled(kind) {
                continue;
            }
            let report = self.run_stage(kind, &current, &next)?;
            summary.stages.push((kind, report));
            if report.closed {
                summary.closed = true;
                summary.remaining = current.size();
                return Ok(summary);
            }
        }

        if self.config.merge {
            summary.merged = self.merge(&current)?;
        }

        if self.config.upload {
            let (report, stats) = self.upload(&current, &next)?;
            summary.stages.push((StageKind::Upload, report));
            summary.writer = Some(stats);
            summary.closed = report.closed;
        }

        summary.remaining = current.size();
        info!(
            remaining = summary.remaining,
            elapsed = %format_elapsed(started.elapsed().as_millis()),
            "Pipeline finished"
        );
        Ok(summary)
    }

    /// The stage object the parent holds for `kind`.
    fn stage(&self, kind: StageKind) -> Result<Box<dyn Stage>> {
        let stage: Box<dyn Stage> = match kind {
            StageKind::Validate => Box::new(ValidateStage::new(Arc::clone(&self.source))),
            StageKind::Fetch => Box::new(FetchStage::new(Arc::clone(&self.source))),
            StageKind::Upload => Box::new(UploadStage),
            other => build_stage(other, &self.config)?,
        };
        Ok(stage)
    }

    /// Network stages run on threads; the rest on processes unless isolation is off.
    fn executor(&self, kind: StageKind) -> Result<Box<dyn Executor>> {
        if matches!(kind, StageKind::Validate | StageKind::Fetch) {
            return Ok(Box::new(ThreadPool::from_config(&self.config)));
        }
        if !self.config.process_isolation {
            return Ok(Box::new(ThreadPool::new(self.config.workers())));
        }
        Ok(Box::new(match &self.worker_program {
            Some(program) => ProcessPool::new(self.config.workers(), program),
            None => ProcessPool::from_config(&self.config)?,
        }))
    }

    pub fn run_stage(&self, kind: StageKind, current: &Records, next: &Records) -> Result<PoolReport> {
        let stage = self.stage(kind)?;
        let executor = self.executor(kind)?;
        let ctx = StageContext::new(&self.config);
        let report = executor.run(stage.as_ref(), &ctx, current, next, PoolOptions::default())?;
        info!(
            stage = %kind,
            submitted = report.submitted,
            forwarded = report.forwarded,
            dropped = report.dropped,
            "Stage finished"
        );
        Ok(report)
    }

    fn merge(&self, current: &Records) -> Result<Vec<MergeOutput>> {
        let units = current.drain();
        let merged = merge_records(&units, &self.config.data_directory);
        for unit in units {
            current.put(unit);
        }
        merged
    }

    /// Run the upload stage with a batch writer behind it.
    ///
    /// The pool neither joins nor dumps; the queue is joined first, then the
    /// writer, and only then are uploaded units handed back.
    fn upload(&self, current: &Records, next: &Records) -> Result<(PoolReport, WriterStats)> {
        let writer = BatchWriter::spawn(
            (self.line_writer)(&self.config)?,
            self.config.workers(),
            Duration::from_millis(self.config.flush_interval_ms),
        )?;
        let sender = writer.sender();
        let ctx = StageContext::new(&self.config).with_lines(&sender);
        let executor = self.executor(StageKind::Upload)?;
        let options = PoolOptions {
            join: false,
            dump: false,
        };

        let report = match executor.run(&UploadStage, &ctx, current, next, options) {
            Ok(report) => report,
            Err(err) => {
                if let Err(stop) = writer.finish() {
                    warn!(error = %stop, "Batch writer did not stop cleanly");
                }
                return Err(err);
            },
        };

        if !report.closed {
            current.join();
        }
        writer.join();
        let stats = writer.finish()?;
        if !report.closed {
            next.dump(current, None);
        }

        info!(
            stage = %StageKind::Upload,
            submitted = report.submitted,
            slices = stats.slices,
            lines = stats.lines,
            failed = stats.failed,
            "Stage finished"
        );
        Ok((report, stats))
    }
}
