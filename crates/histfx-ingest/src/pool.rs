//! Pool executors
//!
//! An [`Executor`] drains `current` through a stage with a fixed number of
//! workers, collects routed units in `next`, and then (unless told
//! otherwise) waits on `current.join()` and dumps `next` back into
//! `current` for the following stage.
//!
//! Two substrates share that contract:
//!
//! - [`ThreadPool`] runs the stage on scoped OS threads in this process.
//! - [`ProcessPool`] runs it in child processes of the same binary
//!   (`histfx __stage-worker <stage>`). Parent and child talk in JSON lines
//!   over the child's stdin/stdout: the child receives the pipeline
//!   configuration, then one [`ParentMessage::Run`] per unit, and answers with
//!   the `put`/`task_done`/lines calls the stage made, closed by
//!   [`ChildMessage::Completed`] or [`ChildMessage::Failed`].
//!
//! A `None` sentinel in `current` closes the pool: nothing more is handed
//! out, units already in flight finish, and the report comes back `closed`
//! without the join or dump. The first stage error does the same, except the
//! error is returned.

use crate::config::PipelineConfig;
use crate::progress::create_progress_bar;
use crate::queue::{QueueHandle, Records};
use crate::record::Record;
use crate::stage::{build_stage, execute_unit, Route, Stage, StageContext, StageKind};
use crate::writer::LineSink;
use anyhow::{Context, Result};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use serde_jsonlines::{JsonLinesReader, JsonLinesWriter};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Hidden subcommand a worker process is started with.
pub const WORKER_SUBCOMMAND: &str = "__stage-worker";

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("{stage} worker failed on {url}: {message}")]
    WorkerFailed {
        stage: StageKind,
        url: String,
        message: String,
    },

    #[error("{stage} worker exited before finishing {url}")]
    WorkerExited { stage: StageKind, url: String },

    #[error("{stage} worker sent an unexpected message: {detail}")]
    Protocol { stage: StageKind, detail: String },
}

/// Per-run switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Wait for every unit of `current` to be marked done.
    pub join: bool,
    /// Move `next` back into `current` afterwards.
    pub dump: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            join: true,
            dump: true,
        }
    }
}

/// What a pool run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub submitted: usize,
    pub forwarded: usize,
    pub dropped: usize,
    /// The sentinel was reached; join and dump were skipped.
    pub closed: bool,
}

pub trait Executor {
    fn run(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext<'_>,
        current: &Records,
        next: &Records,
        options: PoolOptions,
    ) -> Result<PoolReport>;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands units from `current` to workers until it empties, closes or a
/// worker fails.
struct Feed<'a> {
    current: &'a Records,
    take: Mutex<()>,
    stopped: AtomicBool,
    closed: AtomicBool,
    submitted: AtomicUsize,
    forwarded: AtomicUsize,
    dropped: AtomicUsize,
    first_error: Mutex<Option<anyhow::Error>>,
    progress: ProgressBar,
}

impl<'a> Feed<'a> {
    fn new(current: &'a Records, progress: ProgressBar) -> Self {
        Self {
            current,
            take: Mutex::new(()),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            submitted: AtomicUsize::new(0),
            forwarded: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            first_error: Mutex::new(None),
            progress,
        }
    }

    fn next_unit(&self) -> Option<Record> {
        let _guard = lock(&self.take);
        if self.stopped.load(Ordering::SeqCst) || self.current.is_empty() {
            return None;
        }
        match self.current.get() {
            Some(record) => {
                self.submitted.fetch_add(1, Ordering::SeqCst);
                Some(record)
            },
            None => {
                debug!("Queue closed");
                self.closed.store(true, Ordering::SeqCst);
                self.stopped.store(true, Ordering::SeqCst);
                None
            },
        }
    }

    fn finished(&self, route: Route) {
        match route {
            Route::Forward => self.forwarded.fetch_add(1, Ordering::SeqCst),
            Route::Drop => self.dropped.fetch_add(1, Ordering::SeqCst),
        };
        self.progress.inc(1);
    }

    fn fail(&self, err: anyhow::Error) {
        self.stopped.store(true, Ordering::SeqCst);
        lock(&self.first_error).get_or_insert(err);
    }

    /// Close out the run: return the first error, or join and dump.
    fn settle(self, next: &Records, options: PoolOptions) -> Result<PoolReport> {
        let report = PoolReport {
            submitted: self.submitted.load(Ordering::SeqCst),
            forwarded: self.forwarded.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            closed: self.closed.load(Ordering::SeqCst),
        };

        let first_error = self
            .first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = first_error {
            self.progress.abandon();
            return Err(err);
        }
        self.progress.finish_and_clear();

        if report.closed {
            return Ok(report);
        }
        if options.join {
            self.current.join();
        }
        if options.dump {
            next.dump(self.current, None);
        }
        Ok(report)
    }
}

// ============================================================================
// Thread pool
// ============================================================================

/// Runs a stage on scoped threads in this process.
#[derive(Debug, Clone, Copy)]
pub struct ThreadPool {
    workers: usize,
}

impl ThreadPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Network stages wait more than they compute: three threads per worker.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.workers() * 3)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Executor for ThreadPool {
    fn run(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext<'_>,
        current: &Records,
        next: &Records,
        options: PoolOptions,
    ) -> Result<PoolReport> {
        let units = current.size();
        let kind = stage.kind();
        let workers = self.workers.min(units.max(1));
        info!(stage = %kind, workers, units, "Starting thread pool");

        let feed = Feed::new(
            current,
            create_progress_bar(units as u64, &kind.progress_message(units)),
        );

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while let Some(record) = feed.next_unit() {
                        match execute_unit(stage, record, ctx, current, next) {
                            Ok(route) => feed.finished(route),
                            Err(err) => feed.fail(err),
                        }
                    }
                });
            }
        });

        feed.settle(next, options)
    }
}

// ============================================================================
// Process pool
// ============================================================================

/// Parent to child, after the configuration line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ParentMessage {
    Run(Record),
}

/// Child to parent.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChildMessage {
    Put(Record),
    TaskDone,
    Lines(Vec<String>),
    Completed { forwarded: bool },
    Failed { url: String, message: String },
}

/// Runs a stage in worker processes of `program`.
#[derive(Debug, Clone)]
pub struct ProcessPool {
    workers: usize,
    program: PathBuf,
}

impl ProcessPool {
    pub fn new(workers: usize, program: impl Into<PathBuf>) -> Self {
        Self {
            workers: workers.max(1),
            program: program.into(),
        }
    }

    /// Workers re-run the executable of this process.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the running executable")?;
        Ok(Self::new(config.workers(), program))
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn spawn(&self, kind: StageKind, config: &PipelineConfig) -> Result<WorkerProcess> {
        let mut child = Command::new(&self.program)
            .arg(WORKER_SUBCOMMAND)
            .arg(kind.name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {} worker {}", kind, self.program.display()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture worker stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture worker stdout"))?;

        let mut worker = WorkerProcess {
            kind,
            child,
            writer: Some(JsonLinesWriter::new(stdin)),
            reader: JsonLinesReader::new(BufReader::new(stdout)),
        };
        worker.send(config)?;
        Ok(worker)
    }
}

struct WorkerProcess {
    kind: StageKind,
    child: Child,
    writer: Option<JsonLinesWriter<ChildStdin>>,
    reader: JsonLinesReader<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Worker stdin already closed"))?;
        writer.write(message).context("Failed to write to worker")?;
        writer.flush().context("Failed to flush worker stdin")?;
        Ok(())
    }

    /// Send one unit and apply the child's calls until it reports back.
    fn run_unit(
        &mut self,
        record: Record,
        current: &Records,
        next: &Records,
        lines: Option<&dyn LineSink>,
    ) -> Result<Route> {
        let url = record.url.clone();
        self.send(&ParentMessage::Run(record))?;

        loop {
            let message = self
                .reader
                .read::<ChildMessage>()
                .with_context(|| format!("Failed to read from {} worker", self.kind))?;
            match message {
                Some(ChildMessage::Put(unit)) => next.put(unit),
                Some(ChildMessage::TaskDone) => current.task_done()?,
                Some(ChildMessage::Lines(batch)) => match lines {
                    Some(sink) => sink.send(batch)?,
                    None => {
                        return Err(PoolError::Protocol {
                            stage: self.kind,
                            detail: "lines sent to a stage without a batch writer".to_string(),
                        }
                        .into())
                    },
                },
                Some(ChildMessage::Completed { forwarded }) => {
                    return Ok(if forwarded { Route::Forward } else { Route::Drop });
                },
                Some(ChildMessage::Failed { url, message }) => {
                    return Err(PoolError::WorkerFailed {
                        stage: self.kind,
                        url,
                        message,
                    }
                    .into());
                },
                None => {
                    return Err(PoolError::WorkerExited {
                        stage: self.kind,
                        url,
                    }
                    .into())
                },
            }
        }
    }

    /// Close both pipes, then reap the child.
    ///
    /// `abandon` kills it first: after a unit was cut off midway the child may
    /// still be blocked on a reply nobody will read.
    fn shutdown(self, abandon: bool) {
        let WorkerProcess {
            kind,
            mut child,
            writer,
            reader,
        } = self;
        drop(writer);
        drop(reader);

        if abandon {
            if let Err(err) = child.kill() {
                debug!(stage = %kind, error = %err, "Worker already exited");
            }
        }
        match child.wait() {
            Ok(status) if !status.success() && !abandon => {
                warn!(stage = %kind, %status, "Worker exited with failure status")
            },
            Ok(_) => {},
            Err(err) => warn!(stage = %kind, error = %err, "Failed to wait for worker"),
        }
    }
}

impl Executor for ProcessPool {
    fn run(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext<'_>,
        current: &Records,
        next: &Records,
        options: PoolOptions,
    ) -> Result<PoolReport> {
        let units = current.size();
        let kind = stage.kind();
        let workers = self.workers.min(units);
        info!(stage = %kind, workers, units, "Starting process pool");

        let feed = Feed::new(
            current,
            create_progress_bar(units as u64, &kind.progress_message(units)),
        );

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    let mut worker = match self.spawn(kind, ctx.config) {
                        Ok(worker) => worker,
                        Err(err) => {
                            feed.fail(err);
                            return;
                        },
                    };
                    let mut abandon = false;
                    while let Some(record) = feed.next_unit() {
                        match worker.run_unit(record, current, next, ctx.lines) {
                            Ok(route) => feed.finished(route),
                            Err(err) => {
                                abandon = true;
                                feed.fail(err);
                                break;
                            },
                        }
                    }
                    worker.shutdown(abandon);
                });
            }
        });

        feed.settle(next, options)
    }
}

// ============================================================================
// Worker side
// ============================================================================

/// The child's view of the parent's queues and batch writer.
struct Pipe<W: Write> {
    writer: Mutex<JsonLinesWriter<W>>,
}

impl<W: Write> Pipe<W> {
    fn emit(&self, message: &ChildMessage) -> histfx_common::Result<()> {
        let mut writer = lock(&self.writer);
        writer.write(message)?;
        writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> QueueHandle for Pipe<W> {
    fn put(&self, record: Record) -> histfx_common::Result<()> {
        self.emit(&ChildMessage::Put(record))
    }

    fn task_done(&self) -> histfx_common::Result<()> {
        self.emit(&ChildMessage::TaskDone)
    }
}

impl<W: Write + Send> LineSink for Pipe<W> {
    fn send(&self, lines: Vec<String>) -> Result<()> {
        self.emit(&ChildMessage::Lines(lines))?;
        Ok(())
    }
}

/// Serve one stage over `input`/`output` until the parent closes input.
///
/// The first line is the [`PipelineConfig`]; every following line is a
/// [`ParentMessage`]. Logging must not write to `output`.
pub fn run_worker<R: BufRead, W: Write + Send>(kind: StageKind, input: R, output: W) -> Result<()> {
    let mut reader = JsonLinesReader::new(input);
    let config: PipelineConfig = reader
        .read()
        .context("Failed to read worker configuration")?
        .ok_or_else(|| anyhow::anyhow!("Worker input closed before configuration"))?;

    let stage = build_stage(kind, &config)?;
    let pipe = Pipe {
        writer: Mutex::new(JsonLinesWriter::new(output)),
    };
    let ctx = StageContext::new(&config).with_lines(&pipe);
    debug!(stage = %kind, pid = std::process::id(), "Worker ready");

    while let Some(message) = reader
        .read::<ParentMessage>()
        .context("Failed to read from parent")?
    {
        let ParentMessage::Run(record) = message;
        let url = record.url.clone();
        let reply = match execute_unit(stage.as_ref(), record, &ctx, &pipe, &pipe) {
            Ok(route) => ChildMessage::Completed {
                forwarded: route == Route::Forward,
            },
            Err(err) => ChildMessage::Failed {
                url,
                message: format!("{:#}", err),
            },
        };
        pipe.emit(&reply)?;
    }

    debug!(stage = %kind, "Worker input closed");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::extract::tests::write_zip;
    use crate::record::Status;
    use crate::urls::DEFAULT_BASE_URL;
    use std::io::Cursor;
    use std::path::Path;
    use tempfile::TempDir;

    /// Validates every unit except 2003, which fails.
    struct FailOn2003;

    impl Stage for FailOn2003 {
        fn kind(&self) -> StageKind {
            StageKind::Validate
        }

        fn process(&self, record: &mut Record, _ctx: &StageContext<'_>) -> Result<Route> {
            if record.year == 2003 {
                anyhow::bail!("refused");
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
            record.advance(Status::Validated)?;
            Ok(Route::Forward)
        }
    }

    fn record(base: &Path, year: i32) -> Record {
        Record::new(
            format!("{}?/ascii/1-minute-bar-quotes/eurusd/{}", DEFAULT_BASE_URL, year),
            base,
        )
        .unwrap()
    }

    #[test]
    fn test_thread_pool_hands_off_every_unit() {
        let tmp = TempDir::new().unwrap();
        let config = PipelineConfig::default();
        let current: Records = (2004..2020).map(|y| record(tmp.path(), y)).collect();
        let next = Records::new();

        let report = ThreadPool::new(4)
            .run(&FailOn2003, &StageContext::new(&config), &current, &next, PoolOptions::default())
            .unwrap();

        assert_eq!(report.submitted, 16);
        assert_eq!(report.forwarded, 16);
        assert!(!report.closed);
        assert!(next.is_empty());
        let mut years: Vec<i32> = current.drain().iter().map(|r| r.year).collect();
        years.sort_unstable();
        assert_eq!(years, (2004..2020).collect::<Vec<_>>());
    }

    #[test]
    fn test_thread_pool_without_dump_leaves_next() {
        let tmp = TempDir::new().unwrap();
        let config = PipelineConfig::default();
        let current: Records = (2004..2008).map(|y| record(tmp.path(), y)).collect();
        let next = Records::new();

        let options = PoolOptions {
            join: false,
            dump: false,
        };
        ThreadPool::new(2)
            .run(&FailOn2003, &StageContext::new(&config), &current, &next, options)
            .unwrap();
        assert!(current.is_empty());
        assert_eq!(next.size(), 4);
    }

    #[test]
    fn test_thread_pool_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let config = PipelineConfig::default();
        let units: Vec<Record> = (2000..2010).map(|y| record(tmp.path(), y)).collect();
        let mut failing = units[3].clone();
        failing.write_checkpoint(tmp.path()).unwrap();
        let current: Records = units.into_iter().collect();
        let next = Records::new();

        let err = ThreadPool::new(1)
            .run(&FailOn2003, &StageContext::new(&config), &current, &next, PoolOptions::default())
            .unwrap_err();

        assert!(format!("{:#}", err).contains("refused"));
        assert!(!failing.checkpoint_path().exists());
        // Units after the failure were never handed out.
        assert_eq!(current.size(), 6);
        assert_eq!(next.size(), 3);
    }

    #[test]
    fn test_sentinel_closes_pool_without_handoff() {
        let tmp = TempDir::new().unwrap();
        let config = PipelineConfig::default();
        let current: Records = (2004..2006).map(|y| record(tmp.path(), y)).collect();
        current.close();
        current.put(record(tmp.path(), 2010));
        let next = Records::new();

        let report = ThreadPool::new(1)
            .run(&FailOn2003, &StageContext::new(&config), &current, &next, PoolOptions::default())
            .unwrap();

        assert!(report.closed);
        assert_eq!(report.submitted, 2);
        assert_eq!(next.size(), 2);
        assert_eq!(current.size(), 1);
    }

    #[test]
    fn test_empty_queue_is_a_no_op() {
        let config = PipelineConfig::default();
        let current = Records::new();
        let next = Records::new();
        let report = ThreadPool::new(3)
            .run(&FailOn2003, &StageContext::new(&config), &current, &next, PoolOptions::default())
            .unwrap();
        assert_eq!(report, PoolReport::default());
    }

    #[test]
    fn test_worker_protocol_in_memory() {
        let tmp = TempDir::new().unwrap();
        let config = PipelineConfig {
            data_directory: tmp.path().to_path_buf(),
            ..Default::default()
        };

        let mut unit = record(tmp.path(), 2011);
        std::fs::create_dir_all(&unit.dir).unwrap();
        write_zip(
            &unit.dir.join("HISTDATA_COM_ASCII_EURUSD_M12011.zip"),
            &[("DAT_ASCII_EURUSD_M1_2011.csv", "20110101 170000;1;2;0.5;1.5;0\n")],
        );
        unit.archive_filename = "HISTDATA_COM_ASCII_EURUSD_M12011.zip".to_string();
        unit.status = Status::ArchiveFetched;
        let missing = {
            let mut r = record(tmp.path(), 2012);
            r.archive_filename = "gone.zip".to_string();
            r.status = Status::ArchiveFetched;
            r
        };

        let mut input = Vec::new();
        {
            let mut writer = JsonLinesWriter::new(&mut input);
            writer.write(&config).unwrap();
            writer.write(&ParentMessage::Run(unit)).unwrap();
            writer.write(&ParentMessage::Run(missing)).unwrap();
            writer.flush().unwrap();
        }

        let mut output = Vec::new();
        run_worker(StageKind::Extract, Cursor::new(input), &mut output).unwrap();

        let mut reader = JsonLinesReader::new(Cursor::new(output));
        let mut replies = Vec::new();
        while let Some(message) = reader.read::<ChildMessage>().unwrap() {
            replies.push(message);
        }

        assert!(matches!(&replies[0], ChildMessage::Put(r) if r.status == Status::Extracted));
        assert!(matches!(replies[1], ChildMessage::TaskDone));
        assert!(matches!(replies[2], ChildMessage::Completed { forwarded: true }));
        assert!(matches!(replies[3], ChildMessage::TaskDone));
        assert!(matches!(&replies[4], ChildMessage::Failed { message, .. } if message.contains("missing")));
        assert_eq!(replies.len(), 5);
    }
}
