//! histfx - histdata.com forex archive pipeline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use histfx_common::logging::{init_logging, LogConfig, LogLevel};
use histfx_ingest::config::{
    CpuUtilization, InfluxConfig, PipelineConfig, SortBy, DEFAULT_BATCH_SIZE, DEFAULT_DATA_DIRECTORY,
    DEFAULT_INFLUX_FILE,
};
use histfx_ingest::instruments::{normalize_instrument, Format, Granularity};
use histfx_ingest::pipeline::{influx_writer, Pipeline};
use histfx_ingest::pool::run_worker;
use histfx_ingest::repo::AvailableData;
use histfx_ingest::source::HistdataClient;
use histfx_ingest::stage::StageKind;
use histfx_ingest::yearmonth::YearMonth;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "histfx")]
#[command(author, about = "Download, convert and load histdata.com forex archives")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Currency pairs, e.g. eurusd,usdjpy (default: all)
    #[arg(short, long, value_delimiter = ',', num_args = 1..)]
    pairs: Vec<String>,

    /// Platforms: metatrader, ninjatrader, metastock, ascii, excel
    #[arg(short, long, value_delimiter = ',', num_args = 1.., default_value = "ascii")]
    formats: Vec<Format>,

    /// Timeframes: 1-minute-bar-quotes, tick-data-quotes, ...
    #[arg(short, long, value_delimiter = ',', num_args = 1.., default_value = "1-minute-bar-quotes")]
    timeframes: Vec<Granularity>,

    /// First period: YYYY, YYYYMM, YYYY-MM, now or start
    #[arg(short, long)]
    start: Option<YearMonth>,

    /// Last period
    #[arg(short, long)]
    end: Option<YearMonth>,

    /// low, medium, high or a percentage (1-200)
    #[arg(short, long = "cpu", default_value = "medium")]
    cpu: CpuUtilization,

    /// Lines per database write
    #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Minimum milliseconds between database writes
    #[arg(long, default_value_t = 0)]
    flush_interval_ms: u64,

    #[arg(short, long, default_value = DEFAULT_DATA_DIRECTORY)]
    data_directory: PathBuf,

    /// Check which archive pages have data
    #[arg(short = 'V', long)]
    validate: bool,

    /// Download archives
    #[arg(short = 'D', long)]
    download: bool,

    /// Extract CSVs from archives
    #[arg(short = 'X', long)]
    extract: bool,

    /// Convert CSVs to Parquet
    #[arg(short = 'C', long)]
    convert: bool,

    /// Merge Parquet files per pair and timeframe
    #[arg(short = 'M', long)]
    merge: bool,

    /// Upload to InfluxDB
    #[arg(short = 'I', long)]
    upload: bool,

    /// Show the date ranges each pair has data for
    #[arg(short = 'A', long = "available")]
    available: bool,

    /// Table order for --available
    #[arg(long, default_value = "pair_asc")]
    by: SortBy,

    #[arg(long)]
    keep_archive: bool,

    /// Remove archive and Parquet files once uploaded
    #[arg(long)]
    delete_after_upload: bool,

    /// Run CPU stages on threads instead of worker processes
    #[arg(long)]
    no_process_isolation: bool,

    /// InfluxDB settings file
    #[arg(long, default_value = DEFAULT_INFLUX_FILE)]
    influx_config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve one stage over stdin/stdout for a parent process
    #[command(name = "__stage-worker", hide = true)]
    StageWorker { stage: StageKind },
}

impl Cli {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig {
            formats: self.formats.clone(),
            granularities: self.timeframes.clone(),
            start: self.start,
            end: self.end,
            cpu_utilization: self.cpu,
            batch_size: self.batch_size,
            flush_interval_ms: self.flush_interval_ms,
            data_directory: std::path::absolute(&self.data_directory).with_context(|| {
                format!("Invalid data directory {}", self.data_directory.display())
            })?,
            keep_archive: self.keep_archive,
            delete_after_upload: self.delete_after_upload,
            validate: self.validate,
            download: self.download,
            extract: self.extract,
            convert: self.convert,
            merge: self.merge,
            upload: self.upload,
            available_remote_data: self.available,
            by: self.by,
            process_isolation: !self.no_process_isolation,
            ..Default::default()
        };
        if !self.pairs.is_empty() {
            config.instruments = self
                .pairs
                .iter()
                .map(|p| normalize_instrument(p))
                .collect::<std::result::Result<Vec<_>, _>>()?;
        }

        config.resolve_flags();
        if config.upload {
            config.influx = Some(InfluxConfig::load(&self.influx_config)?);
        }
        config.validate(YearMonth::now_est())?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };

    if let Some(Command::StageWorker { stage }) = cli.command {
        // stdout carries the message pipe
        init_logging(&LogConfig::worker(level).merge_env()?.off_stdout())?;

        let stdin = std::io::stdin().lock();
        return run_worker(stage, stdin, std::io::stdout());
    }

    init_logging(&LogConfig::cli(level).merge_env()?)?;

    let config = cli.pipeline_config()?;
    let source = Arc::new(HistdataClient::new(&config.post_url)?);

    if config.available_remote_data {
        let available = AvailableData::new(config, source);
        let repo = available.collect()?;
        available.print(&repo);
        return Ok(());
    }

    let summary = Pipeline::new(config, source, Box::new(influx_writer)).run()?;
    for (stage, report) in &summary.stages {
        info!(
            stage = %stage,
            submitted = report.submitted,
            forwarded = report.forwarded,
            dropped = report.dropped,
            "Stage summary"
        );
    }
    for merged in &summary.merged {
        info!(path = %merged.path.display(), rows = merged.summary.rows, "Merged");
    }
    if let Some(stats) = summary.writer {
        info!(lines = stats.lines, failed = stats.failed, "Upload summary");
    }
    Ok(())
}
