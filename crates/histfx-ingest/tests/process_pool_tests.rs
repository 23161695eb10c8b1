//! Stage worker processes
//!
//! Workers are the `histfx` binary itself, started with the hidden
//! `__stage-worker` subcommand.

mod common;

use common::{m1_archive, m1_url, Capture, FakeSource};
use histfx_ingest::config::PipelineConfig;
use histfx_ingest::convert::csv_to_parquet;
use histfx_ingest::influx::LineWriter;
use histfx_ingest::instruments::Granularity;
use histfx_ingest::pipeline::Pipeline;
use histfx_ingest::pool::{Executor, PoolError, PoolOptions, ProcessPool};
use histfx_ingest::queue::Records;
use histfx_ingest::record::{Record, Status, COLUMNAR_FILE};
use histfx_ingest::stage::{ExtractStage, StageContext, UploadStage};
use histfx_ingest::yearmonth::YearMonth;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const WORKER: &str = env!("CARGO_BIN_EXE_histfx");

fn fetched(base: &Path, year: i32, archive: Option<Vec<u8>>) -> Record {
    let mut record = Record::new(m1_url("eurusd", year), base).unwrap();
    record.form.token = "token".to_string();
    record.advance(Status::Validated).unwrap();
    record.advance(Status::ArchiveFetched).unwrap();
    record.archive_filename = format!("{}.zip", year);
    std::fs::create_dir_all(&record.dir).unwrap();
    if let Some(bytes) = archive {
        std::fs::write(record.archive_path().unwrap(), bytes).unwrap();
    }
    record.write_checkpoint(base).unwrap();
    record
}

#[test]
fn test_extract_in_worker_processes() {
    let tmp = TempDir::new().unwrap();
    let config = PipelineConfig {
        data_directory: tmp.path().to_path_buf(),
        keep_archive: true,
        ..Default::default()
    };
    let current: Records = (2005..2009)
        .map(|year| fetched(tmp.path(), year, Some(m1_archive("eurusd", year, 2))))
        .collect();
    let next = Records::new();

    let report = ProcessPool::new(2, WORKER)
        .run(&ExtractStage, &StageContext::new(&config), &current, &next, PoolOptions::default())
        .unwrap();

    assert_eq!(report.submitted, 4);
    assert_eq!(report.forwarded, 4);
    assert!(next.is_empty());
    let units = current.drain();
    assert_eq!(units.len(), 4);
    for unit in units {
        assert_eq!(unit.status, Status::Extracted);
        assert!(unit.keep_archive);
        assert!(unit.extracted_path().unwrap().exists());
        assert!(unit.archive_path().unwrap().exists());
    }
}

#[test]
fn test_worker_failure_aborts_the_pool() {
    let tmp = TempDir::new().unwrap();
    let config = PipelineConfig {
        data_directory: tmp.path().to_path_buf(),
        ..Default::default()
    };
    let missing = fetched(tmp.path(), 2003, None);
    let current: Records = std::iter::once(missing.clone()).collect();
    let next = Records::new();

    let err = ProcessPool::new(1, WORKER)
        .run(&ExtractStage, &StageContext::new(&config), &current, &next, PoolOptions::default())
        .unwrap_err();

    match err.downcast_ref::<PoolError>() {
        Some(PoolError::WorkerFailed { url, message, .. }) => {
            assert_eq!(url, &missing.url);
            assert!(message.contains("missing"), "{}", message);
        },
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!missing.checkpoint_path().exists());
    assert!(next.is_empty());
}

#[test]
fn test_lines_without_a_writer_fail_without_hanging() {
    let tmp = TempDir::new().unwrap();
    // One line per slice keeps the worker writing long after the parent
    // stops reading.
    let config = PipelineConfig {
        data_directory: tmp.path().to_path_buf(),
        batch_size: 1,
        ..Default::default()
    };

    let mut record = Record::new(m1_url("eurusd", 2011), tmp.path()).unwrap();
    std::fs::create_dir_all(&record.dir).unwrap();
    let csv = record.dir.join("data.csv");
    let rows: String = (0..6000)
        .map(|i| format!("201101{:02} {:02}{:02}00;1.1;1.2;1.0;1.15;0\n", 1 + i / 1440, (i % 1440) / 60, i % 60))
        .collect();
    std::fs::write(&csv, rows).unwrap();
    let summary = csv_to_parquet(&csv, &record.dir.join(COLUMNAR_FILE), Granularity::M1).unwrap();
    record.status = Status::Converted;
    record.columnar_filename = COLUMNAR_FILE.to_string();
    record.row_count = Some(summary.rows);
    record.write_checkpoint(tmp.path()).unwrap();

    let current: Records = std::iter::once(record).collect();
    let next = Records::new();

    let err = ProcessPool::new(1, WORKER)
        .run(&UploadStage, &StageContext::new(&config), &current, &next, PoolOptions::default())
        .unwrap_err();

    assert!(
        matches!(err.downcast_ref::<PoolError>(), Some(PoolError::Protocol { .. })),
        "unexpected error: {:?}",
        err
    );
}

#[test]
fn test_pipeline_with_process_isolation() {
    let tmp = TempDir::new().unwrap();
    let mut config = PipelineConfig {
        instruments: vec!["eurusd".to_string()],
        start: Some(YearMonth::year(2011)),
        end: Some(YearMonth::year(2012)),
        data_directory: tmp.path().to_path_buf(),
        upload: true,
        batch_size: 3,
        ..Default::default()
    };
    config.resolve_flags();
    assert!(config.process_isolation);

    let source = FakeSource::new()
        .with_archive(m1_url("eurusd", 2011), m1_archive("eurusd", 2011, 4))
        .with_archive(m1_url("eurusd", 2012), m1_archive("eurusd", 2012, 4));
    let sink = Capture::default();
    let factory = {
        let sink = sink.clone();
        Box::new(move |_: &PipelineConfig| -> anyhow::Result<Box<dyn LineWriter>> { Ok(Box::new(sink.clone())) })
    };

    let summary = Pipeline::new(config, Arc::new(source), factory)
        .with_worker_program(WORKER)
        .with_now(YearMonth::new(2024, 6))
        .run()
        .unwrap();

    assert_eq!(summary.remaining, 2);
    assert_eq!(summary.writer.unwrap().lines, 8);
    assert_eq!(sink.lines().len(), 8);
    assert!(sink.slices.lock().unwrap().iter().all(|slice| slice.len() <= 3));
    for year in [2011, 2012] {
        let mut record = Record::new(m1_url("eurusd", year), tmp.path()).unwrap();
        record.restore(tmp.path()).unwrap();
        assert_eq!(record.status, Status::Uploaded);
        assert_eq!(record.row_count, Some(4));
    }
}
