//! Pipeline resume and stage handoff tests
//!
//! These run every stage on the thread pool; the process substrate has its
//! own tests in `process_pool_tests.rs`.

mod common;

use common::{checkpoint_exists, m1_archive, m1_url, Capture, FakeSource};
use histfx_ingest::config::PipelineConfig;
use histfx_ingest::influx::LineWriter;
use histfx_ingest::pipeline::{LineWriterFactory, Pipeline};
use histfx_ingest::record::{Record, Status};
use histfx_ingest::stage::StageKind;
use histfx_ingest::yearmonth::YearMonth;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const NOW: YearMonth = YearMonth {
    year: 2024,
    month: Some(6),
};

fn config(base: &Path, start: i32, end: i32) -> PipelineConfig {
    PipelineConfig {
        instruments: vec!["eurusd".to_string()],
        start: Some(YearMonth::year(start)),
        end: Some(YearMonth::year(end)),
        data_directory: base.to_path_buf(),
        process_isolation: false,
        ..Default::default()
    }
}

fn capture(into: &Capture) -> LineWriterFactory {
    let into = into.clone();
    Box::new(move |_: &PipelineConfig| -> anyhow::Result<Box<dyn LineWriter>> { Ok(Box::new(into.clone())) })
}

fn restored(url: &str, base: &Path) -> Record {
    let mut record = Record::new(url, base).unwrap();
    assert!(record.restore(base).unwrap(), "no checkpoint for {}", url);
    record
}

#[test]
fn test_default_run_validates_downloads_and_extracts() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), 2015, 2016);
    config.resolve_flags();
    assert!(config.validate && config.download && config.extract && !config.convert);

    let source = FakeSource::new()
        .with_archive(m1_url("eurusd", 2015), m1_archive("eurusd", 2015, 3))
        .with_archive(m1_url("eurusd", 2016), m1_archive("eurusd", 2016, 3));
    let summary = Pipeline::new(config, Arc::new(source), capture(&Capture::default()))
        .with_now(NOW)
        .run()
        .unwrap();

    assert_eq!(summary.remaining, 2);
    assert!(summary.report(StageKind::Convert).is_none());
    for year in [2015, 2016] {
        let record = restored(&m1_url("eurusd", year), tmp.path());
        assert_eq!(record.status, Status::Extracted);
        assert!(record.extracted_path().unwrap().exists());
        assert!(!record.archive_path().unwrap().exists());
    }
}

#[test]
fn test_no_source_data_is_remembered_across_runs() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), 2001, 2002);
    config.validate = true;
    config.resolve_flags();

    let first = FakeSource::new().without_data(m1_url("eurusd", 2001));
    let summary = Pipeline::new(config.clone(), Arc::new(first), capture(&Capture::default()))
        .with_now(NOW)
        .run()
        .unwrap();
    assert_eq!(summary.report(StageKind::Validate).unwrap().dropped, 1);
    assert_eq!(restored(&m1_url("eurusd", 2001), tmp.path()).status, Status::NoSourceData);

    let second = Arc::new(FakeSource::new());
    let summary = Pipeline::new(config, second.clone(), capture(&Capture::default()))
        .with_now(NOW)
        .run()
        .unwrap();
    assert_eq!(summary.seed.no_source_data, 1);
    assert_eq!(summary.seed.queued, 1);
    // The validated unit passes through without another page request.
    assert!(second.form_requests.lock().unwrap().is_empty());
}

#[test]
fn test_interrupted_run_resumes_at_the_failed_stage() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), 2018, 2018);
    config.convert = true;
    config.resolve_flags();

    // 2018 downloads but its archive has no CSV: dropped at extract, checkpoint gone.
    let broken = FakeSource::new().with_archive(
        m1_url("eurusd", 2018),
        common::zip_bytes(&[("readme.txt", "nothing here")]),
    );
    let summary = Pipeline::new(config.clone(), Arc::new(broken), capture(&Capture::default()))
        .with_now(NOW)
        .run()
        .unwrap();
    assert_eq!(summary.report(StageKind::Extract).unwrap().dropped, 1);
    assert_eq!(summary.remaining, 0);
    assert!(!checkpoint_exists(&m1_url("eurusd", 2018), tmp.path()));

    // With the checkpoint gone the unit starts over and completes.
    let fixed = Arc::new(FakeSource::new().with_archive(m1_url("eurusd", 2018), m1_archive("eurusd", 2018, 5)));
    let summary = Pipeline::new(config.clone(), fixed.clone(), capture(&Capture::default()))
        .with_now(NOW)
        .run()
        .unwrap();
    assert_eq!(summary.remaining, 1);
    assert_eq!(fixed.archive_requests(), 1);
    let record = restored(&m1_url("eurusd", 2018), tmp.path());
    assert_eq!(record.status, Status::Converted);
    assert_eq!(record.row_count, Some(5));

    // A third run has nothing left to fetch.
    let idle = Arc::new(FakeSource::new());
    Pipeline::new(config, idle.clone(), capture(&Capture::default()))
        .with_now(NOW)
        .run()
        .unwrap();
    assert_eq!(idle.archive_requests(), 0);
}

#[test]
fn test_upload_formats_line_protocol() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), 2019, 2019);
    config.upload = true;
    config.batch_size = 2;
    config.delete_after_upload = true;
    config.resolve_flags();

    let source = FakeSource::new().with_archive(m1_url("eurusd", 2019), m1_archive("eurusd", 2019, 3));
    let sink = Capture::default();
    let summary = Pipeline::new(config, Arc::new(source), capture(&sink))
        .with_now(NOW)
        .run()
        .unwrap();

    let stats = summary.writer.unwrap();
    assert_eq!(stats.slices, 2);
    assert_eq!(stats.lines, 3);
    assert_eq!(stats.failed, 0);

    let lines = sink.lines();
    assert_eq!(
        lines[0],
        "EURUSD,source=histdata.com,format=ASCII,timeframe=M1 \
         openbid=1.1,highbid=1.2,lowbid=1,closebid=1.15 1546380000000"
    );

    let record = restored(&m1_url("eurusd", 2019), tmp.path());
    assert_eq!(record.status, Status::Uploaded);
    assert!(!record.columnar_path().unwrap().exists());
}

#[test]
fn test_merge_spans_every_converted_year() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), 2010, 2012);
    config.merge = true;
    config.resolve_flags();

    let mut source = FakeSource::new();
    for year in 2010..=2012 {
        source = source.with_archive(m1_url("eurusd", year), m1_archive("eurusd", year, 2));
    }
    let summary = Pipeline::new(config, Arc::new(source), capture(&Capture::default()))
        .with_now(NOW)
        .run()
        .unwrap();

    assert_eq!(summary.merged.len(), 1);
    assert_eq!(summary.merged[0].units, 3);
    assert_eq!(summary.merged[0].summary.rows, 6);
    assert!(summary.merged[0].path.exists());
    assert_eq!(summary.remaining, 3);
}
