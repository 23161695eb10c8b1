//! Per-instrument Parquet merge
//!
//! Converted units of the same platform, timeframe and pair are concatenated
//! into one file next to their period directories:
//! `base/<FORMAT>/<TIMEFRAME>/<pair>/<pair>_<TIMEFRAME>_<startYYYYMM>_<endYYYYMM>.parquet`.
//! Rows are written in timestamp order; where two units overlap (a yearly
//! archive and a monthly one for the same year) the later rows are skipped.

use crate::convert::{read_batches, ColumnarSummary, QuoteSink};
use crate::instruments::{Format, Granularity};
use crate::record::{Record, Status};
use anyhow::Result;
use chrono::DateTime;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One merged file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutput {
    pub path: PathBuf,
    pub units: usize,
    pub summary: ColumnarSummary,
}

type GroupKey = (Format, Granularity, String);

fn yyyymm(ms: Option<i64>, fallback: &str) -> String {
    ms.and_then(DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y%m").to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// Target path of a merged group.
pub fn merged_path(
    base_dir: &Path,
    format: Format,
    granularity: Granularity,
    instrument: &str,
    start: &str,
    end: &str,
) -> PathBuf {
    base_dir
        .join(format.key())
        .join(granularity.key())
        .join(instrument)
        .join(format!("{}_{}_{}_{}.parquet", instrument, granularity.key(), start, end))
}

/// Merge every group of converted units found in `records`.
///
/// Units that have not reached `CONVERTED` or whose Parquet file is missing
/// are left out of their group.
pub fn merge_records(records: &[Record], base_dir: &Path) -> Result<Vec<MergeOutput>> {
    let mut groups: BTreeMap<GroupKey, Vec<&Record>> = BTreeMap::new();
    for record in records {
        if !matches!(record.status, Status::Converted | Status::Uploaded) {
            continue;
        }
        match record.columnar_path() {
            Some(path) if path.exists() => {},
            _ => {
                warn!(url = %record.url, "No columnar file to merge");
                continue;
            },
        }
        groups
            .entry((record.format, record.granularity, record.instrument.clone()))
            .or_default()
            .push(record);
    }

    let mut outputs = Vec::with_capacity(groups.len());
    for ((format, granularity, instrument), mut members) in groups {
        members.sort_by(|a, b| {
            (a.range_start.unwrap_or(i64::MAX), &a.datemonth)
                .cmp(&(b.range_start.unwrap_or(i64::MAX), &b.datemonth))
        });
        let (Some(first), Some(last)) = (members.first(), members.last()) else {
            continue;
        };

        let path = merged_path(
            base_dir,
            format,
            granularity,
            &instrument,
            &yyyymm(first.range_start, &first.datemonth),
            &yyyymm(last.range_end, &last.datemonth),
        );

        let mut sink = QuoteSink::create(&path, granularity)?;
        for member in &members {
            let Some(source) = member.columnar_path() else {
                continue;
            };
            // Overlap is judged against earlier members only; rows sharing a
            // timestamp inside one file are all kept.
            let after = sink.summary().range_end;
            for batch in read_batches(&source)? {
                sink.push_batch(&batch?, after)?;
            }
        }
        let summary = sink.finish()?;

        info!(
            path = %path.display(),
            units = members.len(),
            rows = summary.rows,
            "Merged {} {} {}",
            format.key(),
            granularity.key(),
            instrument
        );
        outputs.push(MergeOutput {
            path,
            units: members.len(),
            summary,
        });
    }

    Ok(outputs)
}
