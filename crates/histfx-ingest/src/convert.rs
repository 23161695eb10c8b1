//! ASCII CSV to Parquet conversion
//!
//! histdata.com ASCII files carry no header and stamp rows in EST without
//! daylight saving. Conversion shifts every timestamp to UTC epoch
//! milliseconds and writes a Parquet file with one schema per timeframe:
//!
//! | Timeframe | Columns |
//! |---|---|
//! | `M1` | `datetime`, `open`, `high`, `low`, `close`, `vol` |
//! | `T` | `datetime`, `bid`, `ask`, `vol` |
//!
//! [`QuoteSink`] stages output in a hidden temp file and renames it into
//! place on [`QuoteSink::finish`], so a crash never leaves a partial file
//! under the final name.

use crate::instruments::Granularity;
use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, Float64Array, Int32Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDateTime;
use histfx_common::HistfxError;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// EST (UTC-5, no daylight saving) to UTC, in milliseconds.
pub const EST_TO_UTC_MS: i64 = 5 * 60 * 60 * 1000;

/// Rows buffered before a record batch is written.
const BATCH_ROWS: usize = 64 * 1024;

const M1_FORMAT: &str = "%Y%m%d %H%M%S";
const TICK_FORMAT: &str = "%Y%m%d %H%M%S%3f";

/// Price column names of a timeframe, in file order.
pub fn price_columns(granularity: Granularity) -> Result<&'static [&'static str]> {
    match granularity {
        Granularity::M1 => Ok(&["open", "high", "low", "close"]),
        Granularity::Tick => Ok(&["bid", "ask"]),
        other => Err(HistfxError::config(format!("No columnar layout for timeframe {}", other)).into()),
    }
}

/// Arrow schema of a timeframe's Parquet file.
pub fn quote_schema(granularity: Granularity) -> Result<SchemaRef> {
    let mut fields = vec![Field::new("datetime", DataType::Int64, false)];
    for name in price_columns(granularity)? {
        fields.push(Field::new(*name, DataType::Float64, false));
    }
    fields.push(Field::new("vol", DataType::Int32, false));
    Ok(Arc::new(Schema::new(fields)))
}

/// Row count and UTC range of a columnar file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnarSummary {
    pub rows: u64,
    pub range_start: Option<i64>,
    pub range_end: Option<i64>,
}

impl ColumnarSummary {
    fn observe(&mut self, datetime: i64) {
        self.rows += 1;
        if self.range_start.is_none() {
            self.range_start = Some(datetime);
        }
        self.range_end = Some(datetime);
    }
}

/// Buffered, atomically committed Parquet writer for one timeframe.
pub struct QuoteSink {
    schema: SchemaRef,
    writer: Option<ArrowWriter<File>>,
    temp_path: PathBuf,
    final_path: PathBuf,
    datetime: Vec<i64>,
    prices: Vec<Vec<f64>>,
    vol: Vec<i32>,
    summary: ColumnarSummary,
}

impl QuoteSink {
    pub fn create(final_path: &Path, granularity: Granularity) -> Result<Self> {
        let schema = quote_schema(granularity)?;
        let dir = final_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("{} has no parent directory", final_path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

        let name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = dir.join(format!(".{}.tmp", name.trim_start_matches('.')));

        let file = File::create(&temp_path).with_context(|| {
            format!("Failed to create temp parquet file: {}", temp_path.display())
        })?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(file, Arc::clone(&schema), Some(props))
            .context("Failed to create Parquet writer")?;

        let price_count = schema.fields().len() - 2;
        Ok(Self {
            schema,
            writer: Some(writer),
            temp_path,
            final_path: final_path.to_path_buf(),
            datetime: Vec::with_capacity(BATCH_ROWS),
            prices: vec![Vec::with_capacity(BATCH_ROWS); price_count],
            vol: Vec::with_capacity(BATCH_ROWS),
            summary: ColumnarSummary::default(),
        })
    }

    /// Append one row. `prices` follows [`price_columns`] order.
    pub fn push(&mut self, datetime: i64, prices: &[f64], vol: i32) -> Result<()> {
        if prices.len() != self.prices.len() {
            anyhow::bail!(
                "Expected {} price columns, got {}",
                self.prices.len(),
                prices.len()
            );
        }
        self.datetime.push(datetime);
        for (column, value) in self.prices.iter_mut().zip(prices) {
            column.push(*value);
        }
        self.vol.push(vol);
        self.summary.observe(datetime);

        if self.datetime.len() >= BATCH_ROWS {
            self.flush()?;
        }
        Ok(())
    }

    /// Append a batch with this sink's schema, keeping only rows after `after`.
    pub fn push_batch(&mut self, batch: &RecordBatch, after: Option<i64>) -> Result<()> {
        let datetime = int64_column(batch, 0)?;
        let prices = (1..=self.prices.len())
            .map(|i| float64_column(batch, i))
            .collect::<Result<Vec<_>>>()?;
        let vol = int32_column(batch, self.prices.len() + 1)?;

        let mut row_prices = vec![0.0; self.prices.len()];
        for row in 0..batch.num_rows() {
            let ts = datetime.value(row);
            if after.is_some_and(|cutoff| ts <= cutoff) {
                continue;
            }
            for (slot, column) in row_prices.iter_mut().zip(&prices) {
                *slot = column.value(row);
            }
            self.push(ts, &row_prices, vol.value(row))?;
        }
        Ok(())
    }

    pub fn summary(&self) -> ColumnarSummary {
        self.summary
    }

    fn flush(&mut self) -> Result<()> {
        if self.datetime.is_empty() {
            return Ok(());
        }
        let mut columns: Vec<ArrayRef> =
            vec![Arc::new(Int64Array::from(std::mem::take(&mut self.datetime)))];
        for column in &mut self.prices {
            columns.push(Arc::new(Float64Array::from(std::mem::take(column))));
        }
        columns.push(Arc::new(Int32Array::from(std::mem::take(&mut self.vol))));

        let batch = RecordBatch::try_new(Arc::clone(&self.schema), columns)
            .context("Failed to build record batch")?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Parquet sink already closed"))?;
        writer
            .write(&batch)
            .context("Failed to write batch to Parquet")?;
        debug!(rows = batch.num_rows(), path = %self.final_path.display(), "Wrote batch");
        Ok(())
    }

    /// Flush, close and move the file into place.
    pub fn finish(mut self) -> Result<ColumnarSummary> {
        self.flush()?;
        if let Some(writer) = self.writer.take() {
            writer.close().context("Failed to close Parquet writer")?;
        }
        std::fs::rename(&self.temp_path, &self.final_path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                self.temp_path.display(),
                self.final_path.display()
            )
        })?;
        Ok(self.summary)
    }
}

impl Drop for QuoteSink {
    fn drop(&mut self) {
        if self.temp_path.exists() {
            let _ = std::fs::remove_file(&self.temp_path);
            warn!(path = %self.temp_path.display(), "Removed unfinished Parquet temp file");
        }
    }
}

/// Field delimiter of a histdata CSV: M1 files use `;`, tick files `,`.
pub fn sniff_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first)?;
    Ok(if first.contains(';') { b';' } else { b',' })
}

/// Parse a histdata EST timestamp into UTC epoch milliseconds.
pub fn parse_est_timestamp(raw: &str, granularity: Granularity) -> Result<i64> {
    let format = match granularity {
        Granularity::M1 => M1_FORMAT,
        _ => TICK_FORMAT,
    };
    let naive = NaiveDateTime::parse_from_str(raw.trim(), format)
        .map_err(|e| HistfxError::parse(format!("bad timestamp '{}': {}", raw, e)))?;
    Ok(naive.and_utc().timestamp_millis() + EST_TO_UTC_MS)
}

/// Convert an extracted histdata CSV into `parquet`.
pub fn csv_to_parquet(csv: &Path, parquet: &Path, granularity: Granularity) -> Result<ColumnarSummary> {
    let columns = price_columns(granularity)?.len();
    let delimiter = sniff_delimiter(csv)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .from_path(csv)
        .with_context(|| format!("Failed to open {}", csv.display()))?;

    let mut sink = QuoteSink::create(parquet, granularity)?;
    let mut prices = vec![0.0; columns];

    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("{}: unreadable row {}", csv.display(), line + 1))?;
        if row.len() < columns + 2 {
            anyhow::bail!(
                "{}: row {} has {} fields, expected {}",
                csv.display(),
                line + 1,
                row.len(),
                columns + 2
            );
        }

        let datetime = parse_est_timestamp(&row[0], granularity)
            .with_context(|| format!("{}: row {}", csv.display(), line + 1))?;
        for (i, slot) in prices.iter_mut().enumerate() {
            *slot = row[i + 1].trim().parse().with_context(|| {
                format!("{}: row {} has a bad price '{}'", csv.display(), line + 1, &row[i + 1])
            })?;
        }
        let vol: i32 = row[columns + 1].trim().parse().unwrap_or(0);

        sink.push(datetime, &prices, vol)?;
    }

    sink.finish()
}

/// Open a columnar file for batch reading.
pub fn read_batches(path: &Path) -> Result<impl Iterator<Item = Result<RecordBatch>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("Failed to read Parquet metadata of {}", path.display()))?
        .build()
        .context("Failed to build Parquet reader")?;
    Ok(reader.map(|batch| batch.context("Failed to decode Parquet batch")))
}

/// Row count and range of an existing columnar file.
pub fn summarize(path: &Path) -> Result<ColumnarSummary> {
    let mut summary = ColumnarSummary::default();
    for batch in read_batches(path)? {
        let batch = batch?;
        let datetime = int64_column(&batch, 0)?;
        if datetime.is_empty() {
            continue;
        }
        if summary.range_start.is_none() {
            summary.range_start = Some(datetime.value(0));
        }
        summary.range_end = Some(datetime.value(datetime.len() - 1));
        summary.rows += datetime.len() as u64;
    }
    Ok(summary)
}

pub(crate) fn int64_column(batch: &RecordBatch, index: usize) -> Result<&Int64Array> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| anyhow::anyhow!("column {} is not Int64", index))
}

pub(crate) fn float64_column(batch: &RecordBatch, index: usize) -> Result<&Float64Array> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| anyhow::anyhow!("column {} is not Float64", index))
}

pub(crate) fn int32_column(batch: &RecordBatch, index: usize) -> Result<&Int32Array> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Int32Array>()
        .ok_or_else(|| anyhow::anyhow!("column {} is not Int32", index))
}
