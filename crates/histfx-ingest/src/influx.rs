//! InfluxDB line protocol and the v2 write API
//!
//! One point per row:
//!
//! ```text
//! EURUSD,source=histdata.com,format=ASCII,timeframe=M1 openbid=1.1463,highbid=1.1465,lowbid=1.1462,closebid=1.1464 1546380000000
//! EURUSD,source=histdata.com,format=ASCII,timeframe=T bidquote=1.22188,askquote=1.22197 1622523600260
//! ```

use crate::config::InfluxConfig;
use crate::convert::{float64_column, int64_column, read_batches};
use crate::instruments::Granularity;
use crate::record::Record;
use anyhow::{Context, Result};
use arrow::record_batch::RecordBatch;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::path::Path;
use std::time::Duration;

/// Destination of formatted line-protocol slices.
pub trait LineWriter: Send {
    /// Write one slice in a single call.
    fn write(&mut self, lines: &[String]) -> Result<()>;
}

/// Measurement and tag prefix shared by every line of a record.
pub fn series_key(record: &Record) -> String {
    let pair = if record.form.fxpair.is_empty() {
        record.instrument.to_uppercase()
    } else {
        record.form.fxpair.to_uppercase()
    };
    format!(
        "{},source=histdata.com,format={},timeframe={}",
        pair,
        record.format.key(),
        record.granularity.key()
    )
}

/// Field names of a timeframe, matched to its price columns.
fn field_names(granularity: Granularity) -> Result<&'static [&'static str]> {
    match granularity {
        Granularity::M1 => Ok(&["openbid", "highbid", "lowbid", "closebid"]),
        Granularity::Tick => Ok(&["bidquote", "askquote"]),
        other => anyhow::bail!("No line protocol layout for timeframe {}", other),
    }
}

/// Format every row of a columnar batch as line protocol.
pub fn format_batch(series: &str, granularity: Granularity, batch: &RecordBatch) -> Result<Vec<String>> {
    let names = field_names(granularity)?;
    let datetime = int64_column(batch, 0)?;
    let prices = (1..=names.len())
        .map(|i| float64_column(batch, i))
        .collect::<Result<Vec<_>>>()?;

    let mut lines = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let fields = names
            .iter()
            .zip(&prices)
            .map(|(name, column)| format!("{}={}", name, column.value(row)))
            .collect::<Vec<_>>()
            .join(",");
        lines.push(format!("{} {} {}", series, fields, datetime.value(row)));
    }
    Ok(lines)
}

/// Stream a record's columnar file as slices of at most `batch_size` lines.
pub fn for_each_slice(
    record: &Record,
    path: &Path,
    batch_size: usize,
    mut emit: impl FnMut(Vec<String>) -> Result<()>,
) -> Result<u64> {
    let series = series_key(record);
    let batch_size = batch_size.max(1);
    let mut pending: Vec<String> = Vec::with_capacity(batch_size);
    let mut total = 0u64;

    for batch in read_batches(path)? {
        for line in format_batch(&series, record.granularity, &batch?)? {
            pending.push(line);
            if pending.len() == batch_size {
                total += pending.len() as u64;
                emit(std::mem::replace(&mut pending, Vec::with_capacity(batch_size)))?;
            }
        }
    }
    if !pending.is_empty() {
        total += pending.len() as u64;
        emit(pending)?;
    }
    Ok(total)
}

/// InfluxDB v2 `/api/v2/write` client with millisecond precision.
pub struct InfluxClient {
    client: Client,
    endpoint: String,
    token: String,
}

impl InfluxClient {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build InfluxDB client")?;

        let mut endpoint = reqwest::Url::parse(config.url.trim_end_matches('/'))
            .with_context(|| format!("Invalid InfluxDB url {}", config.url))?
            .join("/api/v2/write")
            .context("Invalid InfluxDB write path")?;
        endpoint
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ms");

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            token: config.token.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl LineWriter for InfluxClient {
    fn write(&mut self, lines: &[String]) -> Result<()> {
        let body = lines.join("\n");
        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .context("InfluxDB write request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            anyhow::bail!("InfluxDB write returned {}: {}", status, detail);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::convert::csv_to_parquet;
    use crate::record::COLUMNAR_FILE;
    use crate::urls::DEFAULT_BASE_URL;
    use tempfile::TempDir;

    fn record(tail: &str) -> Record {
        Record::new(format!("{}?/{}", DEFAULT_BASE_URL, tail), Path::new("/d")).unwrap()
    }

    #[test]
    fn test_series_key_prefers_scraped_pair() {
        let mut r = record("ascii/1-minute-bar-quotes/eurusd/2019");
        assert_eq!(series_key(&r), "EURUSD,source=histdata.com,format=ASCII,timeframe=M1");
        r.form.fxpair = "EURUSD".to_string();
        assert_eq!(series_key(&r), "EURUSD,source=histdata.com,format=ASCII,timeframe=M1");
    }

    #[test]
    fn test_m1_lines() {
        let tmp = TempDir::new().unwrap();
        let csv = tmp.path().join("m1.csv");
        let parquet = tmp.path().join(COLUMNAR_FILE);
        std::fs::write(&csv, "20190101 170000;1.1463;1.1465;1.1462;1.1464;0\n").unwrap();
        csv_to_parquet(&csv, &parquet, Granularity::M1).unwrap();

        let r = record("ascii/1-minute-bar-quotes/eurusd/2019");
        let mut slices = Vec::new();
        let total = for_each_slice(&r, &parquet, 10, |lines| {
            slices.push(lines);
            Ok(())
        })
        .unwrap();

        assert_eq!(total, 1);
        assert_eq!(
            slices[0][0],
            "EURUSD,source=histdata.com,format=ASCII,timeframe=M1 \
             openbid=1.1463,highbid=1.1465,lowbid=1.1462,closebid=1.1464 1546380000000"
        );
    }

    #[test]
    fn test_tick_lines_are_sliced() {
        let tmp = TempDir::new().unwrap();
        let csv = tmp.path().join("t.csv");
        let parquet = tmp.path().join(COLUMNAR_FILE);
        let rows: String = (0..7)
            .map(|i| format!("20210601 00000{}260,1.22188,1.22197,0\n", i))
            .collect();
        std::fs::write(&csv, rows).unwrap();
        csv_to_parquet(&csv, &parquet, Granularity::Tick).unwrap();

        let r = record("ascii/tick-data-quotes/eurusd/2021/6");
        let mut sizes = Vec::new();
        let total = for_each_slice(&r, &parquet, 3, |lines| {
            assert!(lines[0].contains(" bidquote=1.22188,askquote=1.22197 "));
            sizes.push(lines.len());
            Ok(())
        })
        .unwrap();

        assert_eq!(total, 7);
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_endpoint_query() {
        let client = InfluxClient::new(&InfluxConfig {
            org: "desk".to_string(),
            bucket: "fx data".to_string(),
            url: "http://localhost:8086/".to_string(),
            token: "t".to_string(),
        })
        .unwrap();
        assert_eq!(
            client.endpoint(),
            "http://localhost:8086/api/v2/write?org=desk&bucket=fx+data&precision=ms"
        );
    }
}
