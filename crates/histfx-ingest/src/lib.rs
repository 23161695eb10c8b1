//! histfx Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! A resumable, staged pipeline over the histdata.com forex archive.
//!
//! # Stages
//!
//! - **validate**: scrape each archive page's download form
//! - **download**: submit the form and store the zip
//! - **extract**: pull the CSV out of the zip
//! - **convert**: CSV to Parquet, timestamps shifted to UTC
//! - **merge**: one Parquet file per pair and timeframe
//! - **upload**: InfluxDB line protocol through a batch writer
//!
//! Every unit of work is a [`record::Record`] keyed by its page URL and
//! checkpointed to `<dir>/.meta` after each stage, so a rerun picks up where
//! the last one stopped.
//!
//! # Example
//!
//! ```no_run
//! use histfx_ingest::config::PipelineConfig;
//! use histfx_ingest::pipeline::{influx_writer, Pipeline};
//! use histfx_ingest::source::HistdataClient;
//! use histfx_ingest::yearmonth::YearMonth;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut config = PipelineConfig {
//!         instruments: vec!["eurusd".to_string()],
//!         start: Some(YearMonth::year(2019)),
//!         convert: true,
//!         ..Default::default()
//!     };
//!     config.resolve_flags();
//!
//!     let source = Arc::new(HistdataClient::new(&config.post_url)?);
//!     let summary = Pipeline::new(config, source, Box::new(influx_writer)).run()?;
//!     println!("{} units converted", summary.remaining);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod convert;
pub mod extract;
pub mod influx;
pub mod instruments;
pub mod merge;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod record;
pub mod repo;
pub mod source;
pub mod stage;
pub mod urls;
pub mod writer;
pub mod yearmonth;
