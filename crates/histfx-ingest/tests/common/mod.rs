//! Shared fixtures for histfx integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use histfx_common::HistfxError;
use histfx_ingest::influx::LineWriter;
use histfx_ingest::record::{DownloadForm, Record};
use histfx_ingest::source::{Archive, PageForm, PageLookup, SourceClient};
use histfx_ingest::urls::DEFAULT_BASE_URL;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub fn m1_url(pair: &str, year: i32) -> String {
    format!("{}?/ascii/1-minute-bar-quotes/{}/{}", DEFAULT_BASE_URL, pair, year)
}

/// Zip bytes holding the given members.
pub fn zip_bytes(members: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in members {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A one-member M1 archive with `rows` minutes starting at New Year 17:00 EST.
pub fn m1_archive(pair: &str, year: i32, rows: usize) -> Vec<u8> {
    let body: String = (0..rows)
        .map(|i| format!("{}0101 17{:02}00;1.1{};1.2;1.0;1.15;0\n", year, i, i))
        .collect();
    let name = format!("DAT_ASCII_{}_M1_{}.csv", pair.to_uppercase(), year);
    zip_bytes(&[(name.as_str(), body.as_str())])
}

/// In-memory archive site.
#[derive(Default)]
pub struct FakeSource {
    empty: HashSet<String>,
    archives: Mutex<HashMap<String, Vec<u8>>>,
    pub form_requests: Mutex<Vec<String>>,
    pub archive_requests: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_data(mut self, url: impl Into<String>) -> Self {
        self.empty.insert(url.into());
        self
    }

    pub fn with_archive(self, url: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.archives.lock().unwrap().insert(url.into(), bytes);
        self
    }

    pub fn archive_requests(&self) -> usize {
        self.archive_requests.lock().unwrap().len()
    }
}

impl SourceClient for FakeSource {
    fn fetch_form(&self, url: &str) -> anyhow::Result<PageLookup> {
        self.form_requests.lock().unwrap().push(url.to_string());
        if self.empty.contains(url) {
            return Ok(PageLookup::NotFound);
        }
        Ok(PageLookup::Found(PageForm {
            form: DownloadForm {
                token: "token".to_string(),
                fxpair: "EURUSD".to_string(),
                ..Default::default()
            },
            encoding: String::new(),
            page_bytes: None,
        }))
    }

    fn fetch_archive(&self, record: &Record) -> anyhow::Result<Archive> {
        self.archive_requests.lock().unwrap().push(record.url.clone());
        let bytes = self
            .archives
            .lock()
            .unwrap()
            .get(&record.url)
            .cloned()
            .ok_or_else(|| HistfxError::malformed(&record.url, "no Content-Disposition"))?;
        Ok(Archive {
            filename: format!("HISTDATA_COM_ASCII_{}_M1{}.zip", record.instrument.to_uppercase(), record.year),
            bytes,
        })
    }
}

/// Keeps every slice it is asked to write.
#[derive(Clone, Default)]
pub struct Capture {
    pub slices: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Capture {
    pub fn lines(&self) -> Vec<String> {
        self.slices.lock().unwrap().iter().flatten().cloned().collect()
    }
}

impl LineWriter for Capture {
    fn write(&mut self, lines: &[String]) -> anyhow::Result<()> {
        self.slices.lock().unwrap().push(lines.to_vec());
        Ok(())
    }
}

pub fn checkpoint_exists(url: &str, base: &Path) -> bool {
    Record::dir_for(url, base).unwrap().join(".meta").exists()
}
