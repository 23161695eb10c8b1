//! Work units and their on-disk checkpoints
//!
//! A [`Record`] is one archive download task keyed by its page URL. Its
//! directory is derived from the URL alone, so any stage can find a unit's
//! files without replaying earlier stages, and two URLs never share a
//! directory.
//!
//! Every successful stage writes a JSON checkpoint (`.meta`) into that
//! directory; a failed stage deletes it. A fresh run restores each generated
//! record from its checkpoint and so skips work that already finished.

use crate::instruments::{Format, Granularity};
use crate::urls::{classify, UrlParts};
use histfx_common::{HistfxError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of a unit's checkpoint inside its directory.
pub const CHECKPOINT_FILE: &str = ".meta";

/// File name of the columnar artifact inside a unit's directory.
pub const COLUMNAR_FILE: &str = ".data.parquet";

/// Pipeline position of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    New,
    Validated,
    /// The archive has nothing for this period. Terminal.
    NoSourceData,
    ArchiveFetched,
    Extracted,
    Converted,
    Uploaded,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "NEW",
            Status::Validated => "VALIDATED",
            Status::NoSourceData => "NO_SOURCE_DATA",
            Status::ArchiveFetched => "ARCHIVE_FETCHED",
            Status::Extracted => "EXTRACTED",
            Status::Converted => "CONVERTED",
            Status::Uploaded => "UPLOADED",
        }
    }

    /// The legal transitions. Everything not listed is rejected.
    pub fn can_advance_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::New, Status::Validated)
                | (Status::New, Status::NoSourceData)
                | (Status::Validated, Status::ArchiveFetched)
                | (Status::ArchiveFetched, Status::Extracted)
                | (Status::Extracted, Status::Converted)
                | (Status::Converted, Status::Uploaded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::NoSourceData | Status::Uploaded)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hidden form fields scraped from a download page; required for the fetch POST.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadForm {
    pub token: String,
    pub date: String,
    pub datemonth: String,
    pub platform: String,
    pub timeframe: String,
    pub fxpair: String,
}

impl DownloadForm {
    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub url: String,
    pub status: Status,

    pub format: Format,
    pub granularity: Granularity,
    pub instrument: String,
    pub year: i32,
    pub month: Option<u32>,
    /// `YYYYMM`, month `00` for yearly archives
    pub datemonth: String,

    pub dir: PathBuf,

    /// Content-Encoding of the download page
    pub encoding: String,
    /// Content-Length of the download page
    pub page_bytes: Option<u64>,
    pub form: DownloadForm,

    pub archive_filename: String,
    pub extracted_filename: String,
    pub columnar_filename: String,

    pub row_count: Option<u64>,
    /// First timestamp in the columnar file, UTC epoch milliseconds
    pub range_start: Option<i64>,
    /// Last timestamp in the columnar file, UTC epoch milliseconds
    pub range_end: Option<i64>,

    pub keep_archive: bool,
}

impl Record {
    /// Create a `NEW` record for an archive page URL.
    pub fn new(url: impl Into<String>, base_dir: &Path) -> Result<Self> {
        let url = url.into();
        let parts = classify(&url)?;
        Ok(Self::from_parts(url, &parts, base_dir))
    }

    fn from_parts(url: String, parts: &UrlParts, base_dir: &Path) -> Self {
        let ym = parts.period.as_year_month();
        Self {
            url,
            status: Status::New,
            format: parts.format,
            granularity: parts.granularity,
            instrument: parts.instrument.clone(),
            year: ym.year,
            month: ym.month,
            datemonth: ym.datemonth(),
            dir: parts.dir(base_dir),
            encoding: String::new(),
            page_bytes: None,
            form: DownloadForm::default(),
            archive_filename: String::new(),
            extracted_filename: String::new(),
            columnar_filename: String::new(),
            row_count: None,
            range_start: None,
            range_end: None,
            keep_archive: false,
        }
    }

    /// Directory of a URL under `base_dir`. Pure; never touches the filesystem.
    pub fn dir_for(url: &str, base_dir: &Path) -> Result<PathBuf> {
        Ok(classify(url)?.dir(base_dir))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn archive_path(&self) -> Option<PathBuf> {
        artifact(&self.dir, &self.archive_filename)
    }

    pub fn extracted_path(&self) -> Option<PathBuf> {
        artifact(&self.dir, &self.extracted_filename)
    }

    pub fn columnar_path(&self) -> Option<PathBuf> {
        artifact(&self.dir, &self.columnar_filename)
    }

    /// Move to `next`, refusing anything outside the transition table.
    pub fn advance(&mut self, next: Status) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(HistfxError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        debug!(url = %self.url, from = %self.status, to = %next, "Status change");
        self.status = next;
        Ok(())
    }

    /// Reconcile with an existing checkpoint under `base_dir`.
    ///
    /// Fields present in the snapshot overwrite in-memory ones; fields the
    /// snapshot lacks or leaves empty (older runs) keep their current values. Returns whether
    /// a checkpoint was found.
    pub fn restore(&mut self, base_dir: &Path) -> Result<bool> {
        self.dir = Self::dir_for(&self.url, base_dir)?;

        let path = self.checkpoint_path();
        if !path.exists() {
            return Ok(false);
        }

        let text = std::fs::read_to_string(&path)?;
        let snapshot: serde_json::Value = serde_json::from_str(&text)?;
        let serde_json::Value::Object(snapshot) = snapshot else {
            return Err(HistfxError::parse(format!(
                "checkpoint {} is not a JSON object",
                path.display()
            )));
        };

        if let Some(url) = snapshot.get("url").and_then(|v| v.as_str()) {
            if url != self.url {
                warn!(
                    url = %self.url,
                    checkpoint_url = %url,
                    path = %path.display(),
                    "Ignoring checkpoint written for a different URL"
                );
                return Ok(false);
            }
        }

        let mut merged = serde_json::to_value(&*self)?;
        if let serde_json::Value::Object(ref mut fields) = merged {
            for (key, value) in snapshot {
                let empty = value.is_null() || value.as_str() == Some("");
                if !empty && fields.contains_key(&key) {
                    fields.insert(key, value);
                }
            }
        }

        let mut restored: Record = serde_json::from_value(merged)?;
        restored.dir = self.dir.clone();
        *self = restored;
        Ok(true)
    }

    /// Persist every field to `<dir>/.meta`, creating the directory if needed.
    ///
    /// Writes to a temporary sibling first and renames it over the
    /// checkpoint, so readers never see a partial file.
    pub fn write_checkpoint(&mut self, base_dir: &Path) -> Result<()> {
        self.dir = Self::dir_for(&self.url, base_dir)?;
        std::fs::create_dir_all(&self.dir)?;

        let path = self.checkpoint_path();
        let temp = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        std::fs::write(&temp, serde_json::to_vec_pretty(&*self)?)?;
        std::fs::rename(&temp, &path)?;
        Ok(())
    }

    /// Remove the checkpoint. A missing file is fine.
    pub fn delete_checkpoint(&self) -> Result<()> {
        match std::fs::remove_file(self.checkpoint_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn artifact(dir: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        None
    } else {
        Some(dir.join(name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::urls::DEFAULT_BASE_URL;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn url(tail: &str) -> String {
        format!("{}?/{}", DEFAULT_BASE_URL, tail)
    }

    #[test]
    fn test_new_classifies_url() {
        let record = Record::new(url("ascii/tick-data-quotes/eurusd/2021/6"), Path::new("/d")).unwrap();
        assert_eq!(record.status, Status::New);
        assert_eq!(record.format, Format::Ascii);
        assert_eq!(record.granularity, Granularity::Tick);
        assert_eq!(record.instrument, "eurusd");
        assert_eq!(record.datemonth, "202106");
        assert_eq!(record.dir, PathBuf::from("/d/ASCII/T/eurusd/2021/6"));
    }

    #[test]
    fn test_transition_table() {
        assert!(Status::New.can_advance_to(Status::Validated));
        assert!(Status::New.can_advance_to(Status::NoSourceData));
        assert!(!Status::New.can_advance_to(Status::ArchiveFetched));
        assert!(!Status::NoSourceData.can_advance_to(Status::ArchiveFetched));
        assert!(!Status::Converted.can_advance_to(Status::Extracted));
        assert!(!Status::Uploaded.can_advance_to(Status::Uploaded));
    }

    #[test]
    fn test_advance_rejects_skipping_stages() {
        let mut record = Record::new(url("ascii/1-minute-bar-quotes/eurusd/2010"), Path::new("/d")).unwrap();
        let err = record.advance(Status::Extracted).unwrap_err();
        assert!(matches!(err, HistfxError::InvalidTransition { .. }));
        assert_eq!(record.status, Status::New);
    }

    #[test]
    fn test_restore_without_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let mut record = Record::new(url("ascii/1-minute-bar-quotes/eurusd/2010"), tmp.path()).unwrap();
        assert!(!record.restore(tmp.path()).unwrap());
        assert_eq!(record.status, Status::New);
    }

    #[test]
    fn test_restore_is_idempotent_at_every_stage() {
        let tmp = TempDir::new().unwrap();
        let address = url("ascii/1-minute-bar-quotes/eurusd/2010");
        let mut record = Record::new(&address, tmp.path()).unwrap();

        for status in [
            Status::Validated,
            Status::ArchiveFetched,
            Status::Extracted,
            Status::Converted,
            Status::Uploaded,
        ] {
            record.advance(status).unwrap();
            record.write_checkpoint(tmp.path()).unwrap();

            let mut fresh = Record::new(&address, tmp.path()).unwrap();
            assert!(fresh.restore(tmp.path()).unwrap());
            assert!(fresh.restore(tmp.path()).unwrap());
            assert_eq!(fresh.status, status);
            assert_eq!(fresh.dir, record.dir);
            assert_eq!(fresh, record);
        }
    }

    #[test]
    fn test_restore_tolerates_older_snapshots() {
        let tmp = TempDir::new().unwrap();
        let address = url("ascii/tick-data-quotes/gbpusd/2019/3");
        let record = Record::new(&address, tmp.path()).unwrap();
        std::fs::create_dir_all(&record.dir).unwrap();
        std::fs::write(
            record.checkpoint_path(),
            serde_json::json!({
                "url": address,
                "status": "ARCHIVE_FETCHED",
                "instrument": "",
                "archive_filename": "HISTDATA_COM_ASCII_GBPUSD_T201903.zip",
                "jay_filename": "legacy field"
            })
            .to_string(),
        )
        .unwrap();

        let mut restored = Record::new(&address, tmp.path()).unwrap();
        assert!(restored.restore(tmp.path()).unwrap());
        assert_eq!(restored.status, Status::ArchiveFetched);
        assert_eq!(restored.archive_filename, "HISTDATA_COM_ASCII_GBPUSD_T201903.zip");
        assert_eq!(restored.instrument, "gbpusd");
        assert!(restored.form.is_empty());
    }

    #[test]
    fn test_restore_ignores_foreign_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let mut record = Record::new(url("ascii/1-minute-bar-quotes/eurusd/2010"), tmp.path()).unwrap();
        std::fs::create_dir_all(&record.dir).unwrap();
        std::fs::write(
            record.checkpoint_path(),
            r#"{"url": "http://elsewhere/?/x", "status": "UPLOADED"}"#,
        )
        .unwrap();

        assert!(!record.restore(tmp.path()).unwrap());
        assert_eq!(record.status, Status::New);
    }

    #[test]
    fn test_delete_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let mut record = Record::new(url("ascii/1-minute-bar-quotes/eurusd/2010"), tmp.path()).unwrap();
        record.write_checkpoint(tmp.path()).unwrap();
        assert!(record.checkpoint_path().exists());
        assert!(!record.dir.join(".meta.tmp").exists());

        record.delete_checkpoint().unwrap();
        assert!(!record.checkpoint_path().exists());
        record.delete_checkpoint().unwrap();
    }

    fn parts_strategy() -> impl Strategy<Value = UrlParts> {
        use crate::instruments::INSTRUMENTS;
        use crate::urls::Period;

        (
            prop::sample::select(Format::ALL.to_vec()),
            prop::sample::select(Granularity::ALL.to_vec()),
            prop::sample::select(INSTRUMENTS.to_vec()),
            2000i32..2030,
            prop::option::of(1u32..=12),
        )
            .prop_map(|(format, granularity, instrument, year, month)| UrlParts {
                format,
                granularity,
                instrument: instrument.to_string(),
                period: match month {
                    Some(m) => Period::Month(year, m),
                    None => Period::Year(year),
                },
            })
    }

    proptest! {
        #[test]
        fn prop_dir_is_pure(parts in parts_strategy()) {
            let base = Path::new("/base");
            let address = parts.to_url(DEFAULT_BASE_URL);
            let first = Record::dir_for(&address, base).unwrap();
            let second = Record::dir_for(&address, base).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert!(first.starts_with(base));
        }

        #[test]
        fn prop_distinct_urls_never_share_a_dir(a in parts_strategy(), b in parts_strategy()) {
            prop_assume!(a != b);
            let base = Path::new("/base");
            prop_assert_ne!(a.dir(base), b.dir(base));
        }
    }
}
