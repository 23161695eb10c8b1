//! Zip extraction
//!
//! histdata.com archives hold one CSV plus a status text file. Only the CSV
//! is extracted.

use anyhow::{Context, Result};
use histfx_common::HistfxError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Extract the single `.csv` member of `archive` into `dir`.
///
/// Returns the extracted file name. An archive without a CSV member is a
/// malformed response from the source; `url` names it in the error.
pub fn extract_csv(archive: &Path, dir: &Path, url: &str) -> Result<String> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| HistfxError::malformed(url, format!("not a zip archive: {}", e)))?;

    let mut csv_index = None;
    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry at index {}", i))?;
        if !entry.is_dir() && entry.name().to_lowercase().ends_with(".csv") {
            csv_index = Some(i);
            break;
        }
    }

    let index = csv_index.ok_or_else(|| HistfxError::malformed(url, "archive has no .csv member"))?;
    let mut entry = zip
        .by_index(index)
        .with_context(|| format!("Failed to read zip entry at index {}", index))?;

    // Flatten the member path; never write outside `dir`.
    let filename = entry
        .enclosed_name()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .ok_or_else(|| HistfxError::malformed(url, format!("unsafe member name {}", entry.name())))?;

    std::fs::create_dir_all(dir)?;
    let target = dir.join(&filename);
    let mut out = BufWriter::new(
        File::create(&target).with_context(|| format!("Failed to create {}", target.display()))?,
    );
    std::io::copy(&mut entry, &mut out)
        .with_context(|| format!("Failed to extract {} from {}", filename, archive.display()))?;
    out.flush()
        .with_context(|| format!("Failed to write {}", target.display()))?;

    Ok(filename)
}
