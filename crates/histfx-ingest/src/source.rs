//! histdata.com download pages and archive fetches
//!
//! Each archive page carries a hidden form (`form#file_down`) whose fields,
//! POSTed back to `get.php` with the page as Referer, return the zip. A page
//! whose token field is empty has no data for that period.

use crate::record::{DownloadForm, Record};
use anyhow::{Context, Result};
use histfx_common::HistfxError;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_LENGTH, REFERER};
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Client Constants
// ============================================================================

/// Default timeout for page and archive requests in seconds.
/// Can be overridden via HISTFX_HTTP_TIMEOUT_SECS.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;

const USER_AGENT: &str = concat!("histfx/", env!("CARGO_PKG_VERSION"));

/// What a download page had to say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageForm {
    pub form: DownloadForm,
    /// Content-Encoding of the page response
    pub encoding: String,
    /// Content-Length of the page response
    pub page_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLookup {
    Found(PageForm),
    /// The page exists but offers nothing to download.
    NotFound,
}

/// A fetched zip archive.
#[derive(Debug, Clone)]
pub struct Archive {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Remote side of the validate and download stages.
pub trait SourceClient: Send + Sync {
    /// Scrape the download form of an archive page.
    fn fetch_form(&self, url: &str) -> Result<PageLookup>;

    /// Submit a record's form and return the archive it answers with.
    fn fetch_archive(&self, record: &Record) -> Result<Archive>;
}

/// [`SourceClient`] over blocking HTTP.
pub struct HistdataClient {
    client: Client,
    post_url: String,
}

impl HistdataClient {
    pub fn new(post_url: impl Into<String>) -> Result<Self> {
        let timeout_secs = std::env::var("HISTFX_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            post_url: post_url.into(),
        })
    }
}

impl SourceClient for HistdataClient {
    fn fetch_form(&self, url: &str) -> Result<PageLookup> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("Failed to fetch {}", url))?
            .error_for_status()
            .with_context(|| format!("Download page {} returned an error", url))?;

        let headers = response.headers();
        let encoding = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let page_bytes = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let html = response
            .text()
            .with_context(|| format!("Failed to read body of {}", url))?;
        let form = parse_form(&html)?;

        if form.is_empty() {
            debug!(url = %url, "No download token on page");
            return Ok(PageLookup::NotFound);
        }

        Ok(PageLookup::Found(PageForm {
            form,
            encoding,
            page_bytes,
        }))
    }

    fn fetch_archive(&self, record: &Record) -> Result<Archive> {
        let form = &record.form;
        let fields = [
            ("tk", form.token.as_str()),
            ("date", form.date.as_str()),
            ("datemonth", form.datemonth.as_str()),
            ("platform", form.platform.as_str()),
            ("timeframe", form.timeframe.as_str()),
            ("fxpair", form.fxpair.as_str()),
        ];

        let response = self
            .client
            .post(&self.post_url)
            .header(REFERER, &record.url)
            .form(&fields)
            .send()
            .with_context(|| format!("Failed to request archive for {}", record.url))?
            .error_for_status()
            .with_context(|| format!("Archive request for {} returned an error", record.url))?;

        let disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let filename = disposition
            .as_deref()
            .and_then(filename_from_disposition)
            .ok_or_else(|| {
                HistfxError::malformed(&record.url, "response has no Content-Disposition filename")
            })?;

        let bytes = response
            .bytes()
            .with_context(|| format!("Failed to read archive body for {}", record.url))?
            .to_vec();

        debug!(url = %record.url, filename = %filename, bytes = bytes.len(), "Fetched archive");
        Ok(Archive { filename, bytes })
    }
}

/// Read the hidden fields of `form#file_down`.
///
/// Missing fields stay empty; an empty token means the page has no archive.
pub fn parse_form(html: &str) -> Result<DownloadForm> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("form#file_down input")
        .map_err(|e| anyhow::anyhow!("Invalid form selector: {:?}", e))?;

    let mut form = DownloadForm::default();
    for input in document.select(&selector) {
        let element = input.value();
        let value = element.attr("value").unwrap_or_default().trim().to_string();
        match element.id() {
            Some("tk") => form.token = value,
            Some("date") => form.date = value,
            Some("datemonth") => form.datemonth = value,
            Some("platform") => form.platform = value,
            Some("timeframe") => form.timeframe = value,
            Some("fxpair") => form.fxpair = value,
            _ => {},
        }
    }
    Ok(form)
}

/// `attachment; filename=HISTDATA_COM_ASCII_EURUSD_M12019.zip` → the file name.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let (_, value) = header.split(';').nth(1)?.split_once('=')?;
    let name = value.trim().trim_matches('"');
    if name.is_empty() || name.contains(['/', '\\']) {
        return None;
    }
    Some(name.to_string())
}
