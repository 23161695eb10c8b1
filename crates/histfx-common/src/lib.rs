//! histfx Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging, and hashing utilities for the histfx workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`HistfxError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Checksums**: SHA-256 over the canonical JSON form of a value
//!
//! # Example
//!
//! ```no_run
//! use histfx_common::{Result, HistfxError};
//! use histfx_common::checksum::json_sha256;
//! use std::collections::BTreeMap;
//!
//! fn fingerprint(pairs: &BTreeMap<String, String>) -> Result<String> {
//!     let digest = json_sha256(pairs)?;
//!     if digest.is_empty() {
//!         return Err(HistfxError::parse("empty digest"));
//!     }
//!     Ok(digest)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{HistfxError, Result};
