//! SHA-256 fingerprint of the available-data summary

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hash a value through its JSON form.
///
/// Object keys come out of `serde_json::Value` sorted, so two maps holding the
/// same entries hash identically regardless of insertion order.
pub fn json_sha256<T: Serialize>(value: &T) -> Result<String> {
    let canonical = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
