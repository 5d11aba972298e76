//! De-identification helpers used while parsing.
//!
//! Nothing here keeps state. Identifying values are either reduced (dates to
//! months), rejected (identifier-shaped dimensions) or hashed (whole uploads).

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::models::UNKNOWN_STATE;

/// Date layouts seen in 835 DTM segments and CSV exports.
const DATE_FORMATS: [&str; 5] = ["%Y%m%d", "%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%m/%d/%y"];

/// Runs of this many digits look like member IDs, NPIs or SSNs.
const IDENTIFIER_DIGIT_RUN: usize = 9;

/// Reduce a service date to `YYYY-MM`.
///
/// Returns `None` for anything that is not a valid calendar date.
pub fn service_month(raw: &str) -> Option<String> {
    let raw = raw.trim();
    // DTM*RD8 ranges: keep the start of the period
    let raw = raw.split('-').next().filter(|s| s.len() == 8).unwrap_or(raw);

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .map(|date| date.format("%Y-%m").to_string())
}

/// Uppercase two-letter region code, or [`UNKNOWN_STATE`].
pub fn normalize_state(raw: &str) -> String {
    let state = raw.trim().to_uppercase();
    if state.len() == 2 && state.chars().all(|c| c.is_ascii_alphabetic()) {
        state
    } else {
        UNKNOWN_STATE.to_string()
    }
}

/// Clean a free-text dimension (payer name) for use in a bucket key.
///
/// Rejects empty values and anything carrying an identifier-shaped digit run.
pub fn guard_dimension(raw: &str) -> Option<String> {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if cleaned.is_empty() || has_identifier_digits(&cleaned) {
        return None;
    }
    Some(cleaned)
}

fn has_identifier_digits(value: &str) -> bool {
    let mut run = 0;
    for c in value.chars() {
        if c.is_ascii_digit() {
            run += 1;
            if run >= IDENTIFIER_DIGIT_RUN {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// Irreversible SHA-256 fingerprint of a raw upload, as lowercase hex.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
