//! 🔍 The Record Parser - one line of TSV in, one [`InstalledAppRecord`] out.
//! Or a polite, itemized [`Rejected`]. Never a panic. We have standards.
//!
//! 📜 Line shape: `device_type \t device_id \t lat \t lon \t app,app,app`
//!
//! Tolerance policy, in order of how forgiving we are:
//! - 🌍 broken lat/lon: warn, drop both coordinates, keep the record
//! - 📱 some non-numeric app ids: warn, keep the purely numeric ones
//! - 🪪 empty device_type / device_id: rejected
//! - 🧱 not exactly five fields: rejected
//!
//! Blank lines never get here; the coordinator skips them via [`is_blank`].

use thiserror::Error;
use tracing::warn;

use crate::common::InstalledAppRecord;

const FIELD_COUNT: usize = 5;

/// 🚫 Why a line did not make it. Counted as a parse error by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum Rejected {
    #[error("malformed line: expected 5 tab-separated fields, found {fields}")]
    Malformed { fields: usize },
    #[error("missing identity fields: device_type and device_id must both be non-empty")]
    MissingIdentity,
}

/// 💤 Whitespace-only lines are skipped, not counted.
pub(crate) fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// 🔍 Parse one log line.
///
/// The line is trimmed first, so a trailing `\n`, `\r\n` or stray spaces are
/// fine. Tabs at the edges are trimmed too, so a line whose first or last
/// field is empty comes up one field short and lands in `Malformed`.
pub(crate) fn parse(line: &str) -> Result<InstalledAppRecord, Rejected> {
    let line = line.trim();
    let fields = split_tabs(line);
    if fields.len() != FIELD_COUNT {
        return Err(Rejected::Malformed {
            fields: fields.len(),
        });
    }

    let (device_type, device_id) = (fields[0], fields[1]);
    if device_type.is_empty() || device_id.is_empty() {
        return Err(Rejected::MissingIdentity);
    }

    let (latitude, longitude) = parse_geo(fields[2], fields[3], line);
    let apps = parse_apps(fields[4], line);

    Ok(InstalledAppRecord {
        device_type: device_type.to_string(),
        device_id: device_id.to_string(),
        latitude,
        longitude,
        apps,
    })
}

// -- ✂️ memchr finds the tabs; '\t' is ASCII so the byte offsets are always char boundaries
fn split_tabs(line: &str) -> Vec<&str> {
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut start = 0;
    for tab in memchr::memchr_iter(b'\t', line.as_bytes()) {
        fields.push(&line[start..tab]);
        start = tab + 1;
    }
    fields.push(&line[start..]);
    fields
}

/// 🌍 Both coordinates or neither. Half a location is just a rumor.
fn parse_geo(lat: &str, lon: &str, line: &str) -> (Option<f64>, Option<f64>) {
    match (lat.trim().parse::<f64>(), lon.trim().parse::<f64>()) {
        (Ok(lat), Ok(lon)) => (Some(lat), Some(lon)),
        _ => {
            warn!("🌍 Invalid geo coords, keeping the record without them: `{}`", line);
            (None, None)
        }
    }
}

/// 📱 Strict pass first; if any token refuses to be a number, fall back to the
/// tokens that are nothing but ASCII digits.
fn parse_apps(raw_apps: &str, line: &str) -> Vec<u32> {
    let strict: Result<Vec<u32>, _> = raw_apps
        .split(',')
        .map(|token| token.trim().parse::<u32>())
        .collect();

    match strict {
        Ok(apps) => apps,
        Err(_) => {
            warn!("📱 Not all user apps are digits: `{}`", line);
            raw_apps
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
                // -- 🧮 digits-only but bigger than u32::MAX still has nowhere to go
                .filter_map(|token| token.parse::<u32>().ok())
                .collect()
        }
    }
}
