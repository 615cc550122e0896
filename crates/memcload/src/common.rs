//! 📦 Common data structures - the building blocks of memcload
//!
//! ---
//!
//! 🎬 COLD OPEN - INT. LOG ARCHIVE - 3:47 AM
//!
//! A gzip file the size of a small moon sits in `./data`. Inside it, a few
//! hundred million tab-separated lines, each one a phone confessing which
//! apps it has installed. Somebody needs those confessions in memcached by
//! morning. Somebody always does.
//!
//! 🦆
//!
//! This module holds the humble structs that carry a line from "text" to
//! "bytes in a shard": the parsed [`InstalledAppRecord`], the [`Batch`] a
//! shard worker writes in one go, and the counters that come back up
//! ([`ShardOutcome`], [`FileRunResult`]).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

/// 🎯 One parsed log line. One phone, one destiny.
///
/// Geo fields are `Option` because the log is allowed to lie about where a
/// phone is. A record with broken coordinates is still a record; it just
/// travels without a map.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InstalledAppRecord {
    /// 🔀 selects the shard (idfa, gaid, adid, dvid, ...)
    pub device_type: String,
    pub device_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// 📱 installed application ids, in the order the log listed them
    pub apps: Vec<u32>,
}

impl InstalledAppRecord {
    /// 🔑 `"{device_type}:{device_id}"` - the name this record goes by in the store.
    pub(crate) fn store_key(&self) -> String {
        format!("{}:{}", self.device_type, self.device_id)
    }
}

/// 📦 A `Batch` - because one `set` per phone is how you end up writing a post-mortem.
///
/// Maps store key → encoded payload. Keys are unique: inserting an existing
/// key replaces the payload (last write wins). Nothing dedupes across
/// batches; the store will simply see the later write last.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Batch {
    entries: HashMap<String, Vec<u8>>,
}

impl Batch {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// 📥 Insert or overwrite. Returns the payload that got replaced, if any.
    pub(crate) fn insert(&mut self, key: String, payload: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.insert(key, payload)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// 🔑 Every key in the batch, sorted, so retries and logs are deterministic.
    pub(crate) fn keys(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(key, payload)| (key.as_str(), payload.as_slice()))
    }

    /// ✂️ A new batch holding only `keys` (unknown keys are ignored).
    /// Used by retries: only the still-unacknowledged keys get resent.
    pub(crate) fn select(&self, keys: &BTreeSet<String>) -> Batch {
        let entries = keys
            .iter()
            .filter_map(|key| {
                self.entries
                    .get(key)
                    .map(|payload| (key.clone(), payload.clone()))
            })
            .collect();
        Batch { entries }
    }

    /// 📊 Total payload bytes. Cold, indifferent, useful in debug logs.
    pub(crate) fn total_bytes(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// 🧾 What a shard worker reports when it stops: how many records landed,
/// how many did not. `processed + errors` is every batch entry it was handed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardOutcome {
    pub processed: u64,
    pub errors: u64,
}

impl ShardOutcome {
    pub(crate) fn record(&mut self, processed: u64, errors: u64) {
        self.processed += processed;
        self.errors += errors;
    }

    pub fn handled(&self) -> u64 {
        self.processed + self.errors
    }
}

/// ⚖️ The file-level judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 💤 nothing was processed and nothing went wrong; no rate, no drama
    Empty,
    /// 🔥 nothing was processed but errors piled up (every write bounced,
    /// every line was junk). No rate either, but definitely drama.
    Failed,
    /// ✅ error rate under the threshold
    Accepted,
    /// 💀 error rate at or over the threshold
    Rejected,
}

impl Verdict {
    /// ⚖️ `errors / processed` against `max_error_rate`. Zero processed means
    /// [`Verdict::Empty`] (no errors) or [`Verdict::Failed`] (some errors), and
    /// no division ever happens.
    pub fn judge(processed: u64, errors: u64, max_error_rate: f64) -> Self {
        match error_rate(processed, errors) {
            None if errors == 0 => Verdict::Empty,
            None => Verdict::Failed,
            Some(rate) if rate < max_error_rate => Verdict::Accepted,
            Some(_) => Verdict::Rejected,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Verdict::Empty => "empty",
            Verdict::Failed => "failed",
            Verdict::Accepted => "accepted",
            Verdict::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

pub(crate) fn error_rate(processed: u64, errors: u64) -> Option<f64> {
    if processed == 0 {
        None
    } else {
        Some(errors as f64 / processed as f64)
    }
}

/// 📜 Everything we learned about one input file, summed across all shards.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRunResult {
    pub path: PathBuf,
    pub processed: u64,
    /// 💀 parse rejections + routing rejections + write failures
    pub errors: u64,
    pub parse_errors: u64,
    pub route_errors: u64,
    /// 🔀 per device type, for the curious and the on-call
    pub shard_outcomes: BTreeMap<String, ShardOutcome>,
    pub verdict: Verdict,
}

impl FileRunResult {
    pub fn error_rate(&self) -> Option<f64> {
        error_rate(self.processed, self.errors)
    }

    pub fn write_errors(&self) -> u64 {
        self.shard_outcomes.values().map(|outcome| outcome.errors).sum()
    }
}
