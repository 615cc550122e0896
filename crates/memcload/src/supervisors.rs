//! 🎬 *[camera pans across a directory of .tsv.gz files]*
//! 🎬 "In a world where every phone has an opinion about its apps..."
//! 🎬 "One coordinator dared to read them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The File Coordinator - drives one input file end to end:
//!
//! ```text
//!   .tsv.gz ──gunzip──▶ lines ──parse──▶ record ──route──▶ encode ──▶ ShardBatcher[type]
//!                         │                │                                  │
//!                    blank: skip     rejected/unrouted: count            bounded queue
//!                                                                             ▼
//!                                                              ShardWorker[type] ──▶ store
//! ```
//!
//! The line reader runs on a blocking thread (gzip is synchronous); shard
//! workers are tokio tasks, one per configured device type, single producer
//! and single consumer per queue. At end of stream every batcher flushes and
//! sends its end-of-stream marker, the workers report, and the counts are
//! judged against the error-rate threshold.
//!
//! ⚠️ DO NOT MAKE THE WORKERS PUB EVER. Like Fight Club, but for async tasks.

mod workers;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use tracing::{error, info};

use crate::app_config::{AppConfig, ShardTable};
use crate::backends::StoreConnector;
use crate::batcher::ShardBatcher;
use crate::common::{FileRunResult, ShardOutcome, Verdict};
use crate::encoding;
use crate::parser;
use crate::router::{Unrouted, route};
use workers::{ShardWorker, Worker};

// 📢 reader heartbeat, in accepted lines
const PROGRESS_EVERY: u64 = 500_000;

/// 🧮 What the reader counted on its own, before any shard weighed in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct LineTally {
    accepted: u64,
    parse_errors: u64,
    route_errors: u64,
}

/// 📦 One file, start to finish.
///
/// 💀 Line-level problems (bad lines, unknown device types, refused writes)
/// are counted, never raised. An `Err` means the file itself could not be
/// read, or something in the orchestration broke; the job should stop.
pub(crate) async fn process_file(
    path: &Path,
    app_config: &AppConfig,
    connector: &StoreConnector,
) -> Result<FileRunResult> {
    info!("📂 Processing {}", path.display());
    let runtime = &app_config.runtime;

    // -- 🧵 1. one worker + one bounded queue per shard
    let mut batchers = HashMap::with_capacity(app_config.shards.len());
    let mut handles = Vec::with_capacity(app_config.shards.len());
    for (device_type, endpoint) in app_config.shards.iter() {
        let (tx, rx) = async_channel::bounded(runtime.queue_capacity.max(1));
        let worker = ShardWorker::new(
            device_type.to_string(),
            endpoint.to_string(),
            rx,
            connector.clone(),
            app_config.retry.clone(),
            runtime.dry_run,
        );
        handles.push((device_type.to_string(), worker.start()));
        batchers.insert(
            device_type.to_string(),
            ShardBatcher::new(device_type.to_string(), runtime.batch_capacity, tx),
        );
    }

    // -- 📖 2-4. read, parse, route, batch, flush. On failure the batchers drop,
    // -- their queues close, and the workers wind down on their own.
    let reader_path = path.to_path_buf();
    let shards = app_config.shards.clone();
    let reading =
        tokio::task::spawn_blocking(move || read_file(&reader_path, &shards, batchers)).await;

    // -- 🧾 5. every worker reports, even when the reader failed
    let mut shard_outcomes = BTreeMap::new();
    for (device_type, handle) in handles {
        let outcome = handle.await.context(format!(
            "💀 The {device_type} shard worker crashed while loading {}. That's not a bad line, that's a bug.",
            path.display()
        ))?;
        shard_outcomes.insert(device_type, outcome);
    }

    let tally = reading
        .context(format!("💀 The reader thread for {} crashed", path.display()))??;

    Ok(summarize(
        path.to_path_buf(),
        tally,
        shard_outcomes,
        runtime.max_error_rate,
    ))
}

/// 📖 The blocking half: gunzip, split lines, parse, route, encode, batch, flush.
fn read_file(
    path: &Path,
    shards: &ShardTable,
    mut batchers: HashMap<String, ShardBatcher>,
) -> Result<LineTally> {
    let file = File::open(path).context(format!(
        "💀 The door to '{}' would not budge. It might not exist, or permissions might be wrong. \
         Either way the file remains unopened and we remain outside.",
        path.display()
    ))?;
    let reader = BufReader::new(MultiGzDecoder::new(file));
    let mut tally = LineTally::default();

    for raw_line in reader.split(b'\n') {
        let raw_line = raw_line.context(format!(
            "💀 Failed to read {} - truncated gzip, or not gzip at all?",
            path.display()
        ))?;
        let line = match std::str::from_utf8(&raw_line) {
            Ok(line) => line,
            Err(_) => {
                tally.parse_errors += 1;
                info!("🚫 Line is not valid UTF-8, skipping: {:?}", String::from_utf8_lossy(&raw_line));
                continue;
            }
        };
        if parser::is_blank(line) {
            continue;
        }

        let record = match parser::parse(line) {
            Ok(record) => record,
            Err(rejected) => {
                tally.parse_errors += 1;
                info!("🚫 {}: `{}`", rejected, line.trim());
                continue;
            }
        };

        if let Err(Unrouted { device_type }) = route(&record, shards) {
            tally.route_errors += 1;
            error!("💀 Unknown device type: {}", device_type);
            continue;
        }
        let batcher = batchers.get_mut(&record.device_type).context(format!(
            "💀 Device type {} routed to a shard that has no batcher. The shard table changed mid-file?",
            record.device_type
        ))?;
        batcher.add(record.store_key(), encoding::encode(&record))?;

        tally.accepted += 1;
        if tally.accepted % PROGRESS_EVERY == 0 {
            info!("📊 Processed {} rows of {}", tally.accepted, path.display());
        }
    }

    for batcher in batchers.into_values() {
        batcher.flush()?;
    }
    Ok(tally)
}

/// ⚖️ 5-7. Sum it all up and pass judgement.
fn summarize(
    path: PathBuf,
    tally: LineTally,
    shard_outcomes: BTreeMap<String, ShardOutcome>,
    max_error_rate: f64,
) -> FileRunResult {
    let processed: u64 = shard_outcomes.values().map(|outcome| outcome.processed).sum();
    let mut result = FileRunResult {
        path,
        processed,
        errors: tally.parse_errors + tally.route_errors,
        parse_errors: tally.parse_errors,
        route_errors: tally.route_errors,
        shard_outcomes,
        verdict: Verdict::Empty,
    };
    result.errors += result.write_errors();
    result.verdict = Verdict::judge(result.processed, result.errors, max_error_rate);

    match (result.verdict, result.error_rate()) {
        (Verdict::Accepted, Some(rate)) => {
            info!("✅ Acceptable error rate ({}). Successful load of {}", rate, result.path.display())
        }
        (Verdict::Rejected, Some(rate)) => error!(
            "💀 High error rate ({} > {}). Failed load of {}",
            rate,
            max_error_rate,
            result.path.display()
        ),
        (Verdict::Failed, _) => error!(
            "🔥 Nothing landed from {}: {} errors and not a single success. Failed load",
            result.path.display(),
            result.errors
        ),
        // -- 💤 nothing processed, nothing wrong: no rate, no verdict log
        _ => info!("💤 Nothing processed in {}", result.path.display()),
    }
    result
}
