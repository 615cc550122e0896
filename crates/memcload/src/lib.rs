//! 📱 memcload - loads installed-apps logs into sharded memcached, one
//! gzipped TSV at a time, several files at once.
//!
//! 🎬 *[narrator voice]* "Every phone. Every app. Every shard. By morning."
//!
//! The map, for the lost and the newly onboarded:
//!
//! - [`app_config`] 🔧 config loading (TOML + `MEMCLOAD_*` env)
//! - `job` 🚀 discovery, the file pool, archival
//! - `supervisors` 📦 one file end to end, plus its shard workers
//! - `parser` / `router` / `encoding` / `batcher` 🧵 the per-line path
//! - `retry` / `backends` 🔁 getting bytes into a store, eventually
//!
//! 🦆 The duck is load-bearing. Do not remove the duck.

pub mod app_config;
mod backends;
mod batcher;
mod common;
mod encoding;
mod job;
mod parser;
mod progress;
mod retry;
mod router;
mod supervisors;

use anyhow::{Context, Result};

pub use common::{FileRunResult, ShardOutcome, Verdict};
pub use encoding::self_check;
pub use job::JobReport;

use crate::app_config::AppConfig;

/// 🚀 Run a whole job: every file matching `runtime.pattern`, through the
/// pool, into the shards. Rejected files are in the report, not in the `Err`;
/// an `Err` means the job itself could not go on.
pub async fn run(app_config: AppConfig) -> Result<JobReport> {
    app_config
        .validate()
        .context("💀 The configuration loaded, but it doesn't make sense. Fix the values above and try again.")?;
    job::run_job(&app_config)
        .await
        .context("💀 The load job stopped early. Files finished before this point were already archived.")
}
