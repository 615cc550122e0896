//! 🚀 The Job Driver. Finds the files, hands them to a pool, and tidies up after.
//!
//! ```text
//!   glob(pattern) ──▶ [a.tsv.gz, b.tsv.gz, ...] ──buffer_unordered(workers)──▶ process_file
//!                                                                                   │
//!                                        rename to .a.tsv.gz  ◀── archive? ◀────────┘
//! ```
//!
//! Files start in sorted order; they finish in whatever order they please.
//! Each file is archived as soon as its own result comes back, so a crash
//! halfway through leaves the finished files hidden and the rest in place
//! for the next run. 🦆

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt, stream};
use tracing::{info, warn};

use crate::app_config::AppConfig;
use crate::backends::StoreConnector;
use crate::common::{FileRunResult, Verdict};
use crate::progress::JobProgress;
use crate::supervisors::process_file;

/// 🧾 Everything a job did, in completion order.
#[derive(Debug, Default)]
pub struct JobReport {
    pub files: Vec<FileRunResult>,
    /// 🙈 where the archived files ended up (dot-prefixed)
    pub archived: Vec<PathBuf>,
}

impl JobReport {
    pub fn processed(&self) -> u64 {
        self.files.iter().map(|file| file.processed).sum()
    }

    pub fn errors(&self) -> u64 {
        self.files.iter().map(|file| file.errors).sum()
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        self.files.iter().filter(|file| file.verdict == verdict).count()
    }
}

/// 🔍 Files matching `pattern`, sorted, minus directories and anything
/// already hidden with a leading dot (that's how finished files are marked).
pub(crate) fn discover(pattern: &str) -> Result<Vec<PathBuf>> {
    let matches = glob::glob(pattern).context(format!(
        "💀 '{pattern}' is not a glob pattern we can work with"
    ))?;
    let mut files = Vec::new();
    for entry in matches {
        let path = entry.context("💀 Could not read a path while expanding the file pattern")?;
        if !path.is_file() || is_hidden(&path) {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// 🙈 `dir/name` → `dir/.name`, so the next glob walks right past it.
pub(crate) async fn dot_rename(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .context(format!("💀 '{}' has no file name to hide", path.display()))?;
    let mut hidden_name = std::ffi::OsString::from(".");
    hidden_name.push(name);
    let hidden = path.with_file_name(hidden_name);
    tokio::fs::rename(path, &hidden).await.context(format!(
        "💀 Could not rename '{}' to '{}'",
        path.display(),
        hidden.display()
    ))?;
    Ok(hidden)
}

/// 🗃️ Should this file be hidden from the next run? Empty and accepted
/// files always are; rejected and failed ones only when the config says so,
/// otherwise they stay put and the next run takes another swing.
pub(crate) fn should_archive(result: &FileRunResult, archive_rejected: bool) -> bool {
    match result.verdict {
        Verdict::Empty | Verdict::Accepted => true,
        Verdict::Rejected | Verdict::Failed => archive_rejected,
    }
}

/// 🚀 Run every matching file through the pool. The first fatal error stops
/// the job; files that already finished keep their results and renames.
pub(crate) async fn run_job(app_config: &AppConfig) -> Result<JobReport> {
    let files = discover(&app_config.runtime.pattern)?;
    if files.is_empty() {
        warn!("⚠️ No files match '{}'. Nothing to do.", app_config.runtime.pattern);
        return Ok(JobReport::default());
    }

    let workers = app_config.runtime.worker_count();
    info!(
        "🚀 Loading {} files with {} workers{}",
        files.len(),
        workers,
        if app_config.runtime.dry_run { " (dry run)" } else { "" }
    );

    let connector = StoreConnector::from_config(&app_config.store_config);
    let mut progress = JobProgress::new(files.len() as u64);
    let mut report = JobReport::default();

    let mut results = stream::iter(files)
        .map(|path| {
            let connector = &connector;
            async move { process_file(&path, app_config, connector).await }
        })
        .buffer_unordered(workers);

    while let Some(result) = results.try_next().await? {
        if should_archive(&result, app_config.runtime.archive_rejected) {
            report.archived.push(dot_rename(&result.path).await?);
        } else {
            info!("📌 Leaving {} in place ({})", result.path.display(), result.verdict);
        }
        progress.update(&result);
        report.files.push(result);
    }

    progress.finish();
    Ok(report)
}
