//! 📊 progress.rs - "Are we there yet?" - every loader, every time, forever.
//!
//! 🚀 One bar for the whole job, one tick per finished file, and a small
//! comfy-table underneath with the running totals.
//!
//! ⚠️  Warning: Watching this progress bar will not make it go faster.
//! Neither will refreshing it. We've tried. Science says no.

use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

use crate::common::{FileRunResult, Verdict};

/// 🔢 Formats a number with commas for the 3 people in the audience who like readability.
/// "1000000 rows" → "1,000,000 rows" - you're welcome, eyes.
pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ Formats a Duration into MM:SS or HH:MM:SS.
/// If it shows HH:MM:SS, you should probably call your mom. It's been a while.
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// 📊 Running tally of a job, rendered onto an indicatif bar.
pub(crate) struct JobProgress {
    total_files: u64,
    files_done: u64,
    rows: u64,
    errors: u64,
    rejected: u64,
    progress_bar: ProgressBar,
    start_time: Instant,
}

impl std::fmt::Debug for JobProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("JobProgress")
            .field("total_files", &self.total_files)
            .field("files_done", &self.files_done)
            .field("rows", &self.rows)
            .field("errors", &self.errors)
            .finish()
    }
}

impl JobProgress {
    pub(crate) fn new(total_files: u64) -> Self {
        let progress_bar = ProgressBar::new(total_files);
        // -- 🎨 cyan because it's classy, blue because it's calm
        let style = ProgressStyle::default_bar()
            .template("{msg}\n| [{bar:40.cyan/blue}] {pos}/{len} files")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        progress_bar.set_style(style);

        Self {
            total_files,
            files_done: 0,
            rows: 0,
            errors: 0,
            rejected: 0,
            progress_bar,
            start_time: Instant::now(),
        }
    }

    /// 🔄 One more file in the books.
    pub(crate) fn update(&mut self, result: &FileRunResult) {
        self.files_done += 1;
        self.rows += result.processed;
        self.errors += result.errors;
        if matches!(result.verdict, Verdict::Rejected | Verdict::Failed) {
            self.rejected += 1;
        }
        self.render(result);
        self.progress_bar.set_position(self.files_done);
    }

    /// ✅ Ring the bell. We made it.
    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    fn remaining(&self, elapsed: Duration) -> String {
        if self.files_done == 0 || self.files_done >= self.total_files {
            return "--:--".to_string();
        }
        // 🔮 linear extrapolation - assumes the remaining files look like the finished ones
        let per_file = elapsed.as_secs_f64() / self.files_done as f64;
        let left = (self.total_files - self.files_done) as f64 * per_file;
        format_duration(Duration::from_secs_f64(left))
    }

    /// 🎨 Layout:
    /// ```text
    /// last: <file> (<verdict>)
    ///   <rows/s>        <total rows>
    ///   <errors>        <rejected files>
    ///   <elapsed>       <remaining>
    /// | [=====>----------] 3/10 files
    /// ```
    fn render(&self, last: &FileRunResult) {
        let elapsed = self.start_time.elapsed();
        let rows_per_sec = if elapsed.as_secs_f64() > 0.0 {
            self.rows as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} Rows/s", format_number(rows_per_sec as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} Rows", format_number(self.rows))).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} Errors", format_number(self.errors))).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} Rejected files", self.rejected)).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(elapsed))).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} remaining", self.remaining(elapsed))).set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar.set_message(format!(
            "last: {} ({})\n{}",
            last.path.display(),
            last.verdict,
            table
        ));
    }
}
