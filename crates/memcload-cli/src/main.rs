//! 🚀 memcload-cli - the front door, the bouncer, the maitre d' of memcload.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that loads config,
//! sets up logging, and then lets the real code do the heavy lifting.
//! Like a manager. 🦆

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL};
use memcload::JobReport;
use memcload::app_config::{AppConfig, load_config};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "memcload.toml";

/// 📱 Load gzipped installed-apps logs into sharded memcached.
#[derive(Debug, Parser)]
#[command(name = "memcload", version, about)]
struct Args {
    /// 🔧 TOML config file (defaults to ./memcload.toml when it exists)
    config: Option<PathBuf>,

    /// 🧪 parse and log everything, write nothing
    #[arg(long)]
    dry: bool,

    /// 🩺 round-trip a couple of sample lines through the protobuf encoder, then exit
    #[arg(short = 't', long)]
    test: bool,

    /// 🔍 glob of input files, e.g. "/data/appsinstalled/*.tsv.gz"
    #[arg(long)]
    pattern: Option<String>,

    /// 🧵 how many files to load at once
    #[arg(short, long)]
    workers: Option<usize>,

    #[arg(long, value_name = "HOST:PORT")]
    idfa: Option<String>,
    #[arg(long, value_name = "HOST:PORT")]
    gaid: Option<String>,
    #[arg(long, value_name = "HOST:PORT")]
    adid: Option<String>,
    #[arg(long, value_name = "HOST:PORT")]
    dvid: Option<String>,

    /// 📝 write logs to this file instead of stderr
    #[arg(long)]
    log: Option<PathBuf>,
}

impl Args {
    /// 🎛️ Flags beat files. Files beat env. Env beats defaults. Rock beats scissors.
    fn apply_to(&self, app_config: &mut AppConfig) {
        if self.dry {
            app_config.runtime.dry_run = true;
        }
        if let Some(pattern) = &self.pattern {
            app_config.runtime.pattern = pattern.clone();
        }
        if let Some(workers) = self.workers {
            app_config.runtime.workers = Some(workers);
        }
        let shard_flags = [
            ("idfa", &self.idfa),
            ("gaid", &self.gaid),
            ("adid", &self.adid),
            ("dvid", &self.dvid),
        ];
        for (device_type, endpoint) in shard_flags {
            if let Some(endpoint) = endpoint {
                app_config.shards.set(device_type, endpoint.clone());
            }
        }
    }
}

/// 📡 tracing to stderr, or to `--log` when given. `RUST_LOG` wins over both defaults.
fn init_tracing(args: &Args) -> Result<()> {
    let default_level = if args.dry { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &args.log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context(format!("💀 Could not open log file '{}'", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// 🍽️ One row per file, in the order they finished.
fn summary_table(report: &JobReport) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["file", "processed", "errors", "error rate", "verdict"]);
    for file in &report.files {
        let rate = file
            .error_rate()
            .map(|rate| format!("{:.4}", rate))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(file.path.display()),
            Cell::new(file.processed).set_alignment(CellAlignment::Right),
            Cell::new(file.errors).set_alignment(CellAlignment::Right),
            Cell::new(rate).set_alignment(CellAlignment::Right),
            Cell::new(file.verdict),
        ]);
    }
    table
}

/// 🚀 main() - where it all begins. The genesis. The big bang.
///
/// 🔧 Steps:
/// 1. Parse args
/// 2. Init tracing (so we can see what goes wrong, and when)
/// 3. Load config, let the flags have the last word
/// 4. Run the thing (send it and pray 🙏)
/// 5. Handle errors (cry)
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    if args.test {
        let checked = memcload::self_check().context("💀 The protobuf self-check failed. Nothing was loaded.")?;
        info!("🩺 Self-check passed: {} records survived the round trip", checked);
        return Ok(());
    }

    // 🔒 explicit path must exist; the default one is optional
    let config_file = match &args.config {
        Some(path) => {
            let exists = path.try_exists().context(format!(
                "💀 Couldn't check whether the config file exists. Was checking here: '{}'",
                path.display()
            ))?;
            anyhow::ensure!(
                exists,
                "💀 Config file '{}' does not exist. Maybe it's a pwd/cwd thing with relative paths; \
                 an absolute path removes all doubt.",
                path.display()
            );
            Some(path.clone())
        }
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG);
            fallback.is_file().then_some(fallback)
        }
    };

    let mut app_config = load_config(config_file.as_deref())
        .context("💀 In memcload-cli, main, we couldn't load the config. Take a look at the file and the MEMCLOAD_* env vars.")?;
    args.apply_to(&mut app_config);

    // 🚀 SEND IT.
    let result = memcload::run(app_config).await;

    match result {
        Ok(report) => {
            if !report.files.is_empty() {
                println!("{}", summary_table(&report));
            }
            info!(
                "🏁 Done: {} files, {} records processed, {} errors, {} archived",
                report.files.len(),
                report.processed(),
                report.errors(),
                report.archived.len()
            );
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion of sadness, one tear-jerking layer at a time
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                let cause_str = cause.to_string();
                if cause_str.contains("connection refused")
                    || cause_str.contains("Connection refused")
                    || cause_str.contains("Could not connect")
                    || cause_str.contains("did not pick up")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }

            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: looks like a memcached shard isn't reachable. \
                    Check that every address in [shards] is up: `nc -z host port`, \
                    or `docker compose up -d` if that's how they live. ☕"
                );
            }

            // 🗑️ Exit with prejudice. Process exitus maximus.
            std::process::exit(1);
        }
    }
}
