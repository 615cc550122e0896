//! 🔧 App Configuration - the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." - every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! Layers, lowest to highest: serde defaults → `MEMCLOAD_*` env vars → TOML file.
//! The CLI then stamps its flags on top.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, ensure};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    /// 🧵 How the job behaves: pattern, batch size, pool size, dry run, thresholds.
    #[serde(default, alias = "loader")]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// 🔌 Which kind of store the shards are.
    #[serde(default)]
    pub store_config: StoreConfig,
    /// 🔀 device type → endpoint. Configure it and you replace the whole table.
    #[serde(default)]
    pub shards: ShardTable,
}

/// 🧵 Runtime knobs for the job driver and the file coordinator.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// 🌐 glob for input files
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// 🧺 records per batch before it ships
    #[serde(default = "default_batch_capacity", alias = "batch_size")]
    pub batch_capacity: usize,
    /// ✉️ batches allowed to wait in a shard queue (1 = one queued while the next fills)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// 👷 files processed at once; `None` means half the logical cores (at least one)
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default, alias = "dry")]
    pub dry_run: bool,
    /// ⚖️ at or above this error rate a file is rejected
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
    /// 🗄️ archive files even when their error rate is too high
    #[serde(default)]
    pub archive_rejected: bool,
}

fn default_pattern() -> String {
    "./data/*.tsv.gz".to_string()
}

// 🧺 100 - enough to amortize a round trip, small enough to retry without regret
fn default_batch_capacity() -> usize {
    100
}

fn default_queue_capacity() -> usize {
    1
}

// ⚖️ one percent. the loader's entire moral compass, in one float.
fn default_max_error_rate() -> f64 {
    0.01
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
            batch_capacity: default_batch_capacity(),
            queue_capacity: default_queue_capacity(),
            workers: None,
            dry_run: false,
            max_error_rate: default_max_error_rate(),
            archive_rejected: false,
        }
    }
}

impl RuntimeConfig {
    /// 👷 How many files run at once. Explicit config wins; zero means "you pick".
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(workers) if workers > 0 => workers,
            _ => default_worker_count(),
        }
    }
}

/// 🧮 Half the logical cores, at least one: hyperthreads share a physical core,
/// and two loaders fighting over one core just take turns being slow.
pub fn default_worker_count() -> usize {
    (num_cpus::get() / 2).max(1)
}

/// 🔄 Retry budget for store writes and connection setup.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// 🔁 tries per batch write (first try included)
    #[serde(default = "default_max_tries")]
    pub max_tries: usize,
    /// 🔌 connection attempts before a shard gives up for the rest of the file
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_tries() -> usize {
    5
}

fn default_connect_attempts() -> usize {
    5
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            connect_attempts: default_connect_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// ⏳ Backoff before retry number `attempt` (1-based): initial, 2x, 4x, ...
    /// capped at `max_backoff_ms`.
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// 🔌 The kinds of key-value store a shard can be.
///
/// TOML picks the variant by table name: `[store_config.Memcached]` or
/// `[store_config.InMemory]`.
#[derive(Debug, Deserialize, Clone)]
pub enum StoreConfig {
    Memcached(MemcachedConfig),
    /// 🧪 everything lands in process memory and evaporates at exit
    InMemory(InMemoryConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memcached(MemcachedConfig::default())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemcachedConfig {
    /// ⏱️ applies to connect, write and read, each on its own
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

// ⏱️ one second. if memcached can't answer in a second it's not having a good day
fn default_timeout_ms() -> u64 {
    1000
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl MemcachedConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct InMemoryConfig {}

/// 🔀 device type → store endpoint (`host:port`).
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct ShardTable(BTreeMap<String, String>);

impl Default for ShardTable {
    fn default() -> Self {
        ShardTable::from_iter([
            ("idfa", "127.0.0.1:33013"),
            ("gaid", "127.0.0.1:33014"),
            ("adid", "127.0.0.1:33015"),
            ("dvid", "127.0.0.1:33016"),
        ])
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ShardTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ShardTable(
            iter.into_iter()
                .map(|(device_type, endpoint)| (device_type.into(), endpoint.into()))
                .collect(),
        )
    }
}

impl ShardTable {
    pub fn endpoint(&self, device_type: &str) -> Option<&str> {
        self.0.get(device_type).map(String::as_str)
    }

    /// 🔧 Add or repoint a shard. The CLI's `--idfa` and friends land here.
    pub fn set(&mut self, device_type: impl Into<String>, endpoint: impl Into<String>) {
        self.0.insert(device_type.into(), endpoint.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(device_type, endpoint)| (device_type.as_str(), endpoint.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AppConfig {
    /// ✅ Reject configs that would make the loader spin, divide by nothing, or ship empty baskets.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.runtime.batch_capacity > 0,
            "💀 runtime.batch_capacity must be at least 1. A batch of zero is a philosophy, not a batch."
        );
        ensure!(
            self.runtime.queue_capacity > 0,
            "💀 runtime.queue_capacity must be at least 1, otherwise nothing ever leaves the reader."
        );
        ensure!(
            self.runtime.max_error_rate > 0.0 && self.runtime.max_error_rate <= 1.0,
            "💀 runtime.max_error_rate must be in (0, 1], got {}",
            self.runtime.max_error_rate
        );
        ensure!(
            self.retry.max_tries > 0,
            "💀 retry.max_tries must be at least 1. Zero tries is just giving up in advance."
        );
        ensure!(
            self.retry.connect_attempts > 0,
            "💀 retry.connect_attempts must be at least 1."
        );
        ensure!(
            !self.shards.is_empty(),
            "💀 No shards configured. Every record would be an unknown device type."
        );
        Ok(())
    }
}

/// 🚀 Load the config - from a file, from env vars, or from the sheer power of hoping.
///
/// 🔧 Merges environment variables (`MEMCLOAD_*`, nested keys separated by `__`,
/// e.g. `MEMCLOAD_RUNTIME__DRY_RUN=true`) with an optional TOML file.
///   - `None`  → env vars only, on top of the serde defaults
///   - `Some`  → env vars + TOML file, merged. TOML wins on conflicts.
///
/// 💀 Returns an error if the config is unparseable or fails validation.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("MEMCLOAD_").split("__"));

    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (MEMCLOAD_*). \
             The file exists in our hearts, but apparently not in a shape serde recognizes.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (MEMCLOAD_*). \
                 No file was provided - this one's all on the environment. Classic."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config
        .validate()
        .context("💀 The configuration parsed, but it doesn't make sense. Check the knobs above.")?;
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("💀 Failed to create a temp config. The filesystem said 'new phone who dis'.");
        file.write_all(contents.as_bytes())
            .expect("💀 Failed to write test config.");
        file
    }

    #[test]
    fn the_one_where_a_full_config_file_is_honored() {
        let config_file = write_test_config(
            r#"
            [runtime]
            pattern = "/var/log/apps/*.tsv.gz"
            batch_capacity = 250
            queue_capacity = 2
            workers = 3
            dry_run = true
            archive_rejected = true

            [retry]
            max_tries = 7
            initial_backoff_ms = 0

            [store_config.Memcached]
            timeout_ms = 250

            [shards]
            idfa = "10.0.0.1:11211"
            gaid = "10.0.0.2:11211"
            "#,
        );

        let app_config = load_config(Some(config_file.path()))
            .expect("💀 A complete config should parse. The schema drift goblin does not get this win.");

        assert_eq!(app_config.runtime.pattern, "/var/log/apps/*.tsv.gz");
        assert_eq!(app_config.runtime.batch_capacity, 250);
        assert_eq!(app_config.runtime.queue_capacity, 2);
        assert_eq!(app_config.runtime.worker_count(), 3);
        assert!(app_config.runtime.dry_run);
        assert!(app_config.runtime.archive_rejected);
        assert_eq!(app_config.retry.max_tries, 7);
        assert_eq!(app_config.retry.connect_attempts, 5);
        match app_config.store_config {
            StoreConfig::Memcached(memcached) => assert_eq!(memcached.timeout(), Duration::from_millis(250)),
            honestly_who_knows => panic!(
                "💀 Expected a Memcached store, serde took us to {:?}. Plot twist energy.",
                honestly_who_knows
            ),
        }
        assert_eq!(app_config.shards.len(), 2);
        assert_eq!(app_config.shards.endpoint("gaid"), Some("10.0.0.2:11211"));
        assert_eq!(app_config.shards.endpoint("adid"), None);
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() {
        let app_config: AppConfig = toml::from_str("").expect("💀 an empty config is a valid config");

        assert_eq!(app_config.runtime.pattern, "./data/*.tsv.gz");
        assert_eq!(app_config.runtime.batch_capacity, 100);
        assert_eq!(app_config.runtime.queue_capacity, 1);
        assert!(!app_config.runtime.dry_run);
        assert_eq!(app_config.runtime.max_error_rate, 0.01);
        assert_eq!(app_config.retry.max_tries, 5);
        assert!(matches!(app_config.store_config, StoreConfig::Memcached(ref m) if m.timeout_ms == 1000));
        assert_eq!(app_config.shards, ShardTable::default());
        assert_eq!(app_config.shards.endpoint("dvid"), Some("127.0.0.1:33016"));
        app_config.validate().expect("💀 defaults should validate");
    }

    #[test]
    fn the_one_where_the_old_stage_names_still_work() {
        let app_config: AppConfig = toml::from_str(
            r#"
            [loader]
            batch_size = 10
            dry = true

            [store_config.InMemory]
            "#,
        )
        .expect("💀 aliases should parse. The witness protection paperwork was valid.");

        assert_eq!(app_config.runtime.batch_capacity, 10);
        assert!(app_config.runtime.dry_run);
        assert!(matches!(app_config.store_config, StoreConfig::InMemory(_)));
    }

    #[test]
    fn the_one_where_nonsense_knobs_are_refused() {
        let config_file = write_test_config(
            r#"
            [runtime]
            batch_capacity = 0
            "#,
        );
        assert!(load_config(Some(config_file.path())).is_err());

        let mut app_config = AppConfig::default();
        app_config.shards = ShardTable::from_iter(Vec::<(String, String)>::new());
        assert!(app_config.validate().is_err());
    }

    #[test]
    fn the_one_where_the_worker_pool_never_shrinks_to_zero() {
        let mut runtime = RuntimeConfig::default();
        assert!(runtime.worker_count() >= 1);
        runtime.workers = Some(0);
        assert_eq!(runtime.worker_count(), default_worker_count());
        runtime.workers = Some(6);
        assert_eq!(runtime.worker_count(), 6);
    }

    #[test]
    fn the_one_where_backoff_doubles_until_it_hits_the_ceiling() {
        let retry = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            ..RetryConfig::default()
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(500));
        assert_eq!(retry.backoff(40), Duration::from_millis(500));
    }
}
