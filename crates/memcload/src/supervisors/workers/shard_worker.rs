//! 🎬 *[a queue fills with batches. somewhere, a shard waits.]*
//! *[the clock on the wall reads 2:47am.]*
//!
//! 🗄️ The ShardWorker - patient, tireless, and deeply unbothered by the chaos
//! happening upstream. It receives batches. It writes batches. It counts.
//!
//! 🔄 Lifecycle:
//!
//! ```text
//! Connecting ──▶ Ready ──(EndOfStream / queue closed)──▶ Draining ──▶ Stopped
//!      ▲           │
//!      └───────────┘  connection dropped after an I/O error, reconnect on next batch
//! ```
//!
//! 🧠 Knowledge graph:
//! - the connection is opened lazily on the first batch, retried with backoff
//!   up to `connect_attempts`; after that the shard gives up for the rest of the
//!   file and every record it receives is an error (it never hangs, never panics)
//! - each batch goes through [`retry`] with at most `max_tries` tries
//! - an I/O error mid-batch drops the connection; the next batch reconnects
//! - dry run: no connection, every record is logged and counted as processed

use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Worker;
use crate::app_config::RetryConfig;
use crate::backends::{Store, StoreBackend, StoreConnector};
use crate::batcher::ShardMessage;
use crate::common::{Batch, ShardOutcome};
use crate::encoding;
use crate::retry::{BatchWrite, retry};

// 📢 progress heartbeat, in processed records per shard
const PROGRESS_EVERY: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShardState {
    Connecting,
    Ready,
    Draining,
    Stopped,
}

/// 🗄️ Takes batches from a queue, throws them at one store endpoint.
#[derive(Debug)]
pub(crate) struct ShardWorker {
    device_type: String,
    endpoint: String,
    rx: Receiver<ShardMessage>,
    connector: StoreConnector,
    retry: RetryConfig,
    dry_run: bool,
    state: ShardState,
    store: Option<StoreBackend>,
    /// 🏳️ connection attempts exhausted; the rest of the file is all errors
    gave_up: bool,
    outcome: ShardOutcome,
}

impl ShardWorker {
    pub(crate) fn new(
        device_type: String,
        endpoint: String,
        rx: Receiver<ShardMessage>,
        connector: StoreConnector,
        retry: RetryConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            device_type,
            endpoint,
            rx,
            connector,
            retry,
            dry_run,
            state: ShardState::Connecting,
            store: None,
            gave_up: false,
            outcome: ShardOutcome::default(),
        }
    }

    fn transition(&mut self, next: ShardState) {
        if self.state != next {
            debug!(
                "🔄 {} shard ({}): {:?} → {:?}",
                self.device_type, self.endpoint, self.state, next
            );
            self.state = next;
        }
    }

    async fn run(mut self) -> ShardOutcome {
        debug!("📥 {} shard worker started draining its queue", self.device_type);
        if self.dry_run {
            // -- 🧪 nothing to connect to in a dry run
            self.transition(ShardState::Ready);
        }
        loop {
            match self.rx.recv().await {
                Ok(ShardMessage::Batch(batch)) => self.write_batch(batch).await,
                Ok(ShardMessage::EndOfStream) => break,
                Err(_) => {
                    // -- 🚪 queue closed without a marker: the reader bailed. Report what we have.
                    debug!("🏁 {} shard queue closed without an end-of-stream marker", self.device_type);
                    break;
                }
            }
        }

        self.transition(ShardState::Draining);
        if let Some(mut store) = self.store.take() {
            if let Err(err) = store.close().await {
                warn!("⚠️ {} shard could not close {} cleanly: {:#}", self.device_type, self.endpoint, err);
            }
        }
        self.transition(ShardState::Stopped);
        debug!(
            "🏁 {} shard done: {} processed, {} errors",
            self.device_type, self.outcome.processed, self.outcome.errors
        );
        self.outcome
    }

    async fn write_batch(&mut self, batch: Batch) {
        let size = batch.len() as u64;
        if self.dry_run {
            self.log_dry_run(&batch);
            self.count(size, 0);
            return;
        }

        self.ensure_connected().await;
        let Some(store) = self.store.as_mut() else {
            error!(
                "💀 Cannot write to memc {}: no connection, counting {} records as errors",
                self.endpoint, size
            );
            self.count(0, size);
            return;
        };

        let retry_config = &self.retry;
        let mut write = BatchWrite {
            store,
            batch: &batch,
        };
        let outcome = retry(
            batch.keys(),
            &mut write,
            retry_config.max_tries,
            |attempt| retry_config.backoff(attempt),
        )
        .await;

        if let Some(err) = &outcome.aborted_by {
            error!(
                "💀 Cannot write to memc {}: {:#} ({} records lost after {} tries)",
                self.endpoint,
                err,
                outcome.failed.len(),
                outcome.tries
            );
            // -- 🔌 a connection that just errored is not a connection we trust
            self.store = None;
        } else if !outcome.failed.is_empty() {
            error!(
                "💀 memc {} refused {} of {} records after {} tries",
                self.endpoint,
                outcome.failed.len(),
                size,
                outcome.tries
            );
        }
        self.count(outcome.succeeded.len() as u64, outcome.failed.len() as u64);
    }

    /// 🔌 Lazily connect, with backoff. Leaves `self.store` as `None` if every attempt fails.
    async fn ensure_connected(&mut self) {
        if self.store.is_some() || self.gave_up {
            return;
        }
        self.transition(ShardState::Connecting);
        let attempts = self.retry.connect_attempts;
        for attempt in 1..=attempts {
            match self.connector.connect(&self.endpoint).await {
                Ok(store) => {
                    self.store = Some(store);
                    self.transition(ShardState::Ready);
                    return;
                }
                Err(err) => {
                    warn!(
                        "⚠️ Connection to {} failed (attempt {} of {}): {:#}",
                        self.endpoint, attempt, attempts, err
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.backoff(attempt as u32)).await;
                    }
                }
            }
        }
        error!(
            "💀 Giving up on {} after {} connection attempts; the {} shard fails everything it gets for this file",
            self.endpoint, attempts, self.device_type
        );
        self.gave_up = true;
        self.transition(ShardState::Ready);
    }

    fn log_dry_run(&self, batch: &Batch) {
        for (key, payload) in batch.iter() {
            match encoding::decode(payload) {
                Ok(user_apps) => debug!(
                    "🧪 {} - {} -> {}",
                    self.endpoint,
                    key,
                    serde_json::json!({
                        "apps": user_apps.apps,
                        "lat": user_apps.lat,
                        "lon": user_apps.lon,
                    })
                ),
                Err(err) => debug!("🧪 {} - {} -> undecodable payload: {:#}", self.endpoint, key, err),
            }
        }
    }

    fn count(&mut self, processed: u64, errors: u64) {
        let before = self.outcome.processed / PROGRESS_EVERY;
        self.outcome.record(processed, errors);
        if self.outcome.processed / PROGRESS_EVERY > before {
            info!(
                "📊 Processed {} rows in address {}",
                self.outcome.processed, self.endpoint
            );
        }
    }
}

impl Worker for ShardWorker {
    type Output = ShardOutcome;

    fn start(self) -> JoinHandle<ShardOutcome> {
        tokio::spawn(self.run())
    }
}
