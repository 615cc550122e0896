//! # Previously, on memcload...
//!
//! 🎬 The shards were unreachable. Docker was down. The memcached containers
//! were somewhere between "starting" and "a distant memory". Someone had to
//! hold the bytes. Someone had to be a store so simple it lives entirely in
//! RAM, gone the moment you blink.
//!
//! That someone was this module.
//!
//! `in_mem` provides an in-memory [`Store`] for tests and local dry-ish runs.
//! All connections made from one [`InMemoryStore`] share the same map behind
//! an `Arc<Mutex<...>>`, partitioned by endpoint, so tests can peek at what
//! every shard received.
//!
//! 🧪 It can also misbehave on purpose: fail chosen keys for a number of
//! calls, refuse connections, or blow up a specific call with an I/O-style
//! error. Great for assertions, great for trust issues, great for both.
//!
//! ⚠️ This is NOT durable. Nothing survives the process. That's the point.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backends::Store;
use crate::common::Batch;

#[derive(Debug, Default)]
struct InMemoryState {
    /// 🗄️ endpoint → (key → payload)
    shards: BTreeMap<String, HashMap<String, Vec<u8>>>,
    /// 💀 key → how many more `set_many` calls refuse it (`usize::MAX` = forever)
    failing_keys: HashMap<String, usize>,
    /// 🚪 connection attempts still to refuse (`usize::MAX` = forever)
    refusals_left: usize,
    /// 💥 1-based `set_many` call numbers that fail like a dropped socket
    broken_calls: BTreeSet<usize>,
    set_many_calls: usize,
    connections: usize,
}

/// 📦 A store that never forgets (until the process exits).
///
/// Clone-able because tests need to peek inside after handing a clone off
/// to the pipeline. The `Arc` means everyone shares the same map.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemoryStore {
    endpoint: String,
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🔌 A handle bound to `endpoint`, sharing this store's map.
    pub(crate) async fn connect(&self, endpoint: &str) -> Result<InMemoryStore> {
        let mut state = self.state.lock().await;
        if state.refusals_left > 0 {
            if state.refusals_left != usize::MAX {
                state.refusals_left -= 1;
            }
            bail!("💀 connection refused by in-memory store at {endpoint} (scripted)");
        }
        state.connections += 1;
        Ok(InMemoryStore {
            endpoint: endpoint.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

#[cfg(test)]
impl InMemoryStore {
    pub(crate) async fn fail_key(&self, key: &str, calls: usize) {
        self.state
            .lock()
            .await
            .failing_keys
            .insert(key.to_string(), calls);
    }

    pub(crate) async fn refuse_connections(&self, attempts: usize) {
        self.state.lock().await.refusals_left = attempts;
    }

    pub(crate) async fn break_call(&self, call_number: usize) {
        self.state.lock().await.broken_calls.insert(call_number);
    }

    pub(crate) async fn get(&self, endpoint: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .shards
            .get(endpoint)
            .and_then(|shard| shard.get(key).cloned())
    }

    pub(crate) async fn stored(&self, endpoint: &str) -> usize {
        self.state
            .lock()
            .await
            .shards
            .get(endpoint)
            .map_or(0, HashMap::len)
    }

    pub(crate) async fn set_many_calls(&self) -> usize {
        self.state.lock().await.set_many_calls
    }

    pub(crate) async fn connections(&self) -> usize {
        self.state.lock().await.connections
    }
}

#[async_trait]
impl Store for InMemoryStore {
    /// 🚰 Lock, store what's allowed, report what isn't.
    async fn set_many(&mut self, batch: &Batch) -> Result<BTreeSet<String>> {
        // 🔒 The Mutex is load-bearing. Every shard's handle points at the same map.
        let mut state = self.state.lock().await;
        state.set_many_calls += 1;
        let call_number = state.set_many_calls;
        if state.broken_calls.contains(&call_number) {
            bail!(
                "💀 in-memory store at {} dropped call #{} on the floor (scripted)",
                self.endpoint,
                call_number
            );
        }

        let mut failed = BTreeSet::new();
        for (key, payload) in batch.iter() {
            if let Some(calls_left) = state.failing_keys.get_mut(key) {
                if *calls_left > 0 {
                    if *calls_left != usize::MAX {
                        *calls_left -= 1;
                    }
                    failed.insert(key.to_string());
                    continue;
                }
            }
            state
                .shards
                .entry(self.endpoint.clone())
                .or_default()
                .insert(key.to_string(), payload.to_vec());
        }
        Ok(failed)
    }

    /// 🗑️ Nothing to clean up. We live in RAM. The vibes are ref-counted.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
