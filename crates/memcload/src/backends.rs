//! 🔌 Backends - where the bytes actually land.
//!
//! 🎭 This module is the casting agency for key-value stores. Need a real
//! memcached on the other side of a socket? Need a HashMap that pretends to be
//! one for tests? We've got a backend for that.
//!
//! 🧠 Knowledge graph:
//! - [`Store`]: the narrow client contract. `set_many` returns the keys that did NOT stick.
//! - [`StoreBackend`]: enum dispatch over the concrete stores, so the shard worker never cares.
//! - [`StoreConnector`]: knows how to open a `StoreBackend` for one endpoint. Each shard
//!   worker owns the connection it gets back; nothing is shared between shards.
//!
//! 🦆 The duck is here because every file must have one. This is law. Do not question the duck.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::app_config::StoreConfig;
use crate::common::Batch;

pub(crate) mod in_mem;
pub(crate) mod memcached;

/// 🕳️ A key-value store connection, exclusively owned by one shard worker.
///
/// # Contract 📜
/// - `set_many` writes every entry of the batch and returns the subset of
///   keys the store refused. Empty set = full success.
/// - `Err(...)` means the connection itself is in trouble (I/O, timeout,
///   protocol confusion). The caller should stop trusting this connection.
/// - `close` releases the connection. Failing to close politely is not a data loss.
#[async_trait]
pub(crate) trait Store: std::fmt::Debug + Send {
    async fn set_many(&mut self, batch: &Batch) -> Result<BTreeSet<String>>;
    async fn close(&mut self) -> Result<()>;
}

/// 🎭 The many faces of a Store. The shard worker holds one of these and
/// stays blissfully ignorant of where data actually lands.
#[derive(Debug)]
pub(crate) enum StoreBackend {
    Memcached(memcached::MemcachedStore),
    InMemory(in_mem::InMemoryStore),
}

#[async_trait]
impl Store for StoreBackend {
    async fn set_many(&mut self, batch: &Batch) -> Result<BTreeSet<String>> {
        match self {
            StoreBackend::Memcached(store) => store.set_many(batch).await,
            StoreBackend::InMemory(store) => store.set_many(batch).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            StoreBackend::Memcached(store) => store.close().await,
            StoreBackend::InMemory(store) => store.close().await,
        }
    }
}

/// 🔧 Opens connections. Cheap to clone, handed to every shard worker.
#[derive(Debug, Clone)]
pub(crate) enum StoreConnector {
    Memcached(crate::app_config::MemcachedConfig),
    /// 🧪 every connection shares one in-process map, partitioned by endpoint
    InMemory(in_mem::InMemoryStore),
}

impl StoreConnector {
    pub(crate) fn from_config(store_config: &StoreConfig) -> Self {
        match store_config {
            StoreConfig::Memcached(config) => StoreConnector::Memcached(config.clone()),
            StoreConfig::InMemory(_) => StoreConnector::InMemory(in_mem::InMemoryStore::new()),
        }
    }

    /// 📡 One connection attempt. Retrying is the shard worker's job.
    pub(crate) async fn connect(&self, endpoint: &str) -> Result<StoreBackend> {
        match self {
            StoreConnector::Memcached(config) => Ok(StoreBackend::Memcached(
                memcached::MemcachedStore::connect(endpoint, config.timeout()).await?,
            )),
            StoreConnector::InMemory(store) => {
                Ok(StoreBackend::InMemory(store.connect(endpoint).await?))
            }
        }
    }
}
