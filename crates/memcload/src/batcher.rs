//! 🧺 Batch Accumulator - fills one [`Batch`] per shard, ships it when full.
//!
//! 🎬 *[a basket fills with encoded phones. at one hundred, it leaves.]*
//!
//! The accumulator lives on the coordinator's reading thread, which is a
//! plain blocking thread (gzip decoding is synchronous), so hand-offs use
//! `send_blocking`. The shard queue is bounded: when the worker is still busy
//! with the previous batch, the reader simply waits. Memory stays flat;
//! throughput stays honest.
//!
//! 🧠 Knowledge graph:
//! - `add` → batch full? → `ShardMessage::Batch` → shard worker queue
//! - `flush` → trailing partial batch (if any) → `ShardMessage::EndOfStream`
//! - the end-of-stream marker is always the last message a worker sees

use anyhow::{Context, Result};
use async_channel::Sender;
use tracing::{debug, trace};

use crate::common::Batch;

/// ✉️ What travels down a shard queue.
#[derive(Debug)]
pub(crate) enum ShardMessage {
    Batch(Batch),
    /// 🏁 "That's all, folks." Report your counts and go home.
    EndOfStream,
}

/// 🧺 The in-progress batch for one shard plus the queue it empties into.
#[derive(Debug)]
pub(crate) struct ShardBatcher {
    device_type: String,
    capacity: usize,
    current: Batch,
    tx: Sender<ShardMessage>,
}

impl ShardBatcher {
    pub(crate) fn new(device_type: String, capacity: usize, tx: Sender<ShardMessage>) -> Self {
        // -- 🔒 a zero-capacity batch would ship empty baskets forever
        let capacity = capacity.max(1);
        Self {
            device_type,
            capacity,
            current: Batch::with_capacity(capacity),
            tx,
        }
    }

    /// 📥 Add one encoded record. Ships the batch the moment it reaches capacity.
    ///
    /// A key already present in the current batch is overwritten; the batch
    /// does not grow, so it does not ship early either.
    pub(crate) fn add(&mut self, key: String, payload: Vec<u8>) -> Result<()> {
        if self.current.insert(key, payload).is_some() {
            trace!(
                "♻️ duplicate key inside one {} batch, last write wins",
                self.device_type
            );
        }
        if self.current.len() >= self.capacity {
            self.hand_off()?;
        }
        Ok(())
    }

    /// 🏁 Ship whatever is left, then the end-of-stream marker. Consumes the
    /// batcher: there is no "after" for a flushed shard.
    pub(crate) fn flush(mut self) -> Result<()> {
        if !self.current.is_empty() {
            self.hand_off()?;
        }
        self.tx
            .send_blocking(ShardMessage::EndOfStream)
            .context(format!(
                "💀 The {} shard worker left before we could say goodbye. The end-of-stream marker had nowhere to go.",
                self.device_type
            ))?;
        debug!("🏁 {} batcher flushed and signed off", self.device_type);
        Ok(())
    }

    fn hand_off(&mut self) -> Result<()> {
        let full = std::mem::replace(&mut self.current, Batch::with_capacity(self.capacity));
        trace!(
            "📦 handing {} records ({} bytes) to the {} shard",
            full.len(),
            full.total_bytes(),
            self.device_type
        );
        self.tx
            .send_blocking(ShardMessage::Batch(full))
            .context(format!(
                "💀 The {} shard queue is closed. Its worker is gone, and the batch is holding the door for nobody.",
                self.device_type
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 🧪 Drains everything queued so far: (batch sizes, saw end-of-stream?)
    fn drain(rx: &async_channel::Receiver<ShardMessage>) -> (Vec<usize>, bool) {
        let mut sizes = Vec::new();
        let mut ended = false;
        while let Ok(message) = rx.try_recv() {
            match message {
                ShardMessage::Batch(batch) => sizes.push(batch.len()),
                ShardMessage::EndOfStream => ended = true,
            }
        }
        (sizes, ended)
    }

    fn fill(batcher: &mut ShardBatcher, count: usize) {
        for i in 0..count {
            batcher
                .add(format!("idfa:{i}"), vec![i as u8])
                .expect("💀 the queue is unbounded in tests, it cannot be full");
        }
    }

    #[test]
    fn the_one_where_full_batches_ship_and_the_remainder_waits_for_flush() {
        let (tx, rx) = async_channel::unbounded();
        let mut batcher = ShardBatcher::new("idfa".into(), 100, tx);

        fill(&mut batcher, 250);
        assert_eq!(drain(&rx), (vec![100, 100], false));

        batcher.flush().expect("💀 flush should succeed");
        assert_eq!(drain(&rx), (vec![50], true));
    }

    #[test]
    fn the_one_where_an_exact_multiple_flushes_only_the_marker() {
        let (tx, rx) = async_channel::unbounded();
        let mut batcher = ShardBatcher::new("gaid".into(), 10, tx);

        fill(&mut batcher, 30);
        batcher.flush().expect("💀 flush should succeed");
        assert_eq!(drain(&rx), (vec![10, 10, 10], true));
    }

    #[test]
    fn the_one_where_an_idle_shard_still_says_goodbye() {
        let (tx, rx) = async_channel::unbounded();
        ShardBatcher::new("dvid".into(), 100, tx)
            .flush()
            .expect("💀 flush should succeed");
        assert_eq!(drain(&rx), (vec![], true));
    }

    #[test]
    fn the_one_where_duplicates_do_not_fill_the_basket() {
        let (tx, rx) = async_channel::unbounded();
        let mut batcher = ShardBatcher::new("adid".into(), 2, tx);

        batcher.add("adid:1".into(), vec![1]).expect("💀 add");
        batcher.add("adid:1".into(), vec![2]).expect("💀 add");
        assert_eq!(drain(&rx), (vec![], false));

        batcher.add("adid:2".into(), vec![3]).expect("💀 add");
        assert_eq!(drain(&rx), (vec![2], false));
    }

    #[test]
    fn the_one_where_a_vanished_worker_is_an_error() {
        let (tx, rx) = async_channel::bounded(1);
        drop(rx);
        let mut batcher = ShardBatcher::new("idfa".into(), 1, tx);
        assert!(batcher.add("idfa:1".into(), vec![1]).is_err());
    }
}
