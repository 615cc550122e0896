//! 🧵 Workers: the ones who actually do the work while the coordinator takes
//! all the credit in the sprint retro.
//!
//! 🚀 One shard worker per device type, per file. It lives exactly as long
//! as the file does, then hands its tally back and clocks out. 🦆

use tokio::task::JoinHandle;

mod shard_worker;
pub(crate) use shard_worker::ShardWorker;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    /// 🧾 what the worker reports when it is done
    type Output: Send + 'static;

    /// 🚀 Start the worker. Returns a JoinHandle because we trust
    /// but verify. Mostly verify.
    fn start(self) -> JoinHandle<Self::Output>;
}
