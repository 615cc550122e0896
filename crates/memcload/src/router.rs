//! 🔀 Shard Router - "which memcached does this phone live in?"
//!
//! A lookup, not a hash ring. Each device type owns exactly one endpoint.
//! Unknown device types get an [`Unrouted`]; the caller counts it, logs it,
//! and moves on with its life.

use thiserror::Error;

use crate::app_config::ShardTable;
use crate::common::InstalledAppRecord;

/// 🚫 No shard is configured for this device type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown device type: {device_type}")]
pub(crate) struct Unrouted {
    pub device_type: String,
}

pub(crate) fn route<'t>(
    record: &InstalledAppRecord,
    shards: &'t ShardTable,
) -> Result<&'t str, Unrouted> {
    shards
        .endpoint(&record.device_type)
        .ok_or_else(|| Unrouted {
            device_type: record.device_type.clone(),
        })
}
