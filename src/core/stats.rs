use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;

/// Per-shard counters reported by the `info` operation and by the
/// load-balancing probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStats {
    pub start_time: SystemTime,
    pub uptime_secs: u64,

    pub total_records: usize,
    pub deleted_records: usize,
    pub keyword_count: usize,
    pub geo_element_count: usize,

    pub write_count: u64,
    pub search_count: u64,
    pub merge_count: u64,

    pub cache_stats: CacheStats,
}

impl ShardStats {
    /// Load figure used by the balancer: live records plus pending writes
    /// weigh equally.
    pub fn load(&self) -> u64 {
        (self.total_records - self.deleted_records) as u64
    }
}
