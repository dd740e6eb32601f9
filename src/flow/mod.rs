//! Flow tracking
//!
//! Groups packets into bidirectional flows, accumulates per-flow features
//! and finalizes each flow into exactly one [`FlowRecord`].
//!
//! # Features
//!
//! - Sharded flow table with bounded capacity and oldest-first eviction
//! - Streaming statistics (no per-packet history)
//! - FIN/RST close detection, idle and lifetime timeouts
//!
//! # Example
//!
//! ```ignore
//! use flowmeter::flow::{FlowConfig, FlowTable, FlowTracker};
//!
//! let config = FlowConfig::default();
//! let table = Arc::new(FlowTable::new(&config));
//! let tracker = FlowTracker::new(&config, table, emitter, stats);
//!
//! tracker.ingest_packet(&packet)?;
//! ```

pub mod accumulator;
pub mod record;
pub mod stats;
pub mod table;
pub mod tracker;

pub use accumulator::{FlowPhase, FlowState};
pub use record::{EndReason, FlowRecord};
pub use stats::RunningStats;
pub use table::{FlowHandle, FlowTable};
pub use tracker::FlowTracker;

use serde::{Deserialize, Serialize};

pub use crate::core::{Direction, FlowKey};

/// Configuration for flow tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Finalize a flow after this long without packets (ms)
    pub idle_timeout_ms: u64,

    /// Finalize a flow once it is this old, regardless of activity (ms)
    pub max_lifetime_ms: u64,

    /// Maximum concurrent flows across all shards
    pub table_capacity: usize,

    /// Gap between packets that splits active and idle periods (ms)
    pub activity_timeout_ms: u64,

    /// Number of table shards, 0 = auto
    pub shards: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 120_000,       // 2 minutes
            max_lifetime_ms: 3_600_000,     // 1 hour
            table_capacity: 1_000_000,
            activity_timeout_ms: 1_000,     // 1 second
            shards: 0,
        }
    }
}

impl FlowConfig {
    pub fn idle_timeout_us(&self) -> u64 {
        self.idle_timeout_ms.saturating_mul(1000)
    }

    pub fn max_lifetime_us(&self) -> u64 {
        self.max_lifetime_ms.saturating_mul(1000)
    }

    pub fn activity_timeout_us(&self) -> u64 {
        self.activity_timeout_ms.saturating_mul(1000)
    }

    /// Effective shard count: a power of two, never above the capacity
    pub fn shard_count(&self) -> usize {
        let requested = if self.shards == 0 {
            (num_cpus::get() * 4).next_power_of_two()
        } else {
            self.shards.next_power_of_two()
        };

        let mut shards = requested.max(1);
        while shards > 1 && shards > self.table_capacity {
            shards /= 2;
        }
        shards
    }
}
