//! Engine counters
//!
//! Lock-free counters shared by capture, workers, expiry and emitter.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Default)]
pub struct EngineStats {
    pub frames_received: AtomicU64,
    pub packets_processed: AtomicU64,
    pub packets_malformed: AtomicU64,
    pub flows_created: AtomicU64,
    pub flows_closed: AtomicU64,
    pub flows_expired: AtomicU64,
    pub flows_evicted: AtomicU64,
    pub flows_rejected: AtomicU64,
    pub flows_flushed: AtomicU64,
    pub records_emitted: AtomicU64,
    pub records_dropped: AtomicU64,
    pub sink_errors: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub packets_processed: u64,
    pub packets_malformed: u64,
    pub flows_created: u64,
    pub flows_closed: u64,
    pub flows_expired: u64,
    pub flows_evicted: u64,
    pub flows_rejected: u64,
    pub flows_flushed: u64,
    pub records_emitted: u64,
    pub records_dropped: u64,
    pub sink_errors: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_received: load(&self.frames_received),
            packets_processed: load(&self.packets_processed),
            packets_malformed: load(&self.packets_malformed),
            flows_created: load(&self.flows_created),
            flows_closed: load(&self.flows_closed),
            flows_expired: load(&self.flows_expired),
            flows_evicted: load(&self.flows_evicted),
            flows_rejected: load(&self.flows_rejected),
            flows_flushed: load(&self.flows_flushed),
            records_emitted: load(&self.records_emitted),
            records_dropped: load(&self.records_dropped),
            sink_errors: load(&self.sink_errors),
        }
    }
}

impl StatsSnapshot {
    /// Flows that left the table by any path
    pub fn flows_finalized(&self) -> u64 {
        self.flows_closed + self.flows_expired + self.flows_evicted + self.flows_flushed
    }

    pub fn log_summary(&self) {
        info!("=== Final Statistics ===");
        info!(
            "Frames: {} received, {} processed, {} malformed",
            self.frames_received, self.packets_processed, self.packets_malformed
        );
        info!(
            "Flows: {} created, {} closed, {} expired, {} evicted, {} flushed, {} rejected",
            self.flows_created,
            self.flows_closed,
            self.flows_expired,
            self.flows_evicted,
            self.flows_flushed,
            self.flows_rejected
        );
        info!(
            "Records: {} emitted, {} dropped, {} sink errors",
            self.records_emitted, self.records_dropped, self.sink_errors
        );
    }
}
