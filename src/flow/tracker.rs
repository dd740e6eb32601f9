//! Flow tracker - ingestion path
//!
//! Coordinates the flow table, the accumulator and the emitter: parses
//! frames, folds packets into their flows and finalizes flows that close,
//! expire or get evicted. Safe to share between ingest workers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, trace, warn};

use crate::core::{FlowKey, Packet, PacketNormalizer};
use crate::engine::capture::RawFrame;
use crate::engine::emitter::Emitter;
use crate::engine::stats::EngineStats;
use crate::error::{FlowError, Result};
use super::accumulator::FlowState;
use super::record::EndReason;
use super::table::FlowTable;
use super::FlowConfig;

/// No packet seen yet
const NO_WATERMARK: i64 = i64::MIN;

/// Main flow tracking engine
pub struct FlowTracker {
    table: Arc<FlowTable>,
    emitter: Arc<Emitter>,
    stats: Arc<EngineStats>,
    idle_timeout_us: u64,
    max_lifetime_us: u64,
    /// Latest packet timestamp seen (µs since epoch)
    watermark: AtomicI64,
}

impl FlowTracker {
    pub fn new(config: &FlowConfig, table: Arc<FlowTable>, emitter: Arc<Emitter>, stats: Arc<EngineStats>) -> Self {
        Self {
            table,
            emitter,
            stats,
            idle_timeout_us: config.idle_timeout_us(),
            max_lifetime_us: config.max_lifetime_us(),
            watermark: AtomicI64::new(NO_WATERMARK),
        }
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Latest packet timestamp seen so far, used as the replay clock
    pub fn packet_clock(&self) -> Option<DateTime<Utc>> {
        match self.watermark.load(Ordering::Acquire) {
            NO_WATERMARK => None,
            us => DateTime::<Utc>::from_timestamp_micros(us),
        }
    }

    /// Process a burst of frames; returns the number of packets accepted
    pub fn ingest_burst(&self, normalizer: &PacketNormalizer, frames: &[RawFrame]) -> Result<usize> {
        let mut accepted = 0;
        for frame in frames {
            if self.ingest_frame(normalizer, frame)? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Parse and process one frame; `false` if it was dropped as malformed
    pub fn ingest_frame(&self, normalizer: &PacketNormalizer, frame: &RawFrame) -> Result<bool> {
        EngineStats::incr(&self.stats.frames_received);

        match normalizer.parse(&frame.data, frame.timestamp) {
            Ok(pkt) => {
                self.ingest_packet(&pkt)?;
                Ok(true)
            }
            Err(FlowError::MalformedPacket(reason)) => {
                EngineStats::incr(&self.stats.packets_malformed);
                trace!("Dropping malformed frame ({} bytes): {}", frame.data.len(), reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Fold one packet into its flow
    ///
    /// Only `Invariant` errors escape; a rejected flow is counted and the
    /// packet dropped.
    pub fn ingest_packet(&self, pkt: &Packet) -> Result<()> {
        EngineStats::incr(&self.stats.packets_processed);
        self.watermark.fetch_max(pkt.timestamp.timestamp_micros(), Ordering::AcqRel);

        let (key, direction) = FlowKey::derive(pkt);

        let mut handle = match self.table.get_or_create_for_update(key, pkt.timestamp) {
            Ok(handle) => handle,
            Err(FlowError::EvictionFailed { shard }) => {
                EngineStats::incr(&self.stats.flows_rejected);
                warn!("Flow table full and nothing evictable (shard {}), dropping {}", shard, key);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if handle.key != key {
            let msg = format!("slot for {} holds flow {}", key, handle.key);
            error!("Flow table corrupted: {}", msg);
            return Err(FlowError::Invariant(msg));
        }

        let evicted = handle.take_evicted();
        let mut stale = None;
        if handle.is_new() {
            EngineStats::incr(&self.stats.flows_created);
        } else if let Some(reason) = handle.expiry_reason(pkt.timestamp, self.idle_timeout_us, self.max_lifetime_us) {
            // Timed out before the sweep reached it: close it, start over
            stale = Some((handle.restart(pkt.timestamp), reason));
            EngineStats::incr(&self.stats.flows_created);
        }

        handle.update(pkt, direction);
        trace!(
            "flow {} {} {:?} len={} phase={}",
            handle.id, key, direction, pkt.length, handle.phase
        );

        let closed = if handle.is_terminal() {
            let reason = handle.close_reason();
            Some((handle.remove_for_finalize(), reason))
        } else {
            drop(handle);
            None
        };

        // Shard lock released; emit outside it
        if let Some(state) = evicted {
            EngineStats::incr(&self.stats.flows_evicted);
            self.emit(state, EndReason::Evicted);
        }
        if let Some((state, reason)) = stale {
            EngineStats::incr(&self.stats.flows_expired);
            self.emit(state, reason);
        }
        if let Some((state, reason)) = closed {
            EngineStats::incr(&self.stats.flows_closed);
            self.emit(state, reason);
        }

        Ok(())
    }

    /// Finalize every flow that is idle or too old at `now`
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let expired = self.table.sweep_expired(now, self.idle_timeout_us, self.max_lifetime_us);
        let count = expired.len();

        for (state, reason) in expired {
            EngineStats::incr(&self.stats.flows_expired);
            self.emit(state, reason);
        }

        if count > 0 {
            debug!("Expired {} flows ({} active)", count, self.table.len());
        }
        count
    }

    /// Finalize every live flow
    pub fn flush_all(&self) -> usize {
        let drained = self.table.drain_all();
        let count = drained.len();

        for state in drained {
            EngineStats::incr(&self.stats.flows_flushed);
            self.emit(state, EndReason::Shutdown);
        }

        debug!("Flushed {} flows", count);
        count
    }

    fn emit(&self, state: FlowState, reason: EndReason) {
        let flow_id = state.id;
        let record = state.finalize(reason);
        if let Err(e) = self.emitter.accept(record) {
            debug!("Flow {} ({}) not emitted: {}", flow_id, reason, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IpProtocol, LinkLayer, TcpFlags};
    use crate::engine::emitter::EmitterConfig;
    use crate::flow::FlowRecord;
    use chrono::{Duration, TimeZone};
    use std::net::{IpAddr, Ipv4Addr};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn setup(config: FlowConfig) -> (FlowTracker, Arc<Emitter>, Arc<EngineStats>) {
        let stats = Arc::new(EngineStats::new());
        let emitter = Arc::new(Emitter::buffered(&EmitterConfig::default(), stats.clone()));
        let table = Arc::new(FlowTable::new(&config));
        let tracker = FlowTracker::new(&config, table, emitter.clone(), stats.clone());
        (tracker, emitter, stats)
    }

    fn tcp(at_ms: i64, client_port: u16, forward: bool, flags: u8) -> Packet {
        let pkt = Packet::new(
            base_time() + Duration::milliseconds(at_ms),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
            IpProtocol::Tcp,
        )
        .with_length(60)
        .with_tcp_flags(TcpFlags::from_u8(flags));
        if forward { pkt } else { pkt.reversed() }
    }

    fn emitted(emitter: &Emitter) -> Vec<FlowRecord> {
        emitter.drain_pending()
    }

    #[test]
    fn test_fin_from_both_sides_emits_once() {
        let (tracker, emitter, stats) = setup(FlowConfig::default());

        tracker.ingest_packet(&tcp(0, 5000, true, 0x02)).unwrap();
        tracker.ingest_packet(&tcp(1, 5000, false, 0x12)).unwrap();
        tracker.ingest_packet(&tcp(2, 5000, true, 0x11)).unwrap();
        assert!(emitted(&emitter).is_empty());
        tracker.ingest_packet(&tcp(3, 5000, false, 0x11)).unwrap();

        let records = emitted(&emitter);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].end_reason, EndReason::Fin);
        assert_eq!(records[0].total_packets(), 4);
        assert!(tracker.table().is_empty());

        // A late ACK opens a new flow rather than touching the emitted one
        tracker.ingest_packet(&tcp(4, 5000, true, 0x10)).unwrap();
        assert_eq!(tracker.table().len(), 1);
        assert_eq!(stats.snapshot().flows_created, 2);
        assert_eq!(stats.snapshot().flows_closed, 1);
    }

    #[test]
    fn test_rst_closes_flow() {
        let (tracker, emitter, _) = setup(FlowConfig::default());
        tracker.ingest_packet(&tcp(0, 5001, true, 0x02)).unwrap();
        tracker.ingest_packet(&tcp(1, 5001, false, 0x14)).unwrap();

        let records = emitted(&emitter);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].end_reason, EndReason::Rst);
    }

    #[test]
    fn test_eviction_emits_oldest() {
        let config = FlowConfig {
            table_capacity: 2,
            shards: 1,
            ..FlowConfig::default()
        };
        let (tracker, emitter, stats) = setup(config);

        tracker.ingest_packet(&tcp(0, 6000, true, 0x02)).unwrap();
        tracker.ingest_packet(&tcp(10, 6001, true, 0x02)).unwrap();
        tracker.ingest_packet(&tcp(20, 6002, true, 0x02)).unwrap();

        let records = emitted(&emitter);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].src_port, 6000);
        assert_eq!(records[0].end_reason, EndReason::Evicted);
        assert_eq!(tracker.table().len(), 2);
        assert_eq!(stats.snapshot().flows_evicted, 1);
    }

    #[test]
    fn test_expire_and_flush() {
        let config = FlowConfig {
            idle_timeout_ms: 1_000,
            ..FlowConfig::default()
        };
        let (tracker, emitter, stats) = setup(config);

        tracker.ingest_packet(&tcp(0, 7000, true, 0x02)).unwrap();
        tracker.ingest_packet(&tcp(1_500, 7001, true, 0x02)).unwrap();
        assert_eq!(tracker.packet_clock(), Some(base_time() + Duration::milliseconds(1_500)));

        assert_eq!(tracker.expire(tracker.packet_clock().unwrap()), 1);
        assert_eq!(tracker.flush_all(), 1);

        let records = emitted(&emitter);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].end_reason, EndReason::IdleTimeout);
        assert_eq!(records[1].end_reason, EndReason::Shutdown);

        let snap = stats.snapshot();
        assert_eq!(snap.flows_expired, 1);
        assert_eq!(snap.flows_flushed, 1);
        assert_eq!(snap.flows_finalized(), snap.flows_created);
    }

    #[test]
    fn test_stale_flow_restarts_on_arrival() {
        let config = FlowConfig {
            idle_timeout_ms: 1_000,
            ..FlowConfig::default()
        };
        let (tracker, emitter, _) = setup(config);

        tracker.ingest_packet(&tcp(0, 8000, true, 0x10)).unwrap();
        tracker.ingest_packet(&tcp(5_000, 8000, false, 0x10)).unwrap();

        let records = emitted(&emitter);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].end_reason, EndReason::IdleTimeout);
        assert_eq!(records[0].total_packets(), 1);

        let live = tracker.flush_all();
        assert_eq!(live, 1);
        let records = emitted(&emitter);
        assert_eq!(records[0].total_bwd_packets, 1);
        assert_ne!(records[0].flow_id, 1);
    }

    #[test]
    fn test_malformed_frames_are_counted() {
        let (tracker, _, stats) = setup(FlowConfig::default());
        let normalizer = PacketNormalizer::new(LinkLayer::RawIp);
        let frames = vec![
            RawFrame::new(vec![], base_time()),
            RawFrame::new(vec![0x45, 0x00], base_time()),
        ];

        assert_eq!(tracker.ingest_burst(&normalizer, &frames).unwrap(), 0);
        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.packets_malformed, 2);
        assert_eq!(snap.packets_processed, 0);
    }
}
