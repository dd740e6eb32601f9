//! Per-flow feature accumulation
//!
//! `FlowState` folds every packet into running statistics in O(1) time and
//! memory; no packet history is kept. `finalize` turns the accumulated state
//! into a [`FlowRecord`] without re-scanning anything.
//!
//! Lifecycle: `New -> Active -> Closing -> Closed`. TIMEOUT and EMITTED are
//! not phases of a live state: the expiry sweep detaches timed-out states and
//! the record's [`EndReason`] carries how the flow ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Direction, FlowKey, Packet};
use super::record::{EndReason, FlowRecord, DEFAULT_LABEL};
use super::stats::RunningStats;

/// Connection phase of a live flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowPhase {
    /// Created, no packet folded in yet
    #[default]
    New,
    /// Exchanging packets
    Active,
    /// FIN seen from one side
    Closing,
    /// FIN seen from both sides, or RST seen
    Closed,
}

impl std::fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowPhase::New => write!(f, "NEW"),
            FlowPhase::Active => write!(f, "ACTIVE"),
            FlowPhase::Closing => write!(f, "CLOSING"),
            FlowPhase::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Counters for one direction of a flow
#[derive(Debug, Clone, Default)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,
    pub lengths: RunningStats,
    pub iat: RunningStats,
    /// Earliest timestamp seen in this direction
    pub first_packet: Option<DateTime<Utc>>,
    pub last_packet: Option<DateTime<Utc>>,
}

impl DirectionStats {
    fn update(&mut self, length: u32, ts: DateTime<Utc>) {
        self.packets += 1;
        self.bytes += u64::from(length);
        self.lengths.push(f64::from(length));
        if let Some(prev) = self.last_packet {
            self.iat.push(micros_between(prev, ts));
        }
        self.first_packet = Some(self.first_packet.map_or(ts, |first| first.min(ts)));
        self.last_packet = Some(ts);
    }
}

/// Microseconds from `from` to `to`, clamped at zero for reordered packets
pub fn micros_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().map(|us| us.max(0) as f64).unwrap_or(f64::MAX)
}

/// Mutable accumulator for one live flow
#[derive(Debug, Clone)]
pub struct FlowState {
    pub id: u64,
    pub key: FlowKey,
    pub phase: FlowPhase,

    /// Earliest packet timestamp
    pub first_seen: DateTime<Utc>,
    /// Latest packet timestamp
    pub last_seen: DateTime<Utc>,
    /// Timestamp of the previous packet in arrival order
    last_packet: Option<DateTime<Utc>>,

    pub fwd: DirectionStats,
    pub bwd: DirectionStats,
    pub lengths: RunningStats,
    pub iat: RunningStats,

    /// Gap (µs) above which the flow is considered idle
    activity_timeout_us: f64,
    active_start: DateTime<Utc>,
    pub active: RunningStats,
    pub idle: RunningStats,

    pub tcp_flags: u8,
    /// FIN, SYN, RST, PSH, ACK, URG, ECE, CWR
    pub flag_counts: [u32; 8],
    pub window: RunningStats,

    pub fin_a_seen: bool,
    pub fin_b_seen: bool,
    pub rst_seen: bool,
}

impl FlowState {
    /// Zeroed state for a newly admitted key
    pub fn new(id: u64, key: FlowKey, created: DateTime<Utc>, activity_timeout_us: u64) -> Self {
        Self {
            id,
            key,
            phase: FlowPhase::New,
            first_seen: created,
            last_seen: created,
            last_packet: None,
            fwd: DirectionStats::default(),
            bwd: DirectionStats::default(),
            lengths: RunningStats::new(),
            iat: RunningStats::new(),
            activity_timeout_us: activity_timeout_us as f64,
            active_start: created,
            active: RunningStats::new(),
            idle: RunningStats::new(),
            tcp_flags: 0,
            flag_counts: [0; 8],
            window: RunningStats::new(),
            fin_a_seen: false,
            fin_b_seen: false,
            rst_seen: false,
        }
    }

    pub fn packets(&self) -> u64 {
        self.fwd.packets + self.bwd.packets
    }

    pub fn bytes(&self) -> u64 {
        self.fwd.bytes + self.bwd.bytes
    }

    /// FIN from both sides or any RST
    pub fn is_terminal(&self) -> bool {
        self.phase == FlowPhase::Closed
    }

    /// Fold one packet into the flow
    pub fn update(&mut self, pkt: &Packet, direction: Direction) {
        let ts = pkt.timestamp;

        match self.last_packet {
            None => {
                self.first_seen = ts;
                self.last_seen = ts;
                self.active_start = ts;
            }
            Some(prev) => {
                let gap = micros_between(prev, ts);
                self.iat.push(gap);

                if gap > self.activity_timeout_us {
                    let active = micros_between(self.active_start, prev);
                    if active > 0.0 {
                        self.active.push(active);
                    }
                    self.idle.push(gap);
                    self.active_start = ts;
                }

                if ts < self.first_seen {
                    self.first_seen = ts;
                }
                if ts > self.last_seen {
                    self.last_seen = ts;
                }
            }
        }
        self.last_packet = Some(ts);

        self.lengths.push(f64::from(pkt.length));
        match direction {
            Direction::Forward => self.fwd.update(pkt.length, ts),
            Direction::Backward => self.bwd.update(pkt.length, ts),
        }

        if let Some(flags) = pkt.tcp_flags {
            self.tcp_flags |= flags.to_u8();
            for (i, set) in [
                flags.fin, flags.syn, flags.rst, flags.psh,
                flags.ack, flags.urg, flags.ece, flags.cwr,
            ]
            .into_iter()
            .enumerate()
            {
                if set {
                    self.flag_counts[i] += 1;
                }
            }

            if flags.fin {
                match direction {
                    Direction::Forward => self.fin_a_seen = true,
                    Direction::Backward => self.fin_b_seen = true,
                }
            }
            if flags.rst {
                self.rst_seen = true;
            }
        }

        if let Some(window) = pkt.window {
            if window > 0 {
                self.window.push(f64::from(window));
            }
        }

        self.phase = if self.rst_seen || (self.fin_a_seen && self.fin_b_seen) {
            FlowPhase::Closed
        } else if self.fin_a_seen || self.fin_b_seen {
            FlowPhase::Closing
        } else {
            FlowPhase::Active
        };
    }

    /// Why this flow should be finalized by the sweep at `now`, if at all
    pub fn expiry_reason(&self, now: DateTime<Utc>, idle_timeout_us: u64, max_lifetime_us: u64) -> Option<EndReason> {
        if micros_between(self.last_seen, now) > idle_timeout_us as f64 {
            Some(EndReason::IdleTimeout)
        } else if micros_between(self.first_seen, now) > max_lifetime_us as f64 {
            Some(EndReason::MaxLifetime)
        } else {
            None
        }
    }

    /// Reason a terminal flow ended
    pub fn close_reason(&self) -> EndReason {
        if self.rst_seen {
            EndReason::Rst
        } else {
            EndReason::Fin
        }
    }

    /// Convert the accumulated state into its immutable record
    pub fn finalize(self, reason: EndReason) -> FlowRecord {
        let duration_us = micros_between(self.first_seen, self.last_seen);
        let duration_secs = duration_us / 1_000_000.0;
        let per_second = |value: u64| {
            if duration_us > 0.0 {
                value as f64 / duration_secs
            } else {
                0.0
            }
        };

        // Close the trailing active period
        let mut active = self.active;
        if self.last_packet.is_some() {
            let tail = micros_between(self.active_start, self.last_seen);
            if tail > 0.0 {
                active.push(tail);
            }
        }

        let total_bytes = self.bytes();
        let total_packets = self.packets();

        FlowRecord {
            flow_id: self.id,
            src_ip: self.key.a.ip,
            src_port: self.key.a.port,
            dst_ip: self.key.b.ip,
            dst_port: self.key.b.port,
            protocol: self.key.protocol.into(),
            protocol_name: self.key.protocol.name(),

            start_time: self.first_seen,
            end_time: self.last_seen,
            flow_duration_us: duration_us as u64,
            end_reason: reason,

            total_fwd_packets: self.fwd.packets,
            total_bwd_packets: self.bwd.packets,
            total_length_fwd_packets: self.fwd.bytes,
            total_length_bwd_packets: self.bwd.bytes,
            flow_bytes_total: total_bytes,

            packet_length_mean: self.lengths.mean,
            packet_length_std: self.lengths.std(),
            packet_length_variance: self.lengths.variance(),
            packet_length_min: self.lengths.min_or_zero(),
            packet_length_max: self.lengths.max_or_zero(),
            fwd_packet_length_mean: self.fwd.lengths.mean,
            fwd_packet_length_std: self.fwd.lengths.std(),
            fwd_packet_length_min: self.fwd.lengths.min_or_zero(),
            fwd_packet_length_max: self.fwd.lengths.max_or_zero(),
            bwd_packet_length_mean: self.bwd.lengths.mean,
            bwd_packet_length_std: self.bwd.lengths.std(),
            bwd_packet_length_min: self.bwd.lengths.min_or_zero(),
            bwd_packet_length_max: self.bwd.lengths.max_or_zero(),

            flow_bytes_per_second: per_second(total_bytes),
            flow_packets_per_second: per_second(total_packets),
            fwd_bytes_per_second: per_second(self.fwd.bytes),
            bwd_bytes_per_second: per_second(self.bwd.bytes),
            fwd_packets_per_second: per_second(self.fwd.packets),
            bwd_packets_per_second: per_second(self.bwd.packets),

            flow_iat_mean: self.iat.mean,
            flow_iat_std: self.iat.std(),
            flow_iat_min: self.iat.min_or_zero(),
            flow_iat_max: self.iat.max_or_zero(),
            fwd_iat_total: self.fwd.iat.sum,
            fwd_iat_mean: self.fwd.iat.mean,
            fwd_iat_std: self.fwd.iat.std(),
            fwd_iat_min: self.fwd.iat.min_or_zero(),
            fwd_iat_max: self.fwd.iat.max_or_zero(),
            bwd_iat_total: self.bwd.iat.sum,
            bwd_iat_mean: self.bwd.iat.mean,
            bwd_iat_std: self.bwd.iat.std(),
            bwd_iat_min: self.bwd.iat.min_or_zero(),
            bwd_iat_max: self.bwd.iat.max_or_zero(),

            active_mean: active.mean,
            active_std: active.std(),
            active_min: active.min_or_zero(),
            active_max: active.max_or_zero(),
            idle_mean: self.idle.mean,
            idle_std: self.idle.std(),
            idle_min: self.idle.min_or_zero(),
            idle_max: self.idle.max_or_zero(),

            tcp_flags: self.tcp_flags,
            fin_flag_count: self.flag_counts[0],
            syn_flag_count: self.flag_counts[1],
            rst_flag_count: self.flag_counts[2],
            psh_flag_count: self.flag_counts[3],
            ack_flag_count: self.flag_counts[4],
            urg_flag_count: self.flag_counts[5],
            ece_flag_count: self.flag_counts[6],
            cwr_flag_count: self.flag_counts[7],
            tcp_window_size_mean: self.window.mean,

            label: DEFAULT_LABEL.to_string(),
        }
    }
}
