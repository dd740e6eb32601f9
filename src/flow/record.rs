//! Finalized flow feature records
//!
//! A `FlowRecord` is produced exactly once per flow lifetime and is never
//! mutated afterwards. Field names are the stable export schema.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label written into every record until a classifier overwrites it downstream
pub const DEFAULT_LABEL: &str = "BENIGN";

/// Why a flow was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// FIN observed from both sides
    Fin,
    /// RST observed
    Rst,
    /// No packets for longer than the idle timeout
    IdleTimeout,
    /// Flow older than the maximum lifetime
    MaxLifetime,
    /// Evicted to admit a new flow into a full table
    Evicted,
    /// Flushed during engine shutdown
    Shutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Fin => write!(f, "fin"),
            EndReason::Rst => write!(f, "rst"),
            EndReason::IdleTimeout => write!(f, "idle_timeout"),
            EndReason::MaxLifetime => write!(f, "max_lifetime"),
            EndReason::Evicted => write!(f, "evicted"),
            EndReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Immutable per-flow feature record
///
/// Durations, inter-arrival times and active/idle periods are in
/// microseconds; rates are per second. "Forward" is traffic sent by the
/// `src` endpoint (the key's side A).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_id: u64,

    // Endpoints
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: u8,
    pub protocol_name: String,

    // Timing
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub flow_duration_us: u64,
    pub end_reason: EndReason,

    // Counts
    pub total_fwd_packets: u64,
    pub total_bwd_packets: u64,
    pub total_length_fwd_packets: u64,
    pub total_length_bwd_packets: u64,
    pub flow_bytes_total: u64,

    // Packet length
    pub packet_length_mean: f64,
    pub packet_length_std: f64,
    pub packet_length_variance: f64,
    pub packet_length_min: f64,
    pub packet_length_max: f64,
    pub fwd_packet_length_mean: f64,
    pub fwd_packet_length_std: f64,
    pub fwd_packet_length_min: f64,
    pub fwd_packet_length_max: f64,
    pub bwd_packet_length_mean: f64,
    pub bwd_packet_length_std: f64,
    pub bwd_packet_length_min: f64,
    pub bwd_packet_length_max: f64,

    // Rates
    pub flow_bytes_per_second: f64,
    pub flow_packets_per_second: f64,
    pub fwd_bytes_per_second: f64,
    pub bwd_bytes_per_second: f64,
    pub fwd_packets_per_second: f64,
    pub bwd_packets_per_second: f64,

    // Inter-arrival times
    pub flow_iat_mean: f64,
    pub flow_iat_std: f64,
    pub flow_iat_min: f64,
    pub flow_iat_max: f64,
    pub fwd_iat_total: f64,
    pub fwd_iat_mean: f64,
    pub fwd_iat_std: f64,
    pub fwd_iat_min: f64,
    pub fwd_iat_max: f64,
    pub bwd_iat_total: f64,
    pub bwd_iat_mean: f64,
    pub bwd_iat_std: f64,
    pub bwd_iat_min: f64,
    pub bwd_iat_max: f64,

    // Activity
    pub active_mean: f64,
    pub active_std: f64,
    pub active_min: f64,
    pub active_max: f64,
    pub idle_mean: f64,
    pub idle_std: f64,
    pub idle_min: f64,
    pub idle_max: f64,

    // TCP
    pub tcp_flags: u8,
    pub fin_flag_count: u32,
    pub syn_flag_count: u32,
    pub rst_flag_count: u32,
    pub psh_flag_count: u32,
    pub ack_flag_count: u32,
    pub urg_flag_count: u32,
    pub ece_flag_count: u32,
    pub cwr_flag_count: u32,
    pub tcp_window_size_mean: f64,

    pub label: String,
}

impl FlowRecord {
    pub fn total_packets(&self) -> u64 {
        self.total_fwd_packets + self.total_bwd_packets
    }

    /// Serialize as a single JSON line
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
