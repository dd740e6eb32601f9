//! Direction-normalized flow keys
//!
//! Both directions of a conversation map to the same `FlowKey`. The smaller
//! (address, port) endpoint is side A; packets sent by side A are forward.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::packet::{IpProtocol, Packet};

/// One side of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Packet direction relative to the key's side A
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by side A
    Forward,
    /// Sent by side B
    Backward,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }

    pub fn is_forward(self) -> bool {
        self == Direction::Forward
    }
}

/// Unique key identifying a flow (5-tuple normalized)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    /// Lexicographically smaller endpoint
    pub a: Endpoint,
    /// The other endpoint
    pub b: Endpoint,
    pub protocol: IpProtocol,
}

impl FlowKey {
    /// Derive the canonical key and the packet's direction within it
    ///
    /// Deterministic and symmetric: a packet and its reversed twin yield
    /// the same key and opposite directions. A packet whose source equals
    /// its destination is forward.
    pub fn derive(pkt: &Packet) -> (Self, Direction) {
        let src = Endpoint::new(pkt.src_ip, pkt.src_port);
        let dst = Endpoint::new(pkt.dst_ip, pkt.dst_port);

        if src <= dst {
            (Self { a: src, b: dst, protocol: pkt.protocol }, Direction::Forward)
        } else {
            (Self { a: dst, b: src, protocol: pkt.protocol }, Direction::Backward)
        }
    }

    /// Key only, for lookups
    pub fn from_packet(pkt: &Packet) -> Self {
        Self::derive(pkt).0
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <-> {} {}", self.a, self.b, self.protocol)
    }
}
