//! Normalized packet representation
//!
//! A `Packet` carries only the header fields the flow features need. It is
//! built once per captured frame by the normalizer and never mutated.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Gre,
    Esp,
    Icmpv6,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            47 => IpProtocol::Gre,
            50 => IpProtocol::Esp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Gre => 47,
            IpProtocol::Esp => 50,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

impl IpProtocol {
    /// Protocol name as exported in flow records
    pub fn name(&self) -> String {
        match self {
            IpProtocol::Icmp => "ICMP".to_string(),
            IpProtocol::Tcp => "TCP".to_string(),
            IpProtocol::Udp => "UDP".to_string(),
            IpProtocol::Gre => "GRE".to_string(),
            IpProtocol::Esp => "ESP".to_string(),
            IpProtocol::Icmpv6 => "ICMPv6".to_string(),
            IpProtocol::Other(n) => format!("UNKNOWN_{}", n),
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;

    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & Self::FIN != 0,
            syn: flags & Self::SYN != 0,
            rst: flags & Self::RST != 0,
            psh: flags & Self::PSH != 0,
            ack: flags & Self::ACK != 0,
            urg: flags & Self::URG != 0,
            ece: flags & Self::ECE != 0,
            cwr: flags & Self::CWR != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= Self::FIN; }
        if self.syn { flags |= Self::SYN; }
        if self.rst { flags |= Self::RST; }
        if self.psh { flags |= Self::PSH; }
        if self.ack { flags |= Self::ACK; }
        if self.urg { flags |= Self::URG; }
        if self.ece { flags |= Self::ECE; }
        if self.cwr { flags |= Self::CWR; }
        flags
    }

    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    pub fn is_rst(&self) -> bool {
        self.rst
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if self.ece { s.push('E'); }
        if self.cwr { s.push('C'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// Canonical packet produced by the normalizer
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Source port (0 for protocols without ports)
    pub src_port: u16,
    /// Destination port (0 for protocols without ports)
    pub dst_port: u16,
    pub protocol: IpProtocol,
    /// Captured frame length in bytes
    pub length: u32,
    /// IP header length in bytes
    pub header_length: u16,
    /// TTL / hop limit
    pub ttl: u8,
    /// Type of service / traffic class
    pub tos: u8,
    /// TCP flags (None for non-TCP)
    pub tcp_flags: Option<TcpFlags>,
    pub seq: Option<u32>,
    pub ack: Option<u32>,
    pub window: Option<u16>,
}

impl Packet {
    /// Create a packet with only addressing filled in
    pub fn new(
        timestamp: DateTime<Utc>,
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: IpProtocol,
    ) -> Self {
        Self {
            timestamp,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
            length: 0,
            header_length: 0,
            ttl: 64,
            tos: 0,
            tcp_flags: None,
            seq: None,
            ack: None,
            window: None,
        }
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    pub fn with_tcp_flags(mut self, flags: TcpFlags) -> Self {
        self.tcp_flags = Some(flags);
        self
    }

    pub fn with_window(mut self, window: u16) -> Self {
        self.window = Some(window);
        self
    }

    /// The same packet travelling the other way
    pub fn reversed(&self) -> Self {
        let mut pkt = self.clone();
        std::mem::swap(&mut pkt.src_ip, &mut pkt.dst_ip);
        std::mem::swap(&mut pkt.src_port, &mut pkt.dst_port);
        pkt
    }

    pub fn is_fin(&self) -> bool {
        self.tcp_flags.map(|f| f.is_fin()).unwrap_or(false)
    }

    pub fn is_rst(&self) -> bool {
        self.tcp_flags.map(|f| f.is_rst()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_tcp_flags() {
        let flags = TcpFlags::from_u8(0x12); // SYN+ACK
        assert!(flags.syn);
        assert!(flags.ack);
        assert!(!flags.fin);
        assert!(!flags.is_syn());
        assert_eq!(flags.to_u8(), 0x12);
        assert_eq!(flags.to_string(), "SA");
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(IpProtocol::from(6).name(), "TCP");
        assert_eq!(IpProtocol::from(47).name(), "GRE");
        assert_eq!(IpProtocol::from(132).name(), "UNKNOWN_132");
        assert_eq!(u8::from(IpProtocol::from(132)), 132);
    }

    #[test]
    fn test_packet_reversed() {
        let pkt = Packet::new(
            Utc::now(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
            IpProtocol::Tcp,
        )
        .with_length(100);

        let rev = pkt.reversed();
        assert_eq!(rev.src_ip, pkt.dst_ip);
        assert_eq!(rev.src_port, 80);
        assert_eq!(rev.dst_port, 5000);
        assert_eq!(rev.length, 100);
        assert_eq!(rev.reversed(), pkt);
    }
}
