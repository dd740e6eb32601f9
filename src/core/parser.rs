//! Frame normalization
//!
//! Turns a raw captured frame into a canonical [`Packet`]. Pure function of
//! its input: no state, no side effects. Frames that cannot be parsed far
//! enough to key a flow are reported as `MalformedPacket` and the caller
//! drops them.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, MalformedReason, Result};
use super::packet::{IpProtocol, Packet, TcpFlags};

/// Link layer the capture source delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkLayer {
    /// Ethernet II frames (optionally VLAN tagged)
    #[default]
    Ethernet,
    /// Bare IPv4/IPv6 packets with no link header
    RawIp,
}

/// Stateless frame parser
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketNormalizer {
    link: LinkLayer,
}

impl PacketNormalizer {
    pub fn new(link: LinkLayer) -> Self {
        Self { link }
    }

    pub fn link_layer(&self) -> LinkLayer {
        self.link
    }

    /// Parse a captured frame into a packet
    pub fn parse(&self, frame: &[u8], timestamp: DateTime<Utc>) -> Result<Packet> {
        if frame.is_empty() {
            return Err(MalformedReason::Empty.into());
        }

        let sliced = match self.link {
            LinkLayer::Ethernet => SlicedPacket::from_ethernet(frame)
                .map_err(|e| MalformedReason::Truncated(e.to_string()))?,
            LinkLayer::RawIp => {
                let version = frame[0] >> 4;
                if version != 4 && version != 6 {
                    return Err(MalformedReason::Unsupported("ip version").into());
                }
                SlicedPacket::from_ip(frame)
                    .map_err(|e| MalformedReason::Truncated(e.to_string()))?
            }
        };

        build_packet(&sliced, frame.len(), timestamp)
    }
}

fn build_packet(sliced: &SlicedPacket<'_>, frame_len: usize, timestamp: DateTime<Utc>) -> Result<Packet> {
    let (src_ip, dst_ip, protocol, header_length, ttl, tos) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(ipv4.payload().ip_number.0),
                u16::from(header.ihl()) * 4,
                header.ttl(),
                // DSCP + ECN byte
                header.slice()[1],
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(ipv6.payload().ip_number.0),
                40,
                header.hop_limit(),
                header.traffic_class(),
            )
        }
        _ => return Err(FlowError::MalformedPacket(MalformedReason::Unsupported("non-ip frame"))),
    };

    let mut packet = Packet::new(timestamp, src_ip, 0, dst_ip, 0, protocol);
    packet.length = frame_len as u32;
    packet.header_length = header_length;
    packet.ttl = ttl;
    packet.tos = tos;

    // Non-first fragments carry no transport header; they key on the
    // address pair and protocol with zero ports.
    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            packet.src_port = tcp.source_port();
            packet.dst_port = tcp.destination_port();
            packet.tcp_flags = Some(TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
                ece: tcp.ece(),
                cwr: tcp.cwr(),
            });
            packet.seq = Some(tcp.sequence_number());
            packet.ack = Some(tcp.acknowledgment_number());
            packet.window = Some(tcp.window_size());
        }
        Some(TransportSlice::Udp(udp)) => {
            packet.src_port = udp.source_port();
            packet.dst_port = udp.destination_port();
        }
        _ => {}
    }

    Ok(packet)
}
