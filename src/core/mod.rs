//! Core packet-level types
//!
//! - `packet`: canonical `Packet` value
//! - `parser`: frame normalization (`PacketNormalizer`)
//! - `flow`: direction-normalized `FlowKey` derivation

pub mod flow;
pub mod packet;
pub mod parser;

pub use flow::{Direction, Endpoint, FlowKey};
pub use packet::{IpProtocol, Packet, TcpFlags};
pub use parser::{LinkLayer, PacketNormalizer};
