//! Refract wire — flow addressing and the IPv4/TCP segment codec.
//!
//! Everything above this crate speaks [`Tuple`]/[`FlowKey`] and decoded
//! [`ParsedDatagram`]s; raw byte handling stays behind this boundary.
//! Malformed input surfaces as [`WireError`] and is always droppable.

pub mod error;
pub mod packet;
pub mod tuple;

pub use error::{Result, WireError};
pub use packet::{
    build_ipv4_tcp, build_ipv4_udp, parse_datagram, ParsedDatagram, TcpFlags, TcpSegment,
    Transport, UdpDatagram, DEFAULT_MSS, DEFAULT_MTU,
};
pub use tuple::{FlowKey, Tuple};
