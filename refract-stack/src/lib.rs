//! Refract stack — the TCP forwarding engine.
//!
//! Reconstructs per-flow TCP state from raw datagrams off a virtual network
//! interface, proxies every flow to its real destination (or through the
//! local TLS terminator), and synthesizes the response segments that keep
//! the original application convinced it owns a direct socket.

pub mod engine;
pub mod flow;
pub mod forwarder;
pub mod io;
pub mod stats;
pub mod udp;

pub use engine::{Engine, EngineBuilder};
pub use flow::{FlowId, FlowTable};
pub use forwarder::{FlowAction, FlowCell, Forwarder, PendingWrite, SegmentTemplate, TcpState};
pub use io::IoManager;
pub use stats::EngineStats;
pub use udp::UdpRelay;
