//! Refract core — ambient foundation for the forwarding engine.
//!
//! Holds the pieces every other crate leans on: the error taxonomy, engine
//! configuration, logging setup, and the collaborator seams (virtual
//! interface, packet filter, socket protection) the embedding layer plugs
//! into.

pub mod config;
pub mod error;
pub mod filter;
pub mod iface;
pub mod logging;
pub mod protect;

pub use config::{
    CleanupConfig, EngineConfig, InterceptConfig, LogLevel, ResolverConfig, TcpConfig, UdpConfig,
};
pub use error::{Error, Result};
pub use filter::{AllowAll, Direction, FlowMetadata, PacketFilter};
pub use iface::{ChannelInterface, VirtualInterface};
pub use logging::init_logging;
pub use protect::{Dialer, NoProtection, SocketProtector};
