//! Error types for the segment codec

use thiserror::Error;

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, WireError>;

/// Codec failures. All of these mean "cannot map/forward, drop the
/// datagram"; none should propagate past the codec boundary.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}
