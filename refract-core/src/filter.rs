//! Outbound filter hooks.
//!
//! The engine consults an externally supplied [`PacketFilter`] at two gates:
//! once per raw IP datagram before forwarding, and once per decrypted chunk
//! inside an intercepted TLS flow. The default implementation allows
//! everything.

use refract_wire::FlowKey;

/// Direction of a decrypted chunk inside an intercepted flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientToServer => write!(f, "client->server"),
            Self::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// Context handed to the decrypted-segment gate
#[derive(Debug, Clone)]
pub struct FlowMetadata {
    pub key: FlowKey,
    /// Owning application name, when the resolver could attribute the flow
    pub app: Option<String>,
    /// Certificate common name of the intercepted server
    pub server_name: Option<String>,
    pub direction: Direction,
}

/// Filter gates consulted by the forwarding engine
pub trait PacketFilter: Send + Sync {
    /// Pre-forwarding gate over the raw IP datagram. Returning `false`
    /// drops the datagram before any flow state is touched.
    fn accept_ip_datagram(&self, _datagram: &[u8]) -> bool {
        true
    }

    /// Post-decryption gate over one chunk of an intercepted flow.
    /// Returning `false` drops the chunk; the flow continues.
    fn accept_decrypted_segment(&self, _chunk: &[u8], _meta: &FlowMetadata) -> bool {
        true
    }

    /// Notification that a flow has been torn down.
    fn connection_closed(&self, _key: FlowKey) {}
}

/// Default filter: everything passes
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PacketFilter for AllowAll {}
