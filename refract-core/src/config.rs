use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Log verbosity, convertible to a tracing directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// TCP forwarding configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Advertised receive window on synthesized segments
    pub recv_window: u16,
    /// MSS advertised in the synthesized SYN-ACK
    pub mss: u16,
    /// Outbound connect timeout
    pub connect_timeout: Duration,
    /// TIME_WAIT linger before the flow is destroyed. Intentionally short:
    /// the real socket is already closed, this is not a 2MSL wait.
    pub linger: Duration,
    /// Idle flows older than this are evicted by the cleanup task
    pub idle_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            recv_window: 65535,
            mss: 1360,
            connect_timeout: Duration::from_secs(3),
            linger: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// UDP relay configuration
#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub session_timeout: Duration,
    pub max_sessions: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(60),
            max_sessions: 4096,
        }
    }
}

/// Connection-to-app resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Sweeper period
    pub sweep_interval: Duration,
    /// Sweeps a record may survive without a lookup hit before eviction
    pub max_sweeps: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            max_sweeps: 5,
        }
    }
}

/// TLS interception configuration
#[derive(Debug, Clone)]
pub struct InterceptConfig {
    /// Whether flows to `tls_port` are redirected to the local terminator
    pub enabled: bool,
    /// Destination port that identifies TLS flows
    pub tls_port: u16,
    /// Address the terminator listens on; port 0 picks an ephemeral port
    pub listen: (Ipv4Addr, u16),
    /// Verify the upstream server certificate on the splice leg.
    /// The probe leg always trusts-all so the identity can be extracted.
    pub verify_upstream: bool,
    /// Allow TLS 1.2 on the upstream leg; TLS 1.3 is always offered
    pub allow_tls12: bool,
    /// Handshake/probe timeout
    pub handshake_timeout: Duration,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tls_port: 443,
            listen: (Ipv4Addr::LOCALHOST, 0),
            verify_upstream: true,
            allow_tls12: true,
            handshake_timeout: Duration::from_secs(3),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    pub resolver: ResolverConfig,
    pub intercept: InterceptConfig,
    pub cleanup: CleanupConfig,
    pub log_level: LogLevel,
}

/// Periodic maintenance configuration
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}
