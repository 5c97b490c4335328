//! TLS interception terminator.
//!
//! Flows the forwarder redirects here arrive as plain TCP connections from
//! the engine's own outbound sockets. Each accepted stream walks the phase
//! machine: locate the owning flow by ephemeral source port, probe the real
//! server's certificate, consult the pinning list, then either splice raw
//! (exempt) or terminate TLS on both legs and splice decrypted bytes
//! through the filter hooks.

use crate::ca::InterceptCa;
use crate::cert::{build_client_config, build_server_config, DynamicCertResolver};
use crate::error::{HandshakeLeg, MitmError, Result};
use crate::pinning::PinningList;
use crate::probe::{CertProbe, UpstreamIdentity};
use crate::splice::splice;
use refract_core::{Dialer, Direction, FlowMetadata, InterceptConfig, PacketFilter};
use refract_sock2app::ConnectionTable;
use refract_wire::{FlowKey, Tuple};
use rustls::pki_types::ServerName;
use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Phase of one intercepted stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptPhase {
    WaitingCert,
    HandshakingClient,
    HandshakingServer,
    Splicing,
    Closed,
}

impl fmt::Display for InterceptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitingCert => write!(f, "WAITING_CERT"),
            Self::HandshakingClient => write!(f, "HANDSHAKING_CLIENT"),
            Self::HandshakingServer => write!(f, "HANDSHAKING_SERVER"),
            Self::Splicing => write!(f, "SPLICING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// The terminator's view of a forwarder
pub trait OwningFlow: Send + Sync {
    /// Client source / real destination of the flow
    fn key(&self) -> FlowKey;
    /// Guards the flow against RSTs racing the TLS negotiation
    fn set_tls_handshaking(&self, active: bool);
    /// Reset the original flow: RST to the client plus teardown
    fn reset(&self);
}

/// Locates forwarders by the ephemeral port of their outbound socket
pub trait FlowDirectory: Send + Sync {
    fn flow_by_local_port(&self, local_port: u16) -> Option<Arc<dyn OwningFlow>>;
}

/// Local TLS-terminating proxy for redirected flows
pub struct TlsTerminator {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: InterceptConfig,
    ca: Arc<InterceptCa>,
    probe: CertProbe,
    pinning: Arc<PinningList>,
    flows: Arc<dyn FlowDirectory>,
    resolver: Arc<ConnectionTable>,
    filter: Arc<dyn PacketFilter>,
    dialer: Arc<Dialer>,
}

impl TlsTerminator {
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        config: InterceptConfig,
        ca: Arc<InterceptCa>,
        pinning: Arc<PinningList>,
        flows: Arc<dyn FlowDirectory>,
        resolver: Arc<ConnectionTable>,
        filter: Arc<dyn PacketFilter>,
        dialer: Arc<Dialer>,
    ) -> Result<Self> {
        let (addr, port) = config.listen;
        let listener = TcpListener::bind(SocketAddr::V4(SocketAddrV4::new(addr, port))).await?;
        let local_addr = listener.local_addr()?;
        info!("TLS terminator listening on {}", local_addr);

        let probe = CertProbe::new(dialer.clone(), config.handshake_timeout);

        Ok(Self {
            listener,
            local_addr,
            config,
            ca,
            probe,
            pinning,
            flows,
            resolver,
            filter,
            dialer,
        })
    }

    /// Port the forwarder redirects intercepted flows to
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop; one task per intercepted stream.
    pub fn spawn(self: Arc<Self>, running: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                match self.listener.accept().await {
                    Ok((stream, peer)) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            this.handle_client(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        if running.load(Ordering::Relaxed) {
                            warn!("Terminator accept error: {}", e);
                        }
                        break;
                    }
                }
            }
        })
    }

    async fn handle_client(&self, client: TcpStream, peer: SocketAddr) {
        let mut phase = InterceptPhase::WaitingCert;

        // The accept can win the race against the forwarder recording its
        // ephemeral port; give the arena a moment before giving up.
        let mut flow = None;
        for _ in 0..10 {
            flow = self.flows.flow_by_local_port(peer.port());
            if flow.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let flow = match flow {
            Some(flow) => flow,
            None => {
                warn!("{}", MitmError::FlowNotFound(peer.port()));
                return;
            }
        };
        let key = flow.key();
        let dest = key.dst;
        let app = self.resolver.lookup(key.src.port).map(|d| d.name);

        debug!(flow = %key, %phase, app = ?app, "Intercepted stream accepted");

        let identity = match self.probe.resolve(dest, None).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(flow = %key, "Certificate probe failed: {}", e);
                flow.reset();
                return;
            }
        };

        let names = identity.names();
        if self.pinning.is_exempt(&names, app.as_deref()) {
            info!(flow = %key, cn = %identity.common_name, "Pinning exemption, bypassing interception");
            self.bypass(client, &*flow, dest).await;
            return;
        }

        flow.set_tls_handshaking(true);
        phase = InterceptPhase::HandshakingClient;
        debug!(flow = %key, %phase, cn = %identity.common_name, "Impersonating server");

        let resolver = DynamicCertResolver::new(self.ca.clone(), dest, identity.clone());
        let acceptor = TlsAcceptor::from(build_server_config(resolver));
        let client_tls = match tokio::time::timeout(
            self.config.handshake_timeout,
            acceptor.accept(client),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.fail(&*flow, &identity, app.as_deref(), HandshakeLeg::Client, &e.to_string());
                return;
            }
            Err(_) => {
                self.fail(&*flow, &identity, app.as_deref(), HandshakeLeg::Client, "timed out");
                return;
            }
        };

        phase = InterceptPhase::HandshakingServer;
        debug!(flow = %key, %phase, "Connecting to real server");

        let upstream = match self.dialer.connect(dest.socket_addr()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(&*flow, &identity, app.as_deref(), HandshakeLeg::Server, &e.to_string());
                return;
            }
        };

        let connector = TlsConnector::from(build_client_config(
            self.config.verify_upstream,
            self.config.allow_tls12,
        ));
        let server_name = upstream_server_name(&identity, dest);
        let upstream_tls = match tokio::time::timeout(
            self.config.handshake_timeout,
            connector.connect(server_name, upstream),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.fail(&*flow, &identity, app.as_deref(), HandshakeLeg::Server, &e.to_string());
                return;
            }
            Err(_) => {
                self.fail(&*flow, &identity, app.as_deref(), HandshakeLeg::Server, "timed out");
                return;
            }
        };

        flow.set_tls_handshaking(false);
        phase = InterceptPhase::Splicing;
        debug!(flow = %key, %phase, "Both handshakes complete");

        let meta = FlowMetadata {
            key,
            app,
            server_name: Some(identity.common_name.clone()),
            direction: Direction::ClientToServer,
        };
        splice(client_tls, upstream_tls, meta, self.filter.clone()).await;

        phase = InterceptPhase::Closed;
        debug!(flow = %key, %phase, "Intercepted stream finished");
    }

    /// Exempt flow: connect the client straight through to the real server.
    async fn bypass(&self, mut client: TcpStream, flow: &dyn OwningFlow, dest: Tuple) {
        match self.dialer.connect(dest.socket_addr()).await {
            Ok(mut upstream) => {
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            }
            Err(e) => {
                debug!("Bypass connect to {} failed: {}", dest, e);
                flow.reset();
            }
        }
    }

    fn fail(
        &self,
        flow: &dyn OwningFlow,
        identity: &UpstreamIdentity,
        app: Option<&str>,
        leg: HandshakeLeg,
        message: &str,
    ) {
        let err = MitmError::handshake(leg, message);
        warn!(flow = %flow.key(), "{}", err);

        let domain = if identity.common_name.is_empty() {
            flow.key().dst.addr.to_string()
        } else {
            identity.common_name.clone()
        };
        self.pinning.record_failure(&domain, app);

        flow.set_tls_handshaking(false);
        flow.reset();
    }
}

fn upstream_server_name(identity: &UpstreamIdentity, dest: Tuple) -> ServerName<'static> {
    if !identity.common_name.is_empty() {
        if let Ok(name) = ServerName::try_from(identity.common_name.clone()) {
            return name;
        }
    }
    ServerName::IpAddress(IpAddr::V4(dest.addr).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display_names() {
        assert_eq!(InterceptPhase::WaitingCert.to_string(), "WAITING_CERT");
        assert_eq!(InterceptPhase::Splicing.to_string(), "SPLICING");
    }

    #[test]
    fn upstream_name_falls_back_to_ip() {
        let dest = Tuple::new(std::net::Ipv4Addr::new(93, 184, 216, 34), 443);
        let no_cn = UpstreamIdentity {
            common_name: String::new(),
            sans: vec![],
        };
        assert!(matches!(
            upstream_server_name(&no_cn, dest),
            ServerName::IpAddress(_)
        ));

        let with_cn = UpstreamIdentity {
            common_name: "example.com".to_string(),
            sans: vec![],
        };
        assert!(matches!(
            upstream_server_name(&with_cn, dest),
            ServerName::DnsName(_)
        ));
    }
}
