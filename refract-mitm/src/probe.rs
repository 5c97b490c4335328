//! Upstream certificate probe.
//!
//! Before impersonating a server the terminator must know who it is. The
//! probe performs one throwaway TLS handshake against the real destination
//! with a trust-all verifier, pulls the common name and subject-alternative
//! names off the presented certificate, and caches the result per
//! destination tuple.

use crate::cert::build_probe_config;
use crate::error::{HandshakeLeg, MitmError, Result};
use dashmap::DashMap;
use refract_core::Dialer;
use refract_wire::Tuple;
use rustls::pki_types::ServerName;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// Identity extracted from the real server's certificate
#[derive(Debug, Clone)]
pub struct UpstreamIdentity {
    pub common_name: String,
    pub sans: Vec<String>,
}

impl UpstreamIdentity {
    /// Common name plus SANs, deduplicated, for pinning checks
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.sans.len() + 1);
        if !self.common_name.is_empty() {
            names.push(self.common_name.clone());
        }
        for san in &self.sans {
            if !names.contains(san) {
                names.push(san.clone());
            }
        }
        names
    }
}

/// Per-destination certificate identity resolver
pub struct CertProbe {
    dialer: Arc<Dialer>,
    cache: DashMap<Tuple, Arc<UpstreamIdentity>>,
    timeout: Duration,
}

impl CertProbe {
    pub fn new(dialer: Arc<Dialer>, timeout: Duration) -> Self {
        Self {
            dialer,
            cache: DashMap::new(),
            timeout,
        }
    }

    pub fn cached(&self, dest: &Tuple) -> Option<Arc<UpstreamIdentity>> {
        self.cache.get(dest).map(|e| e.clone())
    }

    /// Resolve the certificate identity of `dest`, probing at most once.
    pub async fn resolve(&self, dest: Tuple, sni: Option<&str>) -> Result<Arc<UpstreamIdentity>> {
        if let Some(hit) = self.cached(&dest) {
            trace!("Certificate identity cache hit for {}", dest);
            return Ok(hit);
        }

        let identity = tokio::time::timeout(self.timeout, self.probe(dest, sni))
            .await
            .map_err(|_| MitmError::handshake(HandshakeLeg::Probe, "timed out"))??;

        debug!(
            "Probed {}: cn={:?} sans={}",
            dest,
            identity.common_name,
            identity.sans.len()
        );

        let identity = Arc::new(identity);
        self.cache.insert(dest, identity.clone());
        Ok(identity)
    }

    async fn probe(&self, dest: Tuple, sni: Option<&str>) -> Result<UpstreamIdentity> {
        let stream = self.dialer.connect(dest.socket_addr()).await?;

        let server_name = match sni {
            Some(name) => ServerName::try_from(name.to_string())
                .map_err(|_| MitmError::Cert(format!("invalid SNI hostname: {}", name)))?,
            None => ServerName::IpAddress(IpAddr::V4(dest.addr).into()),
        };

        let connector = TlsConnector::from(build_probe_config());
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| MitmError::handshake(HandshakeLeg::Probe, e.to_string()))?;

        let certs = tls
            .get_ref()
            .1
            .peer_certificates()
            .ok_or_else(|| MitmError::Cert("server presented no certificate".to_string()))?;
        let leaf = certs
            .first()
            .ok_or_else(|| MitmError::Cert("empty certificate chain".to_string()))?;

        extract_identity(leaf.as_ref())
    }
}

/// Pull CN and SANs out of a DER-encoded certificate
pub fn extract_identity(der: &[u8]) -> Result<UpstreamIdentity> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| MitmError::Cert(format!("certificate parse failed: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let sans = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    GeneralName::IPAddress(bytes) => match bytes.len() {
                        4 => Some(
                            IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
                                .to_string(),
                        ),
                        16 => {
                            let octets: [u8; 16] = (*bytes).try_into().ok()?;
                            Some(IpAddr::V6(Ipv6Addr::from(octets)).to_string())
                        }
                        _ => None,
                    },
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(UpstreamIdentity { common_name, sans })
}
