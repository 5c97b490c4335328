//! TLS configuration assembly for both legs of an intercepted flow.

use crate::ca::{InterceptCa, LeafKey};
use crate::probe::UpstreamIdentity;
use crate::verifier::SkipServerVerification;
use refract_wire::Tuple;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig, SupportedProtocolVersion};
use std::sync::Arc;
use tracing::{error, trace};

/// Resolves the impersonation certificate from the client's SNI, falling
/// back to the probed common name and finally the raw destination address.
pub struct DynamicCertResolver {
    ca: Arc<InterceptCa>,
    dest: Tuple,
    identity: Arc<UpstreamIdentity>,
}

impl DynamicCertResolver {
    pub fn new(ca: Arc<InterceptCa>, dest: Tuple, identity: Arc<UpstreamIdentity>) -> Self {
        Self { ca, dest, identity }
    }

    fn hostname_for(&self, client_hello: &ClientHello<'_>) -> String {
        if let Some(sni) = client_hello.server_name() {
            return sni.to_string();
        }
        if !self.identity.common_name.is_empty() {
            return self.identity.common_name.clone();
        }
        self.dest.addr.to_string()
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hostname = self.hostname_for(&client_hello);
        trace!("Resolving leaf for {} ({})", hostname, self.dest);

        let key = LeafKey {
            host: self.dest.addr.to_string(),
            port: self.dest.port,
            hostname,
        };
        match self.ca.issue(key, &self.identity.sans) {
            Ok(leaf) => Some(leaf),
            Err(e) => {
                error!("Leaf issuance failed for {}: {}", self.dest, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("dest", &self.dest)
            .field("common_name", &self.identity.common_name)
            .finish()
    }
}

fn protocol_versions(allow_tls12: bool) -> &'static [&'static SupportedProtocolVersion] {
    const ALL: &[&SupportedProtocolVersion] =
        &[&rustls::version::TLS13, &rustls::version::TLS12];
    const TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
    if allow_tls12 {
        ALL
    } else {
        TLS13_ONLY
    }
}

/// Server-side config impersonating the intercepted host.
///
/// ALPN is pinned to http/1.1: the splice is a plain byte copy and must not
/// let the endpoints negotiate a framed protocol it cannot re-multiplex.
pub fn build_server_config(resolver: DynamicCertResolver) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Client-side config for the upstream leg of the splice.
pub fn build_client_config(verify_upstream: bool, allow_tls12: bool) -> Arc<ClientConfig> {
    let builder = ClientConfig::builder_with_protocol_versions(protocol_versions(allow_tls12));
    let mut config = if verify_upstream {
        let roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Trust-all client config for the certificate probe. All protocol versions
/// are offered so the identity of legacy servers can still be read.
pub fn build_probe_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn server_config_builds_with_resolver() {
        let ca = Arc::new(InterceptCa::generate().unwrap());
        let identity = Arc::new(UpstreamIdentity {
            common_name: "example.com".to_string(),
            sans: vec!["example.com".to_string(), "www.example.com".to_string()],
        });
        let resolver = DynamicCertResolver::new(
            ca,
            Tuple::new(Ipv4Addr::new(93, 184, 216, 34), 443),
            identity,
        );
        let config = build_server_config(resolver);
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn client_config_variants_build() {
        let verified = build_client_config(true, true);
        assert_eq!(verified.alpn_protocols, vec![b"http/1.1".to_vec()]);
        let _skipped = build_client_config(false, false);
        let _probe = build_probe_config();
    }
}
