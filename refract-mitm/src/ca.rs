//! Local interception CA and per-host leaf issuance.
//!
//! The CA is generated in memory at engine start; leaf certificates
//! impersonating intercepted hosts are issued on demand and cached in a
//! keystore keyed by destination host, port and presented hostname, so a
//! busy host costs one signing operation.

use crate::error::{MitmError, Result};
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, trace};

const CA_VALIDITY_DAYS: i64 = 7;
const LEAF_VALIDITY_DAYS: i64 = 1;

/// Keystore key: one leaf per (destination host, port, presented hostname)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeafKey {
    pub host: String,
    pub port: u16,
    pub hostname: String,
}

/// In-memory certificate authority for TLS interception
pub struct InterceptCa {
    key_pair: KeyPair,
    params: CertificateParams,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    leaves: RwLock<HashMap<LeafKey, Arc<CertifiedKey>>>,
}

impl InterceptCa {
    /// Generate a fresh CA key pair and self-signed root.
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| MitmError::Ca(format!("key generation failed: {}", e)))?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("Refract Interception CA".to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Refract".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params
            .clone()
            .self_signed(&key_pair)
            .map_err(|e| MitmError::Ca(format!("self-sign failed: {}", e)))?;

        debug!("Interception CA generated");

        Ok(Self {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            key_pair,
            params,
            leaves: RwLock::new(HashMap::new()),
        })
    }

    /// PEM-encoded CA certificate, for installation into a trust store.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Number of cached leaf certificates
    pub fn leaf_count(&self) -> usize {
        self.leaves.read().len()
    }

    /// Issue (or reuse) a leaf certificate for `key`, covering `sans`.
    pub fn issue(&self, key: LeafKey, sans: &[String]) -> Result<Arc<CertifiedKey>> {
        if let Some(leaf) = self.leaves.read().get(&key) {
            trace!("Leaf cache hit for {}:{}", key.host, key.port);
            return Ok(leaf.clone());
        }

        debug!(
            "Issuing leaf certificate for {} ({}:{})",
            key.hostname, key.host, key.port
        );

        let leaf_key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| MitmError::Ca(format!("leaf key generation failed: {}", e)))?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(key.hostname.clone()),
        );
        params.distinguished_name = dn;

        let mut names: Vec<&str> = sans.iter().map(String::as_str).collect();
        if !names.contains(&key.hostname.as_str()) {
            names.push(&key.hostname);
        }
        params.subject_alt_names = names
            .iter()
            .filter_map(|name| {
                if let Ok(ip) = name.parse::<IpAddr>() {
                    Some(SanType::IpAddress(ip))
                } else {
                    (*name).try_into().ok().map(SanType::DnsName)
                }
            })
            .collect();

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let issuer = Issuer::from_params(&self.params, &self.key_pair);
        let cert = params
            .signed_by(&leaf_key_pair, &issuer)
            .map_err(|e| MitmError::Ca(format!("leaf signing failed: {}", e)))?;

        let chain = vec![cert.der().clone(), self.cert_der.clone()];
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key_pair.serialize_der()));
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der)
            .map_err(|e| MitmError::Ca(format!("unsupported leaf key: {}", e)))?;

        let certified = Arc::new(CertifiedKey::new(chain, signing_key));
        self.leaves.write().insert(key, certified.clone());
        Ok(certified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_key(hostname: &str) -> LeafKey {
        LeafKey {
            host: "93.184.216.34".to_string(),
            port: 443,
            hostname: hostname.to_string(),
        }
    }

    #[test]
    fn issues_and_caches_leaves() {
        let ca = InterceptCa::generate().unwrap();
        assert_eq!(ca.leaf_count(), 0);

        let a = ca
            .issue(leaf_key("example.com"), &["example.com".to_string()])
            .unwrap();
        assert_eq!(ca.leaf_count(), 1);

        let b = ca
            .issue(leaf_key("example.com"), &["example.com".to_string()])
            .unwrap();
        assert_eq!(ca.leaf_count(), 1);
        assert!(Arc::ptr_eq(&a, &b));

        // A different hostname for the same endpoint is a separate leaf
        let c = ca
            .issue(leaf_key("www.example.com"), &[])
            .unwrap();
        assert_eq!(ca.leaf_count(), 2);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn leaf_chain_includes_ca() {
        let ca = InterceptCa::generate().unwrap();
        let leaf = ca
            .issue(leaf_key("example.com"), &["example.com".to_string()])
            .unwrap();
        assert_eq!(leaf.cert.len(), 2);
        assert_eq!(leaf.cert[1], *ca.cert_der());
    }

    #[test]
    fn ca_pem_is_exportable() {
        let ca = InterceptCa::generate().unwrap();
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
    }
}
