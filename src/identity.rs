use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};

/// SHA-256 over the certificate DER, base64url without padding.
///
/// This is the `x5t#S256` form that access tokens use to bind a session to a certificate.
pub fn compute_certificate_fingerprint(cert_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    let hash = hasher.finalize();
    URL_SAFE_NO_PAD.encode(hash)
}

/// Where an identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Operator-supplied material read from disk.
    Loaded,
    /// Self-signed material generated and persisted by the store.
    Generated,
    /// Self-signed material that only lives in memory (the host's native behavior).
    Ephemeral,
}

/// The server's TLS identity: key, chain, validity window and fingerprint.
///
/// Immutable once built. A different identity needs a restart.
pub struct CertificateIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    certified_key: Arc<CertifiedKey>,
    subject: String,
    not_before: SystemTime,
    not_after: SystemTime,
    fingerprint: String,
    alpn_protocols: Vec<Vec<u8>>,
    origin: IdentityOrigin,
}

pub(crate) struct IdentityParts {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub certified_key: Arc<CertifiedKey>,
    pub subject: String,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub origin: IdentityOrigin,
}

impl CertificateIdentity {
    pub(crate) fn from_parts(parts: IdentityParts) -> Self {
        let fingerprint = compute_certificate_fingerprint(parts.chain[0].as_ref());
        Self {
            chain: parts.chain,
            key: parts.key,
            certified_key: parts.certified_key,
            subject: parts.subject,
            not_before: parts.not_before,
            not_after: parts.not_after,
            fingerprint,
            alpn_protocols: parts.alpn_protocols,
            origin: parts.origin,
        }
    }

    /// The end-entity certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// The signing key and chain in the form rustls hands to a handshake.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now > self.not_after
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// ALPN tokens this identity is provisioned for.
    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    pub fn supports_alpn(&self, token: &[u8]) -> bool {
        self.alpn_protocols.iter().any(|p| p == token)
    }

    pub fn origin(&self) -> IdentityOrigin {
        self.origin
    }

    /// Two identities are the same when they carry the same leaf certificate.
    pub fn same_as(&self, other: &CertificateIdentity) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl fmt::Debug for CertificateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateIdentity")
            .field("subject", &self.subject)
            .field("fingerprint", &self.fingerprint)
            .field("chain_len", &self.chain.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("origin", &self.origin)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_url_safe_sha256() {
        let fp = compute_certificate_fingerprint(b"certificate");
        assert_eq!(fp.len(), 43);
        assert!(!fp.contains('='));
        assert!(!fp.contains('+'));
        assert!(!fp.contains('/'));
        assert_eq!(fp, compute_certificate_fingerprint(b"certificate"));
        assert_ne!(fp, compute_certificate_fingerprint(b"certificatf"));
    }

    #[test]
    fn debug_output_redacts_key() {
        let identity = crate::store::generate_ephemeral(&["localhost".to_string()], Vec::new())
            .unwrap();
        let debug = format!("{identity:?}");
        assert!(debug.contains("<redacted>"));
        assert!(debug.contains(identity.fingerprint()));
        assert!(!debug.contains("PRIVATE KEY"));
    }
}
