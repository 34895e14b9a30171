//! Client certificate binding.
//!
//! An access token may carry a `cnf` claim naming the fingerprint of the certificate the
//! client must present. Behind a TLS-terminating proxy the server sees the proxy's
//! certificate instead, so the check can be bypassed by configuration.

use rustls::pki_types::CertificateDer;
use serde::Deserialize;
use tracing::debug;

use crate::error::BindingError;
use crate::hook::BindingValidator;
use crate::identity::compute_certificate_fingerprint;

/// The `cnf` claim of an access token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenConfirmation {
    #[serde(rename = "x5t#S256")]
    pub fingerprint: Option<String>,
}

/// Enforces `cnf.x5t#S256` against the presented certificate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CertificateBinding;

impl CertificateBinding {
    pub fn validate(
        expected_fingerprint: Option<&str>,
        presented: Option<&CertificateDer<'_>>,
    ) -> Result<(), BindingError> {
        let Some(expected) = expected_fingerprint else {
            return Ok(());
        };

        match presented {
            Some(cert) => {
                let actual = compute_certificate_fingerprint(cert.as_ref());
                if actual == expected {
                    Ok(())
                } else {
                    Err(BindingError::Mismatch {
                        expected: expected.to_string(),
                        actual,
                    })
                }
            }
            None => Err(BindingError::MissingCertificate {
                expected: expected.to_string(),
            }),
        }
    }
}

impl BindingValidator for CertificateBinding {
    fn validate(
        &self,
        expected_fingerprint: Option<&str>,
        presented: Option<&CertificateDer<'_>>,
    ) -> Result<(), BindingError> {
        CertificateBinding::validate(expected_fingerprint, presented)
    }
}

/// Accepts every client regardless of binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BypassBinding;

impl BindingValidator for BypassBinding {
    fn validate(
        &self,
        expected_fingerprint: Option<&str>,
        presented: Option<&CertificateDer<'_>>,
    ) -> Result<(), BindingError> {
        if let Some(expected) = expected_fingerprint
            && let Err(e) = CertificateBinding::validate(Some(expected), presented)
        {
            debug!("Ignoring certificate binding failure: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert() -> CertificateDer<'static> {
        let identity =
            crate::store::generate_ephemeral(&["client".to_string()], Vec::new()).unwrap();
        identity.leaf().clone()
    }

    #[test]
    fn unbound_token_accepts_anything() {
        assert!(CertificateBinding::validate(None, None).is_ok());
        assert!(CertificateBinding::validate(None, Some(&cert())).is_ok());
    }

    #[test]
    fn matching_certificate_passes() {
        let cert = cert();
        let fp = compute_certificate_fingerprint(cert.as_ref());
        assert!(CertificateBinding::validate(Some(&fp), Some(&cert)).is_ok());
    }

    #[test]
    fn other_certificate_is_a_mismatch() {
        let fp = compute_certificate_fingerprint(cert().as_ref());
        let err = CertificateBinding::validate(Some(&fp), Some(&cert())).unwrap_err();
        assert!(matches!(err, BindingError::Mismatch { .. }));
    }

    #[test]
    fn absent_certificate_is_rejected() {
        let err = CertificateBinding::validate(Some("abc"), None).unwrap_err();
        assert_eq!(
            err,
            BindingError::MissingCertificate {
                expected: "abc".to_string()
            }
        );
    }

    #[test]
    fn bypass_accepts_mismatches() {
        let fp = compute_certificate_fingerprint(cert().as_ref());
        let bypass = BypassBinding;
        assert!(bypass.validate(Some(&fp), Some(&cert())).is_ok());
        assert!(bypass.validate(Some(&fp), None).is_ok());
    }

    #[test]
    fn confirmation_claim_parses() {
        let cnf: TokenConfirmation =
            serde_json::from_str(r#"{"x5t#S256":"q1w2e3"}"#).unwrap();
        assert_eq!(cnf.fingerprint.as_deref(), Some("q1w2e3"));
        let cnf: TokenConfirmation = serde_json::from_str("{}").unwrap();
        assert!(cnf.fingerprint.is_none());
    }
}
