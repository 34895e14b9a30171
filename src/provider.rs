use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use crate::error::InstallError;
use crate::hook::{CertificateSource, RequestContext};
use crate::identity::CertificateIdentity;

/// Holds the one identity every certificate request is answered with.
///
/// Written once during startup. Later installs of the same identity are no-ops, a different
/// identity is refused.
#[derive(Debug, Default)]
pub struct CertificateProviderAdapter {
    installed: OnceLock<Arc<CertificateIdentity>>,
}

impl CertificateProviderAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(
        &self,
        identity: Arc<CertificateIdentity>,
    ) -> Result<InstalledCertificate, InstallError> {
        let mut fresh = false;
        let current = self.installed.get_or_init(|| {
            fresh = true;
            Arc::clone(&identity)
        });

        if !current.same_as(&identity) {
            return Err(InstallError::AlreadyInstalled {
                installed: current.fingerprint().to_string(),
                offered: identity.fingerprint().to_string(),
            });
        }

        if fresh {
            info!(
                fingerprint = %current.fingerprint(),
                subject = %current.subject(),
                "Installed certificate identity"
            );
        } else {
            debug!(fingerprint = %current.fingerprint(), "Identity already installed");
        }

        Ok(InstalledCertificate {
            identity: Arc::clone(current),
        })
    }

    /// The handle for the installed identity, if any.
    pub fn installed(&self) -> Option<InstalledCertificate> {
        self.installed.get().map(|identity| InstalledCertificate {
            identity: Arc::clone(identity),
        })
    }
}

/// Read-only handle to the installed identity, passed to whoever needs the certificate.
#[derive(Debug, Clone)]
pub struct InstalledCertificate {
    identity: Arc<CertificateIdentity>,
}

impl InstalledCertificate {
    /// Answers a certificate request. No I/O, no failure.
    pub fn resolve(&self, _request: &RequestContext) -> Arc<CertificateIdentity> {
        Arc::clone(&self.identity)
    }

    pub fn identity(&self) -> &CertificateIdentity {
        &self.identity
    }
}

impl CertificateSource for InstalledCertificate {
    fn certificate(&self, request: &RequestContext) -> Arc<CertificateIdentity> {
        self.resolve(request)
    }
}
