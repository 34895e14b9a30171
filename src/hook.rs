//! Interception points a host exposes to have its TLS identity and connection metadata
//! supplied from outside.
//!
//! The host owns its QUIC stack. It calls a [`CertificateSource`] where it would otherwise
//! build its own certificate, and a [`ConnectionPreprocessor`] once connection metadata is
//! known but before a certificate is selected. The contract is versioned by
//! [`HOOK_ABI_VERSION`]; a host speaking another version is refused at install time.

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;

use crate::error::{BindingError, InstallError, ShimError};
use crate::identity::CertificateIdentity;
use crate::shim::{HandshakeContext, RawConnectionMeta};

pub const HOOK_ABI_VERSION: u32 = 1;

/// What the host knows when it asks for a certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub server_name: Option<String>,
    pub alpn: Vec<Vec<u8>>,
}

/// Hook 1: replaces the host's certificate construction.
pub trait CertificateSource: Send + Sync {
    /// Must not block or fail. Called on the handshake path.
    fn certificate(&self, request: &RequestContext) -> Arc<CertificateIdentity>;
}

/// Hook 2: corrects connection metadata before the host's handshake logic sees it.
pub trait ConnectionPreprocessor: Send + Sync {
    /// Decides on a server name before certificate selection.
    fn admit_server_name(&self, server_name: Option<&str>) -> Result<(), ShimError>;

    fn preprocess(&self, meta: RawConnectionMeta) -> Result<HandshakeContext, ShimError>;
}

/// Checks that a client's token is bound to the certificate the client presented.
pub trait BindingValidator: Send + Sync {
    fn validate(
        &self,
        expected_fingerprint: Option<&str>,
        presented: Option<&CertificateDer<'_>>,
    ) -> Result<(), BindingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    CertificateSource,
    ConnectionPreprocessor,
    BindingValidator,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookPoint::CertificateSource => "certificate source",
            HookPoint::ConnectionPreprocessor => "connection preprocessor",
            HookPoint::BindingValidator => "binding validator",
        };
        f.write_str(name)
    }
}

/// The host side of the contract.
///
/// Installation happens once, before the host accepts connections. `restore_native` must
/// leave the host exactly as if nothing had been installed.
pub trait HostHooks {
    fn hook_abi_version(&self) -> u32;

    fn install_certificate_source(
        &mut self,
        source: Arc<dyn CertificateSource>,
    ) -> Result<(), InstallError>;

    fn install_connection_preprocessor(
        &mut self,
        preprocessor: Arc<dyn ConnectionPreprocessor>,
    ) -> Result<(), InstallError>;

    fn install_binding_validator(
        &mut self,
        validator: Arc<dyn BindingValidator>,
    ) -> Result<(), InstallError>;

    fn restore_native(&mut self);
}

pub fn check_abi_version(host: &impl HostHooks) -> Result<(), InstallError> {
    let host_version = host.hook_abi_version();
    if host_version != HOOK_ABI_VERSION {
        return Err(InstallError::HookVersionMismatch {
            host: host_version,
            supported: HOOK_ABI_VERSION,
        });
    }
    Ok(())
}

/// A host that only records what gets installed. Used for dry runs.
#[derive(Default)]
pub struct RecordingHost {
    abi_version: Option<u32>,
    unavailable: Vec<HookPoint>,
    certificate_source: Option<Arc<dyn CertificateSource>>,
    preprocessor: Option<Arc<dyn ConnectionPreprocessor>>,
    binding_validator: Option<Arc<dyn BindingValidator>>,
    restored: bool,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_abi_version(mut self, version: u32) -> Self {
        self.abi_version = Some(version);
        self
    }

    /// Makes installing at `point` fail, as with a host build that lacks the hook.
    pub fn without_hook(mut self, point: HookPoint) -> Self {
        self.unavailable.push(point);
        self
    }

    pub fn certificate_source(&self) -> Option<&Arc<dyn CertificateSource>> {
        self.certificate_source.as_ref()
    }

    pub fn preprocessor(&self) -> Option<&Arc<dyn ConnectionPreprocessor>> {
        self.preprocessor.as_ref()
    }

    pub fn binding_validator(&self) -> Option<&Arc<dyn BindingValidator>> {
        self.binding_validator.as_ref()
    }

    pub fn is_native(&self) -> bool {
        self.certificate_source.is_none()
            && self.preprocessor.is_none()
            && self.binding_validator.is_none()
    }

    pub fn was_restored(&self) -> bool {
        self.restored
    }

    fn ensure_available(&self, point: HookPoint) -> Result<(), InstallError> {
        if self.unavailable.contains(&point) {
            return Err(InstallError::HookUnavailable(point.to_string()));
        }
        Ok(())
    }
}

impl HostHooks for RecordingHost {
    fn hook_abi_version(&self) -> u32 {
        self.abi_version.unwrap_or(HOOK_ABI_VERSION)
    }

    fn install_certificate_source(
        &mut self,
        source: Arc<dyn CertificateSource>,
    ) -> Result<(), InstallError> {
        self.ensure_available(HookPoint::CertificateSource)?;
        self.certificate_source = Some(source);
        Ok(())
    }

    fn install_connection_preprocessor(
        &mut self,
        preprocessor: Arc<dyn ConnectionPreprocessor>,
    ) -> Result<(), InstallError> {
        self.ensure_available(HookPoint::ConnectionPreprocessor)?;
        self.preprocessor = Some(preprocessor);
        Ok(())
    }

    fn install_binding_validator(
        &mut self,
        validator: Arc<dyn BindingValidator>,
    ) -> Result<(), InstallError> {
        self.ensure_available(HookPoint::BindingValidator)?;
        self.binding_validator = Some(validator);
        Ok(())
    }

    fn restore_native(&mut self) {
        self.certificate_source = None;
        self.preprocessor = None;
        self.binding_validator = None;
        self.restored = true;
    }
}
