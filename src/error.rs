//! Error types for the certificate lifecycle.
//!
//! Startup errors ([`StoreError`], [`InstallError`], [`ConfigError`]) surface before the host
//! accepts traffic. [`ShimError`] is per-connection: it rejects one connection and nothing else.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while loading, validating or persisting certificate material.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A certificate or key file is absent and generation is not allowed.
    #[error("certificate material missing: {} does not exist", path.display())]
    MissingMaterial { path: PathBuf },

    /// The material exists but cannot be used: unparseable PEM or DER, empty chain,
    /// unsupported key, or a key that does not belong to the certificate.
    #[error("invalid certificate material in {}: {reason}", path.display())]
    InvalidMaterial { path: PathBuf, reason: String },

    /// A certificate in the chain is past its `notAfter`.
    #[error("certificate {subject} expired at unix time {not_after}")]
    ExpiredCertificate { subject: String, not_after: i64 },

    /// A certificate in the chain is before its `notBefore`.
    #[error("certificate {subject} is not valid before unix time {not_before}")]
    NotYetValid { subject: String, not_before: i64 },

    /// Strict chain validation refuses a self-issued leaf.
    #[error("self-signed certificate {subject} rejected by requireValidChain")]
    SelfSignedRejected { subject: String },

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::InvalidMaterial {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<rcgen::Error> for StoreError {
    fn from(e: rcgen::Error) -> Self {
        StoreError::Generation(e.to_string())
    }
}

/// Failures while wiring the adapter or shim into the host.
#[derive(Debug, Error)]
pub enum InstallError {
    /// A different identity is already installed. Identities are never hot-swapped.
    #[error("a different certificate identity is already installed (installed {installed}, offered {offered})")]
    AlreadyInstalled { installed: String, offered: String },

    #[error("host hook ABI version {host} does not match supported version {supported}")]
    HookVersionMismatch { host: u32, supported: u32 },

    #[error("host hook unavailable: {0}")]
    HookUnavailable(String),
}

/// Per-connection rejections produced by the proxy compatibility shim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShimError {
    #[error("SNI mismatch: expected {expected}, got {actual:?}")]
    SniMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[error("malformed proxy header: {0}")]
    MalformedProxyHeader(String),
}

impl ShimError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ShimError::MalformedProxyHeader(reason.into())
    }
}

/// A client's access token is bound to a certificate other than the one it presented.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("certificate binding mismatch: token expects {expected}, client presented {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("token is bound to certificate {expected} but the client presented none")]
    MissingCertificate { expected: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A startup step failure, as seen by the lifecycle controller.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("lifecycle already started")]
    AlreadyStarted,
}

impl StartupError {
    /// Whether an operator can fix this by correcting files or configuration.
    pub fn is_operator_fixable(&self) -> bool {
        matches!(self, StartupError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_operator_fixable() {
        let err: StartupError = StoreError::MissingMaterial {
            path: "certificates/server.crt".into(),
        }
        .into();
        assert!(err.is_operator_fixable());

        let err: StartupError = InstallError::HookUnavailable("gone".into()).into();
        assert!(!err.is_operator_fixable());
    }

    #[test]
    fn messages_name_the_offending_file() {
        let err = StoreError::invalid("certificates/server.key", "key does not match");
        let msg = err.to_string();
        assert!(msg.contains("certificates/server.key"));
        assert!(msg.contains("key does not match"));
    }
}
