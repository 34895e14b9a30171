//! JSON configuration for the certificate lifecycle.
//!
//! The file lives at `earlyplugins/CustomCert.json` by default and is created with defaults
//! the first time the server starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::proxy::ProxyFraming;

pub const DEFAULT_CONFIG_PATH: &str = "earlyplugins/CustomCert.json";
pub const DEFAULT_CERT_PATH: &str = "certificates/server.crt";
pub const DEFAULT_KEY_PATH: &str = "certificates/server.key";

/// The game protocol token the persistent identity is provisioned for.
pub const HYTALE_ALPN: &str = "hytale/2";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomCertConfig {
    #[serde(flatten)]
    pub store: CertificateStoreConfig,
    pub failure_policy: FailurePolicy,
    pub proxy: ProxyTrustPolicy,
    pub experimental: ExperimentalConfig,
}

impl Default for CustomCertConfig {
    fn default() -> Self {
        Self {
            store: CertificateStoreConfig::default(),
            failure_policy: FailurePolicy::Degrade,
            proxy: ProxyTrustPolicy::default(),
            experimental: ExperimentalConfig::default(),
        }
    }
}

impl CustomCertConfig {
    /// Loads the config at `path`, writing a default file first if none exists.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!("Created default config at {}", path.display());
            return Ok(config);
        }

        info!("Loading config from {}", path.display());
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.proxy.validate()
    }
}

/// Where the persistent identity lives and how strictly it is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateStoreConfig {
    #[serde(alias = "publicKeyPath")]
    pub cert_path: PathBuf,
    #[serde(alias = "privateKeyPath")]
    pub key_path: PathBuf,
    pub auto_generate_if_missing: bool,
    pub require_valid_chain: bool,
    /// Subject alternative names for generated identities.
    pub fallback_subject_names: Vec<String>,
    /// ALPN tokens the persistent identity is provisioned for.
    pub alpn_protocols: Vec<String>,
}

impl Default for CertificateStoreConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from(DEFAULT_CERT_PATH),
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            auto_generate_if_missing: false,
            require_valid_chain: false,
            fallback_subject_names: vec!["localhost".to_string()],
            alpn_protocols: vec![HYTALE_ALPN.to_string()],
        }
    }
}

impl CertificateStoreConfig {
    pub fn with_paths(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ..Self::default()
        }
    }

    pub fn alpn_bytes(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cert_path.as_os_str().is_empty() || self.key_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "certPath and keyPath must not be empty".to_string(),
            ));
        }
        if self.cert_path == self.key_path {
            return Err(ConfigError::Invalid(format!(
                "certPath and keyPath both point at {}",
                self.cert_path.display()
            )));
        }
        if self.alpn_protocols.iter().any(|p| p.is_empty() || p.len() > 255) {
            return Err(ConfigError::Invalid(
                "ALPN tokens must be 1..=255 bytes".to_string(),
            ));
        }
        if self.alpn_protocols.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one ALPN protocol is required".to_string(),
            ));
        }
        if self.auto_generate_if_missing && self.require_valid_chain {
            return Err(ConfigError::Invalid(
                "autoGenerateIfMissing produces self-signed material, which requireValidChain rejects"
                    .to_string(),
            ));
        }
        if self.auto_generate_if_missing && self.fallback_subject_names.is_empty() {
            return Err(ConfigError::Invalid(
                "fallbackSubjectNames is required when autoGenerateIfMissing is set".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the lifecycle controller does when a startup step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort startup.
    Strict,
    /// Roll back and continue with the host's native certificate behavior.
    Degrade,
}

/// How forwarded connection metadata from a reverse proxy is trusted.
///
/// Shared read-only by every connection once startup completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyTrustPolicy {
    #[serde(with = "ipnetwork_vec_serde")]
    pub trusted_proxy_addresses: Vec<IpNetwork>,
    pub required_sni_host: Option<String>,
    pub passthrough_alpn: bool,
    pub framing: ProxyFraming,
    pub header_byte_budget: usize,
    pub header_timeout_ms: u64,
}

impl Default for ProxyTrustPolicy {
    fn default() -> Self {
        Self {
            trusted_proxy_addresses: Vec::new(),
            required_sni_host: None,
            passthrough_alpn: true,
            framing: ProxyFraming::ProxyV2,
            header_byte_budget: 536,
            header_timeout_ms: 3000,
        }
    }
}

impl ProxyTrustPolicy {
    pub fn is_trusted(&self, addr: std::net::IpAddr) -> bool {
        let addr = canonical_ip(addr);
        self.trusted_proxy_addresses
            .iter()
            .any(|net| net.contains(addr))
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.header_byte_budget < self.framing.min_header_len() {
            return Err(ConfigError::Invalid(format!(
                "headerByteBudget {} is smaller than the {} byte minimum for {:?}",
                self.header_byte_budget,
                self.framing.min_header_len(),
                self.framing
            )));
        }
        if self.header_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "headerTimeoutMs must be greater than zero".to_string(),
            ));
        }
        if let Some(host) = &self.required_sni_host
            && host.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "requiredSniHost must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// IPv4-mapped IPv6 peers (dual-stack sockets) match IPv4 networks.
pub(crate) fn canonical_ip(addr: std::net::IpAddr) -> std::net::IpAddr {
    match addr {
        std::net::IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(std::net::IpAddr::V4)
            .unwrap_or(addr),
        v4 => v4,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentalConfig {
    /// Accept client access tokens whose certificate binding does not match the presented
    /// certificate. Needed when a proxy terminates client TLS.
    pub bypass_client_certificate_binding: bool,
}

mod ipnetwork_vec_serde {
    use ipnetwork::IpNetwork;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(networks: &[IpNetwork], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        networks
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<IpNetwork>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .collect()
    }
}
