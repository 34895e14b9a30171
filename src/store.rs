//! On-disk certificate store.
//!
//! Loads the operator's PEM certificate chain and private key, checks that they belong
//! together, and optionally generates and persists a self-signed identity when nothing
//! exists yet.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, warn};
use x509_parser::parse_x509_certificate;

use crate::config::CertificateStoreConfig;
use crate::error::StoreError;
use crate::identity::{CertificateIdentity, IdentityOrigin, IdentityParts};

pub struct CertificateStore {
    config: CertificateStoreConfig,
    provider: Arc<CryptoProvider>,
}

impl CertificateStore {
    pub fn new(config: CertificateStoreConfig) -> Self {
        Self {
            config,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }

    pub fn config(&self) -> &CertificateStoreConfig {
        &self.config
    }

    /// Loads the persistent identity.
    ///
    /// When neither file exists and `autoGenerateIfMissing` is set, a self-signed identity is
    /// generated and persisted first. A lone certificate or lone key is never completed by
    /// generation.
    pub fn load(&self) -> Result<CertificateIdentity, StoreError> {
        let cert_path = &self.config.cert_path;
        let key_path = &self.config.key_path;

        match (cert_path.exists(), key_path.exists()) {
            (true, true) => self.load_existing(),
            (false, false) if self.config.auto_generate_if_missing => {
                info!("Certificate files not found, generating new ones...");
                self.generate_fallback()
            }
            (false, _) => Err(StoreError::MissingMaterial {
                path: cert_path.clone(),
            }),
            (true, false) => Err(StoreError::MissingMaterial {
                path: key_path.clone(),
            }),
        }
    }

    /// Loads existing material without ever generating.
    pub fn load_existing(&self) -> Result<CertificateIdentity, StoreError> {
        let cert_path = &self.config.cert_path;
        let key_path = &self.config.key_path;

        let cert_pem = read_material(cert_path)?;
        let key_pem = read_material(key_path)?;

        debug!(
            "Loading certificates: key={} cert={}",
            key_path.display(),
            cert_path.display()
        );

        let identity = build_identity(
            &self.provider,
            MaterialSource {
                cert_pem: &cert_pem,
                key_pem: &key_pem,
                cert_path,
                key_path,
            },
            self.config.require_valid_chain,
            self.config.alpn_bytes(),
            IdentityOrigin::Loaded,
        )?;

        info!("Loaded certificate: {}", identity.subject());
        Ok(identity)
    }

    /// Generates a self-signed identity and persists it to the configured paths.
    ///
    /// Existing files are replaced. The key is written before the certificate, each through a
    /// temporary file and a rename, so a crash never leaves a half-written file behind.
    pub fn generate_fallback(&self) -> Result<CertificateIdentity, StoreError> {
        let cert_path = &self.config.cert_path;
        let key_path = &self.config.key_path;

        let (cert_pem, key_pem) = generate_self_signed_pem(&self.config.fallback_subject_names)?;

        write_atomic(key_path, key_pem.as_bytes(), true)?;
        write_atomic(cert_path, cert_pem.as_bytes(), false)?;

        info!(
            "Saved certificates: key={} cert={}",
            key_path.display(),
            cert_path.display()
        );

        build_identity(
            &self.provider,
            MaterialSource {
                cert_pem: cert_pem.as_bytes(),
                key_pem: key_pem.as_bytes(),
                cert_path,
                key_path,
            },
            false,
            self.config.alpn_bytes(),
            IdentityOrigin::Generated,
        )
    }
}

/// Generates a self-signed identity that only lives in memory.
///
/// This is what a host does natively on every boot.
pub fn generate_ephemeral(
    subject_names: &[String],
    alpn_protocols: Vec<Vec<u8>>,
) -> Result<CertificateIdentity, StoreError> {
    let (cert_pem, key_pem) = generate_self_signed_pem(subject_names)?;
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let memory = Path::new("<memory>");

    build_identity(
        &provider,
        MaterialSource {
            cert_pem: cert_pem.as_bytes(),
            key_pem: key_pem.as_bytes(),
            cert_path: memory,
            key_path: memory,
        },
        false,
        alpn_protocols,
        IdentityOrigin::Ephemeral,
    )
}

fn generate_self_signed_pem(subject_names: &[String]) -> Result<(String, String), StoreError> {
    let mut params = CertificateParams::new(subject_names.to_vec())?;
    if let Some(common_name) = subject_names.first() {
        params
            .distinguished_name
            .push(DnType::CommonName, common_name.clone());
    }

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn read_material(path: &Path) -> Result<Vec<u8>, StoreError> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::MissingMaterial {
            path: path.to_path_buf(),
        },
        _ => StoreError::io(path, e),
    })
}

struct MaterialSource<'a> {
    cert_pem: &'a [u8],
    key_pem: &'a [u8],
    cert_path: &'a Path,
    key_path: &'a Path,
}

/// The parts of a certificate the store checks.
struct ParsedCertificate {
    subject: String,
    subject_raw: Vec<u8>,
    issuer_raw: Vec<u8>,
    spki: Vec<u8>,
    not_before: i64,
    not_after: i64,
}

impl ParsedCertificate {
    fn parse(der: &CertificateDer<'_>, path: &Path) -> Result<Self, StoreError> {
        let (rest, cert) = parse_x509_certificate(der.as_ref())
            .map_err(|e| StoreError::invalid(path, format!("failed to parse certificate: {e}")))?;
        if !rest.is_empty() {
            return Err(StoreError::invalid(
                path,
                "trailing data after certificate",
            ));
        }

        let validity = cert.validity();
        Ok(Self {
            subject: cert.subject().to_string(),
            subject_raw: cert.subject().as_raw().to_vec(),
            issuer_raw: cert.issuer().as_raw().to_vec(),
            spki: cert.public_key().raw.to_vec(),
            not_before: validity.not_before.timestamp(),
            not_after: validity.not_after.timestamp(),
        })
    }

    fn is_self_issued(&self) -> bool {
        self.subject_raw == self.issuer_raw
    }
}

fn build_identity(
    provider: &CryptoProvider,
    source: MaterialSource<'_>,
    require_valid_chain: bool,
    alpn_protocols: Vec<Vec<u8>>,
    origin: IdentityOrigin,
) -> Result<CertificateIdentity, StoreError> {
    let MaterialSource {
        cert_pem,
        key_pem,
        cert_path,
        key_path,
    } = source;

    let chain = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::invalid(cert_path, format!("bad certificate PEM: {e}")))?;
    if chain.is_empty() {
        return Err(StoreError::invalid(
            cert_path,
            "no CERTIFICATE block found",
        ));
    }

    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| StoreError::invalid(key_path, format!("bad private key PEM: {e}")))?;

    let parsed = chain
        .iter()
        .map(|der| ParsedCertificate::parse(der, cert_path))
        .collect::<Result<Vec<_>, _>>()?;

    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| StoreError::invalid(key_path, format!("unsupported private key: {e}")))?;

    let Some(public_key) = signing_key.public_key() else {
        return Err(StoreError::invalid(
            key_path,
            "cannot derive the public key to check it against the certificate",
        ));
    };
    if public_key.as_ref() != parsed[0].spki.as_slice() {
        return Err(StoreError::invalid(
            key_path,
            format!(
                "private key does not match the public key of certificate {}",
                parsed[0].subject
            ),
        ));
    }

    if require_valid_chain {
        check_chain(&parsed, cert_path, unix_now())?;
    } else if parsed[0].not_after < unix_now() {
        warn!(
            "Certificate {} expired at unix time {}, loading anyway",
            parsed[0].subject, parsed[0].not_after
        );
    }

    let leaf = &parsed[0];
    let certified_key = Arc::new(CertifiedKey::new(chain.clone(), signing_key));

    Ok(CertificateIdentity::from_parts(IdentityParts {
        chain,
        key,
        certified_key,
        subject: leaf.subject.clone(),
        not_before: to_system_time(leaf.not_before),
        not_after: to_system_time(leaf.not_after),
        alpn_protocols,
        origin,
    }))
}

fn check_chain(parsed: &[ParsedCertificate], path: &Path, now: i64) -> Result<(), StoreError> {
    for cert in parsed {
        if now > cert.not_after {
            return Err(StoreError::ExpiredCertificate {
                subject: cert.subject.clone(),
                not_after: cert.not_after,
            });
        }
        if now < cert.not_before {
            return Err(StoreError::NotYetValid {
                subject: cert.subject.clone(),
                not_before: cert.not_before,
            });
        }
    }

    if parsed.len() == 1 && parsed[0].is_self_issued() {
        return Err(StoreError::SelfSignedRejected {
            subject: parsed[0].subject.clone(),
        });
    }

    for pair in parsed.windows(2) {
        if pair[0].issuer_raw != pair[1].subject_raw {
            return Err(StoreError::invalid(
                path,
                format!(
                    "chain is out of order: {} is not issued by {}",
                    pair[0].subject, pair[1].subject
                ),
            ));
        }
    }

    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let Some(file_name) = path.file_name() else {
        return Err(StoreError::invalid(path, "path has no file name"));
    };
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let result = (|| -> std::io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            if private {
                options.mode(0o600);
            }
        }
        #[cfg(not(unix))]
        let _ = private;

        let mut file = options.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn to_system_time(timestamp: i64) -> SystemTime {
    if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(timestamp.unsigned_abs())
    }
}
