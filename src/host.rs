//! Reference QUIC host.
//!
//! Left alone it behaves like a stock game server: a fresh self-signed certificate on every
//! boot. With hooks installed it takes its certificate from the installed source and runs the
//! connection preprocessor on every connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::Endpoint;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::{debug, info, warn};

use crate::binding::CertificateBinding;
use crate::error::{BindingError, InstallError};
use crate::hook::{
    BindingValidator, CertificateSource, ConnectionPreprocessor, HOOK_ABI_VERSION, HostHooks,
    RequestContext,
};
use crate::identity::CertificateIdentity;
use crate::shim::{HandshakeContext, RawConnectionMeta};
use crate::store::generate_ephemeral;

/// Application error code sent when the preprocessor refuses a connection.
const REJECTED: u32 = 1;

pub struct QuicHost {
    alpn_protocols: Vec<Vec<u8>>,
    native_subject_names: Vec<String>,
    provider: Arc<CryptoProvider>,
    certificate_source: Option<Arc<dyn CertificateSource>>,
    preprocessor: Option<Arc<dyn ConnectionPreprocessor>>,
    binding_validator: Option<Arc<dyn BindingValidator>>,
}

impl QuicHost {
    pub fn new(alpn_protocols: Vec<Vec<u8>>, native_subject_names: Vec<String>) -> Self {
        Self {
            alpn_protocols,
            native_subject_names,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
            certificate_source: None,
            preprocessor: None,
            binding_validator: None,
        }
    }

    pub fn is_native(&self) -> bool {
        self.certificate_source.is_none()
    }

    /// Builds the TLS configuration for the current hook state.
    ///
    /// Returns the config and the fingerprint of the certificate the host will present to a
    /// client that sends no server name.
    pub fn server_tls_config(&self) -> Result<(Arc<rustls::ServerConfig>, String)> {
        let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCertificate {
                algorithms: self.provider.signature_verification_algorithms,
            }));

        let (mut config, fingerprint) = match &self.certificate_source {
            Some(source) => {
                let fingerprint = source
                    .certificate(&RequestContext::default())
                    .fingerprint()
                    .to_string();
                let resolver = HookedResolver {
                    source: Arc::clone(source),
                    preprocessor: self.preprocessor.clone(),
                };
                (builder.with_cert_resolver(Arc::new(resolver)), fingerprint)
            }
            None => {
                let identity =
                    generate_ephemeral(&self.native_subject_names, self.alpn_protocols.clone())
                        .context("failed to generate native certificate")?;
                debug!("Generated ephemeral certificate {}", identity.fingerprint());
                let config =
                    builder.with_single_cert(identity.chain().to_vec(), identity.private_key())?;
                (config, identity.fingerprint().to_string())
            }
        };

        config.alpn_protocols = self.alpn_protocols.clone();
        Ok((Arc::new(config), fingerprint))
    }

    /// Creates a QUIC server endpoint bound to the given address.
    ///
    /// Returns the endpoint and the served certificate's fingerprint.
    pub fn bind(&self, bind_addr: SocketAddr) -> Result<(Endpoint, String)> {
        let (tls_config, fingerprint) = self.server_tls_config()?;

        let server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)?,
        ));

        let endpoint = Endpoint::server(server_config, bind_addr)
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        Ok((endpoint, fingerprint))
    }

    pub async fn serve(&self, bind_addr: SocketAddr) -> Result<()> {
        let (endpoint, fingerprint) = self.bind(bind_addr)?;

        info!("QUIC server listening on: {}", endpoint.local_addr()?);
        if self.is_native() {
            warn!("Serving ephemeral certificate {fingerprint}, clients cannot pin it");
        } else {
            info!("Serving certificate {fingerprint}");
        }

        while let Some(incoming) = endpoint.accept().await {
            let preprocessor = self.preprocessor.clone();
            tokio::spawn(async move {
                if let Some(accepted) = accept(incoming, preprocessor).await {
                    let peer = accepted
                        .context
                        .as_ref()
                        .map(|ctx| ctx.peer_addr)
                        .unwrap_or_else(|| accepted.connection.remote_address());
                    let reason = accepted.connection.closed().await;
                    debug!(%peer, "Connection closed: {reason}");
                }
            });
        }

        Ok(())
    }

    /// Checks a client's token binding with whatever validator is installed.
    pub fn validate_binding(
        &self,
        expected_fingerprint: Option<&str>,
        presented: Option<&CertificateDer<'_>>,
    ) -> Result<(), BindingError> {
        match &self.binding_validator {
            Some(validator) => validator.validate(expected_fingerprint, presented),
            None => CertificateBinding::validate(expected_fingerprint, presented),
        }
    }
}

impl HostHooks for QuicHost {
    fn hook_abi_version(&self) -> u32 {
        HOOK_ABI_VERSION
    }

    fn install_certificate_source(
        &mut self,
        source: Arc<dyn CertificateSource>,
    ) -> Result<(), InstallError> {
        self.certificate_source = Some(source);
        Ok(())
    }

    fn install_connection_preprocessor(
        &mut self,
        preprocessor: Arc<dyn ConnectionPreprocessor>,
    ) -> Result<(), InstallError> {
        self.preprocessor = Some(preprocessor);
        Ok(())
    }

    fn install_binding_validator(
        &mut self,
        validator: Arc<dyn BindingValidator>,
    ) -> Result<(), InstallError> {
        self.binding_validator = Some(validator);
        Ok(())
    }

    fn restore_native(&mut self) {
        self.certificate_source = None;
        self.preprocessor = None;
        self.binding_validator = None;
    }
}

/// An established connection that passed the preprocessor.
pub struct AcceptedConnection {
    pub connection: quinn::Connection,
    pub context: Option<HandshakeContext>,
    pub client_certificates: Option<Vec<CertificateDer<'static>>>,
}

/// Completes the handshake and runs the preprocessor on what it negotiated.
///
/// Rejected connections are closed and only logged at debug level.
#[tracing::instrument(skip_all, fields(peer = %incoming.remote_address()))]
pub async fn accept(
    incoming: quinn::Incoming,
    preprocessor: Option<Arc<dyn ConnectionPreprocessor>>,
) -> Option<AcceptedConnection> {
    let connection = match incoming.await {
        Ok(connection) => connection,
        Err(e) => {
            debug!("Handshake failed: {e}");
            return None;
        }
    };

    let (server_name, protocol) = connection
        .handshake_data()
        .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
        .map(|data| (data.server_name, data.protocol))
        .unwrap_or_default();

    let client_certificates = connection
        .peer_identity()
        .and_then(|certs| certs.downcast::<Vec<CertificateDer<'static>>>().ok())
        .map(|certs| (*certs).clone());

    match &client_certificates {
        Some(certs) => debug!("Client presented {} certificate(s)", certs.len()),
        None => debug!("Client did not present any certificates"),
    }

    let context = match preprocessor {
        Some(preprocessor) => {
            let mut meta = RawConnectionMeta::new(connection.remote_address());
            meta.sni = server_name;
            meta.alpn = protocol.into_iter().collect();

            match preprocessor.preprocess(meta) {
                Ok(context) => Some(context),
                Err(e) => {
                    debug!("Rejected connection: {e}");
                    connection.close(REJECTED.into(), e.to_string().as_bytes());
                    return None;
                }
            }
        }
        None => None,
    };

    info!(
        "Client connected: {}",
        context
            .as_ref()
            .map(|ctx| ctx.peer_addr)
            .unwrap_or_else(|| connection.remote_address())
    );

    Some(AcceptedConnection {
        connection,
        context,
        client_certificates,
    })
}

struct HookedResolver {
    source: Arc<dyn CertificateSource>,
    preprocessor: Option<Arc<dyn ConnectionPreprocessor>>,
}

impl fmt::Debug for HookedResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedResolver")
            .field("preprocessor", &self.preprocessor.is_some())
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for HookedResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();

        if let Some(preprocessor) = &self.preprocessor
            && let Err(e) = preprocessor.admit_server_name(server_name)
        {
            debug!("Refusing certificate selection: {e}");
            return None;
        }

        let request = RequestContext {
            server_name: server_name.map(str::to_string),
            alpn: client_hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
        };
        let identity: Arc<CertificateIdentity> = self.source.certificate(&request);
        Some(identity.certified_key())
    }
}

/// Requests a client certificate without requiring a trusted issuer. Game clients present
/// self-signed certificates whose fingerprint is checked against their access token.
#[derive(Debug)]
struct AcceptAnyClientCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AcceptAnyClientCertificate {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
