//! Proxy compatibility shim.
//!
//! Runs once per connection before the host's handshake logic. Forwarded metadata is only
//! honored when the physical peer is a trusted proxy; everything else passes through as seen
//! on the wire.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::config::ProxyTrustPolicy;
use crate::error::ShimError;
use crate::hook::{ConnectionPreprocessor, RequestContext};
use crate::identity::CertificateIdentity;
use crate::provider::InstalledCertificate;
use crate::proxy::{ProxyCommand, ProxyHeader, read_proxy_header};

/// Connection metadata as the host observed it.
#[derive(Debug, Clone)]
pub struct RawConnectionMeta {
    pub peer_addr: SocketAddr,
    pub sni: Option<String>,
    pub alpn: Vec<Vec<u8>>,
    /// Proxy header bytes that arrived ahead of the handshake, e.g. prefixed to the first
    /// datagram.
    pub proxy_header: Option<Bytes>,
}

impl RawConnectionMeta {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            sni: None,
            alpn: Vec::new(),
            proxy_header: None,
        }
    }

    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    pub fn with_alpn(mut self, alpn: Vec<Vec<u8>>) -> Self {
        self.alpn = alpn;
        self
    }

    pub fn with_proxy_header(mut self, header: impl Into<Bytes>) -> Self {
        self.proxy_header = Some(header.into());
        self
    }
}

/// Per-connection negotiation state handed to the host. Never persisted.
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    pub certificate: Arc<CertificateIdentity>,
    /// The client address, forwarded when the peer is a trusted proxy.
    pub peer_addr: SocketAddr,
    pub physical_peer: SocketAddr,
    pub sni: Option<String>,
    pub alpn: Vec<Vec<u8>>,
    pub forwarded: bool,
}

pub struct ProxyShim {
    policy: Arc<ProxyTrustPolicy>,
    certificate: InstalledCertificate,
}

impl ProxyShim {
    pub fn new(policy: Arc<ProxyTrustPolicy>, certificate: InstalledCertificate) -> Self {
        Self {
            policy,
            certificate,
        }
    }

    pub fn policy(&self) -> &ProxyTrustPolicy {
        &self.policy
    }

    /// Adapts metadata whose proxy header, if any, is already in `meta.proxy_header`.
    pub fn adapt(&self, meta: RawConnectionMeta) -> Result<HandshakeContext, ShimError> {
        let forwarded = match &meta.proxy_header {
            Some(raw) if self.policy.is_trusted(meta.peer_addr.ip()) => {
                let (header, consumed) = self
                    .policy
                    .framing
                    .decode_complete(raw, self.policy.header_byte_budget)?;
                if consumed != raw.len() {
                    return Err(ShimError::malformed(format!(
                        "{} trailing bytes after header",
                        raw.len() - consumed
                    )));
                }
                Some(header)
            }
            Some(_) => {
                debug!(peer = %meta.peer_addr, "Ignoring proxy header from untrusted peer");
                None
            }
            None => None,
        };

        self.finish(meta, forwarded)
    }

    /// Adapts a stream connection. A trusted peer must send a header first; it is read from
    /// `reader` within the policy's byte and time budgets. Untrusted peers are not read from.
    pub async fn adapt_stream<R>(
        &self,
        reader: &mut R,
        meta: RawConnectionMeta,
    ) -> Result<HandshakeContext, ShimError>
    where
        R: AsyncRead + Unpin,
    {
        let forwarded = if self.policy.is_trusted(meta.peer_addr.ip()) {
            let header = read_proxy_header(
                reader,
                self.policy.framing,
                self.policy.header_byte_budget,
                self.policy.header_timeout(),
            )
            .await?;
            Some(header)
        } else {
            None
        };

        self.finish(meta, forwarded)
    }

    /// Checks a server name against `requiredSniHost`. Runs before certificate selection.
    pub fn admit_server_name(&self, server_name: Option<&str>) -> Result<(), ShimError> {
        let Some(required) = &self.policy.required_sni_host else {
            return Ok(());
        };

        match server_name {
            Some(name) if host_eq(name, required) => Ok(()),
            _ => Err(ShimError::SniMismatch {
                expected: required.clone(),
                actual: server_name.map(str::to_string),
            }),
        }
    }

    fn finish(
        &self,
        meta: RawConnectionMeta,
        forwarded: Option<ProxyHeader>,
    ) -> Result<HandshakeContext, ShimError> {
        let RawConnectionMeta {
            peer_addr: physical_peer,
            mut sni,
            mut alpn,
            ..
        } = meta;
        let mut peer_addr = physical_peer;
        let mut was_forwarded = false;

        if let Some(header) = forwarded
            && header.command == ProxyCommand::Proxy
        {
            if let Some(source) = header.forwarded_source() {
                peer_addr = source;
                was_forwarded = true;
            }
            if let Some(authority) = header.authority {
                sni = Some(authority);
            }
            if let Some(token) = header.alpn {
                alpn = vec![token];
            }
        }

        self.admit_server_name(sni.as_deref())?;

        let certificate = self.certificate.resolve(&RequestContext {
            server_name: sni.clone(),
            alpn: alpn.clone(),
        });

        if !self.policy.passthrough_alpn {
            alpn.retain(|token| certificate.supports_alpn(token));
        }

        Ok(HandshakeContext {
            certificate,
            peer_addr,
            physical_peer,
            sni,
            alpn,
            forwarded: was_forwarded,
        })
    }
}

impl ConnectionPreprocessor for ProxyShim {
    fn admit_server_name(&self, server_name: Option<&str>) -> Result<(), ShimError> {
        ProxyShim::admit_server_name(self, server_name)
    }

    fn preprocess(&self, meta: RawConnectionMeta) -> Result<HandshakeContext, ShimError> {
        self.adapt(meta)
    }
}

fn host_eq(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}
