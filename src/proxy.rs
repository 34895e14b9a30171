//! Reverse-proxy header framings.
//!
//! A proxy in front of the server prefixes each connection with a header describing the
//! original client. Which framing is spoken is configuration, see [`ProxyFraming`].
//! Parsing is bounded by a byte budget and, for streams, a time budget. Anything that does
//! not parse inside those budgets is rejected.

pub mod v1;
pub mod v2;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ShimError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyFraming {
    /// Text header, `PROXY TCP4 <src> <dst> <sport> <dport>\r\n`. Addresses only.
    ProxyV1,
    /// Binary header with TLVs for ALPN and authority (SNI).
    ProxyV2,
}

impl ProxyFraming {
    /// Smallest possible header in this framing.
    pub fn min_header_len(self) -> usize {
        match self {
            ProxyFraming::ProxyV1 => v1::MIN_HEADER_LEN,
            ProxyFraming::ProxyV2 => v2::FIXED_HEADER_LEN,
        }
    }

    /// Tries to decode one header from the start of `buf`.
    ///
    /// Returns `Ok(None)` while the bytes seen so far are a valid prefix of a header that fits
    /// in `budget`, and the header plus its length once complete.
    pub fn decode(
        self,
        buf: &[u8],
        budget: usize,
    ) -> Result<Option<(ProxyHeader, usize)>, ShimError> {
        match self {
            ProxyFraming::ProxyV1 => v1::decode(buf, budget),
            ProxyFraming::ProxyV2 => v2::decode(buf, budget),
        }
    }

    /// Decodes a header that must be complete, as when it arrives in one datagram.
    pub fn decode_complete(
        self,
        buf: &[u8],
        budget: usize,
    ) -> Result<(ProxyHeader, usize), ShimError> {
        self.decode(buf, budget)?.ok_or_else(|| {
            ShimError::malformed(format!("truncated header ({} bytes)", buf.len()))
        })
    }

    /// How many more bytes can be read without reading past the header.
    fn next_read_len(self, buf: &[u8]) -> usize {
        match self {
            ProxyFraming::ProxyV1 => 1,
            ProxyFraming::ProxyV2 => v2::next_read_len(buf),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    /// The proxy opened the connection on its own behalf (health checks). The physical
    /// metadata applies.
    Local,
    /// The proxy relays a client connection.
    Proxy,
}

/// Connection metadata forwarded by a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub command: ProxyCommand,
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
    /// The ALPN token the client negotiated with the proxy.
    pub alpn: Option<Vec<u8>>,
    /// The host name the client asked the proxy for.
    pub authority: Option<String>,
}

impl ProxyHeader {
    pub fn local() -> Self {
        Self {
            command: ProxyCommand::Local,
            source: None,
            destination: None,
            alpn: None,
            authority: None,
        }
    }

    /// The original client address, when the header carries one.
    pub fn forwarded_source(&self) -> Option<SocketAddr> {
        match self.command {
            ProxyCommand::Proxy => self.source,
            ProxyCommand::Local => None,
        }
    }
}

/// Reads one header from a stream, never consuming bytes past its end.
///
/// Fails with [`ShimError::MalformedProxyHeader`] if the header is invalid, exceeds `budget`,
/// the stream ends early, or it is not complete within `timeout`.
pub async fn read_proxy_header<R>(
    reader: &mut R,
    framing: ProxyFraming,
    budget: usize,
    timeout: Duration,
) -> Result<ProxyHeader, ShimError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, read_framed(reader, framing, budget)).await {
        Ok(result) => result,
        Err(_) => Err(ShimError::malformed(format!(
            "no complete header within {}ms",
            timeout.as_millis()
        ))),
    }
}

async fn read_framed<R>(
    reader: &mut R,
    framing: ProxyFraming,
    budget: usize,
) -> Result<ProxyHeader, ShimError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(framing.min_header_len());

    loop {
        if let Some((header, _)) = framing.decode(&buf, budget)? {
            return Ok(header);
        }

        let want = framing.next_read_len(&buf);
        if buf.len() + want > budget {
            return Err(ShimError::malformed(format!(
                "header exceeds {budget} byte budget"
            )));
        }

        let start = buf.len();
        buf.resize(start + want, 0);
        reader.read_exact(&mut buf[start..]).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                ShimError::malformed(format!("stream ended after {start} header bytes"))
            }
            _ => ShimError::malformed(format!("read failed: {e}")),
        })?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const BUDGET: usize = 536;

    fn proxied_header() -> ProxyHeader {
        ProxyHeader {
            command: ProxyCommand::Proxy,
            source: Some("203.0.113.9:41000".parse().unwrap()),
            destination: Some("10.0.0.2:5520".parse().unwrap()),
            alpn: Some(b"hytale/2".to_vec()),
            authority: Some("play.example.test".to_string()),
        }
    }

    #[tokio::test]
    async fn reads_v2_header_and_leaves_payload() {
        let header = proxied_header();
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_all(&v2::encode(&header)).await.unwrap();
        client.write_all(b"TLS").await.unwrap();

        let read = read_proxy_header(
            &mut server,
            ProxyFraming::ProxyV2,
            BUDGET,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(read, header);

        let mut rest = [0u8; 3];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"TLS");
    }

    #[tokio::test]
    async fn reads_v1_header_byte_by_byte() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"PROXY TCP4 203.0.113.9 10.0.0.2 41000 5520\r\nrest")
            .await
            .unwrap();

        let read = read_proxy_header(
            &mut server,
            ProxyFraming::ProxyV1,
            BUDGET,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(read.forwarded_source(), Some("203.0.113.9:41000".parse().unwrap()));

        let mut rest = [0u8; 4];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"rest");
    }

    #[tokio::test]
    async fn stalled_header_times_out() {
        let encoded = v2::encode(&proxied_header());
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&encoded[..10]).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = read_proxy_header(
            &mut server,
            ProxyFraming::ProxyV2,
            BUDGET,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ShimError::MalformedProxyHeader(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(client);
    }

    #[tokio::test]
    async fn truncated_stream_fails_without_waiting_for_timeout() {
        let encoded = v2::encode(&proxied_header());
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&encoded[..20]).await.unwrap();
        drop(client);

        let err = read_proxy_header(
            &mut server,
            ProxyFraming::ProxyV2,
            BUDGET,
            Duration::from_secs(30),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShimError::MalformedProxyHeader(_)));
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_before_reading_body() {
        let mut header = proxied_header();
        header.authority = Some("a".repeat(600));
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&v2::encode(&header)).await.unwrap();

        let err = read_proxy_header(
            &mut server,
            ProxyFraming::ProxyV2,
            BUDGET,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShimError::MalformedProxyHeader(_)));
    }

    #[tokio::test]
    async fn endless_v1_line_hits_budget() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut line = b"PROXY TCP4 ".to_vec();
        line.extend(std::iter::repeat_n(b'1', 200));
        client.write_all(&line).await.unwrap();

        let err = read_proxy_header(
            &mut server,
            ProxyFraming::ProxyV1,
            BUDGET,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShimError::MalformedProxyHeader(_)));
    }

    #[test]
    fn framing_names_match_config_values() {
        let framing: ProxyFraming = serde_json::from_str("\"proxy-v2\"").unwrap();
        assert_eq!(framing, ProxyFraming::ProxyV2);
        let framing: ProxyFraming = serde_json::from_str("\"proxy-v1\"").unwrap();
        assert_eq!(framing, ProxyFraming::ProxyV1);
    }

    #[test]
    fn complete_decode_rejects_truncation() {
        let encoded = v2::encode(&proxied_header());
        let err = ProxyFraming::ProxyV2
            .decode_complete(&encoded[..encoded.len() - 1], BUDGET)
            .unwrap_err();
        assert!(matches!(err, ShimError::MalformedProxyHeader(_)));
    }
}
