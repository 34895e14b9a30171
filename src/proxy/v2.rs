use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ProxyCommand, ProxyHeader};
use crate::error::ShimError;

pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
pub const FIXED_HEADER_LEN: usize = 16;

const VERSION: u8 = 0x2;
const CMD_LOCAL: u8 = 0x0;
const CMD_PROXY: u8 = 0x1;

const AF_UNSPEC: u8 = 0x0;
const AF_INET: u8 = 0x1;
const AF_INET6: u8 = 0x2;
const AF_UNIX: u8 = 0x3;

const INET_ADDR_LEN: usize = 12;
const INET6_ADDR_LEN: usize = 36;

pub const PP2_TYPE_ALPN: u8 = 0x01;
pub const PP2_TYPE_AUTHORITY: u8 = 0x02;

pub(super) fn next_read_len(buf: &[u8]) -> usize {
    if buf.len() < FIXED_HEADER_LEN {
        return FIXED_HEADER_LEN - buf.len();
    }
    let total = FIXED_HEADER_LEN + (&buf[14..16]).get_u16() as usize;
    total.saturating_sub(buf.len()).max(1)
}

pub fn decode(buf: &[u8], budget: usize) -> Result<Option<(ProxyHeader, usize)>, ShimError> {
    let seen = buf.len().min(SIGNATURE.len());
    if buf[..seen] != SIGNATURE[..seen] {
        return Err(ShimError::malformed("missing v2 signature"));
    }
    if buf.len() < FIXED_HEADER_LEN {
        return Ok(None);
    }

    let mut fixed = &buf[SIGNATURE.len()..FIXED_HEADER_LEN];
    let ver_cmd = fixed.get_u8();
    let fam_proto = fixed.get_u8();
    let length = fixed.get_u16() as usize;

    if ver_cmd >> 4 != VERSION {
        return Err(ShimError::malformed(format!(
            "unsupported version {}",
            ver_cmd >> 4
        )));
    }

    let total = FIXED_HEADER_LEN + length;
    if total > budget {
        return Err(ShimError::malformed(format!(
            "header of {total} bytes exceeds {budget} byte budget"
        )));
    }
    if buf.len() < total {
        return Ok(None);
    }

    let mut body = Bytes::copy_from_slice(&buf[FIXED_HEADER_LEN..total]);

    let command = match ver_cmd & 0x0F {
        CMD_LOCAL => ProxyCommand::Local,
        CMD_PROXY => ProxyCommand::Proxy,
        other => {
            return Err(ShimError::malformed(format!("unknown command {other:#x}")));
        }
    };

    // LOCAL connections carry nothing we act on.
    if command == ProxyCommand::Local {
        return Ok(Some((ProxyHeader::local(), total)));
    }

    let (source, destination) = match fam_proto >> 4 {
        AF_UNSPEC => (None, None),
        AF_INET => {
            if body.remaining() < INET_ADDR_LEN {
                return Err(ShimError::malformed("short IPv4 address block"));
            }
            let src = Ipv4Addr::from(body.get_u32());
            let dst = Ipv4Addr::from(body.get_u32());
            let src_port = body.get_u16();
            let dst_port = body.get_u16();
            (
                Some(SocketAddr::new(IpAddr::V4(src), src_port)),
                Some(SocketAddr::new(IpAddr::V4(dst), dst_port)),
            )
        }
        AF_INET6 => {
            if body.remaining() < INET6_ADDR_LEN {
                return Err(ShimError::malformed("short IPv6 address block"));
            }
            let src = Ipv6Addr::from(body.get_u128());
            let dst = Ipv6Addr::from(body.get_u128());
            let src_port = body.get_u16();
            let dst_port = body.get_u16();
            (
                Some(SocketAddr::new(IpAddr::V6(src), src_port)),
                Some(SocketAddr::new(IpAddr::V6(dst), dst_port)),
            )
        }
        AF_UNIX => {
            return Err(ShimError::malformed("unix socket addresses are not supported"));
        }
        other => {
            return Err(ShimError::malformed(format!("unknown address family {other:#x}")));
        }
    };

    let mut header = ProxyHeader {
        command,
        source,
        destination,
        alpn: None,
        authority: None,
    };

    while body.has_remaining() {
        if body.remaining() < 3 {
            return Err(ShimError::malformed("truncated TLV"));
        }
        let kind = body.get_u8();
        let len = body.get_u16() as usize;
        if body.remaining() < len {
            return Err(ShimError::malformed(format!(
                "TLV {kind:#x} extends past end of header"
            )));
        }
        let value = body.copy_to_bytes(len);

        match kind {
            PP2_TYPE_ALPN => header.alpn = Some(value.to_vec()),
            PP2_TYPE_AUTHORITY => {
                let authority = String::from_utf8(value.to_vec())
                    .map_err(|_| ShimError::malformed("authority TLV is not UTF-8"))?;
                header.authority = Some(authority);
            }
            _ => {}
        }
    }

    Ok(Some((header, total)))
}

/// Encodes a header the way a fronting proxy would send it.
pub fn encode(header: &ProxyHeader) -> Bytes {
    let mut body = BytesMut::new();
    let mut fam_proto = AF_UNSPEC << 4;

    if header.command == ProxyCommand::Proxy {
        match (header.source, header.destination) {
            (Some(SocketAddr::V4(src)), Some(SocketAddr::V4(dst))) => {
                fam_proto = AF_INET << 4 | 0x2;
                body.put_slice(&src.ip().octets());
                body.put_slice(&dst.ip().octets());
                body.put_u16(src.port());
                body.put_u16(dst.port());
            }
            (Some(SocketAddr::V6(src)), Some(SocketAddr::V6(dst))) => {
                fam_proto = AF_INET6 << 4 | 0x2;
                body.put_slice(&src.ip().octets());
                body.put_slice(&dst.ip().octets());
                body.put_u16(src.port());
                body.put_u16(dst.port());
            }
            _ => {}
        }

        if let Some(alpn) = &header.alpn {
            body.put_u8(PP2_TYPE_ALPN);
            body.put_u16(alpn.len() as u16);
            body.put_slice(alpn);
        }
        if let Some(authority) = &header.authority {
            body.put_u8(PP2_TYPE_AUTHORITY);
            body.put_u16(authority.len() as u16);
            body.put_slice(authority.as_bytes());
        }
    }

    let command = match header.command {
        ProxyCommand::Local => CMD_LOCAL,
        ProxyCommand::Proxy => CMD_PROXY,
    };

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + body.len());
    buf.put_slice(&SIGNATURE);
    buf.put_u8(VERSION << 4 | command);
    buf.put_u8(fam_proto);
    buf.put_u16(body.len() as u16);
    buf.extend_from_slice(&body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(ver_cmd: u8, fam_proto: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = SIGNATURE.to_vec();
        buf.push(ver_cmd);
        buf.push(fam_proto);
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    fn inet_block() -> Vec<u8> {
        let mut block = vec![198, 51, 100, 7, 10, 0, 0, 2];
        block.extend_from_slice(&40000u16.to_be_bytes());
        block.extend_from_slice(&5520u16.to_be_bytes());
        block
    }

    #[test]
    fn decodes_inet_with_tlvs() {
        let mut body = inet_block();
        body.extend_from_slice(&[PP2_TYPE_ALPN, 0, 8]);
        body.extend_from_slice(b"hytale/2");
        body.extend_from_slice(&[PP2_TYPE_AUTHORITY, 0, 9]);
        body.extend_from_slice(b"mc.a.test");
        body.extend_from_slice(&[0xEE, 0, 1, 0xFF]);
        let buf = fixed(0x21, 0x12, &body);

        let (header, used) = decode(&buf, 536).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(header.forwarded_source(), Some("198.51.100.7:40000".parse().unwrap()));
        assert_eq!(header.destination, Some("10.0.0.2:5520".parse().unwrap()));
        assert_eq!(header.alpn.as_deref(), Some(&b"hytale/2"[..]));
        assert_eq!(header.authority.as_deref(), Some("mc.a.test"));
    }

    #[test]
    fn decodes_inet6() {
        let header = ProxyHeader {
            command: ProxyCommand::Proxy,
            source: Some("[2001:db8::7]:40000".parse().unwrap()),
            destination: Some("[2001:db8::1]:5520".parse().unwrap()),
            alpn: None,
            authority: None,
        };
        let (decoded, _) = decode(&encode(&header), 536).unwrap().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn local_command_carries_no_source() {
        let buf = fixed(0x20, 0x12, &inet_block());
        let (header, used) = decode(&buf, 536).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(header.command, ProxyCommand::Local);
        assert_eq!(header.forwarded_source(), None);
    }

    #[test]
    fn partial_prefix_needs_more() {
        let buf = fixed(0x21, 0x12, &inet_block());
        assert!(decode(&buf[..5], 536).unwrap().is_none());
        assert!(decode(&buf[..FIXED_HEADER_LEN + 3], 536).unwrap().is_none());
        assert_eq!(next_read_len(&buf[..5]), FIXED_HEADER_LEN - 5);
        assert_eq!(next_read_len(&buf[..FIXED_HEADER_LEN]), INET_ADDR_LEN);
    }

    #[test]
    fn rejects_bad_signature_early() {
        assert!(decode(b"GET / HTTP/1.1", 536).is_err());
        assert!(decode(&[0x0D, 0x0A, 0x0D, 0x0B], 536).is_err());
    }

    #[test]
    fn rejects_wrong_version_and_command() {
        assert!(decode(&fixed(0x11, 0x12, &inet_block()), 536).is_err());
        assert!(decode(&fixed(0x2F, 0x12, &inet_block()), 536).is_err());
    }

    #[test]
    fn rejects_short_address_block() {
        assert!(decode(&fixed(0x21, 0x12, &[1, 2, 3, 4]), 536).is_err());
        assert!(decode(&fixed(0x21, 0x22, &inet_block()), 536).is_err());
    }

    #[test]
    fn rejects_unix_family() {
        assert!(decode(&fixed(0x21, 0x31, &[0; 216]), 536).is_err());
    }

    #[test]
    fn rejects_truncated_tlv() {
        let mut body = inet_block();
        body.extend_from_slice(&[PP2_TYPE_AUTHORITY, 0, 20, b'a']);
        assert!(decode(&fixed(0x21, 0x12, &body), 536).is_err());

        let mut body = inet_block();
        body.extend_from_slice(&[PP2_TYPE_AUTHORITY, 0]);
        assert!(decode(&fixed(0x21, 0x12, &body), 536).is_err());
    }

    #[test]
    fn rejects_non_utf8_authority() {
        let mut body = inet_block();
        body.extend_from_slice(&[PP2_TYPE_AUTHORITY, 0, 2, 0xC3, 0x28]);
        assert!(decode(&fixed(0x21, 0x12, &body), 536).is_err());
    }

    #[test]
    fn budget_is_checked_from_declared_length() {
        let buf = fixed(0x21, 0x12, &[0; 100]);
        assert!(decode(&buf[..FIXED_HEADER_LEN], 64).is_err());
    }

    #[test]
    fn unspec_proxy_has_no_addresses() {
        let buf = fixed(0x21, 0x00, &[]);
        let (header, _) = decode(&buf, 536).unwrap().unwrap();
        assert_eq!(header.command, ProxyCommand::Proxy);
        assert_eq!(header.forwarded_source(), None);
    }
}
