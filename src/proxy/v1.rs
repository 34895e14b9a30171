use std::net::{IpAddr, SocketAddr};

use super::{ProxyCommand, ProxyHeader};
use crate::error::ShimError;

const PREFIX: &[u8] = b"PROXY ";
/// `PROXY UNKNOWN\r\n`
pub const MIN_HEADER_LEN: usize = 15;
/// Longest line the text framing allows, CRLF included.
pub const MAX_HEADER_LEN: usize = 107;

pub fn decode(buf: &[u8], budget: usize) -> Result<Option<(ProxyHeader, usize)>, ShimError> {
    let seen = buf.len().min(PREFIX.len());
    if buf[..seen] != PREFIX[..seen] {
        return Err(ShimError::malformed("missing v1 prefix"));
    }

    let limit = MAX_HEADER_LEN.min(budget);
    let Some(end) = buf.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= limit {
            return Err(ShimError::malformed(format!(
                "no line terminator within {limit} bytes"
            )));
        }
        return Ok(None);
    };

    let consumed = end + 2;
    if consumed > limit {
        return Err(ShimError::malformed(format!(
            "header line longer than {limit} bytes"
        )));
    }

    let line = std::str::from_utf8(&buf[PREFIX.len()..end])
        .map_err(|_| ShimError::malformed("header line is not ASCII"))?;

    let fields: Vec<&str> = line.split(' ').collect();
    let header = match fields.as_slice() {
        ["UNKNOWN", ..] => ProxyHeader::local(),
        [proto @ ("TCP4" | "TCP6"), src, dst, src_port, dst_port] => {
            let src_ip = parse_ip(src, proto)?;
            let dst_ip = parse_ip(dst, proto)?;
            ProxyHeader {
                command: ProxyCommand::Proxy,
                source: Some(SocketAddr::new(src_ip, parse_port(src_port)?)),
                destination: Some(SocketAddr::new(dst_ip, parse_port(dst_port)?)),
                alpn: None,
                authority: None,
            }
        }
        _ => return Err(ShimError::malformed(format!("unrecognised header line {line:?}"))),
    };

    Ok(Some((header, consumed)))
}

fn parse_ip(field: &str, proto: &str) -> Result<IpAddr, ShimError> {
    let ip: IpAddr = field
        .parse()
        .map_err(|_| ShimError::malformed(format!("invalid address {field:?}")))?;
    match (proto, ip) {
        ("TCP4", IpAddr::V4(_)) | ("TCP6", IpAddr::V6(_)) => Ok(ip),
        _ => Err(ShimError::malformed(format!("{field} is not a {proto} address"))),
    }
}

fn parse_port(field: &str) -> Result<u16, ShimError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ShimError::malformed(format!("invalid port {field:?}")));
    }
    field
        .parse()
        .map_err(|_| ShimError::malformed(format!("invalid port {field:?}")))
}
