//! Scalar decoders for the textual fields of a tunnel description
//!
//! Keys, prefixes and endpoints are strict: anything malformed is an error.
//! DNS servers and the numeric fields are lenient and fall back instead.

use std::{
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use ipnet::IpNet;

use crate::{config::DEFAULT_MTU, error::DecodeError, key::Key};

/// Decodes a base64 key that must be exactly 32 bytes long.
pub fn decode_key(s: &str) -> Result<Key, DecodeError> {
    Key::from_base64(s)
}

/// Decodes `address/prefix_len`, keeping the address as written.
pub fn decode_network_prefix(s: &str) -> Result<IpNet, DecodeError> {
    let s = s.trim();
    IpNet::from_str(s).map_err(|_| DecodeError::Prefix(s.to_owned()))
}

/// Decodes a comma separated list of prefixes, failing on the first bad one.
pub fn decode_prefix_list<'a>(
    values: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<IpNet>, DecodeError> {
    split_list(values).map(decode_network_prefix).collect()
}

/// Resolves `host:port` to a UDP endpoint.
///
/// The host may be an IP literal (IPv6 in brackets) or a name, which is
/// resolved through the system resolver, preferring IPv4. An empty string
/// means no endpoint.
pub fn decode_endpoint(s: &str) -> Result<Option<SocketAddr>, DecodeError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(Some(addr));
    }

    if s.starts_with('[') && s.ends_with(']') {
        return Err(DecodeError::MissingPort(s.to_owned()));
    }
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| DecodeError::MissingPort(s.to_owned()))?;
    if port.is_empty() {
        return Err(DecodeError::MissingPort(s.to_owned()));
    }
    let host = match host.strip_prefix('[') {
        Some(bracketed) => bracketed
            .strip_suffix(']')
            .filter(|inner| !inner.contains(['[', ']']))
            .ok_or_else(|| DecodeError::Bracket(s.to_owned()))?,
        None if host.contains(['[', ']']) => return Err(DecodeError::Bracket(s.to_owned())),
        // An unbracketed IPv6 literal: its last group is not a port.
        None if host.contains(':') => return Err(DecodeError::MissingPort(s.to_owned())),
        None => host,
    };
    if host.is_empty() {
        return Err(DecodeError::MissingPort(s.to_owned()));
    }
    let port = u16::from_str(port).map_err(|_| DecodeError::InvalidPort(s.to_owned()))?;

    let resolve_err = |reason: String| DecodeError::Resolve {
        host: host.to_owned(),
        reason,
    };
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| resolve_err(e.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .map(Some)
        .ok_or_else(|| resolve_err("no addresses found".to_owned()))
}

/// Decodes a list of IP addresses, dropping entries that are not IPs.
///
/// wg-quick allows search domains next to servers in `DNS`, so unparseable
/// entries are skipped rather than failing the whole document.
pub fn decode_ip_list<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<IpAddr> {
    split_list(values)
        .filter_map(|value| match IpAddr::from_str(value) {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!(entry = value, "ignoring DNS entry that is not an IP address");
                None
            }
        })
        .collect()
}

/// Persistent keepalive interval in seconds, `0`/`off` disabling it.
pub fn decode_keepalive(s: &str) -> u16 {
    lenient("PersistentKeepalive", s, 0, |s| match s {
        "off" => Ok(0),
        s => decode_integer(s),
    })
}

pub fn decode_listen_port(s: &str) -> u16 {
    lenient("ListenPort", s, 0, decode_integer)
}

/// Firewall mark in decimal or `0x` hex, `0`/`off` meaning unset.
pub fn decode_fwmark(s: &str) -> u32 {
    lenient("FwMark", s, 0, |s| match s {
        "off" => Ok(0),
        s => match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => {
                u32::from_str_radix(hex, 16).map_err(|_| DecodeError::Integer(s.to_owned()))
            }
            None => decode_integer(s),
        },
    })
}

/// MTU, defaulting to 1280 when zero or unparseable.
pub fn decode_mtu(s: &str) -> u16 {
    match lenient("MTU", s, DEFAULT_MTU, decode_integer) {
        0 => DEFAULT_MTU,
        mtu => mtu,
    }
}

pub fn decode_integer<T: FromStr>(s: &str) -> Result<T, DecodeError> {
    T::from_str(s.trim()).map_err(|_| DecodeError::Integer(s.to_owned()))
}

/// Splits comma separated values, trimming and dropping empty entries.
pub fn split_list<'a>(values: impl IntoIterator<Item = &'a str>) -> impl Iterator<Item = &'a str> {
    values
        .into_iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn lenient<T: Copy + std::fmt::Display>(
    field: &'static str,
    s: &str,
    default: T,
    decode: impl FnOnce(&str) -> Result<T, DecodeError>,
) -> T {
    let s = s.trim();
    if s.is_empty() {
        return default;
    }
    decode(&s.to_ascii_lowercase()).unwrap_or_else(|err| {
        tracing::warn!(field, %err, %default, "falling back to default");
        default
    })
}
