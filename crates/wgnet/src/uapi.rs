//! The cross-platform userspace control protocol
//!
//! [`encode`] renders a [`Config`] as the body of a `set=1` operation. The
//! output is deterministic and always has this shape:
//!
//! ```text
//! private_key=<hex>
//! replace_peers=true               (only with at least one peer)
//! public_key=<hex>                 (per peer, in order)
//! preshared_key=<hex>              (all zeros when unset)
//! endpoint=<ip:port>               (when present)
//! persistent_keepalive_interval=<n>  (when non-zero)
//! replace_allowed_ips=true         (when there are allowed IPs)
//! allowed_ip=<cidr>                (per allowed IP, in order)
//! ```
//!
//! [`parse`] reads the same kind of text back into [`Operation`]s, which is
//! how the in-process device consumes it.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use ipnet::IpNet;

use crate::{
    config::{Config, Peer},
    error::UapiError,
    key::Key,
};

pub fn encode(config: &Config) -> String {
    Uapi(config).to_string()
}

/// Display adapter writing a config in UAPI form.
pub struct Uapi<'a>(pub &'a Config);

impl fmt::Display for Uapi<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Config {
            interface, peers, ..
        } = self.0;

        writeln!(f, "private_key={:x}", interface.private_key)?;
        if !peers.is_empty() {
            writeln!(f, "replace_peers=true")?;
        }
        for peer in peers {
            write_peer(f, peer)?;
        }
        Ok(())
    }
}

fn write_peer(f: &mut fmt::Formatter<'_>, peer: &Peer) -> fmt::Result {
    writeln!(f, "public_key={:x}", peer.public_key)?;
    writeln!(f, "preshared_key={:x}", peer.preshared_key)?;
    if let Some(endpoint) = peer.endpoint {
        writeln!(f, "endpoint={endpoint}")?;
    }
    if peer.persistent_keepalive > 0 {
        writeln!(
            f,
            "persistent_keepalive_interval={}",
            peer.persistent_keepalive
        )?;
    }
    if !peer.allowed_ips.is_empty() {
        writeln!(f, "replace_allowed_ips=true")?;
        for net in &peer.allowed_ips {
            writeln!(f, "allowed_ip={net}")?;
        }
    }
    Ok(())
}

/// One `key=value` statement of a `set` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    PrivateKey(Key),
    ListenPort(u16),
    FwMark(u32),
    ReplacePeers,
    PublicKey(Key),
    Remove,
    UpdateOnly,
    PresharedKey(Key),
    Endpoint(SocketAddr),
    PersistentKeepaliveInterval(u16),
    ReplaceAllowedIps,
    AllowedIp(IpNet),
    ProtocolVersion(u32),
}

/// Parses the body of a `set` operation.
///
/// Peer-scoped keys are only valid after a `public_key` line. A trailing
/// blank line ends the operation.
pub fn parse(text: &str) -> Result<Vec<Operation>, UapiError> {
    let mut operations = Vec::new();
    let mut in_peer = false;

    for (i, line) in text.lines().enumerate() {
        let line_number = i + 1;
        let error = |reason: String| UapiError {
            line: line_number,
            reason,
        };

        if line.is_empty() {
            break;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| error(format!("expected key=value, got {line:?}")))?;

        let invalid = || error(format!("invalid value for {key}: {value:?}"));
        let flag = || match value {
            "true" => Ok(()),
            _ => Err(invalid()),
        };
        let key_value = || Key::from_hex(value).map_err(|_| invalid());

        let operation = match key {
            "private_key" => Operation::PrivateKey(key_value()?),
            "listen_port" => Operation::ListenPort(value.parse().map_err(|_| invalid())?),
            "fwmark" => Operation::FwMark(value.parse().map_err(|_| invalid())?),
            "replace_peers" => flag().map(|()| Operation::ReplacePeers)?,
            "public_key" => {
                in_peer = true;
                Operation::PublicKey(key_value()?)
            }
            "remove" | "update_only" | "preshared_key" | "endpoint"
            | "persistent_keepalive_interval" | "replace_allowed_ips" | "allowed_ip"
            | "protocol_version"
                if !in_peer =>
            {
                return Err(error(format!("{key} before any public_key")));
            }
            "remove" => flag().map(|()| Operation::Remove)?,
            "update_only" => flag().map(|()| Operation::UpdateOnly)?,
            "preshared_key" => Operation::PresharedKey(key_value()?),
            "endpoint" => Operation::Endpoint(parse_endpoint(value).ok_or_else(invalid)?),
            "persistent_keepalive_interval" => {
                Operation::PersistentKeepaliveInterval(value.parse().map_err(|_| invalid())?)
            }
            "replace_allowed_ips" => flag().map(|()| Operation::ReplaceAllowedIps)?,
            "allowed_ip" => Operation::AllowedIp(IpNet::from_str(value).map_err(|_| invalid())?),
            "protocol_version" => match value {
                "1" => Operation::ProtocolVersion(1),
                _ => return Err(error(format!("unsupported protocol version {value:?}"))),
            },
            _ => return Err(error(format!("unknown key {key:?}"))),
        };
        operations.push(operation);
    }

    Ok(operations)
}

fn parse_endpoint(value: &str) -> Option<SocketAddr> {
    SocketAddr::from_str(value).ok().or_else(|| {
        // Bare IPv6 without brackets is accepted by some implementations.
        let (ip, port) = value.rsplit_once(':')?;
        Some(SocketAddr::new(IpAddr::from_str(ip).ok()?, port.parse().ok()?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Interface;

    fn key(byte: u8) -> Key {
        Key::new([byte; 32])
    }

    fn config(peers: Vec<Peer>) -> Config {
        Config {
            listen: None,
            interface: Interface::new(key(0x11)),
            peers,
        }
    }

    #[test]
    fn no_peers() {
        assert_eq!(
            encode(&config(Vec::new())),
            format!("private_key={}\n", "11".repeat(32))
        );
    }

    #[test]
    fn minimal_peer() {
        let mut peer = Peer::new(key(0xaa));
        peer.allowed_ips = vec!["0.0.0.0/0".parse().unwrap()];

        let expected = format!(
            "private_key={}\nreplace_peers=true\npublic_key={}\npreshared_key={}\n\
             replace_allowed_ips=true\nallowed_ip=0.0.0.0/0\n",
            "11".repeat(32),
            "aa".repeat(32),
            "0".repeat(64),
        );
        assert_eq!(encode(&config(vec![peer])), expected);
    }

    #[test]
    fn full_peers_in_order() {
        let mut first = Peer::new(key(0xaa));
        first.preshared_key = key(0xbb);
        first.endpoint = Some("[2001:db8::1]:51820".parse().unwrap());
        first.persistent_keepalive = 25;
        first.allowed_ips = vec!["10.0.0.0/24".parse().unwrap(), "fd00::/64".parse().unwrap()];
        let second = Peer::new(key(0xcc));

        let text = encode(&config(vec![first, second]));
        let lines: Vec<&str> = text.lines().skip(2).collect();
        let expected = vec![
            format!("public_key={}", "aa".repeat(32)),
            format!("preshared_key={}", "bb".repeat(32)),
            "endpoint=[2001:db8::1]:51820".to_owned(),
            "persistent_keepalive_interval=25".to_owned(),
            "replace_allowed_ips=true".to_owned(),
            "allowed_ip=10.0.0.0/24".to_owned(),
            "allowed_ip=fd00::/64".to_owned(),
            format!("public_key={}", "cc".repeat(32)),
            format!("preshared_key={}", "0".repeat(64)),
        ];
        assert_eq!(expected, lines);
    }

    #[test]
    fn listen_port_and_mark_are_not_encoded() {
        let mut config = config(Vec::new());
        config.interface.listen_port = 51820;
        config.interface.fw_mark = 42;
        let text = encode(&config);
        assert!(!text.contains("listen_port"));
        assert!(!text.contains("fwmark"));
    }

    #[test]
    fn encoding_is_deterministic_and_parses_back() {
        let mut peer = Peer::new(key(0xaa));
        peer.endpoint = Some("192.0.2.1:51820".parse().unwrap());
        peer.allowed_ips = vec!["0.0.0.0/0".parse().unwrap()];
        let config = config(vec![peer]);

        let text = encode(&config);
        assert_eq!(text, encode(&config));
        assert_eq!(
            parse(&text).unwrap(),
            [
                Operation::PrivateKey(key(0x11)),
                Operation::ReplacePeers,
                Operation::PublicKey(key(0xaa)),
                Operation::PresharedKey(Key::ZERO),
                Operation::Endpoint("192.0.2.1:51820".parse().unwrap()),
                Operation::ReplaceAllowedIps,
                Operation::AllowedIp("0.0.0.0/0".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn parse_errors() {
        assert_eq!(parse("bogus").unwrap_err().line, 1);
        assert!(parse("private_key=zz").is_err());
        assert!(parse("endpoint=192.0.2.1:1").is_err());
        assert!(parse("replace_peers=yes").is_err());
        assert!(parse("nonsense=1").is_err());
        let err = parse(&format!("public_key={}\nallowed_ip=10.0.0.0", "aa".repeat(32))).unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn parse_stops_at_blank_line() {
        let ops = parse(&format!("private_key={}\n\ngarbage", "aa".repeat(32))).unwrap();
        assert_eq!(ops.len(), 1);
    }
}
