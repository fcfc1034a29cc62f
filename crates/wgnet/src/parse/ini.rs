//! wg-quick style sectioned documents
//!
//! ```ini
//! [Interface]
//! PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=
//! Address = 10.0.0.2/32
//!
//! [Peer]
//! PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=
//! AllowedIPs = 0.0.0.0/0, ::/0
//! ```
//!
//! Each `[Peer]` header starts a new peer. Repeated keys accumulate.

use super::{Document, Frontend, Section};
use crate::error::ParseError;

pub struct Ini;

#[derive(Clone, Copy)]
enum Kind {
    Interface,
    Peer,
    Ignored,
}

impl Frontend for Ini {
    fn read(&self, text: &str) -> Result<Document, ParseError> {
        let mut document = Document::default();
        let mut current: Option<(Kind, Section)> = None;

        for (i, line) in text.lines().enumerate() {
            let line_number = i + 1;
            let syntax = |reason: &str| ParseError::Syntax {
                line: line_number,
                reason: reason.to_owned(),
            };

            let line = strip_comment(line).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or_else(|| syntax("unterminated section header"))?
                    .trim();
                let kind = if name.eq_ignore_ascii_case("interface") {
                    Kind::Interface
                } else if name.eq_ignore_ascii_case("peer") {
                    Kind::Peer
                } else {
                    tracing::warn!(line = line_number, section = name, "skipping unknown section");
                    Kind::Ignored
                };
                flush(&mut document, current.replace((kind, Section::default())));
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| syntax("expected `key = value`"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(syntax("missing key before `=`"));
            }

            match &mut current {
                Some((_, section)) => section.push(key, value.trim()),
                None => return Err(syntax("key outside of any section")),
            }
        }

        flush(&mut document, current);
        Ok(document)
    }
}

fn flush(document: &mut Document, section: Option<(Kind, Section)>) {
    match section {
        Some((Kind::Interface, section)) => document.interfaces.push(section),
        Some((Kind::Peer, section)) => document.peers.push(section),
        Some((Kind::Ignored, _)) | None => {}
    }
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with(';') {
        return "";
    }
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, error::DecodeError, parse::field};

    const CONFIG: &str = "
# laptop
[Interface]
PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=
ListenPort = 51820
FwMark = 0x42
Address = 10.0.0.2/24, fd00::2/64
Address = 10.1.0.2/32
DNS = 1.1.1.1, home.arpa
MTU = 1420
PostUp = iptables -A FORWARD -i %i -j ACCEPT

[Peer]
PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=
PresharedKey = /UwcSPg38hW/D9Y3tcS1FOV0K1wuURMbS0sesJEP5ak=
AllowedIPs = 0.0.0.0/0, ::/0 # everything
Endpoint = 192.95.5.67:1234
PersistentKeepalive = 25

[peer]
publickey = TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=
allowedips = 10.0.0.3/32
";

    #[test]
    fn full_document() {
        let config = Config::from_ini(CONFIG).unwrap();
        let interface = &config.interface;
        assert_eq!(
            interface.private_key.to_base64(),
            "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk="
        );
        assert_eq!(interface.listen_port, 51820);
        assert_eq!(interface.fw_mark, 0x42);
        assert_eq!(interface.addresses.len(), 3);
        assert_eq!(interface.dns, ["1.1.1.1".parse::<std::net::IpAddr>().unwrap()]);
        assert_eq!(interface.mtu, 1420);

        assert_eq!(config.peers.len(), 2);
        let peer = &config.peers[0];
        assert!(!peer.preshared_key.is_zero());
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.endpoint, Some("192.95.5.67:1234".parse().unwrap()));
        assert_eq!(peer.persistent_keepalive, 25);

        let peer = &config.peers[1];
        assert!(peer.preshared_key.is_zero());
        assert_eq!(peer.endpoint, None);
        assert_eq!(peer.persistent_keepalive, 0);
    }

    #[test]
    fn no_peer_section_means_no_peers() {
        let config =
            Config::from_ini("[Interface]\nPrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=")
                .unwrap();
        assert!(config.peers.is_empty());
    }

    #[test]
    fn malformed_private_key() {
        for key in ["yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBm", "AAAA"] {
            let err = Config::from_ini(&format!("[Interface]\nPrivateKey = {key}")).unwrap_err();
            assert_eq!(err.field(), Some(field::PRIVATE_KEY));
            assert!(matches!(
                err,
                ParseError::Decode {
                    source: DecodeError::Base64(_) | DecodeError::KeyLength(_),
                    ..
                }
            ));
        }
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = Config::from_ini("\nPrivateKey = x\n").unwrap_err();
        assert!(matches!(err, ParseError::Syntax { line: 2, .. }));

        let err = Config::from_ini("[Interface\n").unwrap_err();
        assert!(matches!(err, ParseError::Syntax { line: 1, .. }));

        let err = Config::from_ini("[Interface]\njust words\n").unwrap_err();
        assert!(matches!(err, ParseError::Syntax { line: 2, .. }));
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let config = Config::from_ini(
            "[Interface]\nPrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\n\
             [Extra]\nPublicKey = nonsense\n; comment\n",
        )
        .unwrap();
        assert!(config.peers.is_empty());
    }
}
