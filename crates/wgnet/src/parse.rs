//! The config parser
//!
//! Front-ends turn a document of some surface syntax into a [`Document`]: an
//! interface section and peer sections holding raw textual fields. [`build`]
//! then decodes those fields into a [`Config`], so both syntaxes share a
//! single set of field rules.

use crate::{
    config::{Config, Interface, Peer},
    decode::{
        decode_endpoint, decode_fwmark, decode_ip_list, decode_keepalive, decode_key,
        decode_listen_port, decode_mtu, decode_prefix_list,
    },
    error::{DecodeError, ParseError, ValidationError},
};

pub mod ini;
pub mod yaml;

pub trait Frontend {
    fn read(&self, text: &str) -> Result<Document, ParseError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Document {
    pub listen: Option<String>,
    pub interfaces: Vec<Section>,
    pub peers: Vec<Section>,
}

/// Raw `key = value` pairs of one section, in document order.
///
/// Keys are compared ignoring case, spaces, dashes and underscores, so
/// `PrivateKey`, `private_key` and `Private-Key` are the same field.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Section {
    fields: Vec<(String, String)>,
}

pub mod field {
    pub const PRIVATE_KEY: &str = "PrivateKey";
    pub const LISTEN_PORT: &str = "ListenPort";
    pub const FW_MARK: &str = "FwMark";
    pub const ADDRESS: &str = "Address";
    pub const DNS: &str = "DNS";
    pub const MTU: &str = "MTU";

    pub const PUBLIC_KEY: &str = "PublicKey";
    pub const PRESHARED_KEY: &str = "PresharedKey";
    pub const ALLOWED_IPS: &str = "AllowedIPs";
    pub const ENDPOINT: &str = "Endpoint";
    pub const PERSISTENT_KEEPALIVE: &str = "PersistentKeepalive";

    pub const LISTEN: &str = "Listen";

    pub(super) const INTERFACE: &[&str] = &[PRIVATE_KEY, LISTEN_PORT, FW_MARK, ADDRESS, DNS, MTU];
    pub(super) const PEER: &[&str] = &[
        PUBLIC_KEY,
        PRESHARED_KEY,
        ALLOWED_IPS,
        ENDPOINT,
        PERSISTENT_KEEPALIVE,
    ];
}

pub fn parse(frontend: &impl Frontend, text: &str) -> Result<Config, ParseError> {
    build(frontend.read(text)?)
}

/// Decodes a document into a config, stopping at the first bad field.
pub fn build(document: Document) -> Result<Config, ParseError> {
    let Document {
        listen,
        mut interfaces,
        peers,
    } = document;

    if interfaces.len() > 1 {
        return Err(ValidationError::DuplicateSection("Interface").into());
    }
    let interface = interfaces
        .pop()
        .ok_or(ValidationError::MissingSection("Interface"))?;
    let interface = build_interface(&interface)?;

    let peers = peers
        .iter()
        .enumerate()
        .map(|(i, peer)| build_peer(&format!("Peer {}", i + 1), peer))
        .collect::<Result<Vec<_>, _>>()?;

    let listen = match listen {
        Some(listen) => attribute("document", field::LISTEN, decode_endpoint(&listen))?,
        None => None,
    };

    tracing::debug!(
        peers = peers.len(),
        addresses = interface.addresses.len(),
        "parsed tunnel configuration"
    );
    Ok(Config {
        listen,
        interface,
        peers,
    })
}

fn build_interface(section: &Section) -> Result<Interface, ParseError> {
    const NAME: &str = "Interface";
    section.warn_unknown(NAME, field::INTERFACE);

    let private_key = section
        .get(field::PRIVATE_KEY)
        .ok_or_else(|| ValidationError::MissingField {
            section: NAME.to_owned(),
            field: field::PRIVATE_KEY,
        })?;
    let mut interface = Interface::new(attribute(NAME, field::PRIVATE_KEY, decode_key(private_key))?);

    interface.addresses = attribute(
        NAME,
        field::ADDRESS,
        decode_prefix_list(section.get_all(field::ADDRESS)),
    )?;
    interface.dns = decode_ip_list(section.get_all(field::DNS));
    if let Some(port) = section.get(field::LISTEN_PORT) {
        interface.listen_port = decode_listen_port(port);
    }
    if let Some(mark) = section.get(field::FW_MARK) {
        interface.fw_mark = decode_fwmark(mark);
    }
    if let Some(mtu) = section.get(field::MTU) {
        interface.mtu = decode_mtu(mtu);
    }

    Ok(interface)
}

fn build_peer(name: &str, section: &Section) -> Result<Peer, ParseError> {
    section.warn_unknown(name, field::PEER);

    let public_key = section
        .get(field::PUBLIC_KEY)
        .ok_or_else(|| ValidationError::MissingField {
            section: name.to_owned(),
            field: field::PUBLIC_KEY,
        })?;
    let mut peer = Peer::new(attribute(name, field::PUBLIC_KEY, decode_key(public_key))?);

    if let Some(psk) = section.get(field::PRESHARED_KEY) {
        peer.preshared_key = attribute(name, field::PRESHARED_KEY, decode_key(psk))?;
    }
    // Allowed IPs are routing ranges, keep the network only.
    peer.allowed_ips = attribute(
        name,
        field::ALLOWED_IPS,
        decode_prefix_list(section.get_all(field::ALLOWED_IPS)),
    )?
    .into_iter()
    .map(|net| net.trunc())
    .collect();
    if let Some(endpoint) = section.get(field::ENDPOINT) {
        peer.endpoint = attribute(name, field::ENDPOINT, decode_endpoint(endpoint))?;
    }
    if let Some(keepalive) = section.get(field::PERSISTENT_KEEPALIVE) {
        peer.persistent_keepalive = decode_keepalive(keepalive);
    }

    Ok(peer)
}

fn attribute<T>(
    section: &str,
    field: &'static str,
    result: Result<T, DecodeError>,
) -> Result<T, ParseError> {
    result.map_err(|source| ParseError::Decode {
        section: section.to_owned(),
        field,
        source,
    })
}

impl Section {
    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.fields.push((normalize(key), value.into()));
    }

    /// The last non-empty value of a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).filter(|v| !v.is_empty()).last()
    }

    /// Every value of a repeated field, in document order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> + 'a {
        let key = normalize(key);
        self.fields
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v.trim())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn warn_unknown(&self, section: &str, known: &[&str]) {
        for (key, _) in &self.fields {
            if !known.iter().any(|k| normalize(k) == *key) {
                tracing::debug!(section, key = key.as_str(), "ignoring unsupported field");
            }
        }
    }
}

fn normalize(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
