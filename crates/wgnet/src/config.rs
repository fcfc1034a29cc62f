use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    path::Path,
    str::FromStr,
};

use ipnet::IpNet;

use crate::{error::ParseError, key::Key, parse, uapi};

pub const DEFAULT_MTU: u16 = 1280;

/// A parsed tunnel description.
///
/// Built once from a document and never mutated afterwards; the orchestrator
/// only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address the proxy-facing side should listen on, if the document says.
    pub listen: Option<SocketAddr>,
    pub interface: Interface,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub private_key: Key,
    /// `0` lets the bind pick a port.
    pub listen_port: u16,
    /// `0` means no mark.
    pub fw_mark: u32,
    pub addresses: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub mtu: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub public_key: Key,
    /// All-zero when no preshared key is configured.
    pub preshared_key: Key,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<SocketAddr>,
    /// Seconds, `0` disables keepalives.
    pub persistent_keepalive: u16,
}

/// Surface syntax of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// wg-quick style `[Interface]`/`[Peer]` sections
    Ini,
    /// Structured document with `interface` and a `peer` list
    Yaml,
}

impl Config {
    pub fn parse(text: &str, format: Format) -> Result<Self, ParseError> {
        match format {
            Format::Ini => parse::parse(&parse::ini::Ini, text),
            Format::Yaml => parse::parse(&parse::yaml::Yaml, text),
        }
    }

    pub fn from_ini(text: &str) -> Result<Self, ParseError> {
        Self::parse(text, Format::Ini)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ParseError> {
        Self::parse(text, Format::Yaml)
    }

    /// Reads a document from disk, guessing its format from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ParseError> {
        let path = path.as_ref();
        Self::from_path_with(path, Format::detect(path))
    }

    pub fn from_path_with(path: impl AsRef<Path>, format: Format) -> Result<Self, ParseError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text, format)
    }

    /// Control channel text configuring a device with this config.
    pub fn to_uapi(&self) -> String {
        uapi::encode(self)
    }
}

impl Interface {
    pub fn new(private_key: Key) -> Self {
        Self {
            private_key,
            listen_port: 0,
            fw_mark: 0,
            addresses: Vec::new(),
            dns: Vec::new(),
            mtu: DEFAULT_MTU,
        }
    }

    /// Addresses assigned to the interface itself, without their networks.
    pub fn host_addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.addresses.iter().map(IpNet::addr)
    }
}

impl Peer {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            preshared_key: Key::ZERO,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: 0,
        }
    }
}

impl Format {
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Self::Yaml
            }
            _ => Self::Ini,
        }
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ini" | "conf" | "wg-quick" => Ok(Self::Ini),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(format!("unknown config format {other:?}, expected ini or yaml")),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ini => "ini",
            Self::Yaml => "yaml",
        })
    }
}
