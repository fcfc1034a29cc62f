//! Structured documents
//!
//! ```yaml
//! listen: 127.0.0.1:1080
//! interface:
//!   private_key: yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=
//!   address: [10.0.0.2/32]
//!   mtu: 1420
//! peer:
//!   - public_key: xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=
//!     allowed_ips: [0.0.0.0/0, ::/0]
//!     endpoint: 192.95.5.67:1234
//! ```
//!
//! Field values stay textual here and go through the same decoders as the
//! sectioned syntax.

use std::{collections::BTreeMap, fmt};

use serde::Deserialize;

use super::{Document, Frontend, Section};
use crate::error::ParseError;

pub struct Yaml;

#[derive(Debug, Deserialize)]
struct Raw {
    #[serde(default)]
    listen: Option<Scalar>,
    #[serde(default)]
    interface: Option<RawSection>,
    #[serde(default, alias = "peers")]
    peer: Option<Peers>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Many(Vec<RawSection>),
    One(RawSection),
}

type RawSection = BTreeMap<String, Option<Value>>;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Value {
    One(Scalar),
    Many(Vec<Scalar>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Str(String),
}

impl Frontend for Yaml {
    fn read(&self, text: &str) -> Result<Document, ParseError> {
        let raw: Raw = serde_yaml::from_str(text)?;

        let peers = match raw.peer {
            Some(Peers::Many(peers)) => peers,
            Some(Peers::One(peer)) => vec![peer],
            None => Vec::new(),
        };

        Ok(Document {
            listen: raw.listen.map(|listen| listen.to_string()),
            interfaces: raw.interface.map(section).into_iter().collect(),
            peers: peers.into_iter().map(section).collect(),
        })
    }
}

fn section(raw: RawSection) -> Section {
    let mut section = Section::default();
    for (key, value) in raw {
        match value {
            Some(Value::One(value)) => section.push(&key, value.to_string()),
            Some(Value::Many(values)) => {
                for value in values {
                    section.push(&key, value.to_string());
                }
            }
            None => {}
        }
    }
    section
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => b.fmt(f),
            Self::Int(i) => i.fmt(f),
            Self::Uint(u) => u.fmt(f),
            Self::Str(s) => s.fmt(f),
        }
    }
}
