//! Error types
//!
//! Parsing fails with [`ParseError`], which wraps a scalar [`DecodeError`]
//! together with the field it came from, or a [`ValidationError`]. Bringing a
//! device up fails with [`DeviceError`]. Failures while tearing down are
//! reported as [`TeardownError`]s and never abort the teardown itself.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::orchestrator::State;

/// A single textual field could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid hex key")]
    Hex,
    #[error("key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("invalid CIDR {0:?}")]
    Prefix(String),
    #[error("invalid IP address {0:?}")]
    Ip(String),
    #[error("endpoint {0:?} is missing a port")]
    MissingPort(String),
    #[error("endpoint {0:?} has an invalid port")]
    InvalidPort(String),
    #[error("endpoint {0:?} has an unbalanced IPv6 bracket")]
    Bracket(String),
    #[error("could not resolve {host:?}: {reason}")]
    Resolve { host: String, reason: String },
    #[error("invalid integer {0:?}")]
    Integer(String),
}

/// The document is well-formed but does not describe a usable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing [{0}] section")]
    MissingSection(&'static str),
    #[error("more than one [{0}] section")]
    DuplicateSection(&'static str),
    #[error("{section} is missing mandatory field {field}")]
    MissingField {
        section: String,
        field: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{section}: invalid {field}: {source}")]
    Decode {
        section: String,
        field: &'static str,
        #[source]
        source: DecodeError,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("invalid YAML document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ParseError {
    /// The offending field, when the failure is attributable to one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Decode { field, .. } => Some(field),
            Self::Validation(ValidationError::MissingField { field, .. }) => Some(field),
            _ => None,
        }
    }
}

/// Malformed text handed to a device's control channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("UAPI line {line}: {reason}")]
pub struct UapiError {
    pub line: usize,
    pub reason: String,
}

/// A collaborator operation failed while bringing the device up.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct DeviceError {
    pub stage: State,
    #[source]
    pub source: io::Error,
}

/// A resource failed to close during teardown.
#[derive(Debug, Error)]
#[error("failed to close {resource}: {source}")]
pub struct TeardownError {
    pub resource: &'static str,
    #[source]
    pub source: io::Error,
}

impl From<UapiError> for io::Error {
    fn from(err: UapiError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}
