//! wg-quick configuration to in-process WireGuard for Tokio.
//!
//! [`Config`] parses `wg-quick` INI or YAML documents and renders them as
//! UAPI `set` text. An [`Orchestrator`] turns a [`Config`] into a running
//! userspace device whose [`Net`] hands out [`TcpStream`]s and
//! [`UdpSocket`]s that travel through the tunnel.

pub mod config;
pub mod decode;
pub mod device;
pub mod error;
mod io;
pub mod key;
pub mod netstack;
pub mod orchestrator;
pub mod parse;
pub mod tcp;
pub mod uapi;
pub mod udp;

pub(crate) type Shared<T> = std::sync::Arc<parking_lot::Mutex<Option<T>>>;

pub use crate::{
    config::{Config, Format},
    device::{Device, UdpBind},
    error::{DecodeError, DeviceError, ParseError, TeardownError, UapiError, ValidationError},
    key::Key,
    netstack::{Net, Tun},
    orchestrator::{Orchestrator, Running, State, Userspace},
    tcp::TcpStream,
    udp::UdpSocket,
};
