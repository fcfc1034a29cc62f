use std::{io, net::IpAddr};

use crate::{
    device::{self, UdpBind},
    netstack::{self, Net, Options, Tun},
};

use super::{Bind, Close, Device, Stack};

/// In-process stack: a smoltcp interface, an OS UDP socket and a boringtun
/// device.
#[derive(Debug, Clone)]
pub struct Userspace {
    options: Options,
}

impl Userspace {
    /// Uses default [`Options`], which capture the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Self { options }
    }
}

impl Default for Userspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Stack for Userspace {
    type Tun = Tun;
    type Net = Net;
    type Bind = UdpBind;
    type Device = device::Device;

    fn create_tun(&self, addresses: &[IpAddr], dns: &[IpAddr], mtu: u16) -> io::Result<(Tun, Net)> {
        netstack::create_with(addresses, dns, mtu, self.options.clone())
    }

    fn create_bind(&self) -> io::Result<UdpBind> {
        Ok(UdpBind::new())
    }

    fn create_device(&self, tun: &Tun, bind: &UdpBind) -> io::Result<device::Device> {
        Ok(device::Device::new(tun, bind))
    }
}

impl Close for Tun {
    fn close(&self) -> io::Result<()> {
        Tun::close(self);
        Ok(())
    }
}

impl Close for UdpBind {
    fn close(&self) -> io::Result<()> {
        UdpBind::close(self)
    }
}

impl Bind for UdpBind {
    fn open(&self, port: u16) -> io::Result<u16> {
        UdpBind::open(self, port)
    }

    fn set_mark(&self, mark: u32) -> io::Result<()> {
        UdpBind::set_mark(self, mark)
    }
}

impl Close for device::Device {
    fn close(&self) -> io::Result<()> {
        device::Device::close(self)
    }
}

impl Device for device::Device {
    fn ipc_set(&self, uapi: &str) -> io::Result<()> {
        device::Device::ipc_set(self, uapi)
    }

    fn up(&self) -> io::Result<()> {
        device::Device::up(self)
    }
}
