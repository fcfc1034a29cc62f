use std::{
    any::type_name,
    collections::HashSet,
    fmt,
    net::{IpAddr, SocketAddr},
    ops::RangeInclusive,
    sync::Arc,
};

use parking_lot::Mutex;
use rand::{rngs::OsRng, Rng};

use super::Address;

/// Local ports in use on an interface, per protocol and family.
#[derive(Clone)]
pub struct Allocations {
    pub address: Address,
    used: Arc<Mutex<HashSet<Allocation>>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    address: SocketAddr,
    proto: Proto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl Allocations {
    const EPHEMERAL: RangeInclusive<u16> = 49152..=65535;

    pub fn new(address: Address) -> Self {
        Self {
            address,
            used: Arc::default(),
        }
    }

    /// Claims `address`, picking an ephemeral port when its port is 0.
    ///
    /// Unspecified IPs are replaced with the interface address of the same
    /// family. Returns `None` when the IP is not assigned to the interface or
    /// no port is available.
    pub fn acquire(&self, address: SocketAddr, proto: Proto) -> Option<Allocation> {
        let ip = self.local_ip(address.ip())?;
        let mut used = self.used.lock();

        let mut claim = |port| {
            let allocation = Allocation {
                address: SocketAddr::new(ip, port),
                proto,
            };
            used.insert(allocation).then_some(allocation)
        };

        match address.port() {
            0 => {
                let (start, end) = Self::EPHEMERAL.into_inner();
                let offset = OsRng.gen_range(Self::EPHEMERAL);
                (offset..=end).chain(start..offset).find_map(claim)
            }
            port => claim(port),
        }
    }

    pub fn release(&self, allocation: Allocation) {
        self.used.lock().remove(&allocation);
    }

    fn local_ip(&self, ip: IpAddr) -> Option<IpAddr> {
        match ip {
            IpAddr::V4(ip) => {
                let local = self.address.v4()?;
                (ip.is_unspecified() || ip == local).then_some(IpAddr::V4(local))
            }
            IpAddr::V6(ip) => {
                let local = self.address.v6()?;
                (ip.is_unspecified() || ip == local).then_some(IpAddr::V6(local))
            }
        }
    }
}

impl Allocation {
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(type_name::<Self>())
            .field(&self.proto)
            .field(&self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocations() -> Allocations {
        Allocations::new(Address::V4("10.0.0.2".parse().unwrap()))
    }

    #[test]
    fn fixed_ports_are_exclusive_per_protocol() {
        let allocations = allocations();
        let address: SocketAddr = "0.0.0.0:8080".parse().unwrap();

        let tcp = allocations.acquire(address, Proto::Tcp).unwrap();
        assert_eq!(tcp.address(), "10.0.0.2:8080".parse().unwrap());
        assert!(allocations.acquire(address, Proto::Tcp).is_none());
        assert!(allocations.acquire(address, Proto::Udp).is_some());

        allocations.release(tcp);
        assert!(allocations.acquire(address, Proto::Tcp).is_some());
    }

    #[test]
    fn ephemeral_ports_are_distinct() {
        let allocations = allocations();
        let address: SocketAddr = "0.0.0.0:0".parse().unwrap();

        let a = allocations.acquire(address, Proto::Udp).unwrap();
        let b = allocations.acquire(address, Proto::Udp).unwrap();
        assert_ne!(a.address(), b.address());
        assert!(Allocations::EPHEMERAL.contains(&a.address().port()));
    }

    #[test]
    fn foreign_addresses_are_rejected() {
        let allocations = allocations();
        assert!(allocations
            .acquire("10.0.0.3:80".parse().unwrap(), Proto::Tcp)
            .is_none());
        assert!(allocations
            .acquire("[::]:80".parse().unwrap(), Proto::Tcp)
            .is_none());
    }
}
