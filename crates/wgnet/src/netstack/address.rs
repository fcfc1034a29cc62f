use std::{
    array,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

/// The primary host address of each family assigned to an interface.
///
/// Sockets are bound to these. The interface also owns every other
/// configured address, but those are never chosen as a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Dual(Ipv4Addr, Ipv6Addr),
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl Address {
    /// Picks the first address of each family, `None` if there are none.
    pub fn from_ips(ips: impl IntoIterator<Item = IpAddr>) -> Option<Self> {
        let mut v4 = None;
        let mut v6 = None;
        for ip in ips {
            match ip {
                IpAddr::V4(ip) => {
                    v4.get_or_insert(ip);
                }
                IpAddr::V6(ip) => {
                    v6.get_or_insert(ip);
                }
            }
        }

        match (v4, v6) {
            (Some(v4), Some(v6)) => Some(Self::Dual(v4, v6)),
            (Some(v4), None) => Some(Self::V4(v4)),
            (None, Some(v6)) => Some(Self::V6(v6)),
            (None, None) => None,
        }
    }

    pub fn ips(&self) -> impl Iterator<Item = IpAddr> {
        match *self {
            Self::Dual(v4, v6) => Ips::Dual([IpAddr::V4(v4), IpAddr::V6(v6)].into_iter()),
            Self::V4(ip) => Ips::Single([IpAddr::V4(ip)].into_iter()),
            Self::V6(ip) => Ips::Single([IpAddr::V6(ip)].into_iter()),
        }
    }

    pub fn v4(&self) -> Option<Ipv4Addr> {
        match *self {
            Self::V4(ip) | Self::Dual(ip, _) => Some(ip),
            Self::V6(_) => None,
        }
    }

    pub fn v6(&self) -> Option<Ipv6Addr> {
        match *self {
            Self::V6(ip) | Self::Dual(_, ip) => Some(ip),
            Self::V4(_) => None,
        }
    }

    pub fn is_dual(&self) -> bool {
        matches!(self, Self::Dual(..))
    }

    /// Whether a socket on this interface can talk to `other`.
    pub fn is_compatible(&self, other: SocketAddr) -> bool {
        match other {
            SocketAddr::V4(..) => self.v4().is_some(),
            SocketAddr::V6(..) => self.v6().is_some(),
        }
    }

    /// The unspecified address of the family of `target`, with port 0.
    pub(crate) fn unspecified_for(target: SocketAddr) -> SocketAddr {
        match target {
            SocketAddr::V4(..) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            SocketAddr::V6(..) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        }
    }
}

enum Ips<T> {
    Dual(array::IntoIter<T, 2>),
    Single(array::IntoIter<T, 1>),
}

impl<T> Iterator for Ips<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Dual(iter) => iter.next(),
            Self::Single(iter) => iter.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_of_each_family_wins() {
        let ips = ["10.0.0.2", "fd00::2", "10.0.0.3", "fd00::3"].map(|ip| ip.parse().unwrap());
        let address = Address::from_ips(ips).unwrap();
        assert_eq!(
            address,
            Address::Dual("10.0.0.2".parse().unwrap(), "fd00::2".parse().unwrap())
        );
        assert_eq!(address.ips().count(), 2);
        assert!(address.is_dual());
    }

    #[test]
    fn single_family() {
        let address = Address::from_ips(["10.0.0.2".parse().unwrap()]).unwrap();
        assert!(address.is_compatible("1.1.1.1:53".parse().unwrap()));
        assert!(!address.is_compatible("[2606:4700::1111]:53".parse().unwrap()));
        assert_eq!(address.v6(), None);
        assert_eq!(Address::from_ips([]), None);
    }
}
