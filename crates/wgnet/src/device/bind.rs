use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6},
    sync::Arc,
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;

/// The host UDP socket a device sends and receives encrypted packets on.
///
/// A single dual-stack IPv6 socket serves both families. Hosts without IPv6
/// get an IPv4 socket instead.
#[derive(Clone, Default)]
pub struct UdpBind {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    socket: Option<Arc<UdpSocket>>,
    port: u16,
    mark: u32,
}

impl UdpBind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the socket on `port`, 0 meaning any, and returns the bound port.
    ///
    /// Opening an open bind is a no-op when the ports agree.
    pub fn open(&self, port: u16) -> io::Result<u16> {
        let mut state = self.state.lock();
        if state.socket.is_some() {
            return if port == 0 || port == state.port {
                Ok(state.port)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("bind is already open on port {}", state.port),
                ))
            };
        }

        let socket = match bind(Domain::IPV6, port, state.mark) {
            Ok(socket) => socket,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => return Err(err),
            Err(err) => {
                tracing::debug!(%err, "dual-stack bind failed, falling back to IPv4");
                bind(Domain::IPV4, port, state.mark)?
            }
        };

        let socket = UdpSocket::from_std(socket.into())?;
        let bound = socket.local_addr()?.port();
        tracing::debug!(port = bound, "bind opened");

        state.socket = Some(Arc::new(socket));
        state.port = bound;
        Ok(bound)
    }

    /// Sets the firewall mark of outgoing packets, now and on later opens.
    pub fn set_mark(&self, mark: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        if let Some(socket) = &state.socket {
            apply_mark(&socket2::SockRef::from(socket.as_ref()), mark)?;
        }
        state.mark = mark;
        Ok(())
    }

    pub fn port(&self) -> Option<u16> {
        let state = self.state.lock();
        state.socket.as_ref().map(|_| state.port)
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().socket.is_some()
    }

    /// Releases the socket. Closing a closed bind does nothing.
    pub fn close(&self) -> io::Result<()> {
        if self.state.lock().socket.take().is_some() {
            tracing::debug!("bind closed");
        }
        Ok(())
    }

    pub(crate) fn socket(&self) -> io::Result<Arc<UdpSocket>> {
        self.state
            .lock()
            .socket
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "bind is not open"))
    }
}

fn bind(domain: Domain, port: u16, mark: u32) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if mark != 0 {
        apply_mark(&socket, mark)?;
    }

    let address: SockAddr = if domain == Domain::IPV6 {
        socket.set_only_v6(false)?;
        SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into()
    } else {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into()
    };
    socket.bind(&address)?;
    Ok(socket)
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn apply_mark(socket: &Socket, mark: u32) -> io::Result<()> {
    socket.set_mark(mark)
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn apply_mark(_: &Socket, mark: u32) -> io::Result<()> {
    match mark {
        0 => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "firewall marks are not supported on this platform",
        )),
    }
}

impl fmt::Debug for UdpBind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UdpBind")
            .field("open", &state.socket.is_some())
            .field("port", &state.port)
            .field("mark", &state.mark)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_is_idempotent() {
        let bind = UdpBind::new();
        assert_eq!(bind.port(), None);

        let port = bind.open(0).unwrap();
        assert_ne!(port, 0);
        assert_eq!(bind.open(0).unwrap(), port);
        assert_eq!(bind.open(port).unwrap(), port);
        assert_eq!(bind.port(), Some(port));

        let other = port.checked_add(1).unwrap_or(port - 1);
        assert_eq!(
            bind.open(other).unwrap_err().kind(),
            io::ErrorKind::AddrInUse
        );
    }

    #[tokio::test]
    async fn ports_are_not_shared() {
        let first = UdpBind::new();
        let port = first.open(0).unwrap();

        let second = UdpBind::new();
        assert_eq!(
            second.open(port).unwrap_err().kind(),
            io::ErrorKind::AddrInUse
        );
        assert!(!second.is_open());

        first.close().unwrap();
        assert_eq!(second.open(port).unwrap(), port);
    }

    #[tokio::test]
    async fn close_releases_the_socket() {
        let bind = UdpBind::new();
        bind.open(0).unwrap();
        assert!(bind.socket().is_ok());

        bind.close().unwrap();
        bind.close().unwrap();
        assert!(!bind.is_open());
        assert_eq!(
            bind.socket().unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}
