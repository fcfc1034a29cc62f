use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll, Waker},
};

use bytes::BufMut;
use smoltcp::{
    socket::tcp::{ConnectError, RecvError, SendError, Socket, SocketBuffer, State},
    wire::IpEndpoint,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, Error, ErrorKind, Interest, ReadBuf, Ready, Result},
    time,
};

use crate::{
    io::{Evented, IO},
    netstack::{Address, ToNet},
};

/// A TCP connection carried through the tunnel.
pub struct TcpStream {
    socket: IO<Socket<'static>>,
}

impl TcpStream {
    pub async fn connect<N: ToNet>(target: SocketAddr, net: N) -> Result<TcpStream> {
        let net = net.to_net().await?;
        if !net.address().is_compatible(target) {
            return Err(Error::new(
                ErrorKind::AddrNotAvailable,
                format!("interface has no address to reach {target}"),
            ));
        }

        let allocation = net
            .allocate_tcp(Address::unspecified_for(target))
            .ok_or_else(|| Error::new(ErrorKind::AddrInUse, "no local port available"))?;
        let socket = IO::new(
            net.clone(),
            Socket::new(
                SocketBuffer::new(vec![0; net.options().tcp.recv_buffer_size]),
                SocketBuffer::new(vec![0; net.options().tcp.send_buffer_size]),
            ),
            Some(allocation),
        );

        net.connect_tcp((*socket).clone(), allocation, target)
            .await?
            .map_err(|e| match e {
                ConnectError::Unaddressable => {
                    Error::new(ErrorKind::AddrNotAvailable, "target is unaddressable")
                }
                ConnectError::InvalidState => Error::from(ErrorKind::AlreadyExists),
            })?;

        let established = socket.ready(Interest::WRITABLE);
        match time::timeout(net.options().tcp.connect_timeout, established).await {
            Ok(Ok(ready)) if ready.is_writable() => {
                tracing::trace!(%target, "connected");
                Ok(TcpStream { socket })
            }
            Ok(Ok(..)) => Err(Error::from(ErrorKind::ConnectionRefused)),
            Ok(Err(e)) => Err(e),
            Err(..) => Err(Error::from(ErrorKind::TimedOut)),
        }
    }

    fn endpoint<F>(&self, f: F) -> Result<SocketAddr>
    where
        F: FnOnce(&mut Socket<'static>) -> Option<IpEndpoint>,
    {
        let endpoint = self
            .socket
            .with(f)?
            .ok_or_else(|| Error::from(ErrorKind::NotConnected))?;
        let address: IpAddr = endpoint.addr.into();

        Ok(SocketAddr::new(address, endpoint.port))
    }
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint(|s| s.local_endpoint())
    }
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.endpoint(|s| s.remote_endpoint())
    }

    pub async fn ready(&self, interest: Interest) -> Result<Ready> {
        self.socket.ready(interest).await
    }

    pub async fn readable(&self) -> Result<()> {
        self.socket.ready(Interest::READABLE).await.map(drop)
    }
    pub fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.socket.poll_ready(Interest::READABLE, cx)
    }

    fn read_io<B: BufMut>(socket: &mut Socket<'static>, buf: &mut B) -> Poll<Result<usize>> {
        let received = socket.recv(|data| {
            let len = usize::min(buf.remaining_mut(), data.len());
            buf.put_slice(&data[..len]);
            (len, len)
        });
        match received {
            Ok(len) if len > 0 => Poll::Ready(Ok(len)),
            Ok(..) => Poll::Pending,
            Err(RecvError::Finished) => Poll::Ready(Ok(0)),
            Err(RecvError::InvalidState) => {
                Poll::Ready(Err(Error::from(ErrorKind::ConnectionAborted)))
            }
        }
    }
    pub fn try_read<B: BufMut>(&self, buf: &mut B) -> Result<usize> {
        self.socket.try_io(|s| Self::read_io(s, buf))
    }

    pub async fn writable(&self) -> Result<()> {
        self.socket.ready(Interest::WRITABLE).await.map(drop)
    }
    pub fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.socket.poll_ready(Interest::WRITABLE, cx)
    }

    fn write_io(socket: &mut Socket<'static>, buf: &[u8]) -> Poll<Result<usize>> {
        match socket.send_slice(buf) {
            Ok(len) if len > 0 => Poll::Ready(Ok(len)),
            Ok(..) => Poll::Pending,
            Err(SendError::InvalidState) => Poll::Ready(Err(Error::from(ErrorKind::BrokenPipe))),
        }
    }
    pub fn try_write(&self, buf: &[u8]) -> Result<usize> {
        self.socket.try_io(|s| Self::write_io(s, buf))
    }

    pub fn nodelay(&self) -> Result<bool> {
        self.socket.with(|s| !s.nagle_enabled())
    }
    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        self.socket.with(|s| s.set_nagle_enabled(!nodelay))
    }

    pub fn ttl(&self) -> Result<u32> {
        self.socket.with(|s| s.hop_limit().unwrap_or(64).into())
    }
    pub fn set_ttl(&mut self, ttl: u32) -> Result<()> {
        self.socket.with(|s| s.set_hop_limit(ttl.try_into().ok()))
    }
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStream")
            .field("local", &self.local_addr().ok())
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        self.socket
            .poll_io(Interest::READABLE, cx, |s| Self::read_io(s, buf))
            .map_ok(drop)
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        self.socket
            .poll_io(Interest::WRITABLE, cx, |s| Self::write_io(s, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.socket.poll_io(Interest::WRITABLE, cx, |s| {
            if !s.may_send() {
                Poll::Ready(Ok(()))
            } else {
                s.close();
                Poll::Pending
            }
        })
    }
}

/// Handshake states, which are neither open nor closed.
fn is_connecting(state: State) -> bool {
    matches!(state, State::Listen | State::SynSent | State::SynReceived)
}

impl Evented for Socket<'static> {
    #[inline]
    fn readiness(&self) -> Ready {
        let mut readiness = Ready::EMPTY;
        if is_connecting(self.state()) {
            return readiness;
        }

        if self.can_recv() {
            readiness |= Ready::READABLE;
        } else if !self.may_recv() {
            readiness |= Ready::READ_CLOSED;
        }
        if self.can_send() {
            readiness |= Ready::WRITABLE;
        } else if !self.may_send() {
            readiness |= Ready::WRITE_CLOSED;
        }
        readiness
    }

    #[inline]
    fn register_read_waker(&mut self, waker: &Waker) {
        self.register_recv_waker(waker)
    }
    #[inline]
    fn register_write_waker(&mut self, waker: &Waker) {
        self.register_send_waker(waker)
    }
}
