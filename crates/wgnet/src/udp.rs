use std::{
    net::SocketAddr,
    task::{Context, Poll, Waker},
};

use bytes::BufMut;
use smoltcp::{
    socket::udp::{SendError, Socket},
    storage::{PacketBuffer, PacketMetadata},
};
use tokio::io::{Error, ErrorKind, Interest, ReadBuf, Ready, Result};

use crate::{
    io::{Evented, IO},
    netstack::ToNet,
};

/// A UDP socket bound to an address of the tunnel interface.
pub struct UdpSocket {
    socket: IO<Socket<'static>>,
    local: SocketAddr,
}

impl UdpSocket {
    /// Binds to `addr`; unspecified IPs pick the interface address and port 0
    /// picks an ephemeral port.
    pub async fn bind<N: ToNet>(addr: SocketAddr, net: N) -> Result<Self> {
        let net = net.to_net().await?;
        let allocation = net.allocate_udp(addr).ok_or_else(|| {
            Error::new(ErrorKind::AddrNotAvailable, "not a suitable bind address")
        })?;

        let options = net.options().udp;
        let mut socket = Socket::new(
            PacketBuffer::new(
                vec![PacketMetadata::EMPTY; options.recv_buffer_size / 1024],
                vec![0; options.recv_buffer_size],
            ),
            PacketBuffer::new(
                vec![PacketMetadata::EMPTY; options.send_buffer_size / 1024],
                vec![0; options.send_buffer_size],
            ),
        );
        socket
            .bind(allocation.address())
            .map_err(|e| Error::new(ErrorKind::AddrNotAvailable, format!("{e:?}")))?;

        let socket = IO::new(net, socket, Some(allocation));
        socket.net().register_udp((*socket).clone())?;

        Ok(UdpSocket {
            socket,
            local: allocation.address(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    pub async fn ready(&self, interest: Interest) -> Result<Ready> {
        self.socket.ready(interest).await
    }

    pub async fn writable(&self) -> Result<()> {
        self.socket.ready(Interest::WRITABLE).await.map(drop)
    }
    pub fn poll_send_ready(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.socket.poll_ready(Interest::WRITABLE, cx)
    }

    fn send_to_io(
        socket: &mut Socket<'static>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<Result<usize>> {
        match socket.send_slice(buf, target) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(SendError::Unaddressable) => Poll::Ready(Err(Error::new(
                ErrorKind::InvalidInput,
                "not a valid target address",
            ))),
            Err(SendError::BufferFull) => Poll::Pending,
        }
    }
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        if self.local.is_ipv4() != target.is_ipv4() {
            return Err(Error::new(
                ErrorKind::AddrNotAvailable,
                "target address family does not match the socket",
            ));
        }

        self.socket
            .io(Interest::WRITABLE, |s| Self::send_to_io(s, buf, target))
            .await
    }
    pub fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<Result<usize>> {
        self.socket
            .poll_io(Interest::WRITABLE, cx, |s| Self::send_to_io(s, buf, target))
    }
    pub fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        self.socket.try_io(|s| Self::send_to_io(s, buf, target))
    }

    pub async fn readable(&self) -> Result<()> {
        self.socket.ready(Interest::READABLE).await.map(drop)
    }
    pub fn poll_recv_ready(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.socket.poll_ready(Interest::READABLE, cx)
    }

    fn recv_from_io<B: BufMut>(
        socket: &mut Socket<'static>,
        buf: &mut B,
    ) -> Poll<Result<(usize, SocketAddr)>> {
        match socket.recv() {
            Ok((packet, meta)) => {
                let len = usize::min(buf.remaining_mut(), packet.len());
                let addr = SocketAddr::new(meta.endpoint.addr.into(), meta.endpoint.port);
                buf.put_slice(&packet[..len]);
                Poll::Ready(Ok((len, addr)))
            }
            Err(..) => Poll::Pending,
        }
    }
    pub async fn recv_from<B: BufMut>(&self, buf: &mut B) -> Result<(usize, SocketAddr)> {
        self.socket
            .io(Interest::READABLE, |s| Self::recv_from_io(s, buf))
            .await
    }
    pub fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<SocketAddr>> {
        self.socket
            .poll_io(Interest::READABLE, cx, |s| Self::recv_from_io(s, buf))
            .map_ok(|(_, addr)| addr)
    }
    pub fn try_recv_from<B: BufMut>(&self, buf: &mut B) -> Result<(usize, SocketAddr)> {
        self.socket.try_io(|s| Self::recv_from_io(s, buf))
    }

    pub fn ttl(&self) -> Result<u32> {
        self.socket.with(|s| s.hop_limit().unwrap_or(64).into())
    }
    pub fn set_ttl(&mut self, ttl: u32) -> Result<()> {
        self.socket.with(|s| s.set_hop_limit(ttl.try_into().ok()))
    }
}

impl Evented for Socket<'static> {
    #[inline]
    fn readiness(&self) -> Ready {
        let mut readiness = Ready::EMPTY;
        if self.is_open() && self.can_recv() {
            readiness |= Ready::READABLE;
        }
        if self.is_open() && self.can_send() {
            readiness |= Ready::WRITABLE;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_to_the_interface_address() {
        let (_tun, net) =
            crate::netstack::create(&["10.0.0.2".parse().unwrap()], &[], 1280).unwrap();

        let socket = UdpSocket::bind("0.0.0.0:5353".parse().unwrap(), &net)
            .await
            .unwrap();
        assert_eq!(
            socket.local_addr().unwrap(),
            "10.0.0.2:5353".parse().unwrap()
        );

        let taken = UdpSocket::bind("10.0.0.2:5353".parse().unwrap(), &net).await;
        assert!(matches!(taken, Err(e) if e.kind() == ErrorKind::AddrNotAvailable));

        drop(socket);
        assert!(UdpSocket::bind("10.0.0.2:5353".parse().unwrap(), &net)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn datagrams_leave_through_the_tun() {
        let (tun, net) =
            crate::netstack::create(&["10.0.0.2".parse().unwrap()], &[], 1280).unwrap();
        let (_writer, mut reader) = tun.attach().unwrap();

        let socket = UdpSocket::bind("0.0.0.0:0".parse().unwrap(), &net)
            .await
            .unwrap();
        socket
            .send_to(b"ping", "10.0.0.1:7".parse().unwrap())
            .await
            .unwrap();

        let packet = tokio::time::timeout(std::time::Duration::from_secs(5), reader.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet[9], 17);
        assert!(packet.ends_with(b"ping"));
    }
}
