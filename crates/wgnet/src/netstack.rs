//! In-process TCP/IP stack behind a virtual tunnel interface.
//!
//! [`create`] returns two handles onto the same stack. The [`Tun`] side is
//! where raw IP packets enter and leave, and is meant to be attached to a
//! [`Device`](crate::device::Device). The [`Net`] side is where sockets are
//! opened and names are resolved.

use std::{
    any::type_name,
    fmt,
    future::{poll_fn, Future},
    io,
    net::{IpAddr, SocketAddr},
    ops::Deref,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use rand::{rngs::OsRng, Rng};
use smoltcp::{
    socket::{tcp, udp},
    wire::HardwareAddress,
};
use tokio::{
    runtime::Handle,
    sync::{futures::Notified, mpsc, oneshot, Notify},
    time,
};

mod address;
mod allocations;
mod dns;
mod phy;
mod sockets;

pub use address::Address;
pub(crate) use allocations::Allocation;
use allocations::{Allocations, Proto};

/// Socket side of a stack.
#[derive(Clone)]
pub struct Net {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    allocations: Allocations,
    _drop: Arc<CloseOnDrop>,
}

/// Packet side of a stack.
#[derive(Clone)]
pub struct Tun {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    port: Arc<Port>,
}

/// Injects packets received from the tunnel into the stack.
#[derive(Debug, Clone)]
pub struct TunWriter {
    inbound: mpsc::UnboundedSender<Bytes>,
}

/// Yields packets the stack wants sent through the tunnel.
#[derive(Debug)]
pub struct TunReader {
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Options {
    pub runtime: Handle,
    pub poll_interval: Duration,
    pub timer_interval: Duration,
    pub dns_timeout: Duration,
    pub tcp: TcpOptions,
    pub udp: UdpOptions,
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TcpOptions {
    pub connect_timeout: Duration,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct UdpOptions {
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

/// Anything sockets can be opened on.
pub trait ToNet {
    fn to_net(self) -> impl Future<Output = Result<Net, io::Error>>;
}

struct Shared {
    is_closed: AtomicBool,
    notify_closed: Notify,
    options: Options,
    dns: Vec<IpAddr>,
    mtu: u16,
}

struct Port {
    inbound: mpsc::UnboundedSender<Bytes>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

#[derive(Debug)]
enum Message {
    Tcp(crate::Shared<tcp::Socket<'static>>),
    Udp(crate::Shared<udp::Socket<'static>>),
    TcpConnect {
        socket: crate::Shared<tcp::Socket<'static>>,
        allocation: Allocation,
        target: SocketAddr,
        result: oneshot::Sender<Result<(), tcp::ConnectError>>,
    },
    Close,
}

pin_project! {
    pub struct Closed<'a> {
        #[pin]
        notified: Notified<'a>,
        shared: Arc<Shared>,
    }
}

/// Creates a stack with the given host addresses.
///
/// Every address is assigned to the interface and the first of each family
/// is the source of outgoing sockets; `dns` servers are used by
/// [`Net::resolve`]. Must be called within a Tokio runtime unless
/// `options` name one.
pub fn create(addresses: &[IpAddr], dns: &[IpAddr], mtu: u16) -> io::Result<(Tun, Net)> {
    create_with(addresses, dns, mtu, Options::default())
}

pub fn create_with(
    addresses: &[IpAddr],
    dns: &[IpAddr],
    mtu: u16,
    options: Options,
) -> io::Result<(Tun, Net)> {
    let address = Address::from_ips(addresses.iter().copied()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface needs at least one address",
        )
    })?;

    let runtime = options.runtime.clone();
    let (tx, messages) = mpsc::unbounded_channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(Shared {
        is_closed: AtomicBool::new(false),
        notify_closed: Notify::new(),
        options,
        dns: dns.to_vec(),
        mtu,
    });

    let (iface, phy) = smol(address, addresses, mtu);
    let driver = Driver {
        iface,
        phy,
        sockets: sockets::Sockets::new(),
        messages,
        inbound,
        outbound,
        shared: NotifyOnDrop(shared.clone()),
    };
    runtime.spawn(driver.run());

    tracing::debug!(%address, mtu, dns = ?dns, "network stack created");

    let tun = Tun {
        tx: tx.clone(),
        shared: shared.clone(),
        port: Arc::new(Port {
            inbound: inbound_tx,
            outbound: Mutex::new(Some(outbound_rx)),
        }),
    };
    let net = Net {
        tx: tx.clone(),
        shared,
        allocations: Allocations::new(address),
        _drop: Arc::new(CloseOnDrop { tx }),
    };
    Ok((tun, net))
}

fn error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "network stack is closed")
}

impl Net {
    pub fn error() -> io::Error {
        error()
    }

    pub fn address(&self) -> Address {
        self.allocations.address
    }

    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.shared.dns
    }

    pub fn mtu(&self) -> u16 {
        self.shared.mtu
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    pub fn close(&self) {
        self.tx.send(Message::Close).ok();
    }

    pub fn closed(&self) -> Closed<'_> {
        Closed {
            notified: self.shared.notify_closed.notified(),
            shared: self.shared.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed.load(Ordering::Acquire)
    }

    /// Opens a TCP connection through the tunnel.
    pub async fn connect(&self, target: SocketAddr) -> io::Result<crate::tcp::TcpStream> {
        crate::tcp::TcpStream::connect(target, self).await
    }

    pub(crate) fn register_tcp(
        &self,
        socket: crate::Shared<tcp::Socket<'static>>,
    ) -> io::Result<()> {
        self.tx.send(Message::Tcp(socket)).map_err(|_| error())
    }

    pub(crate) fn register_udp(
        &self,
        socket: crate::Shared<udp::Socket<'static>>,
    ) -> io::Result<()> {
        self.tx.send(Message::Udp(socket)).map_err(|_| error())
    }

    pub(crate) fn allocate_tcp(&self, address: SocketAddr) -> Option<Allocation> {
        self.allocations.acquire(address, Proto::Tcp)
    }

    pub(crate) fn allocate_udp(&self, address: SocketAddr) -> Option<Allocation> {
        self.allocations.acquire(address, Proto::Udp)
    }

    pub(crate) async fn connect_tcp(
        &self,
        socket: crate::Shared<tcp::Socket<'static>>,
        allocation: Allocation,
        target: SocketAddr,
    ) -> io::Result<Result<(), tcp::ConnectError>> {
        let (tx, result) = oneshot::channel();
        self.tx
            .send(Message::TcpConnect {
                socket,
                allocation,
                target,
                result: tx,
            })
            .map_err(|_| error())?;
        result.await.map_err(|_| error())
    }

    pub(crate) fn deallocate(&self, allocation: Allocation) {
        self.allocations.release(allocation);
    }
}

impl Tun {
    pub fn mtu(&self) -> u16 {
        self.shared.mtu
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed.load(Ordering::Acquire)
    }

    /// Shuts the stack down. Open sockets are aborted.
    pub fn close(&self) {
        self.tx.send(Message::Close).ok();
    }

    /// Takes the packet endpoints of the stack. Only one reader may exist.
    pub fn attach(&self) -> io::Result<(TunWriter, TunReader)> {
        if self.is_closed() {
            return Err(error());
        }
        let outbound = self.port.outbound.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "tun is already attached")
        })?;

        Ok((
            TunWriter {
                inbound: self.port.inbound.clone(),
            },
            TunReader { outbound },
        ))
    }
}

impl TunWriter {
    pub fn write(&self, packet: Bytes) -> io::Result<()> {
        self.inbound.send(packet).map_err(|_| error())
    }
}

impl TunReader {
    pub fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.outbound.poll_recv(cx)
    }

    pub async fn read(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }
}

struct Driver {
    iface: smoltcp::iface::Interface,
    phy: phy::Phy,
    sockets: sockets::Sockets,
    messages: mpsc::UnboundedReceiver<Message>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::UnboundedSender<Bytes>,
    shared: NotifyOnDrop,
}

impl Driver {
    async fn run(self) {
        #[derive(Clone, Copy)]
        enum Close {
            No,
            Requested,
            Ready,
        }

        enum Select {
            Poll,
            Message(Message),
            Received(Option<Bytes>),
            Send,
            Close,
        }

        let Self {
            mut iface,
            mut phy,
            mut sockets,
            mut messages,
            mut inbound,
            outbound,
            shared,
        } = self;

        let poll = time::sleep_until(time::Instant::now());
        tokio::pin!(poll);
        let mut close = Close::No;
        let mut inbound_open = true;

        loop {
            let selected = poll_fn(|cx| {
                if let Poll::Ready(()) = poll.as_mut().poll(cx) {
                    return Poll::Ready(Select::Poll);
                }
                if let Close::No = close {
                    if let Poll::Ready(message) = messages.poll_recv(cx) {
                        // Every handle is gone.
                        return Poll::Ready(Select::Message(message.unwrap_or(Message::Close)));
                    }
                }
                if inbound_open {
                    if let Poll::Ready(packet) = inbound.poll_recv(cx) {
                        return Poll::Ready(Select::Received(packet));
                    }
                }
                if phy.can_send() {
                    Poll::Ready(Select::Send)
                } else if let Close::Ready = close {
                    Poll::Ready(Select::Close)
                } else {
                    Poll::Pending
                }
            })
            .await;

            match selected {
                Select::Poll => {
                    let wait = sockets.with(|s| {
                        let now = smoltcp::time::Instant::now();
                        iface.poll(now, &mut phy, s);
                        iface.poll_delay(now, s).map(time::Duration::from)
                    });
                    match wait {
                        Some(wait) => poll.as_mut().reset(time::Instant::now() + wait),
                        None => {
                            poll.as_mut()
                                .reset(time::Instant::now() + shared.options.poll_interval);
                            if let Close::Requested = close {
                                close = Close::Ready;
                            }
                        }
                    }
                }
                Select::Message(Message::Tcp(socket)) => {
                    sockets.register_tcp(socket);
                    poll.as_mut().reset(time::Instant::now());
                }
                Select::Message(Message::Udp(socket)) => {
                    sockets.register_udp(socket);
                    poll.as_mut().reset(time::Instant::now());
                }
                Select::Message(Message::TcpConnect {
                    socket,
                    allocation,
                    target,
                    result,
                }) => {
                    if let Some(socket) = socket.lock().as_mut() {
                        result
                            .send(socket.connect(iface.context(), target, allocation.address()))
                            .ok();
                    }
                    sockets.register_tcp(socket);
                    poll.as_mut().reset(time::Instant::now());
                }
                Select::Message(Message::Close) => {
                    tracing::debug!(sockets = sockets.len(), "closing network stack");
                    close = Close::Requested;
                    sockets.close();
                    poll.as_mut().reset(time::Instant::now());
                }
                Select::Received(Some(packet)) => {
                    phy.enqueue_received(packet);
                    poll.as_mut().reset(time::Instant::now());
                }
                Select::Received(None) => inbound_open = false,
                Select::Send => {
                    while let Some(packet) = phy.dequeue_sent() {
                        // Nobody reads once the device is gone.
                        outbound.send(packet).ok();
                    }
                }
                Select::Close => break,
            }
        }

        tracing::debug!("network stack closed");
    }
}

/// Assigns every host address, primary ones first.
fn smol(
    address: Address,
    addresses: &[IpAddr],
    mtu: u16,
) -> (smoltcp::iface::Interface, phy::Phy) {
    let mut phy = phy::Phy::new(mtu);
    let mut config = smoltcp::iface::Config::new(HardwareAddress::Ip);
    config.random_seed = OsRng.gen();

    let mut iface = smoltcp::iface::Interface::new(config, &mut phy, smoltcp::time::Instant::now());
    iface.update_ip_addrs(|assigned| {
        for ip in address.ips().chain(addresses.iter().copied()) {
            let cidr: smoltcp::wire::IpCidr = match ip {
                IpAddr::V4(ip) => smoltcp::wire::Ipv4Cidr::new(ip.into(), 32).into(),
                IpAddr::V6(ip) => smoltcp::wire::Ipv6Cidr::new(ip.into(), 128).into(),
            };
            if assigned.contains(&cidr) {
                continue;
            }
            if assigned.push(cidr).is_err() {
                tracing::warn!(%ip, "interface address limit reached, address ignored");
            }
        }
    });
    if let Some(v4) = address.v4() {
        iface.routes_mut().add_default_ipv4_route(v4.into()).ok();
    }
    if let Some(v6) = address.v6() {
        iface.routes_mut().add_default_ipv6_route(v6.into()).ok();
    }

    (iface, phy)
}

impl fmt::Debug for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(type_name::<Self>())
            .field(&self.address())
            .finish()
    }
}

impl fmt::Debug for Tun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("mtu", &self.mtu())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dual(v4, v6) => write!(f, "{v4}+{v6}"),
            Self::V4(ip) => ip.fmt(f),
            Self::V6(ip) => ip.fmt(f),
        }
    }
}

impl ToNet for Net {
    async fn to_net(self) -> Result<Net, io::Error> {
        Ok(self)
    }
}

impl<'a> ToNet for &'a Net {
    async fn to_net(self) -> Result<Net, io::Error> {
        Ok(self.clone())
    }
}

impl<'a> ToNet for &'a mut Net {
    async fn to_net(self) -> Result<Net, io::Error> {
        Ok(self.clone())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            runtime: Handle::current(),
            poll_interval: Duration::from_millis(100),
            timer_interval: Duration::from_millis(250),
            dns_timeout: Duration::from_secs(5),
            tcp: TcpOptions::default(),
            udp: UdpOptions::default(),
        }
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            recv_buffer_size: 64 * 1024,
            send_buffer_size: 16 * 1024,
        }
    }
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            recv_buffer_size: 32 * 1024,
            send_buffer_size: 16 * 1024,
        }
    }
}

impl<'a> Future for Closed<'a> {
    type Output = <Notified<'a> as Future>::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.shared.is_closed.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            self.project().notified.poll(cx)
        }
    }
}

struct CloseOnDrop {
    tx: mpsc::UnboundedSender<Message>,
}

struct NotifyOnDrop(Arc<Shared>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.tx.send(Message::Close).ok();
    }
}

impl Deref for NotifyOnDrop {
    type Target = Shared;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        self.is_closed.store(true, Ordering::Release);
        self.notify_closed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses() -> Vec<IpAddr> {
        vec!["10.0.0.2".parse().unwrap()]
    }

    #[tokio::test]
    async fn requires_an_address() {
        let err = create(&[], &[], 1280).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn tun_attaches_once() {
        let (tun, _net) = create(&addresses(), &[], 1280).unwrap();
        assert!(tun.attach().is_ok());
        assert_eq!(
            tun.attach().unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
    }

    #[tokio::test]
    async fn closing_the_tun_closes_the_net() {
        let (tun, net) = create(&addresses(), &[], 1280).unwrap();
        assert_eq!(net.mtu(), 1280);
        tun.close();
        time::timeout(Duration::from_secs(5), net.closed())
            .await
            .unwrap();
        assert!(net.is_closed());
        assert!(tun.is_closed());
    }

    fn echo_request(src: std::net::Ipv4Addr, dst: std::net::Ipv4Addr) -> Bytes {
        use smoltcp::{
            phy::ChecksumCapabilities,
            wire::{Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Packet, Ipv4Repr},
        };

        let icmp = Icmpv4Repr::EchoRequest {
            ident: 1,
            seq_no: 1,
            data: b"ping",
        };
        let ip = Ipv4Repr {
            src_addr: src.into(),
            dst_addr: dst.into(),
            next_header: IpProtocol::Icmp,
            payload_len: icmp.buffer_len(),
            hop_limit: 64,
        };

        let caps = ChecksumCapabilities::default();
        let mut buffer = vec![0; ip.buffer_len() + icmp.buffer_len()];
        let mut packet = Ipv4Packet::new_unchecked(&mut buffer);
        ip.emit(&mut packet, &caps);
        icmp.emit(&mut Icmpv4Packet::new_unchecked(packet.payload_mut()), &caps);
        Bytes::from(buffer)
    }

    #[tokio::test]
    async fn every_address_is_assigned() {
        let addresses: [IpAddr; 3] = ["10.0.0.2", "10.0.0.3", "fd00::2"].map(|a| a.parse().unwrap());
        let (tun, net) = create(&addresses, &[], 1280).unwrap();
        assert_eq!(net.address().v4(), Some([10, 0, 0, 2].into()));
        let (writer, mut reader) = tun.attach().unwrap();

        writer
            .write(echo_request([10, 0, 0, 1].into(), [10, 0, 0, 3].into()))
            .unwrap();
        let reply = time::timeout(Duration::from_secs(5), reader.read())
            .await
            .unwrap()
            .unwrap();
        // ICMP from the second address back to the sender.
        assert_eq!(reply[9], 1);
        assert_eq!(&reply[12..16], &[10, 0, 0, 3]);
        assert_eq!(&reply[16..20], &[10, 0, 0, 1]);
    }

    #[tokio::test]
    async fn outgoing_connections_emit_packets() {
        let (tun, net) = create(&addresses(), &[], 1280).unwrap();
        let (_writer, mut reader) = tun.attach().unwrap();

        let connect = tokio::spawn({
            let net = net.clone();
            async move { net.connect("10.0.0.1:80".parse().unwrap()).await }
        });

        let syn = time::timeout(Duration::from_secs(5), reader.read())
            .await
            .unwrap()
            .unwrap();
        // IPv4, source 10.0.0.2, destination 10.0.0.1, TCP.
        assert_eq!(syn[0] >> 4, 4);
        assert_eq!(syn[9], 6);
        assert_eq!(&syn[12..16], &[10, 0, 0, 2]);
        assert_eq!(&syn[16..20], &[10, 0, 0, 1]);

        connect.abort();
    }
}
