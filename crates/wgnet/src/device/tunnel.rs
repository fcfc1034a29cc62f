use std::{
    collections::HashSet,
    io, mem,
    net::{IpAddr, SocketAddr, SocketAddrV6},
    sync::Arc,
    time::{Duration, Instant},
};

use boringtun::noise::{
    handshake::parse_handshake_anon, rate_limiter::RateLimiter, HandshakeResponse, Packet,
    PacketCookieReply, PacketData, Tunn, TunnResult,
};
use ipnet::IpNet;
use rand::{rngs::OsRng, Rng};
use tokio::net::UdpSocket;

use super::{PeerSettings, Settings};
use crate::key::{Key, PublicKey, StaticSecret};

/// Handshakes per second above which cookies are required.
const HANDSHAKE_LIMIT: u64 = 64;
const RATE_LIMITER_RESET: Duration = Duration::from_secs(1);

/// WireGuard sessions with every configured peer over one UDP socket.
pub struct Tunnel {
    private_key: Key,
    keypair: (StaticSecret, PublicKey),
    peers: Vec<Peer>,
    indices: Indices,
    rate_limiter: Arc<RateLimiter>,
    last_reset: Instant,
    buffers: (Vec<u8>, Vec<u8>),
    socket: Arc<UdpSocket>,
    dual_stack: bool,
}

struct Peer {
    public_key: Key,
    preshared_key: Option<Key>,
    persistent_keepalive: Option<u16>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    tunnel: Tunn,
    index: u32,
}

/// Unique 24 bit session index prefixes.
#[derive(Default)]
struct Indices {
    used: HashSet<u32>,
}

impl Tunnel {
    pub fn new(settings: &Settings, socket: Arc<UdpSocket>) -> io::Result<Self> {
        let private_key = private_key(settings)?;
        let secret = private_key.secret();
        let public = PublicKey::from(&secret);

        let mut tunnel = Self {
            private_key,
            keypair: (secret, public),
            peers: Vec::new(),
            indices: Indices::default(),
            rate_limiter: Arc::new(RateLimiter::new(&public, HANDSHAKE_LIMIT)),
            last_reset: Instant::now(),
            buffers: (vec![0; u16::MAX as usize], vec![0; u16::MAX as usize]),
            dual_stack: socket.local_addr().map_or(false, |a| a.is_ipv6()),
            socket,
        };
        tunnel.configure(settings)?;
        Ok(tunnel)
    }

    /// Applies new settings, keeping the sessions of unchanged peers.
    pub fn configure(&mut self, settings: &Settings) -> io::Result<()> {
        let private_key = private_key(settings)?;
        let mut previous = mem::take(&mut self.peers);

        if private_key != self.private_key {
            let secret = private_key.secret();
            let public = PublicKey::from(&secret);
            self.private_key = private_key;
            self.keypair = (secret, public);
            self.rate_limiter = Arc::new(RateLimiter::new(&public, HANDSHAKE_LIMIT));
            for peer in previous.drain(..) {
                self.indices.release(peer.index);
            }
        }

        for settings in &settings.peers {
            let kept = previous
                .iter()
                .position(|p| p.is_compatible(settings))
                .map(|i| previous.swap_remove(i));

            let peer = match kept {
                Some(mut peer) => {
                    peer.allowed_ips.clone_from(&settings.allowed_ips);
                    if settings.endpoint.is_some() {
                        peer.endpoint = settings.endpoint;
                    }
                    peer
                }
                None => self.peer(settings),
            };
            self.peers.push(peer);
        }

        for peer in previous {
            self.indices.release(peer.index);
        }
        tracing::debug!(peers = self.peers.len(), "tunnel configured");
        Ok(())
    }

    fn peer(&mut self, settings: &PeerSettings) -> Peer {
        let index = self.indices.next();
        let tunnel = Tunn::new(
            self.keypair.0.clone(),
            PublicKey::from(settings.public_key),
            settings.preshared_key.map(|k| *k.as_bytes()),
            settings.persistent_keepalive,
            index,
            Some(self.rate_limiter.clone()),
        );

        Peer {
            public_key: settings.public_key,
            preshared_key: settings.preshared_key,
            persistent_keepalive: settings.persistent_keepalive,
            endpoint: settings.endpoint,
            allowed_ips: settings.allowed_ips.clone(),
            tunnel,
            index,
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Handles one datagram from the socket and returns the IP packet it
    /// carried, if any. Handshake replies are sent from here.
    pub async fn recv(&mut self) -> Option<&[u8]> {
        let Self {
            keypair: (private, public),
            peers,
            buffers,
            socket,
            dual_stack,
            ..
        } = self;

        let (len, source) = socket.try_recv_from(&mut buffers.0).ok()?;
        let source = unmapped(source);

        let peer = match Tunn::parse_incoming_packet(&buffers.0[..len]).ok()? {
            Packet::HandshakeInit(packet) => {
                let handshake = parse_handshake_anon(private, public, &packet).ok()?;
                peers
                    .iter_mut()
                    .find(|p| p.public_key.as_bytes() == &handshake.peer_static_public)
            }
            Packet::HandshakeResponse(HandshakeResponse { receiver_idx, .. })
            | Packet::PacketCookieReply(PacketCookieReply { receiver_idx, .. })
            | Packet::PacketData(PacketData { receiver_idx, .. }) => {
                peers.iter_mut().find(|p| p.index == receiver_idx >> 8)
            }
        };
        let Some(peer) = peer else {
            tracing::trace!(%source, "datagram from unknown peer");
            return None;
        };

        let packet = match peer
            .tunnel
            .decapsulate(Some(source.ip()), &buffers.0[..len], &mut buffers.1)
        {
            TunnResult::Done => None,
            TunnResult::Err(err) => {
                tracing::trace!(%source, ?err, "dropping datagram");
                return None;
            }
            TunnResult::WriteToNetwork(datagram) => {
                socket.send_to(datagram, mapped(*dual_stack, source)).await.ok();
                // Packets queued while the handshake was in flight.
                while let TunnResult::WriteToNetwork(queued) =
                    peer.tunnel.decapsulate(None, &[], &mut buffers.0)
                {
                    socket.send_to(queued, mapped(*dual_stack, source)).await.ok();
                }
                None
            }
            TunnResult::WriteToTunnelV4(packet, src) if peer.allows(src.into()) => Some(packet),
            TunnResult::WriteToTunnelV6(packet, src) if peer.allows(src.into()) => Some(packet),
            TunnResult::WriteToTunnelV4(_, src) => {
                tracing::trace!(%src, "source outside allowed IPs");
                None
            }
            TunnResult::WriteToTunnelV6(_, src) => {
                tracing::trace!(%src, "source outside allowed IPs");
                None
            }
        };

        if peer.endpoint != Some(source) {
            tracing::debug!(peer = ?peer.public_key, endpoint = %source, "peer endpoint updated");
            peer.endpoint = Some(source);
        }
        packet.map(|p| &*p)
    }

    /// Encrypts an IP packet for the peer routing its destination.
    pub async fn send(&mut self, packet: &[u8]) {
        let Self {
            peers,
            buffers,
            socket,
            dual_stack,
            ..
        } = self;

        let Some(destination) = Tunn::dst_address(packet) else {
            return;
        };
        let Some(peer) = route(peers, destination) else {
            tracing::trace!(%destination, "no peer for destination");
            return;
        };
        let Some(endpoint) = peer.endpoint else {
            tracing::trace!(peer = ?peer.public_key, "peer has no endpoint");
            return;
        };

        match peer.tunnel.encapsulate(packet, &mut buffers.1) {
            TunnResult::WriteToNetwork(datagram) => {
                socket.send_to(datagram, mapped(*dual_stack, endpoint)).await.ok();
            }
            TunnResult::Err(err) => tracing::trace!(?err, "encapsulation failed"),
            _ => {}
        }
    }

    pub async fn update_timers(&mut self) {
        if self.last_reset.elapsed() >= RATE_LIMITER_RESET {
            self.rate_limiter.reset_count();
            self.last_reset = Instant::now();
        }

        let Self {
            peers,
            buffers,
            socket,
            dual_stack,
            ..
        } = self;

        for peer in peers.iter_mut() {
            match peer.tunnel.update_timers(&mut buffers.0) {
                TunnResult::WriteToNetwork(datagram) => {
                    if let Some(endpoint) = peer.endpoint {
                        socket.send_to(datagram, mapped(*dual_stack, endpoint)).await.ok();
                    }
                }
                TunnResult::Err(err) => {
                    tracing::trace!(peer = ?peer.public_key, ?err, "timer error")
                }
                _ => {}
            }
        }
    }
}

impl Peer {
    fn is_compatible(&self, settings: &PeerSettings) -> bool {
        self.public_key == settings.public_key
            && self.preshared_key == settings.preshared_key
            && self.persistent_keepalive == settings.persistent_keepalive
    }

    fn allows(&self, address: IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(&address))
    }

    fn prefix_for(&self, address: IpAddr) -> Option<u8> {
        self.allowed_ips
            .iter()
            .filter(|net| net.contains(&address))
            .map(IpNet::prefix_len)
            .max()
    }
}

/// Longest prefix match over the allowed IPs of every peer.
fn route(peers: &mut [Peer], destination: IpAddr) -> Option<&mut Peer> {
    peers
        .iter_mut()
        .filter_map(|p| p.prefix_for(destination).map(|len| (len, p)))
        .max_by_key(|(len, _)| *len)
        .map(|(_, p)| p)
}

impl Indices {
    fn next(&mut self) -> u32 {
        loop {
            let index = OsRng.gen_range(0..1 << 24);
            if self.used.insert(index) {
                break index;
            }
        }
    }

    fn release(&mut self, index: u32) {
        self.used.remove(&index);
    }
}

fn private_key(settings: &Settings) -> io::Result<Key> {
    settings
        .private_key
        .filter(|k| !k.is_zero())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "device has no private key"))
}

/// A dual-stack socket reaches IPv4 peers through mapped addresses.
fn mapped(dual_stack: bool, endpoint: SocketAddr) -> SocketAddr {
    match endpoint {
        SocketAddr::V4(addr) if dual_stack => {
            SocketAddrV6::new(addr.ip().to_ipv6_mapped(), addr.port(), 0, 0).into()
        }
        v6 => v6,
    }
}

fn unmapped(source: SocketAddr) -> SocketAddr {
    match source {
        SocketAddr::V6(addr) => match addr.ip().to_ipv4_mapped() {
            Some(ip) => SocketAddr::new(ip.into(), addr.port()),
            None => source,
        },
        v4 => v4,
    }
}
