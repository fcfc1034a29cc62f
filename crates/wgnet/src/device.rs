//! A userspace WireGuard device.
//!
//! A [`Device`] moves packets between a [`Tun`] and a [`UdpBind`], encrypting
//! towards peers and decrypting from them. It is configured with UAPI `set`
//! text through [`Device::ipc_set`] and started with [`Device::up`].

use std::{
    fmt,
    future::{poll_fn, Future},
    io,
    net::SocketAddr,
    sync::Arc,
    task::Poll,
};

use bytes::Bytes;
use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::mpsc, time};
use tokio_util::sync::CancellationToken;

use crate::{
    key::Key,
    netstack::Tun,
    uapi::{self, Operation},
};

mod bind;
mod tunnel;

pub use bind::UdpBind;

#[derive(Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

struct Inner {
    tun: Tun,
    bind: UdpBind,
    settings: Mutex<Settings>,
    updates: Mutex<Option<mpsc::UnboundedSender<Settings>>>,
    cancel: CancellationToken,
    runtime: Handle,
}

/// Device configuration accumulated from UAPI operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub private_key: Option<Key>,
    pub listen_port: Option<u16>,
    pub fw_mark: Option<u32>,
    pub peers: Vec<PeerSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSettings {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
    pub allowed_ips: Vec<IpNet>,
}

impl Device {
    pub fn new(tun: &Tun, bind: &UdpBind) -> Self {
        Self {
            inner: Arc::new(Inner {
                tun: tun.clone(),
                bind: bind.clone(),
                settings: Mutex::default(),
                updates: Mutex::default(),
                cancel: CancellationToken::new(),
                runtime: tun.options().runtime.clone(),
            }),
        }
    }

    /// Applies a UAPI `set` body. A running device picks the changes up.
    ///
    /// Nothing is applied if any line is invalid.
    pub fn ipc_set(&self, text: &str) -> io::Result<()> {
        let operations = uapi::parse(text)?;

        let mut settings = self.inner.settings.lock();
        let mut next = settings.clone();
        next.apply(operations);

        if next.listen_port != settings.listen_port {
            if let Some(port) = next.listen_port {
                self.inner.bind.open(port)?;
            }
        }
        if next.fw_mark != settings.fw_mark {
            self.inner.bind.set_mark(next.fw_mark.unwrap_or(0))?;
        }

        if let Some(updates) = &*self.inner.updates.lock() {
            updates.send(next.clone()).ok();
        }
        tracing::debug!(peers = next.peers.len(), "device configured");
        *settings = next;
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        self.inner.settings.lock().clone()
    }

    /// Starts moving packets. The bind must be open and a private key set.
    pub fn up(&self) -> io::Result<()> {
        let settings = self.inner.settings.lock();
        let mut updates = self.inner.updates.lock();
        if updates.is_some() {
            return Ok(());
        }
        if self.inner.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device is closed"));
        }

        let socket = self.inner.bind.socket()?;
        let tunnel = tunnel::Tunnel::new(&settings, socket)?;
        let (writer, reader) = self.inner.tun.attach()?;
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner.runtime.spawn(run(
            tunnel,
            writer,
            reader,
            rx,
            self.inner.cancel.clone(),
            self.inner.tun.options().timer_interval,
        ));
        *updates = Some(tx);

        tracing::info!("device up");
        Ok(())
    }

    pub fn is_up(&self) -> bool {
        self.inner.updates.lock().is_some() && !self.inner.cancel.is_cancelled()
    }

    /// Stops the device. Closing twice is harmless.
    pub fn close(&self) -> io::Result<()> {
        if !self.inner.cancel.is_cancelled() {
            self.inner.cancel.cancel();
            tracing::debug!("device closed");
        }
        Ok(())
    }
}

async fn run(
    mut tunnel: tunnel::Tunnel,
    writer: crate::netstack::TunWriter,
    mut reader: crate::netstack::TunReader,
    mut updates: mpsc::UnboundedReceiver<Settings>,
    cancel: CancellationToken,
    timer_interval: time::Duration,
) {
    enum Select {
        Close,
        Update(Settings),
        Recv,
        Send(Bytes),
        Timers,
    }

    let cancelled = cancel.cancelled();
    tokio::pin!(cancelled);
    let mut timers = time::interval(timer_interval);
    timers.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        let selected = poll_fn(|cx| {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Select::Close);
            }
            if let Poll::Ready(Some(settings)) = updates.poll_recv(cx) {
                return Poll::Ready(Select::Update(settings));
            }
            if tunnel.socket().poll_recv_ready(cx).is_ready() {
                return Poll::Ready(Select::Recv);
            }
            match reader.poll_read(cx) {
                Poll::Ready(Some(packet)) => return Poll::Ready(Select::Send(packet)),
                // The stack is gone.
                Poll::Ready(None) => return Poll::Ready(Select::Close),
                Poll::Pending => {}
            }
            if timers.poll_tick(cx).is_ready() {
                Poll::Ready(Select::Timers)
            } else {
                Poll::Pending
            }
        })
        .await;

        match selected {
            Select::Close => break,
            Select::Update(settings) => {
                if let Err(err) = tunnel.configure(&settings) {
                    tracing::warn!(%err, "ignoring device update");
                }
            }
            Select::Recv => {
                if let Some(packet) = tunnel.recv().await {
                    if writer.write(Bytes::copy_from_slice(packet)).is_err() {
                        break;
                    }
                }
            }
            Select::Send(packet) => tunnel.send(&packet).await,
            Select::Timers => tunnel.update_timers().await,
        }
    }

    tracing::debug!("device stopped");
}

impl Settings {
    /// Applies operations in order, the way a WireGuard device does.
    pub fn apply(&mut self, operations: impl IntoIterator<Item = Operation>) {
        // Index of the peer later operations refer to; `None` after a
        // removal or before any `public_key`.
        let mut current: Option<usize> = None;
        let mut created = false;

        for operation in operations {
            match operation {
                Operation::PrivateKey(key) => {
                    self.private_key = (!key.is_zero()).then_some(key);
                }
                Operation::ListenPort(port) => self.listen_port = Some(port),
                Operation::FwMark(mark) => self.fw_mark = (mark != 0).then_some(mark),
                Operation::ReplacePeers => {
                    self.peers.clear();
                    current = None;
                }
                Operation::PublicKey(key) => {
                    match self.peers.iter().position(|p| p.public_key == key) {
                        Some(i) => {
                            current = Some(i);
                            created = false;
                        }
                        None => {
                            self.peers.push(PeerSettings::new(key));
                            current = Some(self.peers.len() - 1);
                            created = true;
                        }
                    }
                }
                Operation::ProtocolVersion(_) => {}
                operation => {
                    let Some(i) = current else {
                        continue;
                    };
                    match operation {
                        Operation::Remove => {
                            self.peers.remove(i);
                            current = None;
                        }
                        Operation::UpdateOnly if created => {
                            self.peers.remove(i);
                            current = None;
                        }
                        operation => self.peers[i].apply(operation),
                    }
                }
            }
        }
    }
}

impl PeerSettings {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            allowed_ips: Vec::new(),
        }
    }

    fn apply(&mut self, operation: Operation) {
        match operation {
            Operation::PresharedKey(key) => self.preshared_key = (!key.is_zero()).then_some(key),
            Operation::Endpoint(endpoint) => self.endpoint = Some(endpoint),
            Operation::PersistentKeepaliveInterval(interval) => {
                self.persistent_keepalive = (interval != 0).then_some(interval)
            }
            Operation::ReplaceAllowedIps => self.allowed_ips.clear(),
            Operation::AllowedIp(net) => {
                let net = net.trunc();
                if !self.allowed_ips.contains(&net) {
                    self.allowed_ips.push(net);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("bind", &self.inner.bind)
            .field("up", &self.is_up())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
