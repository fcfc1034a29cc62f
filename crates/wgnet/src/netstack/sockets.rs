use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use smoltcp::{
    iface::{SocketHandle, SocketSet},
    socket::{tcp, udp, AnySocket, Socket},
};

/// Sockets owned by user handles, lent to smoltcp for the duration of a poll.
pub struct Sockets {
    set: SocketSet<'static>,
    tcp: Registry<tcp::Socket<'static>>,
    udp: Registry<udp::Socket<'static>>,
}

/// Protocol specific lifecycle of a registered socket.
trait Managed: AnySocket<'static> + Sized {
    fn extract(socket: Socket<'static>) -> Option<Self>;

    fn shutdown(&mut self);

    /// Called when lending a socket whose user handle was dropped.
    fn orphaned(&mut self) {}

    /// Whether the socket goes back to its slot after a poll.
    fn retain(&self, orphaned: bool) -> bool;
}

struct Registry<T> {
    sockets: Vec<crate::Shared<T>>,
    lent: Vec<(SocketHandle, ArcMutexGuard<RawMutex, Option<T>>)>,
}

impl Sockets {
    pub fn new() -> Self {
        Self {
            set: SocketSet::new(Vec::new()),
            tcp: Registry::new(),
            udp: Registry::new(),
        }
    }

    pub fn register_tcp(&mut self, socket: crate::Shared<tcp::Socket<'static>>) {
        self.tcp.register(socket);
    }

    pub fn register_udp(&mut self, socket: crate::Shared<udp::Socket<'static>>) {
        self.udp.register(socket);
    }

    pub fn len(&self) -> usize {
        self.tcp.sockets.len() + self.udp.sockets.len()
    }

    /// Aborts every TCP connection and closes every UDP socket.
    pub fn close(&mut self) {
        self.tcp.shutdown();
        self.udp.shutdown();
    }

    pub fn with<R>(&mut self, f: impl FnOnce(&mut SocketSet<'static>) -> R) -> R {
        let Self { set, tcp, udp } = self;

        tcp.lend(set);
        udp.lend(set);
        let result = f(set);
        tcp.reclaim(set);
        udp.reclaim(set);

        result
    }
}

impl<T: Managed> Registry<T> {
    const fn new() -> Self {
        Self {
            sockets: Vec::new(),
            lent: Vec::new(),
        }
    }

    /// Reuses the slot of a socket no one else references, if any.
    fn register(&mut self, socket: crate::Shared<T>) {
        let free = self
            .sockets
            .iter_mut()
            .position(|s| Arc::get_mut(s).map(Mutex::get_mut).is_some_and(|s| s.is_none()));

        match free {
            Some(slot) => self.sockets[slot] = socket,
            None => self.sockets.push(socket),
        }
    }

    fn shutdown(&mut self) {
        for socket in &self.sockets {
            if let Some(socket) = &mut *socket.lock() {
                socket.shutdown();
            }
        }
    }

    fn lend(&mut self, set: &mut SocketSet<'static>) {
        let Self { sockets, lent } = self;

        for socket in sockets {
            let mut guard = socket.lock_arc();
            if let Some(mut socket) = guard.take() {
                if is_orphaned(&guard) {
                    socket.orphaned();
                }
                lent.push((set.add(socket), guard));
            }
        }
    }

    fn reclaim(&mut self, set: &mut SocketSet<'static>) {
        while let Some((handle, mut guard)) = self.lent.pop() {
            let Some(socket) = T::extract(set.remove(handle)) else {
                continue;
            };
            if socket.retain(is_orphaned(&guard)) {
                guard.replace(socket);
            }
        }
    }
}

/// One reference from the registry plus the guard itself.
fn is_orphaned<T>(guard: &ArcMutexGuard<RawMutex, Option<T>>) -> bool {
    Arc::strong_count(ArcMutexGuard::mutex(guard)) == 2
}

impl Managed for tcp::Socket<'static> {
    fn extract(socket: Socket<'static>) -> Option<Self> {
        match socket {
            Socket::Tcp(socket) => Some(socket),
            _ => None,
        }
    }

    fn shutdown(&mut self) {
        self.abort();
    }

    fn orphaned(&mut self) {
        self.abort();
    }

    fn retain(&self, _: bool) -> bool {
        !matches!(
            (self.state(), self.local_endpoint()),
            (tcp::State::Closed, None)
        )
    }
}

impl Managed for udp::Socket<'static> {
    fn extract(socket: Socket<'static>) -> Option<Self> {
        match socket {
            Socket::Udp(socket) => Some(socket),
            _ => None,
        }
    }

    fn shutdown(&mut self) {
        self.close();
    }

    fn retain(&self, orphaned: bool) -> bool {
        !orphaned
    }
}
