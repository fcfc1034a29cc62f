//! Readiness plumbing between user handles and sockets owned by the stack.

use std::{
    ops::Deref,
    sync::Arc,
    task::{Context, Poll, Wake, Waker},
};

use atomic_waker::AtomicWaker;
use parking_lot::Mutex;
use tokio::{
    io::{Error, ErrorKind, Interest, Ready, Result},
    sync::Notify,
};

use crate::{netstack::Allocation, Net, Shared};

/// A smoltcp socket shared with the stack, plus the port it holds.
pub struct IO<E: Evented> {
    net: Net,
    evented: Shared<E>,
    lease: Option<Arc<Lease>>,
    wake: Arc<WakeState>,
    wakers: Wakers,
}

pub trait Evented {
    fn readiness(&self) -> Ready;

    fn register_read_waker(&mut self, waker: &Waker);
    fn register_write_waker(&mut self, waker: &Waker);
}

impl<E: Evented> IO<E> {
    pub fn new(net: Net, evented: E, allocation: Option<Allocation>) -> Self {
        let wake = Arc::new(WakeState::default());
        let wakers = Wakers {
            read: Waker::from(Arc::new(Direction {
                state: wake.clone(),
                read: true,
            })),
            write: Waker::from(Arc::new(Direction {
                state: wake.clone(),
                read: false,
            })),
        };

        Self {
            lease: allocation.map(|allocation| {
                Arc::new(Lease {
                    net: net.clone(),
                    allocation,
                })
            }),
            net,
            evented: Arc::new(Mutex::new(Some(evented))),
            wake,
            wakers,
        }
    }

    pub fn net(&self) -> &Net {
        &self.net
    }

    pub fn allocation(&self) -> Option<Allocation> {
        self.lease.as_ref().map(|lease| lease.allocation)
    }

    /// Runs `f` on the socket, failing once the stack or the socket is gone.
    pub fn with<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut E) -> R,
    {
        if self.net.is_closed() {
            return Err(Net::error());
        }

        self.evented
            .lock()
            .as_mut()
            .map(f)
            .ok_or_else(Net::error)
    }

    pub fn try_io<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut E) -> Poll<Result<R>>,
    {
        match self.with(f)? {
            Poll::Ready(result) => result,
            Poll::Pending => Err(Error::from(ErrorKind::WouldBlock)),
        }
    }

    pub async fn io<F, R>(&self, interest: Interest, mut f: F) -> Result<R>
    where
        F: FnMut(&mut E) -> Poll<Result<R>>,
    {
        loop {
            let notified = self.wake.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let poll = self.with(|e| {
                self.register(e, interest);
                f(e)
            })?;

            match poll {
                Poll::Pending => notified.await,
                Poll::Ready(result) => break result,
            }
        }
    }

    pub async fn ready(&self, interest: Interest) -> Result<Ready> {
        loop {
            let notified = self.wake.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = self.with(|e| {
                let ready = e.readiness();
                if satisfies(ready, interest) {
                    Some(ready)
                } else {
                    self.register(e, interest);
                    None
                }
            })?;

            match ready {
                None => notified.await,
                Some(ready) => break Ok(ready),
            }
        }
    }

    pub fn poll_io<F, R>(&self, interest: Interest, cx: &mut Context<'_>, f: F) -> Poll<Result<R>>
    where
        F: FnOnce(&mut E) -> Poll<Result<R>>,
    {
        let result = self.with(|e| {
            let poll = f(e);
            if poll.is_pending() {
                self.register_task(e, interest, cx);
            }
            poll
        });
        match result {
            Ok(poll) => poll,
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    pub fn poll_ready(&self, interest: Interest, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let result = self.with(|e| {
            if satisfies(e.readiness(), interest) {
                Poll::Ready(Ok(()))
            } else {
                self.register_task(e, interest, cx);
                Poll::Pending
            }
        });
        match result {
            Ok(poll) => poll,
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn register(&self, e: &mut E, interest: Interest) {
        if interest.is_readable() || interest.is_error() {
            e.register_read_waker(&self.wakers.read);
        }
        if interest.is_writable() || interest.is_error() {
            e.register_write_waker(&self.wakers.write);
        }
    }

    fn register_task(&self, e: &mut E, interest: Interest, cx: &mut Context<'_>) {
        if interest.is_readable() || interest.is_error() {
            self.wake.read.register(cx.waker());
        }
        if interest.is_writable() || interest.is_error() {
            self.wake.write.register(cx.waker());
        }
        self.register(e, interest);
    }
}

impl<E: Evented> Clone for IO<E> {
    fn clone(&self) -> Self {
        Self {
            net: self.net.clone(),
            evented: self.evented.clone(),
            lease: self.lease.clone(),
            wake: self.wake.clone(),
            wakers: self.wakers.clone(),
        }
    }
}

impl<E: Evented> Deref for IO<E> {
    type Target = Shared<E>;

    fn deref(&self) -> &Self::Target {
        &self.evented
    }
}

/// Releases the local port once every handle to the socket is gone.
struct Lease {
    net: Net,
    allocation: Allocation,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.net.deallocate(self.allocation);
    }
}

fn satisfies(readiness: Ready, interest: Interest) -> bool {
    let mut anyof = Ready::EMPTY;
    if interest.is_readable() || interest.is_error() {
        anyof |= Ready::READABLE | Ready::READ_CLOSED;
    }
    if interest.is_writable() || interest.is_error() {
        anyof |= Ready::WRITABLE | Ready::WRITE_CLOSED;
    }
    anyof & readiness != Ready::EMPTY
}

#[derive(Default)]
struct WakeState {
    notify: Notify,
    read: AtomicWaker,
    write: AtomicWaker,
}

#[derive(Clone)]
struct Wakers {
    read: Waker,
    write: Waker,
}

struct Direction {
    state: Arc<WakeState>,
    read: bool,
}

impl Wake for Direction {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.state.notify.notify_waiters();
        if self.read {
            self.state.read.wake();
        } else {
            self.state.write.wake();
        }
    }
}
