//! Brings a WireGuard device up from a [`Config`] and tears it down again.
//!
//! The [`Orchestrator`] drives three collaborators supplied by a [`Stack`]:
//! a virtual interface with its network stack, a transport bind and the
//! device itself. Startup walks [`State::Created`], [`State::Bound`],
//! [`State::Configured`] and [`State::Up`] in order; a failure at any stage
//! releases whatever was acquired and is reported as a [`DeviceError`].
//! Once up, cancelling the token given to [`Orchestrator::start`] closes
//! every resource exactly once, in reverse order of acquisition.

use std::{fmt, io, net::IpAddr, sync::Arc};

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{DeviceError, TeardownError},
};

mod userspace;

pub use userspace::Userspace;

pub trait Close {
    fn close(&self) -> io::Result<()>;
}

/// Transport the device sends encrypted packets through.
pub trait Bind: Close {
    /// Returns the bound port, which differs from `port` when it is 0.
    fn open(&self, port: u16) -> io::Result<u16>;

    fn set_mark(&self, mark: u32) -> io::Result<()>;
}

pub trait Device: Close {
    /// Applies UAPI `set` text in one call.
    fn ipc_set(&self, uapi: &str) -> io::Result<()>;

    fn up(&self) -> io::Result<()>;
}

/// Creates the collaborators of a device.
pub trait Stack {
    type Tun: Close + Send + Sync + 'static;
    /// Handle through which connections are made and names resolved.
    type Net;
    type Bind: Bind + Send + Sync + 'static;
    type Device: Device + Send + Sync + 'static;

    fn create_tun(
        &self,
        addresses: &[IpAddr],
        dns: &[IpAddr],
        mtu: u16,
    ) -> io::Result<(Self::Tun, Self::Net)>;

    fn create_bind(&self) -> io::Result<Self::Bind>;

    fn create_device(&self, tun: &Self::Tun, bind: &Self::Bind) -> io::Result<Self::Device>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Created,
    Bound,
    Configured,
    Up,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Orchestrator<S> {
    stack: S,
}

/// A device that reached [`State::Up`].
pub struct Running<N> {
    net: N,
    port: u16,
    state: watch::Receiver<State>,
    teardown: JoinHandle<Vec<TeardownError>>,
}

/// Close operations in acquisition order.
#[derive(Default)]
struct Teardown {
    resources: Vec<(&'static str, Arc<dyn Close + Send + Sync>)>,
}

impl<S: Stack> Orchestrator<S> {
    pub fn new(stack: S) -> Self {
        Self { stack }
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    /// Brings the device up. `config` is only read.
    ///
    /// Must be called within a Tokio runtime: the teardown listener is
    /// spawned on it.
    pub fn start(
        &self,
        config: &Config,
        cancel: CancellationToken,
    ) -> Result<Running<S::Net>, DeviceError> {
        let (state, watcher) = watch::channel(State::Created);
        let mut teardown = Teardown::default();

        match self.acquire(config, &mut teardown, &state) {
            Ok((net, port)) => {
                let task = tokio::spawn(async move {
                    cancel.cancelled().await;
                    transition(&state, State::Closing);
                    let errors = teardown.run();
                    transition(&state, State::Closed);
                    errors
                });

                Ok(Running {
                    net,
                    port,
                    state: watcher,
                    teardown: task,
                })
            }
            Err(err) => {
                tracing::error!(%err, "device startup failed");
                transition(&state, State::Closing);
                teardown.run();
                transition(&state, State::Closed);
                Err(err)
            }
        }
    }

    fn acquire(
        &self,
        config: &Config,
        teardown: &mut Teardown,
        state: &watch::Sender<State>,
    ) -> Result<(S::Net, u16), DeviceError> {
        let interface = &config.interface;

        let addresses: Vec<IpAddr> = interface.host_addresses().collect();
        let (tun, net) = self
            .stack
            .create_tun(&addresses, &interface.dns, interface.mtu)
            .map_err(fail(State::Created))?;
        let tun = teardown.register("interface", tun);
        transition(state, State::Created);

        let bind = self.stack.create_bind().map_err(fail(State::Bound))?;
        let bind = teardown.register("bind", bind);
        let port = bind.open(interface.listen_port).map_err(fail(State::Bound))?;
        if interface.fw_mark != 0 {
            bind.set_mark(interface.fw_mark)
                .map_err(fail(State::Bound))?;
        }
        tracing::debug!(port, fw_mark = interface.fw_mark, "bind open");
        transition(state, State::Bound);

        let device = self
            .stack
            .create_device(&tun, &bind)
            .map_err(fail(State::Configured))?;
        let device = teardown.register("device", device);
        device
            .ipc_set(&config.to_uapi())
            .map_err(fail(State::Configured))?;
        transition(state, State::Configured);

        device.up().map_err(fail(State::Up))?;
        transition(state, State::Up);

        Ok((net, port))
    }
}

fn fail(stage: State) -> impl FnOnce(io::Error) -> DeviceError {
    move |source| DeviceError { stage, source }
}

fn transition(state: &watch::Sender<State>, next: State) {
    state.send_replace(next);
    match next {
        State::Up | State::Closed => tracing::info!(state = %next, "device state changed"),
        _ => tracing::debug!(state = %next, "device state changed"),
    }
}

impl Teardown {
    fn register<T: Close + Send + Sync + 'static>(&mut self, name: &'static str, resource: T) -> Arc<T> {
        let resource = Arc::new(resource);
        self.resources.push((name, resource.clone()));
        resource
    }

    /// Closes everything, newest first, whatever the individual outcomes.
    fn run(self) -> Vec<TeardownError> {
        let mut errors = Vec::new();
        for (resource, close) in self.resources.into_iter().rev() {
            match close.close() {
                Ok(()) => tracing::debug!(resource, "closed"),
                Err(source) => {
                    tracing::warn!(resource, error = %source, "close failed");
                    errors.push(TeardownError { resource, source });
                }
            }
        }
        errors
    }
}

impl<N> Running<N> {
    pub fn net(&self) -> &N {
        &self.net
    }

    /// The port the bind ended up on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<State> {
        self.state.clone()
    }

    /// Waits for teardown to finish and returns the closes that failed.
    pub async fn closed(self) -> Vec<TeardownError> {
        match self.teardown.await {
            Ok(errors) => errors,
            Err(err) => {
                tracing::error!(%err, "teardown task failed");
                Vec::new()
            }
        }
    }
}

impl<N: fmt::Debug> fmt::Debug for Running<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Running")
            .field("net", &self.net)
            .field("port", &self.port)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Bound => "bound",
            Self::Configured => "configured",
            Self::Up => "up",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

impl<T: Close + ?Sized> Close for Arc<T> {
    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct Flaky {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Close for Flaky {
        fn close(&self) -> io::Result<()> {
            self.log.lock().push(self.name);
            if self.fail {
                Err(io::Error::new(io::ErrorKind::Other, "boom"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn teardown_runs_every_close_in_reverse() {
        let log = Arc::default();
        let mut teardown = Teardown::default();
        for (name, fail) in [("interface", false), ("bind", true), ("device", false)] {
            teardown.register(
                name,
                Flaky {
                    name,
                    fail,
                    log: Arc::clone(&log),
                },
            );
        }

        let errors = teardown.run();
        assert_eq!(*log.lock(), ["device", "bind", "interface"]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].resource, "bind");
    }

    #[test]
    fn states_are_ordered() {
        assert!(State::Created < State::Bound);
        assert!(State::Up < State::Closing);
        assert_eq!(State::Configured.to_string(), "configured");
    }
}
