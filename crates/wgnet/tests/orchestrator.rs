use std::{io, net::IpAddr, sync::Arc};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use wgnet::{
    key::keypair,
    orchestrator::{Bind, Close, Device, Stack},
    Config, Orchestrator, State,
};

/// Records every collaborator call and fails the one named by `fail`.
#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
    fail: Option<&'static str>,
}

impl Recorder {
    fn failing(operation: &'static str) -> Self {
        Self {
            fail: Some(operation),
            ..Self::default()
        }
    }

    fn call(&self, operation: &'static str, detail: impl std::fmt::Display) -> io::Result<()> {
        let detail = detail.to_string();
        self.log.lock().push(if detail.is_empty() {
            operation.to_owned()
        } else {
            format!("{operation} {detail}")
        });
        if self.fail == Some(operation) {
            Err(io::Error::new(io::ErrorKind::Other, format!("{operation} failed")))
        } else {
            Ok(())
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn closes(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| entry.starts_with("close"))
            .collect()
    }
}

struct MockTun(Recorder);
struct MockBind(Recorder);
struct MockDevice(Recorder);

/// What the stack was asked to build the interface with.
#[derive(Debug, PartialEq, Eq)]
struct MockNet {
    addresses: Vec<IpAddr>,
    dns: Vec<IpAddr>,
    mtu: u16,
}

impl Close for MockTun {
    fn close(&self) -> io::Result<()> {
        self.0.call("close_tun", "")
    }
}

impl Close for MockBind {
    fn close(&self) -> io::Result<()> {
        self.0.call("close_bind", "")
    }
}

impl Close for MockDevice {
    fn close(&self) -> io::Result<()> {
        self.0.call("close_device", "")
    }
}

impl Bind for MockBind {
    fn open(&self, port: u16) -> io::Result<u16> {
        self.0.call("open", port)?;
        Ok(if port == 0 { 40000 } else { port })
    }

    fn set_mark(&self, mark: u32) -> io::Result<()> {
        self.0.call("set_mark", mark)
    }
}

impl Device for MockDevice {
    fn ipc_set(&self, uapi: &str) -> io::Result<()> {
        self.0.call("ipc_set", uapi.lines().count())
    }

    fn up(&self) -> io::Result<()> {
        self.0.call("up", "")
    }
}

impl Stack for Recorder {
    type Tun = MockTun;
    type Net = MockNet;
    type Bind = MockBind;
    type Device = MockDevice;

    fn create_tun(
        &self,
        addresses: &[IpAddr],
        dns: &[IpAddr],
        mtu: u16,
    ) -> io::Result<(MockTun, MockNet)> {
        self.call("create_tun", "")?;
        Ok((
            MockTun(self.clone()),
            MockNet {
                addresses: addresses.to_vec(),
                dns: dns.to_vec(),
                mtu,
            },
        ))
    }

    fn create_bind(&self) -> io::Result<MockBind> {
        self.call("create_bind", "")?;
        Ok(MockBind(self.clone()))
    }

    fn create_device(&self, _: &MockTun, _: &MockBind) -> io::Result<MockDevice> {
        self.call("create_device", "")?;
        Ok(MockDevice(self.clone()))
    }
}

fn config(interface_extra: &str) -> Config {
    let (private, _) = keypair();
    let (_, peer) = keypair();
    Config::from_ini(&format!(
        "[Interface]\n\
         PrivateKey = {}\n\
         Address = 10.0.0.2/32, fd00::2/128\n\
         DNS = 10.0.0.1\n\
         {interface_extra}\n\
         [Peer]\n\
         PublicKey = {}\n\
         AllowedIPs = 0.0.0.0/0\n",
        private.to_base64(),
        peer.to_base64(),
    ))
    .unwrap()
}

#[tokio::test]
async fn acquires_in_order_and_releases_in_reverse() {
    let stack = Recorder::default();
    let config = config("");
    let uapi_lines = config.to_uapi().lines().count();

    let cancel = CancellationToken::new();
    let running = Orchestrator::new(stack.clone())
        .start(&config, cancel.clone())
        .unwrap();
    assert_eq!(running.state(), State::Up);
    assert_eq!(running.port(), 40000);
    assert_eq!(
        running.net(),
        &MockNet {
            addresses: vec!["10.0.0.2".parse().unwrap(), "fd00::2".parse().unwrap()],
            dns: vec!["10.0.0.1".parse().unwrap()],
            mtu: 1280,
        }
    );
    assert_eq!(
        stack.log(),
        [
            "create_tun".to_owned(),
            "create_bind".to_owned(),
            "open 0".to_owned(),
            "create_device".to_owned(),
            format!("ipc_set {uapi_lines}"),
            "up".to_owned(),
        ]
    );

    let mut watch = running.watch();
    cancel.cancel();
    assert!(running.closed().await.is_empty());
    assert_eq!(stack.closes(), ["close_device", "close_bind", "close_tun"]);

    watch.wait_for(|state| *state == State::Closed).await.unwrap();
}

#[tokio::test]
async fn port_and_mark_reach_the_bind() {
    let stack = Recorder::default();
    let running = Orchestrator::new(stack.clone())
        .start(
            &config("ListenPort = 51820\nFwMark = 0x20"),
            CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(running.port(), 51820);
    let log = stack.log();
    assert!(log.contains(&"open 51820".to_owned()));
    assert!(log.contains(&"set_mark 32".to_owned()));
}

#[tokio::test]
async fn a_zero_mark_is_not_applied() {
    let stack = Recorder::default();
    Orchestrator::new(stack.clone())
        .start(&config(""), CancellationToken::new())
        .unwrap();

    assert!(!stack.log().iter().any(|entry| entry.starts_with("set_mark")));
}

#[tokio::test]
async fn configuration_failures_release_everything_acquired() {
    let stack = Recorder::failing("ipc_set");
    let err = Orchestrator::new(stack.clone())
        .start(&config(""), CancellationToken::new())
        .unwrap_err();

    assert_eq!(err.stage, State::Configured);
    assert!(!stack.log().contains(&"up".to_owned()));
    assert_eq!(stack.closes(), ["close_device", "close_bind", "close_tun"]);
}

#[tokio::test]
async fn bind_failures_are_fatal() {
    let stack = Recorder::failing("open");
    let err = Orchestrator::new(stack.clone())
        .start(&config(""), CancellationToken::new())
        .unwrap_err();

    assert_eq!(err.stage, State::Bound);
    assert!(!stack.log().contains(&"create_device".to_owned()));
    assert_eq!(stack.closes(), ["close_bind", "close_tun"]);
}

#[tokio::test]
async fn interface_failures_leave_nothing_to_close() {
    let stack = Recorder::failing("create_tun");
    let err = Orchestrator::new(stack.clone())
        .start(&config(""), CancellationToken::new())
        .unwrap_err();

    assert_eq!(err.stage, State::Created);
    assert!(err.to_string().starts_with("created stage failed"));
    assert_eq!(stack.log(), ["create_tun"]);
}

#[tokio::test]
async fn up_failures_are_reported_at_the_up_stage() {
    let stack = Recorder::failing("up");
    let err = Orchestrator::new(stack.clone())
        .start(&config(""), CancellationToken::new())
        .unwrap_err();

    assert_eq!(err.stage, State::Up);
    assert_eq!(stack.closes(), ["close_device", "close_bind", "close_tun"]);
}

#[tokio::test]
async fn close_failures_do_not_stop_teardown() {
    let stack = Recorder::failing("close_bind");
    let cancel = CancellationToken::new();
    let running = Orchestrator::new(stack.clone())
        .start(&config(""), cancel.clone())
        .unwrap();

    cancel.cancel();
    let errors = running.closed().await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].resource, "bind");
    assert_eq!(stack.closes(), ["close_device", "close_bind", "close_tun"]);
}

#[tokio::test]
async fn an_already_cancelled_token_tears_down_right_away() {
    let stack = Recorder::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let running = Orchestrator::new(stack.clone())
        .start(&config(""), cancel)
        .unwrap();
    assert!(running.closed().await.is_empty());
    assert_eq!(stack.closes(), ["close_device", "close_bind", "close_tun"]);
}
