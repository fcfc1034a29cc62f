//! SOCKS5 front-end (RFC 1928): no authentication, `CONNECT` only.

use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

const VERSION: u8 = 0x05;

const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Where relayed connections are dialled.
pub trait Connector: Clone + Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, target: SocketAddr) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    fn resolve(&self, host: &str) -> impl Future<Output = io::Result<Vec<IpAddr>>> + Send;
}

impl Connector for wgnet::Net {
    type Stream = wgnet::TcpStream;

    fn connect(&self, target: SocketAddr) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        wgnet::Net::connect(self, target)
    }

    fn resolve(&self, host: &str) -> impl Future<Output = io::Result<Vec<IpAddr>>> + Send {
        wgnet::Net::resolve(self, host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Ip(SocketAddr),
    Domain(String, u16),
}

/// Accepts clients until `cancel` fires. Open relays are cut at that point.
pub async fn serve<C: Connector>(
    listener: TcpListener,
    connector: C,
    cancel: CancellationToken,
) -> io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    continue;
                }
            },
        };

        let connector = connector.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = handle(stream, &connector) => match result {
                    Ok((sent, received)) => tracing::debug!(%peer, sent, received, "relay finished"),
                    Err(err) => tracing::debug!(%peer, %err, "relay failed"),
                },
            }
        });
    }

    tracing::info!("relay stopped");
    Ok(())
}

/// Runs one client session. Returns the byte counts in each direction.
async fn handle<C: Connector>(mut client: TcpStream, connector: &C) -> io::Result<(u64, u64)> {
    negotiate(&mut client).await?;

    let (command, target) = match read_request(&mut client).await {
        Ok(request) => request,
        Err(err) if err.kind() == io::ErrorKind::Unsupported => {
            reply(&mut client, REP_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(err);
        }
        Err(err) => return Err(err),
    };
    if command != CMD_CONNECT {
        reply(&mut client, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported command {command:#04x}"),
        ));
    }

    let address = match target {
        Target::Ip(address) => address,
        Target::Domain(host, port) => match connector.resolve(&host).await {
            Ok(ips) if !ips.is_empty() => SocketAddr::new(ips[0], port),
            Ok(_) => {
                reply(&mut client, REP_HOST_UNREACHABLE).await?;
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{host} has no addresses"),
                ));
            }
            Err(err) => {
                reply(&mut client, REP_HOST_UNREACHABLE).await?;
                return Err(err);
            }
        },
    };

    let mut remote = match connector.connect(address).await {
        Ok(remote) => remote,
        Err(err) => {
            reply(&mut client, reply_code(&err)).await?;
            return Err(err);
        }
    };
    tracing::debug!(target = %address, "connected");
    reply(&mut client, REP_SUCCEEDED).await?;

    tokio::io::copy_bidirectional(&mut client, &mut remote).await
}

async fn negotiate<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> io::Result<()> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(invalid(format!("unsupported SOCKS version {}", header[0])));
    }

    let mut methods = vec![0u8; header[1].into()];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&NO_AUTH) {
        stream.write_all(&[VERSION, NO_ACCEPTABLE_METHODS]).await?;
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "client requires authentication",
        ));
    }

    stream.write_all(&[VERSION, NO_AUTH]).await
}

async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(u8, Target)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _, atyp] = header;
    if version != VERSION {
        return Err(invalid(format!("unsupported SOCKS version {version}")));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            Target::Ip(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            Target::Ip(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut host = vec![0u8; len.into()];
            stream.read_exact(&mut host).await?;
            let host = String::from_utf8(host).map_err(|_| invalid("domain is not UTF-8"))?;
            let port = stream.read_u16().await?;
            Target::Domain(host, port)
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported address type {other:#04x}"),
            ))
        }
    };

    Ok((command, target))
}

/// Replies with an unspecified bound address, which clients ignore for `CONNECT`.
async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> io::Result<()> {
    stream
        .write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

fn reply_code(err: &io::Error) -> u8 {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        io::ErrorKind::TimedOut => REP_HOST_UNREACHABLE,
        io::ErrorKind::AddrNotAvailable => REP_NETWORK_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

fn invalid(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;

    /// Dials over the host network and resolves from a fixed table.
    #[derive(Clone, Default)]
    struct Direct {
        hosts: Arc<HashMap<String, Vec<IpAddr>>>,
    }

    impl Connector for Direct {
        type Stream = TcpStream;

        fn connect(&self, target: SocketAddr) -> impl Future<Output = io::Result<TcpStream>> + Send {
            TcpStream::connect(target)
        }

        fn resolve(&self, host: &str) -> impl Future<Output = io::Result<Vec<IpAddr>>> + Send {
            let ips = self.hosts.get(host).cloned().unwrap_or_default();
            async move { Ok(ips) }
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        address
    }

    async fn proxy(connector: Direct) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, connector, cancel.clone()));
        (address, cancel)
    }

    async fn greet(proxy: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[VERSION, 1, NO_AUTH]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [VERSION, NO_AUTH]);
        client
    }

    async fn reply_of(client: &mut TcpStream) -> u8 {
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], VERSION);
        reply[1]
    }

    #[tokio::test]
    async fn connects_to_ipv4_targets() {
        let echo = echo_server().await;
        let (proxy, cancel) = proxy(Direct::default()).await;

        let mut client = greet(proxy).await;
        let mut request = vec![VERSION, CMD_CONNECT, 0, ATYP_IPV4, 127, 0, 0, 1];
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        assert_eq!(reply_of(&mut client).await, REP_SUCCEEDED);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        cancel.cancel();
    }

    #[tokio::test]
    async fn resolves_domains_through_the_connector() {
        let echo = echo_server().await;
        let hosts = HashMap::from([("echo.test".to_owned(), vec![echo.ip()])]);
        let (proxy, cancel) = proxy(Direct {
            hosts: Arc::new(hosts),
        })
        .await;

        let mut client = greet(proxy).await;
        let mut request = vec![VERSION, CMD_CONNECT, 0, ATYP_DOMAIN, 9];
        request.extend_from_slice(b"echo.test");
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        assert_eq!(reply_of(&mut client).await, REP_SUCCEEDED);

        client.write_all(b"pong").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"pong");

        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_domains_are_unreachable() {
        let (proxy, cancel) = proxy(Direct::default()).await;

        let mut client = greet(proxy).await;
        let mut request = vec![VERSION, CMD_CONNECT, 0, ATYP_DOMAIN, 7];
        request.extend_from_slice(b"nowhere");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();
        assert_eq!(reply_of(&mut client).await, REP_HOST_UNREACHABLE);

        cancel.cancel();
    }

    #[tokio::test]
    async fn only_connect_is_supported() {
        let (proxy, cancel) = proxy(Direct::default()).await;

        let mut client = greet(proxy).await;
        // BIND
        client
            .write_all(&[VERSION, 0x02, 0, ATYP_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        assert_eq!(reply_of(&mut client).await, REP_COMMAND_NOT_SUPPORTED);

        cancel.cancel();
    }

    #[tokio::test]
    async fn authentication_is_refused() {
        let (proxy, cancel) = proxy(Direct::default()).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        // username/password only
        client.write_all(&[VERSION, 1, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [VERSION, NO_ACCEPTABLE_METHODS]);

        cancel.cancel();
    }

    #[test]
    fn refused_connections_map_to_their_reply() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(reply_code(&err), REP_CONNECTION_REFUSED);
        assert_eq!(reply_code(&io::Error::from(io::ErrorKind::Other)), REP_GENERAL_FAILURE);
    }
}
