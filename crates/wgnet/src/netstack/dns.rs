use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use hickory_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{Name, RData, RecordType},
    serialize::binary::{BinDecodable, BinEncodable},
};
use rand::{rngs::OsRng, Rng};
use tokio::time;

use super::{Address, Net};
use crate::udp::UdpSocket;

const PORT: u16 = 53;

impl Net {
    /// Resolves `host` through the tunnel using the interface DNS servers.
    ///
    /// IP literals are returned as is. Servers are tried in order until one
    /// answers; IPv4 addresses come before IPv6 ones.
    pub async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let literal = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let name = Name::from_ascii(host)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut last = None;
        for &server in self.dns_servers() {
            let server = SocketAddr::new(server, PORT);
            if !self.address().is_compatible(server) {
                continue;
            }

            match lookup(self, &name, server).await {
                Ok(ips) if !ips.is_empty() => {
                    tracing::debug!(host, %server, ?ips, "resolved");
                    return Ok(ips);
                }
                Ok(_) => last = Some(not_found(host)),
                Err(err) => {
                    tracing::debug!(host, %server, %err, "DNS lookup failed");
                    last = Some(err);
                }
            }
        }

        Err(last.unwrap_or_else(|| not_found(host)))
    }
}

async fn lookup(net: &Net, name: &Name, server: SocketAddr) -> io::Result<Vec<IpAddr>> {
    let socket = UdpSocket::bind(Address::unspecified_for(server), net).await?;
    let timeout = net.options().dns_timeout;

    let mut ips = Vec::new();
    let mut error = None;
    for record_type in [RecordType::A, RecordType::AAAA] {
        match time::timeout(timeout, query(&socket, name, record_type, server)).await {
            Ok(Ok(answers)) => ips.extend(answers),
            Ok(Err(err)) => error = Some(err),
            Err(_) => error = Some(io::Error::new(io::ErrorKind::TimedOut, "DNS query timed out")),
        }
    }

    match error {
        Some(err) if ips.is_empty() => Err(err),
        _ => Ok(ips),
    }
}

async fn query(
    socket: &UdpSocket,
    name: &Name,
    record_type: RecordType,
    server: SocketAddr,
) -> io::Result<Vec<IpAddr>> {
    let id = OsRng.gen();
    let request = request(id, name, record_type)
        .to_bytes()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    socket.send_to(&request, server).await?;

    let mut buf = Vec::with_capacity(4096);
    loop {
        buf.clear();
        let (_, from) = socket.recv_from(&mut buf).await?;
        if from != server {
            continue;
        }

        let response = match Message::from_bytes(&buf) {
            Ok(response) => response,
            Err(err) => {
                tracing::trace!(%server, %err, "ignoring malformed DNS response");
                continue;
            }
        };
        if response.id() != id || response.message_type() != MessageType::Response {
            continue;
        }

        return match response.response_code() {
            ResponseCode::NoError => Ok(answers(&response)),
            ResponseCode::NXDomain => Ok(Vec::new()),
            code => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("DNS server answered {code}"),
            )),
        };
    }
}

fn request(id: u16, name: &Name, record_type: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name.clone(), record_type));
    message
}

fn answers(response: &Message) -> Vec<IpAddr> {
    response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

fn not_found(host: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no address found for {host}"))
}
