//! Local SOCKS5 server and client
//!
//! The server dispatches CONNECT to a core's stream dial capability and
//! UDP ASSOCIATE to its packet dial capability. Only the "no authentication"
//! method is offered. [`Socks5Dialer`] is the client side, used to reach a
//! proxy engine that exposes a SOCKS5 inbound.

use crate::dial::{BoxedStream, PacketDialer, PacketEndpoint, StreamDialer, TargetAddr};
use crate::error::Error;
use crate::log_buffer::CoreLog;
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, Instrument};
use uuid::Uuid;

const VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// SOCKS5 front end of a running core
pub struct Socks5Server {
    stream: Arc<dyn StreamDialer>,
    packet: Arc<dyn PacketDialer>,
    log: CoreLog,
    cancel: CancellationToken,
}

impl Socks5Server {
    pub fn new(
        stream: Arc<dyn StreamDialer>,
        packet: Arc<dyn PacketDialer>,
        log: CoreLog,
        cancel: CancellationToken,
    ) -> Self {
        Self { stream, packet, log, cancel }
    }

    /// Accept until the cancellation token fires; the listener is dropped on return.
    ///
    /// Every connection gets its own task. There is no cap on concurrent connections.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        let server = Arc::clone(&self);
                        let span = debug_span!("socks", conn = %Uuid::new_v4(), peer = %client_addr);
                        tokio::spawn(
                            async move {
                                tokio::select! {
                                    _ = server.cancel.cancelled() => {}
                                    handled = server.handle_connection(stream, client_addr) => {
                                        if let Err(e) = handled {
                                            server.log.debug(format!("connection closed with error: {}", e));
                                        }
                                    }
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        self.log.warn(format!("failed to accept connection: {}", e));
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }

    async fn handle_connection(&self, mut client: TcpStream, client_addr: SocketAddr) -> io::Result<()> {
        // 1. method negotiation
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await?;
        if greeting[0] != VERSION {
            return Err(invalid_data(format!("unsupported SOCKS version {:#04x}", greeting[0])));
        }
        let mut methods = vec![0u8; greeting[1] as usize];
        client.read_exact(&mut methods).await?;
        if !methods.contains(&AUTH_NONE) {
            client.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await?;
            return Err(invalid_data("client offers no acceptable auth method"));
        }
        client.write_all(&[VERSION, AUTH_NONE]).await?;

        // 2. request
        let mut head = [0u8; 4];
        client.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(invalid_data(format!("unsupported SOCKS version {:#04x}", head[0])));
        }
        if !matches!(head[3], ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6) {
            write_reply(&mut client, REP_ADDRESS_NOT_SUPPORTED, unspecified()).await?;
            return Err(invalid_data(format!("unsupported address type {:#04x}", head[3])));
        }
        let target = read_target(&mut client, head[3]).await?;

        match head[1] {
            CMD_CONNECT => self.connect(client, target).await,
            CMD_UDP_ASSOCIATE => self.associate(client, client_addr).await,
            other => {
                let err = Error::UnsupportedNetwork(format!("SOCKS5 command {:#04x}", other));
                self.log.warn(format!("connection rejected target={} error={}", target, err));
                write_reply(&mut client, REP_COMMAND_NOT_SUPPORTED, unspecified()).await
            }
        }
    }

    async fn connect(&self, mut client: TcpStream, target: TargetAddr) -> io::Result<()> {
        let dialed = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            dialed = self.stream.dial_stream(&target) => dialed,
        };

        let mut upstream = match dialed {
            Ok(upstream) => upstream,
            Err(e) => {
                self.log.warn(format!("connection failed network=tcp target={} error={}", target, e));
                return write_reply(&mut client, reply_code(&e), unspecified()).await;
            }
        };
        self.log.debug(format!("connection established network=tcp target={}", target));
        write_reply(&mut client, REP_SUCCEEDED, unspecified()).await?;

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            relayed = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
                relayed?;
            }
        }
        Ok(())
    }

    async fn associate(&self, mut client: TcpStream, client_addr: SocketAddr) -> io::Result<()> {
        let relay = UdpSocket::bind(SocketAddr::new(client.local_addr()?.ip(), 0)).await?;
        let endpoint = match self.packet.dial_packet().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.log.warn(format!("connection failed network=udp error={}", e));
                return write_reply(&mut client, reply_code(&e), unspecified()).await;
            }
        };
        write_reply(&mut client, REP_SUCCEEDED, relay.local_addr()?).await?;
        self.log.debug(format!("udp association opened relay={}", relay.local_addr()?));

        let result = self.relay_datagrams(&mut client, client_addr, &relay, endpoint.as_ref()).await;
        self.log.debug("udp association closed");
        result
    }

    /// Pump datagrams until the control connection closes or the core stops
    async fn relay_datagrams(
        &self,
        control: &mut TcpStream,
        client_addr: SocketAddr,
        relay: &UdpSocket,
        endpoint: &dyn PacketEndpoint,
    ) -> io::Result<()> {
        let mut inbound = vec![0u8; UDP_BUFFER_SIZE];
        let mut outbound = vec![0u8; UDP_BUFFER_SIZE];
        let mut control_buf = [0u8; 64];
        let mut client_udp: Option<SocketAddr> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = control.read(&mut control_buf) => match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(_) => {}
                },
                received = relay.recv_from(&mut inbound) => {
                    let (n, from) = received?;
                    if from.ip() != client_addr.ip() {
                        continue;
                    }
                    client_udp = Some(from);
                    // RSV(2) FRAG ATYP ADDR PORT DATA
                    if n < 4 || inbound[2] != 0 {
                        continue;
                    }
                    let (target, header_len) = match parse_target(&inbound[3..n]) {
                        Ok(parsed) => parsed,
                        Err(_) => continue,
                    };
                    if let Err(e) = endpoint.send_to(&target, &inbound[3 + header_len..n]).await {
                        self.log.warn(format!("connection failed network=udp target={} error={}", target, e));
                    }
                },
                replied = endpoint.recv_from(&mut outbound) => {
                    let (n, source) = replied?;
                    if let Some(to) = client_udp {
                        let mut datagram = vec![0, 0, 0];
                        write_target(&mut datagram, &source)?;
                        datagram.extend_from_slice(&outbound[..n]);
                        relay.send_to(&datagram, to).await?;
                    }
                },
            }
        }
    }
}

/// Stream dial capability through a SOCKS5 proxy without authentication
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: SocketAddr,
}

impl Socks5Dialer {
    pub fn new(proxy: SocketAddr) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl StreamDialer for Socks5Dialer {
    async fn dial_stream(&self, target: &TargetAddr) -> io::Result<BoxedStream> {
        let mut upstream = TcpStream::connect(self.proxy).await?;
        client_handshake(&mut upstream, target).await?;
        Ok(Box::new(upstream))
    }
}

/// CONNECT handshake against a SOCKS5 server
pub async fn client_handshake<S>(upstream: &mut S, target: &TargetAddr) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    upstream.write_all(&[VERSION, 0x01, AUTH_NONE]).await?;
    let mut response = [0u8; 2];
    upstream.read_exact(&mut response).await?;
    if response != [VERSION, AUTH_NONE] {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "upstream SOCKS5 server rejected the handshake",
        ));
    }

    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    write_target(&mut request, target)?;
    upstream.write_all(&request).await?;

    let mut head = [0u8; 4];
    upstream.read_exact(&mut head).await?;
    if head[1] != REP_SUCCEEDED {
        let kind = match head[1] {
            REP_CONNECTION_REFUSED => io::ErrorKind::ConnectionRefused,
            REP_COMMAND_NOT_SUPPORTED | REP_ADDRESS_NOT_SUPPORTED => io::ErrorKind::Unsupported,
            _ => io::ErrorKind::Other,
        };
        return Err(io::Error::new(kind, format!("upstream SOCKS5 connect failed: reply {:#04x}", head[1])));
    }
    // bound address is not used
    read_target(upstream, head[3]).await?;
    Ok(())
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, rep: u8, bound: SocketAddr) -> io::Result<()> {
    let mut reply = vec![VERSION, rep, 0x00];
    write_target(&mut reply, &TargetAddr::Ip(bound))?;
    writer.write_all(&reply).await?;
    writer.flush().await
}

fn reply_code(err: &io::Error) -> u8 {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        io::ErrorKind::TimedOut | io::ErrorKind::NotFound => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

fn unspecified() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

async fn read_target<R: AsyncRead + Unpin>(reader: &mut R, atyp: u8) -> io::Result<TargetAddr> {
    match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            reader.read_exact(&mut ip).await?;
            let port = reader.read_u16().await?;
            Ok(TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(ip), port))))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            reader.read_exact(&mut domain).await?;
            let host = String::from_utf8(domain).map_err(|_| invalid_data("domain is not UTF-8"))?;
            let port = reader.read_u16().await?;
            Ok(TargetAddr::Domain(host, port))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            reader.read_exact(&mut ip).await?;
            let port = reader.read_u16().await?;
            Ok(TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(ip), port))))
        }
        other => Err(invalid_data(format!("unsupported address type {:#04x}", other))),
    }
}

/// Parse `ATYP ADDR PORT` from the front of `buf`; returns the target and its encoded length
fn parse_target(buf: &[u8]) -> io::Result<(TargetAddr, usize)> {
    let short = || invalid_data("truncated SOCKS5 address");
    let atyp = *buf.first().ok_or_else(short)?;
    let (addr_len, addr_start) = match atyp {
        ATYP_IPV4 => (4, 1),
        ATYP_IPV6 => (16, 1),
        ATYP_DOMAIN => (*buf.get(1).ok_or_else(short)? as usize, 2),
        other => return Err(invalid_data(format!("unsupported address type {:#04x}", other))),
    };
    let end = addr_start + addr_len + 2;
    if buf.len() < end {
        return Err(short());
    }
    let addr = &buf[addr_start..addr_start + addr_len];
    let port = u16::from_be_bytes([buf[end - 2], buf[end - 1]]);

    let target = match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = addr.try_into().map_err(|_| short())?;
            TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(octets), port)))
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = addr.try_into().map_err(|_| short())?;
            TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(octets), port)))
        }
        _ => {
            let host = std::str::from_utf8(addr).map_err(|_| invalid_data("domain is not UTF-8"))?;
            TargetAddr::Domain(host.to_string(), port)
        }
    };
    Ok((target, end))
}

fn write_target(out: &mut Vec<u8>, target: &TargetAddr) -> io::Result<()> {
    match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
        }
        TargetAddr::Domain(host, _) => {
            let len = u8::try_from(host.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "domain name too long"))?;
            out.push(ATYP_DOMAIN);
            out.push(len);
            out.extend_from_slice(host.as_bytes());
        }
    }
    out.extend_from_slice(&target.port().to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_buffer::LogBuffer;

    struct DirectDialer;

    #[async_trait]
    impl StreamDialer for DirectDialer {
        async fn dial_stream(&self, target: &TargetAddr) -> io::Result<BoxedStream> {
            match target {
                TargetAddr::Ip(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
                TargetAddr::Domain(..) => Err(io::Error::new(io::ErrorKind::NotFound, "no resolver in tests")),
            }
        }
    }

    struct DirectEndpoint(UdpSocket);

    #[async_trait]
    impl PacketEndpoint for DirectEndpoint {
        async fn send_to(&self, target: &TargetAddr, payload: &[u8]) -> io::Result<usize> {
            match target {
                TargetAddr::Ip(addr) => self.0.send_to(payload, addr).await,
                TargetAddr::Domain(..) => Err(io::Error::new(io::ErrorKind::NotFound, "no resolver in tests")),
            }
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, TargetAddr)> {
            let (n, from) = self.0.recv_from(buf).await?;
            Ok((n, TargetAddr::Ip(from)))
        }
    }

    #[async_trait]
    impl PacketDialer for DirectDialer {
        async fn dial_packet(&self) -> io::Result<Arc<dyn PacketEndpoint>> {
            Ok(Arc::new(DirectEndpoint(UdpSocket::bind("127.0.0.1:0").await?)))
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn start_server() -> (SocketAddr, CoreLog, CancellationToken, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = CoreLog::new("test", Arc::new(LogBuffer::new()));
        let cancel = CancellationToken::new();
        let dialer = Arc::new(DirectDialer);
        let server = Arc::new(Socks5Server::new(dialer.clone(), dialer, log.clone(), cancel.clone()));
        let task = tokio::spawn(server.serve(listener));
        (addr, log, cancel, task)
    }

    #[tokio::test]
    async fn connect_relays_bytes() {
        let echo = echo_server().await;
        let (proxy, _log, cancel, _task) = start_server().await;

        let mut stream = Socks5Dialer::new(proxy).dial_stream(&TargetAddr::Ip(echo)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        cancel.cancel();
    }

    #[tokio::test]
    async fn failed_dial_is_logged_and_rejected() {
        let (proxy, log, cancel, _task) = start_server().await;

        let target = TargetAddr::Domain("nowhere.invalid".into(), 80);
        let err = Socks5Dialer::new(proxy).dial_stream(&target).await.err().unwrap();
        assert!(err.to_string().contains("0x04"), "{}", err);

        let logs = log.buffer().fetch_logs();
        assert!(logs.contains("connection failed network=tcp target=nowhere.invalid:80"), "{}", logs);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unsupported_command_is_rejected() {
        let (proxy, _log, cancel, _task) = start_server().await;
        let mut stream = TcpStream::connect(proxy).await.unwrap();

        stream.write_all(&[VERSION, 1, AUTH_NONE]).await.unwrap();
        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await.unwrap();

        // BIND
        stream.write_all(&[VERSION, 0x02, 0, ATYP_IPV4, 127, 0, 0, 1, 0, 80]).await.unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);
        cancel.cancel();
    }

    #[tokio::test]
    async fn auth_only_clients_are_refused() {
        let (proxy, _log, cancel, _task) = start_server().await;
        let mut stream = TcpStream::connect(proxy).await.unwrap();

        // username/password only
        stream.write_all(&[VERSION, 1, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [VERSION, AUTH_NO_ACCEPTABLE]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn udp_associate_relays_datagrams() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let (proxy, _log, cancel, _task) = start_server().await;
        let mut control = TcpStream::connect(proxy).await.unwrap();
        control.write_all(&[VERSION, 1, AUTH_NONE]).await.unwrap();
        let mut method = [0u8; 2];
        control.read_exact(&mut method).await.unwrap();
        control
            .write_all(&[VERSION, CMD_UDP_ASSOCIATE, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut head = [0u8; 4];
        control.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], REP_SUCCEEDED);
        let relay = match read_target(&mut control, head[3]).await.unwrap() {
            TargetAddr::Ip(addr) => addr,
            other => panic!("unexpected relay address {}", other),
        };

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = vec![0, 0, 0];
        write_target(&mut datagram, &TargetAddr::Ip(echo_addr)).unwrap();
        datagram.extend_from_slice(b"hello");
        client.send_to(&datagram, relay).await.unwrap();

        let mut buf = [0u8; 1500];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (source, header_len) = parse_target(&buf[3..n]).unwrap();
        assert_eq!(source, TargetAddr::Ip(echo_addr));
        assert_eq!(&buf[3 + header_len..n], b"hello");
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_connections_mid_handshake() {
        let (proxy, _log, cancel, _task) = start_server().await;
        let mut silent = TcpStream::connect(proxy).await.unwrap();
        let mut half_greeting = TcpStream::connect(proxy).await.unwrap();
        half_greeting.write_all(&[VERSION]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        let mut buf = [0u8; 1];
        for stream in [&mut silent, &mut half_greeting] {
            let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("connection left open after cancellation");
            assert!(matches!(read, Ok(0) | Err(_)));
        }
    }

    #[tokio::test]
    async fn cancellation_ends_accept_loop() {
        let (proxy, _log, cancel, task) = start_server().await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(TcpStream::connect(proxy).await.is_err());
    }

    #[test]
    fn parses_domain_header() {
        let mut encoded = Vec::new();
        write_target(&mut encoded, &TargetAddr::Domain("example.com".into(), 53)).unwrap();
        encoded.extend_from_slice(b"payload");
        let (target, len) = parse_target(&encoded).unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".into(), 53));
        assert_eq!(&encoded[len..], b"payload");
        assert!(parse_target(&encoded[..5]).is_err());
    }
}
