//! Encrypted SOCKS5 tunnel core
//!
//! A local SOCKS5 listener whose CONNECT and UDP ASSOCIATE requests are
//! carried to a Shadowsocks server.

use crate::proxy_core::Core;
use crate::dial::{BoxedStream, PacketDialer, PacketEndpoint, StreamDialer, TargetAddr};
use crate::error::{Error, Result};
use crate::log_buffer::{CoreLog, LogBuffer};
use crate::options::StartOptions;
use crate::probe::{self, PingResult, ProbeSettings};
use crate::socks5::Socks5Server;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shadowsocks::{
    config::{ServerConfig, ServerType},
    context::{Context as SsContext, SharedContext},
    crypto::CipherKind,
    relay::{socks5::Address as SsAddress, tcprelay::ProxyClientStream, udprelay::proxy_socket::ProxySocket},
    ServerAddr,
};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TUNNEL_CORE_NAME: &str = "shadowsocks";

const TUNNEL_VERSION: &str = concat!("coreswitch-tunnel ", env!("CARGO_PKG_VERSION"));

/// JSON config of the tunnel core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub server_port: i64,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub method: String,
    /// Local listen address, `host:port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<String>,
    #[serde(default)]
    pub verbose: bool,
}

impl TunnelConfig {
    /// Parse and validate
    pub fn parse(json: &str) -> Result<Self> {
        let config: TunnelConfig = serde_json::from_str(json)
            .map_err(|e| Error::ConfigInvalid(format!("invalid JSON config provided: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::MissingField("server".to_string()));
        }
        if self.server_port == 0 {
            return Err(Error::MissingField("server_port".to_string()));
        }
        if !(1..=65535).contains(&self.server_port) {
            return Err(Error::ConfigInvalid(format!("server_port {} out of range", self.server_port)));
        }
        if self.password.is_empty() {
            return Err(Error::MissingField("password".to_string()));
        }
        if self.method.is_empty() {
            return Err(Error::MissingField("method".to_string()));
        }
        Ok(())
    }

    /// Port of `local_addr`, if one is configured
    pub fn local_port(&self) -> Result<Option<u16>> {
        let Some(addr) = self.local_addr.as_deref().filter(|a| !a.is_empty()) else {
            return Ok(None);
        };
        let port = addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
            .ok_or_else(|| Error::ConfigInvalid(format!("invalid local_addr {}", addr)))?;
        Ok(Some(port))
    }

    /// Derive the server's key material from `method` and `password`
    pub fn server_config(&self) -> Result<ServerConfig> {
        let cipher: CipherKind = self
            .method
            .parse()
            .map_err(|_| Error::KeyDerivation(format!("unsupported cipher {}", self.method)))?;

        let port = self.server_port as u16;
        let server_addr = match self.server.parse::<IpAddr>() {
            Ok(ip) => ServerAddr::SocketAddr(SocketAddr::new(ip, port)),
            Err(_) => ServerAddr::DomainName(self.server.clone(), port),
        };

        ServerConfig::new(server_addr, self.password.clone(), cipher)
            .map_err(|e| Error::KeyDerivation(e.to_string()))
    }
}

fn to_ss_address(target: &TargetAddr) -> SsAddress {
    match target {
        TargetAddr::Ip(addr) => SsAddress::SocketAddress(*addr),
        TargetAddr::Domain(host, port) => SsAddress::DomainNameAddress(host.clone(), *port),
    }
}

fn from_ss_address(addr: SsAddress) -> TargetAddr {
    match addr {
        SsAddress::SocketAddress(addr) => TargetAddr::Ip(addr),
        SsAddress::DomainNameAddress(host, port) => TargetAddr::Domain(host, port),
    }
}

fn dial_cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "dial cancelled")
}

fn relay_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Encrypted TCP streams to arbitrary destinations via the server
struct ShadowsocksStreamDialer {
    context: SharedContext,
    server: Arc<ServerConfig>,
    cancel: CancellationToken,
}

#[async_trait]
impl StreamDialer for ShadowsocksStreamDialer {
    async fn dial_stream(&self, target: &TargetAddr) -> io::Result<BoxedStream> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(dial_cancelled()),
            stream = ProxyClientStream::connect(self.context.clone(), &self.server, to_ss_address(target)) => {
                Ok(Box::new(stream?) as BoxedStream)
            }
        }
    }
}

/// Encrypted UDP endpoints via the server
struct ShadowsocksPacketDialer {
    context: SharedContext,
    server: Arc<ServerConfig>,
    cancel: CancellationToken,
}

#[async_trait]
impl PacketDialer for ShadowsocksPacketDialer {
    async fn dial_packet(&self) -> io::Result<Arc<dyn PacketEndpoint>> {
        let socket = tokio::select! {
            _ = self.cancel.cancelled() => return Err(dial_cancelled()),
            socket = ProxySocket::connect(self.context.clone(), &self.server) => socket.map_err(relay_error)?,
        };
        Ok(Arc::new(ShadowsocksEndpoint {
            socket,
            cancel: self.cancel.clone(),
        }))
    }
}

struct ShadowsocksEndpoint {
    socket: ProxySocket<shadowsocks::net::UdpSocket>,
    cancel: CancellationToken,
}

#[async_trait]
impl PacketEndpoint for ShadowsocksEndpoint {
    async fn send_to(&self, target: &TargetAddr, payload: &[u8]) -> io::Result<usize> {
        let addr = to_ss_address(target);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(dial_cancelled()),
            sent = self.socket.send(&addr, payload) => sent.map_err(relay_error),
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, TargetAddr)> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(dial_cancelled()),
            received = self.socket.recv_from(buf) => {
                let (n, _server_addr, target, _raw_len) = received.map_err(relay_error)?;
                Ok((n, from_ss_address(target)))
            }
        }
    }
}

/// Resources that exist only while the tunnel runs
struct Running {
    local_addr: SocketAddr,
    stream: Arc<dyn StreamDialer>,
    cancel: CancellationToken,
    accept: JoinHandle<()>,
}

/// Encrypted SOCKS5 tunnel core
pub struct TunnelService {
    state: Mutex<Option<Running>>,
    log: CoreLog,
    probe: ProbeSettings,
}

impl TunnelService {
    pub fn new(probe: ProbeSettings) -> Self {
        Self::with_log_buffer(probe, Arc::new(LogBuffer::new()))
    }

    pub fn with_log_buffer(probe: ProbeSettings, buffer: Arc<LogBuffer>) -> Self {
        Self {
            state: Mutex::new(None),
            log: CoreLog::new(TUNNEL_CORE_NAME, buffer),
            probe,
        }
    }

    /// Bound listener address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|running| running.local_addr)
    }

    pub fn log_buffer(&self) -> &Arc<LogBuffer> {
        self.log.buffer()
    }
}

/// Loopback listener with address reuse, so a restart can rebind a just-closed port
fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
    socket.listen(1024)
}

#[async_trait]
impl Core for TunnelService {
    fn core_name(&self) -> &str {
        TUNNEL_CORE_NAME
    }

    async fn start(&self, opts: &StartOptions, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            text = opts.load_config() => text?,
        };
        let config = TunnelConfig::parse(&text)?;
        let server = Arc::new(config.server_config()?);

        let port = match opts.local_proxy_port {
            0 => config.local_port()?.unwrap_or(0),
            port => port,
        };
        let listener = bind_listener(port)
            .map_err(|e| Error::NetworkFailure(format!("failed to listen on 127.0.0.1:{}: {}", port, e)))?;
        let local_addr = listener.local_addr()?;

        let context = SsContext::new_shared(ServerType::Local);
        let core_cancel = CancellationToken::new();
        let stream: Arc<dyn StreamDialer> = Arc::new(ShadowsocksStreamDialer {
            context: context.clone(),
            server: server.clone(),
            cancel: core_cancel.clone(),
        });
        let packet: Arc<dyn PacketDialer> = Arc::new(ShadowsocksPacketDialer {
            context,
            server,
            cancel: core_cancel.clone(),
        });

        self.log.set_verbose(config.verbose);
        let socks = Arc::new(Socks5Server::new(stream.clone(), packet, self.log.clone(), core_cancel.clone()));
        let accept = tokio::spawn(socks.serve(listener));

        self.log.info(format!(
            "proxy started address={} server={}:{} method={}",
            local_addr, config.server, config.server_port, config.method
        ));
        *state = Some(Running {
            local_addr,
            stream,
            cancel: core_cancel,
            accept,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return Ok(());
        };

        running.cancel.cancel();
        if let Err(e) = running.accept.await {
            self.log.warn(format!("accept loop ended abnormally: {}", e));
        }
        self.log.info(format!("proxy stopped address={}", running.local_addr));
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    fn version(&self) -> String {
        TUNNEL_VERSION.to_string()
    }

    async fn measure_ping(&self, urls: &[String], cancel: &CancellationToken) -> Result<Vec<PingResult>> {
        let dialer = {
            let state = self.state.lock().await;
            state.as_ref().map(|running| running.stream.clone()).ok_or(Error::NotRunning)?
        };
        probe::measure_ping(dialer.as_ref(), urls, &self.probe, cancel).await
    }

    fn fetch_logs(&self) -> String {
        self.log.buffer().fetch_logs()
    }

    fn clear_logs(&self) -> bool {
        self.log.buffer().clear_logs()
    }
}
