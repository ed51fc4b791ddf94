//! coreswitch core - lifecycle orchestration for interchangeable proxy cores
//!
//! Provides the core registry, an encrypted SOCKS5 tunnel core, a core backed
//! by an external proxy engine, bounded log capture, latency probing and the
//! VPN bridge, all reachable through [`ControlSurface`].

pub mod config;
pub mod control;
pub mod dial;
pub mod error;
pub mod external;
pub mod log_buffer;
pub mod options;
pub mod patcher;
pub mod probe;
pub mod process_engine;
pub mod proxy_core;
pub mod registry;
pub mod socks5;
pub mod tunnel;
pub mod vpn;

pub use config::{ApiSettings, ExternalSettings, Settings, VpnSettings};
pub use control::{detect_core_name, ControlSurface, StartCoreRequest, PING_TIMEOUT};
pub use dial::{BoxedStream, PacketDialer, PacketEndpoint, StreamDialer, TargetAddr};
pub use error::{Error, Result};
pub use external::{EngineInstance, EngineLaunch, ExternalCore, ProxyEngine};
pub use log_buffer::{CoreLog, LogBuffer, LOG_BUFFER_CEILING};
pub use options::StartOptions;
pub use patcher::replace_inbound_socks_port;
pub use probe::{FailurePolicy, PingResult, ProbeSettings, DEFAULT_PROBE_URL, FAILED_DELAY};
pub use process_engine::ProcessEngine;
pub use proxy_core::Core;
pub use registry::CoreRegistry;
pub use socks5::{Socks5Dialer, Socks5Server};
pub use tunnel::{TunnelConfig, TunnelService, TUNNEL_CORE_NAME};
pub use vpn::{PacketEngine, PacketEngineKey, UnlinkedPacketEngine, VpnBridge};

/// Initialize the logger; `RUST_LOG` wins over `default_filter`
pub fn init_logger(default_filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
