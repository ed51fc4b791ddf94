//! coreswitch - local control plane for switchable proxy cores
//!
//! Re-exports the core and API crates and wires them together in [`daemon`].

pub use coreswitch_core::{
    detect_core_name, init_logger, ControlSurface, Core, CoreRegistry, Error, ExternalCore, PacketEngine,
    PingResult, ProbeSettings, ProcessEngine, Result, Settings, StartCoreRequest, StartOptions, TunnelService,
    UnlinkedPacketEngine, VpnBridge, TUNNEL_CORE_NAME,
};
pub use coreswitch_api::{ApiConfig, ApiServer};

pub mod daemon;
