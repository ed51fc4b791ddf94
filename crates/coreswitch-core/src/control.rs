//! Transport-independent control operations
//!
//! Every front end (HTTP API, in-process callers, the CLI) goes through
//! [`ControlSurface`], which routes to the registry's active core and drives
//! the VPN bridge.

use crate::error::{Error, Result};
use crate::options::StartOptions;
use crate::probe::PingResult;
use crate::registry::CoreRegistry;
use crate::tunnel::TUNNEL_CORE_NAME;
use crate::vpn::VpnBridge;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Upper bound of one MeasurePing call
pub const PING_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartCoreRequest {
    /// Empty selects a core from the shape of the config
    pub core_name: String,
    pub work_dir: PathBuf,
    pub config: String,
    pub memory_mb: u64,
    pub is_inline_config: bool,
    pub local_proxy_port: u16,
    pub vpn_device_fd: i32,
    pub is_vpn_mode: bool,
}

impl StartCoreRequest {
    pub fn options(&self) -> StartOptions {
        StartOptions {
            work_dir: self.work_dir.clone(),
            config: self.config.clone(),
            memory_limit_mb: self.memory_mb,
            is_inline_config: self.is_inline_config,
            local_proxy_port: self.local_proxy_port,
        }
    }
}

/// Pick a core for a config: tunnel-shaped configs go to the tunnel core,
/// everything else to the first other registered core.
pub fn detect_core_name(config: &str, registered: &[String]) -> String {
    let tunnel_shaped = serde_json::from_str::<serde_json::Value>(config)
        .ok()
        .and_then(|value| {
            let object = value.as_object()?;
            Some(["server", "server_port", "method", "password"].iter().all(|key| object.contains_key(*key)))
        })
        .unwrap_or(false);

    if !tunnel_shaped {
        if let Some(other) = registered.iter().find(|name| name.as_str() != TUNNEL_CORE_NAME) {
            return other.clone();
        }
    }
    TUNNEL_CORE_NAME.to_string()
}

pub struct ControlSurface {
    registry: Arc<CoreRegistry>,
    vpn: Arc<VpnBridge>,
    ping_timeout: Duration,
}

impl ControlSurface {
    pub fn new(registry: Arc<CoreRegistry>, vpn: Arc<VpnBridge>) -> Self {
        Self {
            registry,
            vpn,
            ping_timeout: PING_TIMEOUT,
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<CoreRegistry> {
        &self.registry
    }

    pub fn vpn(&self) -> &Arc<VpnBridge> {
        &self.vpn
    }

    /// Start a core and, in VPN mode, route the device through its SOCKS port.
    ///
    /// If the VPN cannot start, the core is stopped again and the VPN error returned.
    pub async fn start_core(&self, request: &StartCoreRequest, cancel: &CancellationToken) -> Result<()> {
        if request.is_vpn_mode && request.local_proxy_port == 0 {
            return Err(Error::MissingField("local_proxy_port".to_string()));
        }
        let opts = request.options();

        let name = if request.core_name.is_empty() {
            let config = opts.load_config().await?;
            let detected = detect_core_name(&config, &self.registry.names());
            info!(core = %detected, "core detected from config");
            detected
        } else {
            request.core_name.clone()
        };

        let core = self.registry.start_core(&name, &opts, cancel).await?;

        if request.is_vpn_mode && !self.vpn.is_started() {
            let proxy_address = format!("127.0.0.1:{}", request.local_proxy_port);
            if let Err(e) = self.vpn.start(request.vpn_device_fd, &proxy_address) {
                warn!(core = %name, error = %e, "packet engine failed, stopping core");
                if let Err(stop_err) = core.stop().await {
                    warn!(core = %name, error = %stop_err, "rollback stop failed");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop the active core and the VPN bridge
    pub async fn stop_core(&self) -> Result<()> {
        let core = self.registry.active()?;
        let stopped = core.stop().await;
        if self.vpn.is_started() {
            self.vpn.stop();
        }
        stopped
    }

    pub async fn is_core_running(&self) -> Result<bool> {
        Ok(self.registry.active()?.is_running().await)
    }

    pub fn get_version(&self) -> Result<String> {
        Ok(self.registry.active()?.version())
    }

    /// Probe through the active core, bounded by the ping timeout and `cancel`
    pub async fn measure_ping(&self, urls: &[String], cancel: &CancellationToken) -> Result<Vec<PingResult>> {
        let core = self.registry.active()?;
        let scope = cancel.child_token();
        match tokio::time::timeout(self.ping_timeout, core.measure_ping(urls, &scope)).await {
            Ok(results) => results,
            Err(_) => {
                scope.cancel();
                Err(Error::Cancelled)
            }
        }
    }

    pub fn fetch_logs(&self) -> Result<String> {
        Ok(self.registry.active()?.fetch_logs())
    }

    pub fn clear_logs(&self) -> Result<bool> {
        Ok(self.registry.active()?.clear_logs())
    }
}
