use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use crate::error::Result;
use crate::probe::{FailurePolicy, ProbeSettings};
use tracing::{info, warn};

/// Daemon settings, read from `coreswitch.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub api: ApiSettings,
    /// Probe settings used by the tunnel core
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub external: ExternalSettings,
    #[serde(default)]
    pub vpn: VpnSettings,
}

fn default_log_filter() -> String { "info".to_string() }

/// Control API listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default)]
    pub enable_cors: bool,
}

fn default_bind_address() -> String { "127.0.0.1".to_string() }
fn default_bind_port() -> u16 { 19085 }

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            enable_cors: false,
        }
    }
}

/// External engine core, backed by a proxy binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Core name the host uses to select this backend
    #[serde(default = "default_external_name")]
    pub name: String,
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments; `{config}` is replaced with the config file path
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_engine_version")]
    pub version: String,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    #[serde(default = "default_external_policy")]
    pub policy: FailurePolicy,
}

fn default_external_name() -> String { "xray".to_string() }
fn default_program() -> String { "xray".to_string() }
fn default_args() -> Vec<String> { vec!["run".to_string(), "-c".to_string(), "{config}".to_string()] }
fn default_engine_version() -> String { "unknown".to_string() }
fn default_ready_timeout_ms() -> u64 { 5000 }
fn default_maintenance_interval_ms() -> u64 { 1000 }
fn default_external_policy() -> FailurePolicy { FailurePolicy::Strict }

impl Default for ExternalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            name: default_external_name(),
            program: default_program(),
            args: default_args(),
            version: default_engine_version(),
            ready_timeout_ms: default_ready_timeout_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            policy: default_external_policy(),
        }
    }
}

impl ExternalSettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}

/// Packet-routing engine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnSettings {
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_vpn_log_level")]
    pub log_level: String,
}

fn default_mtu() -> u32 { 1500 }
fn default_vpn_log_level() -> String { "info".to_string() }

impl Default for VpnSettings {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            log_level: default_vpn_log_level(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            api: ApiSettings::default(),
            probe: ProbeSettings::default(),
            external: ExternalSettings::default(),
            vpn: VpnSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;

        match toml::from_str::<Self>(&content) {
            Ok(settings) => {
                info!(path = %path.as_ref().display(), "settings loaded");
                Ok(settings)
            }
            Err(e) => {
                warn!("settings file is malformed: {}", e);
                warn!("falling back to per-section parsing");
                Self::parse_with_fallbacks(&content)
            }
        }
    }

    /// Keep every section that parses on its own and default the rest
    fn parse_with_fallbacks(content: &str) -> Result<Self> {
        let table = content.parse::<toml::Table>()?;
        let mut settings = Settings::default();

        if let Some(filter) = table.get("log_filter").and_then(|v| v.as_str()) {
            settings.log_filter = filter.to_string();
        }

        macro_rules! section {
            ($key:literal, $field:ident) => {
                if let Some(value) = table.get($key) {
                    match value.clone().try_into() {
                        Ok(parsed) => settings.$field = parsed,
                        Err(e) => warn!("ignoring [{}] section: {}", $key, e),
                    }
                }
            };
        }

        section!("api", api);
        section!("probe", probe);
        section!("external", external);
        section!("vpn", vpn);

        Ok(settings)
    }

    /// Save settings to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Load the file if it exists, otherwise write and return the defaults
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_file(path);
        }
        let settings = Settings::default();
        settings.save_to_file(path)?;
        info!(path = %path.display(), "default settings written");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.api.bind_port, 19085);
        assert_eq!(settings.probe.policy, FailurePolicy::Soft);
        assert_eq!(settings.external.policy, FailurePolicy::Strict);
        assert_eq!(settings.vpn.mtu, 1500);
    }

    #[test]
    fn broken_section_is_defaulted() {
        let content = r#"
log_filter = "debug"

[api]
bind_port = "not a port"

[vpn]
mtu = 1400
"#;
        let settings = Settings::parse_with_fallbacks(content).unwrap();
        assert_eq!(settings.log_filter, "debug");
        assert_eq!(settings.api.bind_port, 19085);
        assert_eq!(settings.vpn.mtu, 1400);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coreswitch.toml");

        let created = Settings::load_or_create(&path).unwrap();
        assert!(path.exists());

        let loaded = Settings::from_file(&path).unwrap();
        assert_eq!(loaded.external.args, created.external.args);
        assert_eq!(loaded.probe.default_url, created.probe.default_url);
    }
}
