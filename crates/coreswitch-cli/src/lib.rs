//! coreswitch CLI - standalone runner for the encrypted SOCKS5 tunnel
//!
//! Builds a tunnel config from flags, raw JSON or a file and prints helpers
//! shared by the `coreswitch-tunnel` binary.

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use coreswitch_core::{StartOptions, TunnelConfig};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "coreswitch-tunnel", version, about = "Run a local SOCKS5 proxy over an encrypted tunnel")]
pub struct Args {
    /// Config file path
    #[arg(long, default_value = "config.json")]
    pub config: PathBuf,
    /// Raw JSON config, takes precedence over everything else
    #[arg(long)]
    pub json: Option<String>,
    /// Tunnel server address
    #[arg(long)]
    pub server: Option<String>,
    /// Tunnel server port
    #[arg(long, default_value_t = 2080)]
    pub port: u16,
    #[arg(long)]
    pub password: Option<String>,
    /// Cipher, e.g. chacha20-ietf-poly1305
    #[arg(long)]
    pub method: Option<String>,
    /// Local SOCKS5 listen address, used when the config has none
    #[arg(long, default_value = "127.0.0.1:1080")]
    pub local: String,
    #[arg(short = 'v', long)]
    pub verbose: bool,
    /// Probe these URLs through the tunnel once it is up
    #[arg(long)]
    pub ping: Vec<String>,
}

/// Where the tunnel config comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Json(String),
    Flags,
    File(PathBuf),
}

impl Args {
    pub fn source(&self) -> ConfigSource {
        let given = |flag: &Option<String>| flag.as_deref().is_some_and(|v| !v.is_empty());
        match &self.json {
            Some(json) if !json.is_empty() => ConfigSource::Json(json.clone()),
            _ if given(&self.server) && given(&self.password) && given(&self.method) => ConfigSource::Flags,
            _ => ConfigSource::File(self.config.clone()),
        }
    }

    pub fn tunnel_config(&self) -> Result<TunnelConfig> {
        let mut config: TunnelConfig = match self.source() {
            ConfigSource::Json(json) => serde_json::from_str(&json).context("invalid --json config")?,
            ConfigSource::Flags => TunnelConfig {
                server: self.server.clone().unwrap_or_default(),
                server_port: i64::from(self.port),
                password: self.password.clone().unwrap_or_default(),
                method: self.method.clone().unwrap_or_default(),
                ..TunnelConfig::default()
            },
            ConfigSource::File(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))?
            }
        };

        if config.local_addr.as_deref().map_or(true, str::is_empty) {
            config.local_addr = Some(self.local.clone());
        }
        config.verbose |= self.verbose;
        config.validate()?;
        Ok(config)
    }

    /// Inline start options; the listen port comes from the config's `local_addr`
    pub fn start_options(&self) -> Result<StartOptions> {
        let config = self.tunnel_config()?;
        Ok(StartOptions::inline(serde_json::to_string(&config)?, 0))
    }
}

pub fn print_banner(version: &str) {
    println!("{} {}", "coreswitch-tunnel".cyan().bold(), version.yellow());
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", "i".blue().bold(), msg);
}

pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}
