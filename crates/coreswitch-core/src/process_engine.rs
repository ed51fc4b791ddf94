//! Proxy engine that runs an external proxy binary

use crate::config::ExternalSettings;
use crate::dial::StreamDialer;
use crate::error::{Error, Result};
use crate::external::{EngineInstance, EngineLaunch, ProxyEngine};
use crate::log_buffer::CoreLog;
use crate::patcher::inbound_socks_port;
use crate::socks5::Socks5Dialer;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Work directory, exported to the engine
pub const ASSET_DIR_ENV: &str = "CORESWITCH_ASSET_DIR";

const CONFIG_PLACEHOLDER: &str = "{config}";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
    version: String,
    ready_timeout: Duration,
}

impl ProcessEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>, version: impl Into<String>, ready_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            version: version.into(),
            ready_timeout,
        }
    }

    pub fn from_settings(settings: &ExternalSettings) -> Self {
        Self::new(
            settings.program.clone(),
            settings.args.clone(),
            settings.version.clone(),
            settings.ready_timeout(),
        )
    }

    fn command(&self, config_path: &Path, launch: &EngineLaunch) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(substitute_config(&self.args, config_path))
            .env(ASSET_DIR_ENV, &launch.work_dir)
            .env("GOGC", "10")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if launch.memory_limit_bytes > 0 {
            command.env("GOMEMLIMIT", launch.memory_limit_bytes.to_string());
        }
        if !launch.work_dir.as_os_str().is_empty() {
            command.current_dir(&launch.work_dir);
        }
        command
    }
}

fn substitute_config(args: &[String], config_path: &Path) -> Vec<String> {
    let path = config_path.display().to_string();
    args.iter().map(|arg| arg.replace(CONFIG_PLACEHOLDER, &path)).collect()
}

fn forward_lines<R>(reader: R, log: CoreLog, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                log.warn(line);
            } else {
                log.info(line);
            }
        }
    });
}

/// Config file written for an inline config; removed when dropped
struct ScratchConfig(PathBuf);

impl ScratchConfig {
    async fn write(text: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("coreswitch-{}.json", Uuid::new_v4()));
        tokio::fs::write(&path, text).await?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchConfig {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Fail fast when another listener already holds the engine's port
fn ensure_port_free(addr: SocketAddr) -> Result<()> {
    std::net::TcpListener::bind(addr)
        .map(drop)
        .map_err(|e| Error::NetworkFailure(format!("proxy port {} is not available: {}", addr.port(), e)))
}

fn exited(status: std::process::ExitStatus) -> Error {
    Error::UpstreamFailure(format!("engine exited during startup: {}", status))
}

/// Poll until the engine's socks port accepts connections
async fn wait_for_port(child: &mut Child, addr: SocketAddr, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(exited(status));
        }
        if TcpStream::connect(addr).await.is_ok() {
            return match child.try_wait()? {
                Some(status) => Err(exited(status)),
                None => Ok(()),
            };
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::UpstreamFailure(format!(
                "engine did not listen on {} within {:?}",
                addr, timeout
            )));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

#[async_trait]
impl ProxyEngine for ProcessEngine {
    fn version(&self) -> String {
        self.version.clone()
    }

    async fn launch(&self, launch: EngineLaunch) -> Result<Arc<dyn EngineInstance>> {
        let port = match launch.local_proxy_port {
            0 => inbound_socks_port(&launch.config)
                .ok_or_else(|| Error::MissingField("inbounds[socks].port".to_string()))?,
            port => port,
        };

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        ensure_port_free(addr)?;

        let scratch_config = match &launch.config_path {
            Some(_) => None,
            None => Some(ScratchConfig::write(&launch.config).await?),
        };
        let config_path = match &scratch_config {
            Some(scratch) => scratch.path().to_path_buf(),
            None => launch.config_path.clone().unwrap_or_default(),
        };

        let mut child = self
            .command(&config_path, &launch)
            .spawn()
            .map_err(|e| Error::UpstreamFailure(format!("failed to launch {}: {}", self.program, e)))?;
        debug!(program = %self.program, pid = ?child.id(), "engine process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, launch.log.clone(), false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, launch.log.clone(), true);
        }

        if let Err(e) = wait_for_port(&mut child, addr, self.ready_timeout).await {
            let _ = child.kill().await;
            return Err(e);
        }

        Ok(Arc::new(ProcessInstance {
            child: Mutex::new(child),
            dialer: Arc::new(Socks5Dialer::new(addr)),
            scratch_config,
        }))
    }
}

struct ProcessInstance {
    child: Mutex<Child>,
    dialer: Arc<Socks5Dialer>,
    scratch_config: Option<ScratchConfig>,
}

#[async_trait]
impl EngineInstance for ProcessInstance {
    fn stream_dialer(&self) -> Arc<dyn StreamDialer> {
        self.dialer.clone()
    }

    /// The memory ceiling is applied through the environment at launch;
    /// upkeep only reports an engine that died on its own.
    async fn maintain(&self, _memory_limit_bytes: u64) -> Result<()> {
        match self.child.lock().await.try_wait()? {
            Some(status) => Err(Error::UpstreamFailure(format!("engine exited: {}", status))),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_none() {
            child.kill().await?;
        }
        if let Some(scratch) = &self.scratch_config {
            let _ = tokio::fs::remove_file(scratch.path()).await;
        }
        Ok(())
    }
}
