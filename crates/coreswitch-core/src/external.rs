//! Core backed by an external proxy engine
//!
//! The engine itself is opaque: it is launched from a (port-patched) config
//! and hands back a stream dial capability. While it runs, a maintenance task
//! ticks at a fixed interval.

use crate::proxy_core::Core;
use crate::dial::StreamDialer;
use crate::error::{Error, Result};
use crate::log_buffer::{CoreLog, LogBuffer};
use crate::options::StartOptions;
use crate::patcher::replace_inbound_socks_port;
use crate::probe::{self, FailurePolicy, PingResult, ProbeSettings};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything an engine needs to come up
#[derive(Debug, Clone)]
pub struct EngineLaunch {
    /// Config text after port patching
    pub config: String,
    /// File holding `config`, for file-based starts
    pub config_path: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub local_proxy_port: u16,
    /// 0 means no ceiling
    pub memory_limit_bytes: u64,
    pub log: CoreLog,
}

#[async_trait]
pub trait ProxyEngine: Send + Sync {
    fn version(&self) -> String;

    async fn launch(&self, launch: EngineLaunch) -> Result<Arc<dyn EngineInstance>>;
}

/// A launched engine
#[async_trait]
pub trait EngineInstance: Send + Sync {
    fn stream_dialer(&self) -> Arc<dyn StreamDialer>;

    /// Periodic upkeep while running; an error is logged once per failing streak, not fatal
    async fn maintain(&self, memory_limit_bytes: u64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

struct EngineRun {
    instance: Arc<dyn EngineInstance>,
    cancel: CancellationToken,
    maintenance: JoinHandle<()>,
}

pub struct ExternalCore {
    name: String,
    engine: Arc<dyn ProxyEngine>,
    probe: ProbeSettings,
    maintenance_interval: Duration,
    state: Mutex<Option<EngineRun>>,
    ready: watch::Sender<bool>,
    log: CoreLog,
}

impl ExternalCore {
    pub fn new(
        name: impl Into<String>,
        engine: Arc<dyn ProxyEngine>,
        probe: ProbeSettings,
        maintenance_interval: Duration,
    ) -> Self {
        let name = name.into();
        let (ready, _) = watch::channel(false);
        Self {
            log: CoreLog::new(&name, Arc::new(LogBuffer::new())),
            name,
            engine,
            probe,
            maintenance_interval,
            state: Mutex::new(None),
            ready,
        }
    }

    /// Strict probing unless configured otherwise
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.probe.policy = policy;
        self
    }

    /// Resolves once the engine is up; never resolves while it is down
    async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let mut ready = self.ready.subscribe();
        loop {
            let is_ready = *ready.borrow_and_update();
            if is_ready {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                changed = ready.changed() => changed.map_err(|_| Error::NotRunning)?,
            }
        }
    }
}

fn spawn_maintenance(
    instance: Arc<dyn EngineInstance>,
    interval: Duration,
    memory_limit_bytes: u64,
    log: CoreLog,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        // a failure is logged once until upkeep succeeds again
        let mut failing = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match instance.maintain(memory_limit_bytes).await {
                    Ok(()) if failing => {
                        failing = false;
                        log.info("maintenance recovered");
                    }
                    Ok(()) => {}
                    Err(e) if !failing => {
                        failing = true;
                        log.warn(format!("maintenance failed: {}", e));
                    }
                    Err(_) => {}
                },
            }
        }
    })
}

#[async_trait]
impl Core for ExternalCore {
    fn core_name(&self) -> &str {
        &self.name
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
        let config = if opts.local_proxy_port != 0 {
            replace_inbound_socks_port(&text, opts.local_proxy_port)?
        } else {
            text
        };

        let config_path = if opts.is_inline_config {
            None
        } else {
            tokio::fs::write(&opts.config, &config).await?;
            Some(PathBuf::from(&opts.config))
        };

        let launch = EngineLaunch {
            config,
            config_path,
            work_dir: opts.work_dir.clone(),
            local_proxy_port: opts.local_proxy_port,
            memory_limit_bytes: opts.memory_limit_bytes(),
            log: self.log.clone(),
        };
        let instance = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            launched = self.engine.launch(launch) => launched?,
        };

        let core_cancel = CancellationToken::new();
        let maintenance = spawn_maintenance(
            instance.clone(),
            self.maintenance_interval,
            opts.memory_limit_bytes(),
            self.log.clone(),
            core_cancel.clone(),
        );

        *state = Some(EngineRun {
            instance,
            cancel: core_cancel,
            maintenance,
        });
        self.ready.send_replace(true);
        self.log.info(format!("{} started port={}", self.name, opts.local_proxy_port));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(run) = state.take() else {
            return Ok(());
        };

        self.ready.send_replace(false);
        run.cancel.cancel();
        if let Err(e) = run.maintenance.await {
            self.log.warn(format!("maintenance task ended abnormally: {}", e));
        }

        let closed = run.instance.close().await;
        match &closed {
            Ok(()) => self.log.info(format!("{} stopped", self.name)),
            Err(e) => self.log.error(format!("{} stopped with error: {}", self.name, e)),
        }
        closed
    }

    async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    fn version(&self) -> String {
        self.engine.version()
    }

    async fn measure_ping(&self, urls: &[String], cancel: &CancellationToken) -> Result<Vec<PingResult>> {
        self.wait_ready(cancel).await?;
        let dialer = {
            let state = self.state.lock().await;
            state
                .as_ref()
                .map(|run| run.instance.stream_dialer())
                .ok_or(Error::NotRunning)?
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
