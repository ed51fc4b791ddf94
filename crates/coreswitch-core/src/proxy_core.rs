use crate::error::Result;
use crate::options::StartOptions;
use crate::probe::PingResult;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A pluggable proxy backend with a fixed lifecycle.
///
/// Every implementation serializes its own `start`/`stop` and owns its
/// cancellation scope; stopping one core never touches another.
#[async_trait]
pub trait Core: Send + Sync {
    /// Registry key of this core
    fn core_name(&self) -> &str;

    /// Start with per-request options; `cancel` aborts a start still in progress
    async fn start(&self, opts: &StartOptions, cancel: &CancellationToken) -> Result<()>;

    /// Stop; succeeds without effect when not running
    async fn stop(&self) -> Result<()>;

    async fn is_running(&self) -> bool;

    fn version(&self) -> String;

    /// Probe `urls` through this core's dial capability
    async fn measure_ping(&self, urls: &[String], cancel: &CancellationToken) -> Result<Vec<PingResult>>;

    /// Drain captured log lines
    fn fetch_logs(&self) -> String;

    fn clear_logs(&self) -> bool;
}
