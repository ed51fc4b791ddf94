use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use crate::error::Result;

/// Per-request start parameters handed to a core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Work/asset directory, passed through to backends that need it
    pub work_dir: PathBuf,
    /// Inline JSON, or a file path when `is_inline_config` is false
    pub config: String,
    /// Memory ceiling in MB; 0 disables it
    pub memory_limit_mb: u64,
    pub is_inline_config: bool,
    /// Requested local SOCKS port; 0 lets the core decide
    pub local_proxy_port: u16,
}

impl StartOptions {
    /// Options for an inline JSON config
    pub fn inline(config: impl Into<String>, local_proxy_port: u16) -> Self {
        Self {
            config: config.into(),
            is_inline_config: true,
            local_proxy_port,
            ..Self::default()
        }
    }

    /// Config text, reading the file when the config is not inline
    pub async fn load_config(&self) -> Result<String> {
        if self.is_inline_config {
            return Ok(self.config.clone());
        }
        Ok(tokio::fs::read_to_string(&self.config).await?)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inline_config_is_returned_verbatim() {
        let opts = StartOptions::inline("{\"a\":1}", 1080);
        assert_eq!(opts.load_config().await.unwrap(), "{\"a\":1}");
    }

    #[tokio::test]
    async fn file_config_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let opts = StartOptions {
            config: path.display().to_string(),
            ..StartOptions::default()
        };
        assert_eq!(opts.load_config().await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let opts = StartOptions {
            config: "/nonexistent/coreswitch.json".to_string(),
            ..StartOptions::default()
        };
        assert!(matches!(opts.load_config().await, Err(crate::Error::Io(_))));
    }

    #[test]
    fn memory_limit_in_bytes() {
        let opts = StartOptions { memory_limit_mb: 2, ..StartOptions::default() };
        assert_eq!(opts.memory_limit_bytes(), 2 * 1024 * 1024);
    }
}
