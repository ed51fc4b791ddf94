//! Bounded in-memory log capture
//!
//! Each core owns one [`LogBuffer`]. The host drains it with `fetch_logs`;
//! when nobody drains it, the buffer halves itself at line boundaries once it
//! grows past [`LOG_BUFFER_CEILING`].

use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Size ceiling of a log buffer (2 MiB)
pub const LOG_BUFFER_CEILING: usize = 2 * 1024 * 1024;

#[derive(Debug)]
struct LogState {
    text: String,
    enabled: bool,
}

/// Lock-protected, size-bounded sink of newline-terminated lines
#[derive(Debug)]
pub struct LogBuffer {
    state: Mutex<LogState>,
    ceiling: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_ceiling(LOG_BUFFER_CEILING)
    }

    pub fn with_ceiling(ceiling: usize) -> Self {
        Self {
            state: Mutex::new(LogState {
                text: String::new(),
                enabled: true,
            }),
            ceiling,
        }
    }

    /// Append one line; trailing line breaks are normalized to exactly one
    /// and interior ones become spaces
    pub fn append(&self, line: &str) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }

        let line = line.trim_end_matches(['\n', '\r']);
        if line.contains(['\n', '\r']) {
            let flat = line.replace("\r\n", " ").replace(['\n', '\r'], " ");
            state.text.push_str(&flat);
        } else {
            state.text.push_str(line);
        }
        state.text.push('\n');

        if state.text.len() > self.ceiling {
            Self::truncate(&mut state.text);
        }
    }

    /// Drop everything up to the first line boundary at or after the midpoint
    fn truncate(text: &mut String) {
        let mid = text.len() / 2;
        match text.as_bytes()[mid..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                text.drain(..mid + offset + 1);
            }
            None => text.clear(),
        }
    }

    /// Return all buffered lines joined by `\n` and empty the buffer
    pub fn fetch_logs(&self) -> String {
        let mut state = self.state.lock();
        let mut out = std::mem::take(&mut state.text);
        if out.ends_with('\n') {
            out.pop();
        }
        out
    }

    /// Disable, clear and re-enable
    pub fn clear_logs(&self) -> bool {
        let mut state = self.state.lock();
        state.enabled = false;
        state.text.clear();
        state.enabled = true;
        true
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn len(&self) -> usize {
        self.state.lock().text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Logging handle of one core: every event goes to `tracing` and to the core's buffer
#[derive(Debug, Clone)]
pub struct CoreLog {
    core: Arc<str>,
    buffer: Arc<LogBuffer>,
    verbose: Arc<AtomicBool>,
}

impl CoreLog {
    pub fn new(core: &str, buffer: Arc<LogBuffer>) -> Self {
        Self {
            core: Arc::from(core),
            buffer,
            verbose: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    /// Whether debug lines are captured into the buffer
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    fn capture(&self, level: &str, message: &dyn Display) {
        let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        self.buffer.append(&format!("{} {} {}", now, level, message));
    }

    pub fn debug(&self, message: impl Display) {
        tracing::debug!(core = %self.core, "{}", message);
        if self.verbose.load(Ordering::Relaxed) {
            self.capture("DEBUG", &message);
        }
    }

    pub fn info(&self, message: impl Display) {
        tracing::info!(core = %self.core, "{}", message);
        self.capture("INFO", &message);
    }

    pub fn warn(&self, message: impl Display) {
        tracing::warn!(core = %self.core, "{}", message);
        self.capture("WARN", &message);
    }

    pub fn error(&self, message: impl Display) {
        tracing::error!(core = %self.core, "{}", message);
        self.capture("ERROR", &message);
    }
}
