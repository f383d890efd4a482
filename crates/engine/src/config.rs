//! Pool configuration

use std::path::PathBuf;
use std::time::Duration;

use conveyor_core::serde_util::duration_millis;
use serde::{Deserialize, Serialize};

/// Name of the sandbox executable built alongside the engine
pub const SANDBOX_BIN_NAME: &str = "conveyor-sandbox";

/// How sandboxes are isolated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Dedicated OS thread with its own runtime
    Thread,
    /// Child process speaking JSON lines over stdio
    Process,
}

impl std::str::FromStr for SandboxMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown sandbox mode: {other}")),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live sandboxes
    pub size: usize,

    /// Default wall-clock limit for a run
    #[serde(with = "duration_millis")]
    pub run_timeout: Duration,

    pub mode: SandboxMode,

    /// Sandbox executable (process mode); defaults to a sibling of the current binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_bin: Option<PathBuf>,

    /// Register diagnostic task handlers (tests only)
    #[serde(default)]
    pub diagnostics: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            run_timeout: Duration::from_secs(300),
            mode: SandboxMode::Process,
            sandbox_bin: None,
            diagnostics: false,
        }
    }
}

impl PoolConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `POOL_SIZE`: Maximum live sandboxes (default: available parallelism)
    /// - `RUN_TIMEOUT_MS`: Default run timeout (default: 300000)
    /// - `SANDBOX_MODE`: "process" or "thread" (default: process)
    /// - `CONVEYOR_SANDBOX_BIN`: Path to the sandbox executable
    /// - `SANDBOX_DIAGNOSTICS`: "1"/"true" to enable diagnostic tasks
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let size = std::env::var("POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.size);

        let run_timeout = std::env::var("RUN_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.run_timeout);

        let mode = std::env::var("SANDBOX_MODE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.mode);

        Self {
            size: size.max(1),
            run_timeout,
            mode,
            sandbox_bin: std::env::var("CONVEYOR_SANDBOX_BIN").ok().map(PathBuf::from),
            diagnostics: matches!(
                std::env::var("SANDBOX_DIAGNOSTICS").as_deref(),
                Ok("1") | Ok("true")
            ),
        }
    }

    /// Set the pool size
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    /// Set the default run timeout
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Set the sandbox mode
    pub fn with_mode(mut self, mode: SandboxMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the sandbox executable
    pub fn with_sandbox_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.sandbox_bin = Some(path.into());
        self
    }

    /// Enable diagnostic task handlers
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    /// Sandbox executable to launch in process mode
    pub fn resolve_sandbox_bin(&self) -> PathBuf {
        if let Some(path) = &self.sandbox_bin {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(SANDBOX_BIN_NAME)))
            .unwrap_or_else(|| PathBuf::from(SANDBOX_BIN_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = PoolConfig::default()
            .with_size(0)
            .with_run_timeout(Duration::from_millis(250))
            .with_mode(SandboxMode::Thread)
            .with_diagnostics(true);

        assert_eq!(config.size, 1);
        assert_eq!(config.run_timeout, Duration::from_millis(250));
        assert_eq!(config.mode, SandboxMode::Thread);
        assert!(config.diagnostics);
    }

    #[test]
    fn test_sandbox_mode_parse() {
        assert_eq!("Thread".parse::<SandboxMode>(), Ok(SandboxMode::Thread));
        assert_eq!("process".parse::<SandboxMode>(), Ok(SandboxMode::Process));
        assert!("fork".parse::<SandboxMode>().is_err());
    }

    #[test]
    fn test_explicit_sandbox_bin_wins() {
        let config = PoolConfig::default().with_sandbox_bin("/opt/sandbox");
        assert_eq!(config.resolve_sandbox_bin(), PathBuf::from("/opt/sandbox"));
    }
}
