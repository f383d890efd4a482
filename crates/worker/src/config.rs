// Worker configuration
// Decision: Everything comes from environment variables with development defaults

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::reconnect::ReconnectPolicy;
use crate::transport::TransportConfig;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the queue server (`ws://host:port`)
    pub queue_url: String,
    pub worker_id: String,
    /// Shared secret used to sign the worker token
    pub worker_secret: Option<String>,
    /// Maximum attempts run concurrently
    pub capacity: usize,
    /// Directory adaptors are installed under (`<repo_dir>/<specifier>`)
    pub repo_dir: Option<PathBuf>,
    /// Poll interval right after a successful claim
    pub poll_min_interval: Duration,
    /// Poll interval ceiling while the queue stays empty
    pub poll_max_interval: Duration,
    pub poll_backoff_multiplier: f64,
    /// Per-attempt timeout (defaults to the pool's run timeout)
    pub attempt_timeout: Option<Duration>,
    pub reply_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_url: "ws://127.0.0.1:8888".to_string(),
            worker_id: format!("worker-{}", Uuid::now_v7()),
            worker_secret: None,
            capacity: 5,
            repo_dir: None,
            poll_min_interval: Duration::from_millis(100),
            poll_max_interval: Duration::from_secs(5),
            poll_backoff_multiplier: 1.5,
            attempt_timeout: None,
            reply_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

impl WorkerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut reconnect = defaults.reconnect.clone();
        if let Some(max_attempts) = env_parse("WORKER_RECONNECT_MAX_ATTEMPTS") {
            reconnect = reconnect.with_max_attempts(max_attempts);
        }
        if let Some(interval) = env_millis("WORKER_RECONNECT_INITIAL_MS") {
            reconnect = reconnect.with_initial_interval(interval);
        }
        if let Some(interval) = env_millis("WORKER_RECONNECT_MAX_MS") {
            reconnect = reconnect.with_max_interval(interval);
        }

        Self {
            queue_url: std::env::var("QUEUE_URL").unwrap_or(defaults.queue_url),
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            worker_secret: std::env::var("WORKER_SECRET")
                .ok()
                .filter(|secret| !secret.is_empty()),
            capacity: env_parse::<usize>("WORKER_CAPACITY")
                .unwrap_or(defaults.capacity)
                .max(1),
            repo_dir: std::env::var("REPO_DIR").ok().map(PathBuf::from),
            poll_min_interval: env_millis("WORKER_POLL_MIN_MS").unwrap_or(defaults.poll_min_interval),
            poll_max_interval: env_millis("WORKER_POLL_MAX_MS").unwrap_or(defaults.poll_max_interval),
            poll_backoff_multiplier: defaults.poll_backoff_multiplier,
            attempt_timeout: env_millis("ATTEMPT_TIMEOUT_MS"),
            reply_timeout: env_millis("WORKER_REPLY_TIMEOUT_MS").unwrap_or(defaults.reply_timeout),
            heartbeat_interval: env_millis("WORKER_HEARTBEAT_MS")
                .unwrap_or(defaults.heartbeat_interval),
            reconnect,
        }
    }

    pub fn with_queue_url(mut self, url: impl Into<String>) -> Self {
        self.queue_url = url.into();
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_worker_secret(mut self, secret: impl Into<String>) -> Self {
        self.worker_secret = Some(secret.into());
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_repo_dir(mut self, repo_dir: impl Into<PathBuf>) -> Self {
        self.repo_dir = Some(repo_dir.into());
        self
    }

    pub fn with_poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.poll_min_interval = min;
        self.poll_max_interval = max.max(min);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Transport settings derived from this config
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            url: self.queue_url.clone(),
            worker_id: self.worker_id.clone(),
            worker_secret: self.worker_secret.clone(),
            reply_timeout: self.reply_timeout,
            heartbeat_interval: self.heartbeat_interval,
            reconnect: self.reconnect.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_clamp() {
        let config = WorkerConfig::default()
            .with_capacity(0)
            .with_poll_interval(Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(config.capacity, 1);
        assert_eq!(config.poll_max_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_transport_config_carries_identity() {
        let config = WorkerConfig::default()
            .with_queue_url("ws://queue:8888")
            .with_worker_id("w-1")
            .with_worker_secret("s");
        let transport = config.transport();
        assert_eq!(transport.url, "ws://queue:8888");
        assert_eq!(transport.worker_id, "w-1");
        assert_eq!(transport.worker_secret.as_deref(), Some("s"));
    }
}
