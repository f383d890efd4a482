// Queue server configuration
// Decision: No worker secret means an open server (local development and tests)

use std::net::SocketAddr;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8888";

#[derive(Debug, Clone)]
pub struct QueueServerConfig {
    /// Address the HTTP/WebSocket listener binds to
    pub bind_addr: SocketAddr,
    /// Shared secret used to verify worker tokens
    pub worker_secret: Option<String>,
}

impl Default for QueueServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8888)),
            worker_secret: None,
        }
    }
}

impl QueueServerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = std::env::var("QUEUE_BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid QUEUE_BIND_ADDR: {}", e))?;

        let worker_secret = std::env::var("WORKER_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty());

        Ok(Self {
            bind_addr,
            worker_secret,
        })
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_worker_secret(mut self, secret: impl Into<String>) -> Self {
        self.worker_secret = Some(secret.into());
        self
    }
}
