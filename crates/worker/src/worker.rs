// Claim loop
// Decision: Claims never exceed free capacity, so a claimed attempt always has a slot
// Decision: Polling backs off while the queue is empty and resets after a claim

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conveyor_core::serde_util::millis;
use conveyor_core::{events, ClaimRequest, Topic};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::WorkerConfig;
use crate::runner::AttemptRunner;
use crate::transport::QueueTransport;

/// Delay after a failed claim before trying again
const CLAIM_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Poll interval that grows while the queue is empty
#[derive(Debug, Clone)]
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            min,
            max: max.max(min),
            multiplier: multiplier.max(1.0),
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn increase(&mut self) {
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = next.min(self.max);
    }
}

pub struct Worker {
    config: WorkerConfig,
    transport: Arc<dyn QueueTransport>,
    runner: Arc<AttemptRunner>,
    slots: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        transport: Arc<dyn QueueTransport>,
        runner: AttemptRunner,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            slots: Arc::new(Semaphore::new(config.capacity)),
            config,
            transport,
            runner: Arc::new(runner),
            shutdown_tx,
        }
    }

    /// Attempts currently running
    pub fn active(&self) -> usize {
        self.config.capacity - self.slots.available_permits()
    }

    /// Signal the claim loop to stop; running attempts finish first
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Claim and run attempts until shut down
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let workers = Topic::Workers.to_string();
        self.transport
            .join(&workers)
            .await
            .context("Failed to join the workers channel")?;

        info!(capacity = self.config.capacity, "worker started");

        let mut backoff = PollBackoff::new(
            self.config.poll_min_interval,
            self.config.poll_max_interval,
            self.config.poll_backoff_multiplier,
        );

        while !*shutdown_rx.borrow() {
            let free = self.slots.available_permits();
            if free == 0 {
                // Wait for a slot (or shutdown) before claiming again
                tokio::select! {
                    permit = Arc::clone(&self.slots).acquire_owned() => drop(permit),
                    _ = shutdown_rx.changed() => break,
                }
                continue;
            }

            let delay = match self.claim(&workers, free).await {
                Ok(0) => {
                    backoff.increase();
                    trace!(
                        interval_ms = millis(backoff.current()),
                        "queue empty"
                    );
                    backoff.current()
                }
                Ok(_) => {
                    backoff.reset();
                    continue;
                }
                Err(e) => {
                    error!("claim failed: {:#}", e);
                    CLAIM_ERROR_DELAY
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        info!(active = self.active(), "draining running attempts");
        let _ = self
            .slots
            .acquire_many(self.config.capacity as u32)
            .await;
        if let Err(e) = self.transport.leave(&workers).await {
            debug!("leave failed: {}", e);
        }
        info!("worker stopped");
        Ok(())
    }

    /// Claim up to `free` attempts and start each; returns how many were claimed
    async fn claim(&self, workers: &str, free: usize) -> Result<usize> {
        let request = serde_json::to_value(ClaimRequest { count: Some(free) })?;
        let reply = self.transport.push(workers, events::CLAIM, request).await?;
        let ids: Vec<String> = serde_json::from_value(reply).context("Invalid claim reply")?;

        if !ids.is_empty() {
            debug!(count = ids.len(), "claimed attempts");
        }

        for id in &ids {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                // Only this loop takes permits, so a claim never outgrows them
                warn!(attempt_id = %id, "no free slot for claimed attempt");
                continue;
            };
            let runner = Arc::clone(&self.runner);
            let id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.run(&id).await {
                    error!(attempt_id = %id, "attempt failed: {:#}", e);
                    if let Err(report) = runner.report_crash(&id, &e).await {
                        warn!(attempt_id = %id, "crash not reported: {:#}", report);
                    }
                }
                drop(permit);
            });
        }
        Ok(ids.len())
    }
}
