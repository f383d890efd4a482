//! Worker pool
//!
//! Holds at most `size` sandboxes, spawned lazily. A submit takes an idle
//! sandbox, spawns a new one while under capacity, or waits in FIFO order for
//! one to be released. A sandbox goes back to the pool only if it is still
//! healthy; otherwise it is terminated and, if anyone is waiting, replaced
//! immediately.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use crate::error::EngineError;
use crate::events::WorkerEvent;
use crate::rpc::Task;
use crate::sandbox::{Sandbox, SandboxSpawner};

type Waiter = oneshot::Sender<Result<Sandbox, EngineError>>;

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,
    pub shut_down: bool,
}

struct PoolState {
    idle: VecDeque<Sandbox>,
    waiters: VecDeque<Waiter>,
    /// Spawned and not yet terminated (idle + busy + spawning)
    live: usize,
    next_id: usize,
    shut_down: bool,
}

pub struct WorkerPool {
    size: usize,
    spawner: Arc<dyn SandboxSpawner>,
    state: Mutex<PoolState>,
}

/// A sandbox checked out of the pool; released as unhealthy if dropped early
struct Lease<'a> {
    pool: &'a WorkerPool,
    sandbox: Option<Sandbox>,
}

impl Lease<'_> {
    fn sandbox(&self) -> Option<&Sandbox> {
        self.sandbox.as_ref()
    }

    fn release(mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            let healthy = sandbox.channel().is_healthy();
            self.pool.release(sandbox, healthy);
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            debug!(id = sandbox.id(), "submit abandoned mid-task, discarding sandbox");
            self.pool.release(sandbox, false);
        }
    }
}

/// A queued acquire; a sandbox delivered after the caller gave up goes back to the pool
struct Waiting<'a> {
    pool: &'a WorkerPool,
    rx: oneshot::Receiver<Result<Sandbox, EngineError>>,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        // No-op once the receiver has yielded its value
        self.rx.close();
        if let Ok(Ok(sandbox)) = self.rx.try_recv() {
            debug!(id = sandbox.id(), "waiter abandoned, returning sandbox");
            let healthy = sandbox.channel().is_healthy();
            self.pool.release(sandbox, healthy);
        }
    }
}

enum Acquire {
    Ready(Sandbox),
    Spawn(usize),
    Wait(oneshot::Receiver<Result<Sandbox, EngineError>>),
}

impl WorkerPool {
    pub fn new(size: usize, spawner: Arc<dyn SandboxSpawner>) -> Self {
        Self {
            size: size.max(1),
            spawner,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                live: 0,
                next_id: 0,
                shut_down: false,
            }),
        }
    }

    /// Run a task in a sandbox
    ///
    /// Waits for a free sandbox if all are busy. The timeout starts when the
    /// task is dispatched, not while waiting.
    #[instrument(skip(self, task, on_event), fields(task = %task.name))]
    pub async fn submit(
        &self,
        task: Task,
        timeout: Duration,
        on_event: &mut (dyn FnMut(WorkerEvent) + Send),
    ) -> Result<Value, EngineError> {
        let lease = Lease {
            pool: self,
            sandbox: Some(self.acquire().await?),
        };

        let outcome = match lease.sandbox() {
            Some(sandbox) => sandbox.channel().dispatch(task, timeout, on_event).await,
            None => Err(EngineError::Protocol("lease without sandbox".to_string())),
        };
        lease.release();
        outcome
    }

    async fn acquire(&self) -> Result<Sandbox, EngineError> {
        let next = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(EngineError::Shutdown);
            }
            if let Some(sandbox) = state.idle.pop_front() {
                Acquire::Ready(sandbox)
            } else if state.live < self.size {
                state.live += 1;
                let id = state.next_id;
                state.next_id += 1;
                Acquire::Spawn(id)
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                debug!(queued = state.waiters.len(), "all sandboxes busy, waiting");
                Acquire::Wait(rx)
            }
        };

        match next {
            Acquire::Ready(sandbox) => Ok(sandbox),
            Acquire::Spawn(id) => self.spawner.spawn(id).inspect_err(|e| {
                error!(id, "failed to spawn sandbox: {}", e);
                self.state.lock().live -= 1;
            }),
            Acquire::Wait(rx) => {
                let mut waiting = Waiting { pool: self, rx };
                (&mut waiting.rx).await.unwrap_or(Err(EngineError::Shutdown))
            }
        }
    }

    /// Return a sandbox after its task finished
    fn release(&self, sandbox: Sandbox, healthy: bool) {
        if healthy {
            let rejected = {
                let mut state = self.state.lock();
                if state.shut_down {
                    state.live -= 1;
                    Some(sandbox)
                } else {
                    match Self::hand_over(&mut state.waiters, sandbox) {
                        Some(sandbox) => {
                            state.idle.push_back(sandbox);
                            None
                        }
                        None => None,
                    }
                }
            };
            if let Some(sandbox) = rejected {
                sandbox.terminate();
            }
            return;
        }

        warn!(id = sandbox.id(), "discarding unhealthy sandbox");
        let replacement = {
            let mut state = self.state.lock();
            state.live -= 1;
            state.waiters.retain(|waiter| !waiter.is_closed());
            if !state.shut_down && !state.waiters.is_empty() && state.live < self.size {
                state.live += 1;
                let id = state.next_id;
                state.next_id += 1;
                Some(id)
            } else {
                None
            }
        };
        sandbox.terminate();

        if let Some(id) = replacement {
            self.replenish(id);
        }
    }

    /// Spawn a replacement and give it to the first waiter
    fn replenish(&self, id: usize) {
        let spawned = self.spawner.spawn(id);
        let mut state = self.state.lock();
        match spawned {
            Ok(sandbox) => {
                debug!(id, "replenished sandbox");
                if let Some(sandbox) = Self::hand_over(&mut state.waiters, sandbox) {
                    state.idle.push_back(sandbox);
                }
            }
            Err(e) => {
                error!(id, "failed to replenish sandbox: {}", e);
                state.live -= 1;
                if let Some(waiter) = state.waiters.pop_front() {
                    let _ = waiter.send(Err(e));
                }
            }
        }
    }

    /// Give the sandbox to the oldest live waiter; returns it if nobody is waiting
    fn hand_over(waiters: &mut VecDeque<Waiter>, mut sandbox: Sandbox) -> Option<Sandbox> {
        while let Some(waiter) = waiters.pop_front() {
            match waiter.send(Ok(sandbox)) {
                Ok(()) => return None,
                Err(returned) => match returned {
                    Ok(back) => sandbox = back,
                    Err(_) => return None,
                },
            }
        }
        Some(sandbox)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            size: self.size,
            live: state.live,
            idle: state.idle.len(),
            busy: state.live - state.idle.len(),
            queued: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            shut_down: state.shut_down,
        }
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live
    }

    pub fn queued(&self) -> usize {
        self.status().queued
    }

    /// Terminate idle sandboxes and reject further submits
    ///
    /// Busy sandboxes are terminated when their task finishes.
    pub fn shutdown(&self) {
        let (idle, waiters) = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let idle: Vec<Sandbox> = state.idle.drain(..).collect();
            state.live -= idle.len();
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            (idle, waiters)
        };

        info!(terminated = idle.len(), "shutting down worker pool");
        for sandbox in idle {
            sandbox.terminate();
        }
        for waiter in waiters {
            let _ = waiter.send(Err(EngineError::Shutdown));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{HandlerRegistry, ThreadSpawner};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(size: usize) -> WorkerPool {
        let spawner = ThreadSpawner::new(HandlerRegistry::production().with_diagnostics());
        WorkerPool::new(size, Arc::new(spawner))
    }

    async fn submit(pool: &WorkerPool, name: &str, args: Vec<Value>, timeout: Duration) -> Result<Value, EngineError> {
        pool.submit(Task::new(name, args), timeout, &mut |_| {}).await
    }

    /// Counts spawns, delegating to a thread spawner
    struct CountingSpawner {
        inner: ThreadSpawner,
        spawned: AtomicUsize,
    }

    impl SandboxSpawner for CountingSpawner {
        fn spawn(&self, id: usize) -> Result<Sandbox, EngineError> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.inner.spawn(id)
        }
    }

    #[tokio::test]
    async fn test_sandboxes_are_spawned_lazily() {
        let spawner = Arc::new(CountingSpawner {
            inner: ThreadSpawner::new(HandlerRegistry::production()),
            spawned: AtomicUsize::new(0),
        });
        let pool = WorkerPool::new(4, spawner.clone());
        assert_eq!(pool.live_count(), 0);

        for _ in 0..3 {
            let result = submit(&pool, "handshake", vec![], Duration::from_secs(5)).await;
            assert_eq!(result, Ok(json!(true)));
        }

        // Sequential submits reuse the same sandbox
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_state_persists_within_a_sandbox() {
        let pool = pool(1);
        let first = submit(&pool, "increment", vec![], Duration::from_secs(5)).await;
        let second = submit(&pool, "increment", vec![], Duration::from_secs(5)).await;
        assert_eq!(first, Ok(json!(1)));
        assert_eq!(second, Ok(json!(2)));
    }

    #[tokio::test]
    async fn test_excess_submits_wait_for_a_free_sandbox() {
        let pool = pool(2);
        let (a, b, c) = tokio::join!(
            submit(&pool, "wait", vec![json!(100)], Duration::from_secs(5)),
            submit(&pool, "wait", vec![json!(100)], Duration::from_secs(5)),
            submit(&pool, "sandbox_id", vec![], Duration::from_secs(5)),
        );
        assert_eq!(a, Ok(json!(100)));
        assert_eq!(b, Ok(json!(100)));
        assert!(c.is_ok());
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_sandbox_is_replaced() {
        let pool = pool(1);
        let before = submit(&pool, "sandbox_id", vec![], Duration::from_secs(5)).await.unwrap();

        let result = submit(&pool, "wait", vec![json!(1000)], Duration::from_millis(50)).await;
        assert_eq!(result, Err(EngineError::Timeout { timeout_ms: 50 }));
        assert_eq!(pool.live_count(), 0);

        let after = submit(&pool, "sandbox_id", vec![], Duration::from_secs(5)).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_crash_replenishes_for_waiters() {
        let pool = pool(1);
        let (crashed, next) = tokio::join!(
            submit(&pool, "panic", vec![], Duration::from_secs(5)),
            async {
                tokio::task::yield_now().await;
                submit(&pool, "increment", vec![], Duration::from_secs(5)).await
            },
        );

        assert!(matches!(crashed, Err(EngineError::Crash { .. })));
        // The waiter got a fresh sandbox with a fresh counter
        assert_eq!(next, Ok(json!(1)));
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_keeps_the_sandbox() {
        let pool = pool(1);
        let id = submit(&pool, "sandbox_id", vec![], Duration::from_secs(5)).await.unwrap();
        let result = submit(&pool, "throw", vec![], Duration::from_secs(5)).await;
        assert!(matches!(result, Err(EngineError::Execution { .. })));
        let again = submit(&pool, "sandbox_id", vec![], Duration::from_secs(5)).await.unwrap();
        assert_eq!(id, again);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_returns_its_sandbox() {
        let pool = pool(1);
        let mut running = Box::pin(submit(&pool, "wait", vec![json!(100)], Duration::from_secs(5)));
        let mut queued = Box::pin(submit(&pool, "increment", vec![], Duration::from_secs(5)));
        assert!(futures::poll!(&mut running).is_pending());
        assert!(futures::poll!(&mut queued).is_pending());
        assert_eq!(pool.queued(), 1);

        // Finishing hands the sandbox to the queued submit, which is then dropped unpolled
        assert_eq!(running.await, Ok(json!(100)));
        drop(queued);
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.idle_count(), 1);

        let next = tokio::time::timeout(
            Duration::from_secs(2),
            submit(&pool, "increment", vec![], Duration::from_secs(5)),
        )
        .await
        .expect("pool should still have a free sandbox");
        assert_eq!(next, Ok(json!(1)));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_submits() {
        let pool = pool(2);
        submit(&pool, "handshake", vec![], Duration::from_secs(5)).await.unwrap();
        pool.shutdown();

        let status = pool.status();
        assert!(status.shut_down);
        assert_eq!(status.live, 0);
        assert_eq!(
            submit(&pool, "handshake", vec![], Duration::from_secs(5)).await,
            Err(EngineError::Shutdown)
        );
    }
}
