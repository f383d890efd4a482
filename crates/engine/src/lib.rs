//! Conveyor worker pool engine
//!
//! Runs compiled [`ExecutionPlan`]s inside a bounded pool of isolated sandboxes.
//!
//! # Architecture
//!
//! - [`WorkerPool`]: lazily spawns up to `size` sandboxes, queues excess submits
//!   in FIFO order, discards and replaces sandboxes that crashed or timed out
//! - [`rpc::TaskChannel`]: one outstanding task per sandbox, exactly one outcome
//!   per task (resolve, reject, timeout or crash)
//! - [`sandbox`]: thread and process isolation, the in-sandbox harness and the
//!   expression runtime
//! - [`lifecycle`]: translates sandbox events for an [`EngineListener`]
//! - [`Engine`]: `execute` and `validate` on top of the pool
//!
//! # Example
//!
//! ```ignore
//! use conveyor_engine::{Engine, ExecutionPlan, Job, NoopListener, PoolConfig, RunOptions};
//!
//! let engine = Engine::new(PoolConfig::from_env());
//! engine.validate().await?;
//!
//! let plan = ExecutionPlan::new("wf-1")
//!     .with_job(Job::new("a").with_expression(r#"{"data": {"ok": true}}"#));
//! let state = engine.execute(plan, RunOptions::default(), &NoopListener).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod plan;
pub mod pool;
pub mod rpc;
pub mod sandbox;

pub use config::{PoolConfig, SandboxMode};
pub use engine::Engine;
pub use error::EngineError;
pub use events::{EngineEvent, EngineEventKind, ErrorInfo, WorkerEvent};
pub use lifecycle::{EngineListener, NoopListener, RunContext, RunState};
pub use plan::{ExecutionPlan, Job, RunOptions};
pub use pool::{PoolStatus, WorkerPool};
pub use rpc::{Severity, Task, TaskError};
