//! Execution sandboxes
//!
//! A [`Sandbox`] is a live, isolated execution context plus the host side of its
//! task channel. Spawners create them; the pool owns them.

pub mod adaptor;
pub mod harness;
pub mod process;
pub mod runtime;
pub mod thread;

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::rpc::TaskChannel;

pub use harness::{HandlerRegistry, SandboxState, TaskHandler, TaskScope};
pub use process::ProcessSpawner;
pub use thread::ThreadSpawner;

/// Lifecycle control for the isolation unit behind a sandbox
pub trait SandboxControl: Send {
    /// Stop the sandbox. Processes are killed; threads are detached and abandoned.
    fn terminate(&mut self);
}

/// Creates sandboxes
pub trait SandboxSpawner: Send + Sync {
    fn spawn(&self, id: usize) -> Result<Sandbox, EngineError>;
}

pub struct Sandbox {
    id: usize,
    channel: TaskChannel,
    control: Mutex<Box<dyn SandboxControl>>,
}

impl Sandbox {
    pub fn new(id: usize, channel: TaskChannel, control: Box<dyn SandboxControl>) -> Self {
        Self {
            id,
            channel,
            control: Mutex::new(control),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn channel(&self) -> &TaskChannel {
        &self.channel
    }

    pub fn terminate(mut self) {
        self.control.get_mut().terminate();
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("busy", &self.channel.is_busy())
            .field("healthy", &self.channel.is_healthy())
            .finish()
    }
}
