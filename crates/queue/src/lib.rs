// Conveyor Queue Server
//
// Holds the attempt queue and speaks the channel protocol with workers.
//
// Key design decisions:
// - One `QueueState` behind one mutex; claims are atomic pops off a FIFO queue
// - A per-attempt channel can only be joined while the attempt is running
// - `attempt_complete` payloads are validated before any state changes
// - Worker sockets are authenticated with HS256 tokens when a secret is configured

pub mod channel;
pub mod config;
pub mod error;
pub mod http;
pub mod server;
pub mod state;

pub use channel::{Channel, Socket};
pub use config::QueueServerConfig;
pub use error::{QueueError, ResourceKind};
pub use http::router;
pub use server::{QueueServer, ServerEvent};
pub use state::{AttemptRecord, QueueState};
