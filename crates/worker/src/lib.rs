// Conveyor Worker
//
// Claims attempts from the queue server and runs them in the engine's sandbox pool.
//
// Key design decisions:
// - All queue access goes through `QueueTransport` (channel protocol request/reply)
// - The WebSocket transport reconnects with capped exponential backoff and re-joins topics
// - Claims are bounded by free capacity; each claimed attempt runs on its own task
// - Logs and job outputs are streamed in order and always land before the completion

pub mod config;
pub mod reconnect;
pub mod runner;
pub mod transport;
pub mod worker;

pub use config::WorkerConfig;
pub use reconnect::ReconnectPolicy;
pub use runner::{build_plan, completion_for, AttemptRunner, JobFailure};
pub use transport::{ConnectionState, QueueTransport, TransportConfig, TransportError, WsTransport};
pub use worker::{PollBackoff, Worker};
