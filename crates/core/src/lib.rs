// Conveyor Core
//
// Types shared by the execution engine, the queue server and the worker.
//
// Key design decisions:
// - Attempt definitions, credentials and dataclips travel as JSON (serde types here)
// - The channel protocol is a frame exchange: {topic, event, payload, ref}
// - Completion payloads are validated from raw JSON so surplus keys are rejected
// - Worker tokens are HS256 JWTs signed with a shared secret

pub mod attempt;
pub mod channel;
pub mod completion;
pub mod serde_util;
pub mod telemetry;
pub mod token;

pub use attempt::{
    AttemptDefinition, AttemptStatus, EdgeDefinition, JobDefinition, TriggerDefinition,
};
pub use channel::{
    events, AttemptLogPayload, ChannelErrorBody, ClaimRequest, Frame, ReplyPayload, ReplyStatus,
    ResourceRequest, RunCompletePayload, Topic,
};
pub use completion::{AttemptCompletePayload, CompletionError, CompletionReason};
pub use token::{generate_worker_token, verify_worker_token, TokenError, WorkerClaims};
