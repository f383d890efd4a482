//! Queue errors

use conveyor_core::{ChannelErrorBody, CompletionError};

/// Kind of resource looked up by id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Attempt,
    Credential,
    Dataclip,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attempt => write!(f, "attempt"),
            Self::Credential => write!(f, "credential"),
            Self::Dataclip => write!(f, "dataclip"),
        }
    }
}

/// Queue server errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The attempt is not in a state that allows the operation
    #[error("invalid attempt {id}: {message}")]
    InvalidAttempt { id: String, message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    #[error(transparent)]
    Validation(#[from] CompletionError),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("topic not joined: {0}")]
    NotJoined(String),

    /// Malformed payload
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl QueueError {
    pub fn invalid_attempt(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAttempt {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable reason code used in channel replies
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAttempt { .. } => "invalid_attempt",
            Self::NotFound { .. } => "not_found",
            Self::Validation(_) => "validation_error",
            Self::UnknownEvent(_) => "unknown_event",
            Self::UnknownTopic(_) => "unknown_topic",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotJoined(_) => "not_joined",
            Self::Protocol(_) => "protocol_error",
        }
    }

    pub fn to_body(&self) -> ChannelErrorBody {
        ChannelErrorBody {
            reason: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            QueueError::invalid_attempt("a", "not started").code(),
            "invalid_attempt"
        );
        assert_eq!(
            QueueError::from(CompletionError::ErrorOnSuccess).code(),
            "validation_error"
        );

        let body = QueueError::not_found(ResourceKind::Dataclip, "d-1").to_body();
        assert_eq!(body.reason, "not_found");
        assert_eq!(body.message, "dataclip not found: d-1");
    }
}
