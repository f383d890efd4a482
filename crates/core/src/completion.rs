//! Attempt completion payloads
//!
//! `attempt_complete` is the only event that changes an attempt's terminal state,
//! so it is validated strictly: unknown reasons, null reasons and surplus keys
//! are rejected, and the reason must agree with the error fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why an attempt finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Success,
    /// A job failed
    Fail,
    /// The sandbox died unexpectedly
    Crash,
    /// The run was terminated (timeout)
    Kill,
    /// The run was cancelled
    Cancel,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Crash => "crash",
            Self::Kill => "kill",
            Self::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation failures for a completion payload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    /// Not an object, missing or null reason, unknown reason or surplus keys
    #[error("malformed completion payload: {0}")]
    Malformed(String),

    #[error("reason 'success' must not carry error_type or error_message")]
    ErrorOnSuccess,

    #[error("reason '{0}' requires an error_type")]
    MissingErrorType(CompletionReason),
}

/// Body of the `attempt_complete` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttemptCompletePayload {
    pub reason: CompletionReason,

    #[serde(default)]
    pub error_type: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,
}

impl AttemptCompletePayload {
    pub fn success() -> Self {
        Self {
            reason: CompletionReason::Success,
            error_type: None,
            error_message: None,
        }
    }

    pub fn failure(
        reason: CompletionReason,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            reason,
            error_type: Some(error_type.into()),
            error_message: Some(error_message.into()),
        }
    }

    /// Parse and validate a raw payload as pushed by a worker
    pub fn from_value(raw: &Value) -> Result<Self, CompletionError> {
        if !raw.is_object() {
            return Err(CompletionError::Malformed(
                "payload must be an object".to_string(),
            ));
        }

        let payload: Self = serde_json::from_value(raw.clone())
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Check that the reason agrees with the error fields
    pub fn validate(&self) -> Result<(), CompletionError> {
        let has_error = self.error_type.is_some() || self.error_message.is_some();
        match self.reason {
            CompletionReason::Success if has_error => Err(CompletionError::ErrorOnSuccess),
            CompletionReason::Success => Ok(()),
            reason if self.error_type.is_none() => Err(CompletionError::MissingErrorType(reason)),
            _ => Ok(()),
        }
    }
}
