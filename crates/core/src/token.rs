// Worker tokens
// Decision: HS256 with a secret shared by the queue server and its workers
// Decision: Tokens are short-lived and re-issued on every (re)connect

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by a worker token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerClaims {
    /// Worker id
    pub worker_id: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("failed to sign worker token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),

    #[error("invalid worker token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
}

/// Sign a token identifying `worker_id`
pub fn generate_worker_token(
    secret: &str,
    worker_id: &str,
    lifetime: std::time::Duration,
) -> Result<String, TokenError> {
    let now = Utc::now();
    let lifetime = Duration::from_std(lifetime).unwrap_or_else(|_| Duration::hours(1));
    let claims = WorkerClaims {
        worker_id: worker_id.to_string(),
        exp: (now + lifetime).timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(TokenError::Sign)
}

/// Verify a worker token and return its claims
pub fn verify_worker_token(secret: &str, token: &str) -> Result<WorkerClaims, TokenError> {
    let data = decode::<WorkerClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(TokenError::Invalid)?;
    Ok(data.claims)
}
