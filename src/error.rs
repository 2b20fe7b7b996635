use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// key: security-error
/// Error taxonomy for the secrets core. Configuration and workflow errors
/// carry actionable detail; cryptographic failures are deliberately opaque so
/// a caller probing the system cannot distinguish a wrong key from corrupted
/// data.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("decryption failed: invalid ciphertext or authentication tag")]
    DecryptionFailed,
    #[error("cryptographic verification failed: {0}")]
    CryptoFailure(String),
    #[error("{0}")]
    Workflow(String),
    #[error("not found")]
    NotFound,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("kms error: {0}")]
    Kms(#[from] reqwest::Error),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        let status = match self {
            SecurityError::NotFound => StatusCode::NOT_FOUND,
            SecurityError::Config(_)
            | SecurityError::Workflow(_)
            | SecurityError::DecryptionFailed
            | SecurityError::CryptoFailure(_) => StatusCode::BAD_REQUEST,
            SecurityError::Db(_) | SecurityError::Kms(_) | SecurityError::Message(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type SecurityResult<T> = Result<T, SecurityError>;
