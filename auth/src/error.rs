use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid token")]
    InvalidToken,
    #[error("email not verified")]
    EmailNotVerified,
    #[error("email already registered")]
    EmailTaken,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("no usable credentials")]
    NoCredentials,
    #[error("challenge not found")]
    ChallengeNotFound,
    #[error("challenge expired")]
    ChallengeExpired,
    #[error("credential compromised")]
    CredentialCompromised,
    #[error("credential enrolled to another user")]
    CredentialConflict,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::Internal(format!("database error: {err}"))
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Internal(format!("serialization error: {err}"))
    }
}

impl From<cache::KvError> for AuthError {
    fn from(err: cache::KvError) -> Self {
        AuthError::Internal(format!("ephemeral store error: {err}"))
    }
}

impl From<cache::RateLimitError> for AuthError {
    fn from(err: cache::RateLimitError) -> Self {
        match err {
            cache::RateLimitError::Exceeded => AuthError::RateLimited,
            cache::RateLimitError::Store(inner) => inner.into(),
        }
    }
}
