use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Errors surfaced by the idempotency layer and its record stores.
#[derive(Debug, Error)]
pub enum AppError {
    /// Another execution under the same key is still running.
    #[error("request with the same idempotency key is already in flight")]
    RequestInFlight,

    /// The key was already used with a different request payload.
    #[error("idempotency key reused with a different request payload")]
    RequestMismatch,

    /// The record lapsed between a lost lock race and the follow-up load.
    #[error("idempotency record for key {0} expired before it could be loaded")]
    RecordExpired(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The wrapped operation failed; its lock was released.
    #[error("Handler error: {0}")]
    Handler(#[source] anyhow::Error),

    /// The wrapped operation failed and releasing its lock failed as well.
    #[error("Handler error: {handler}; releasing the lock also failed: {release}")]
    ReleaseFailed {
        handler: Box<AppError>,
        release: Box<AppError>,
    },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Wraps any error raised by a wrapped operation.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        AppError::Handler(err.into())
    }

    /// Whether retrying the same request under the same key can succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::RequestInFlight | AppError::RecordExpired(_))
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::RequestInFlight => "in_flight",
            AppError::RequestMismatch => "mismatch",
            AppError::RecordExpired(_) => "record_expired",
            AppError::Redis(_) => "redis",
            AppError::Serialization(_) => "serialization",
            AppError::Validation(_) => "validation",
            AppError::Config(_) => "config",
            AppError::Handler(_) => "handler",
            AppError::ReleaseFailed { .. } => "release_failed",
            AppError::Internal(_) => "internal",
        }
    }
}
