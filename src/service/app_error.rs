pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// protocol errors: client and server disagree about outstanding
    /// batches; fatal to the caller, never retried silently
    #[error("ack ordering violation: {0}")]
    OrderingViolation(String),

    #[error("stale or duplicate ack: {0}")]
    StaleAck(String),

    #[error("no subscription: {0}")]
    NoSubscription(String),

    /// downstream sink rejected a flushed transaction
    #[error("sink failure: {0}")]
    SinkFailure(String),
}
