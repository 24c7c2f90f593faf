use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("queue configuration error: {0}")]
    Config(String),

    #[error("consumer is stopped")]
    Stopped,

    #[error("unknown receipt handle: {0}")]
    NotFound(String),

    #[cfg(feature = "embedded")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
