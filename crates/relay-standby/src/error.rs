use thiserror::Error;

#[derive(Error, Debug)]
pub enum StandbyError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("leader election already running")]
    AlreadyRunning,
}
