use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("config fetch error: {0}")]
    ConfigFetch(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("pool full: {0}")]
    PoolFull(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("duplicate in pipeline: {0}")]
    DuplicateInPipeline(String),

    #[error("delivery connection error: {0}")]
    DeliveryConnection(String),

    #[error("delivery server error: {0}")]
    DeliveryServer(String),

    #[error("delivery processing error: {0}")]
    DeliveryProcessing(String),

    #[error("circuit open for target: {0}")]
    CircuitOpen(String),

    #[error("broker ack error: {0}")]
    BrokerAck(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("queue error: {0}")]
    Queue(#[from] relay_queue::QueueError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
