use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use relay_common::{BatchRouter, MessagePointer};

pub mod error;
pub mod factory;
pub mod parser;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "amqp")]
pub mod amq;

pub use error::QueueError;
pub use factory::VariantConsumerFactory;
pub use parser::ParserType;

pub type Result<T> = std::result::Result<T, QueueError>;

/// A consumer that owns N parallel long-pollers against one broker queue.
///
/// `start` spawns the pollers and returns; each poll hands a batch of
/// `BatchMessage` records (with per-message ack/nack callbacks) to the
/// router. `stop` only initiates shutdown: pollers finish their in-flight
/// poll's delivery first, then the consumer reports `is_fully_stopped`.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn queue_identifier(&self) -> &str;

    async fn start(self: Arc<Self>, router: Arc<dyn BatchRouter>);

    async fn stop(&self);

    fn is_fully_stopped(&self) -> bool;

    /// Healthy iff every poller has polled within the freshness window.
    fn is_healthy(&self) -> bool;

    /// Oldest last-poll time across the pollers.
    fn last_poll_time(&self) -> Option<DateTime<Utc>>;

    /// Approximate number of messages available on the broker, when the
    /// variant can report it.
    async fn queue_depth(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Per-poller liveness bookkeeping shared by the consumer variants.
pub struct PollerHealth {
    last_polls: Vec<AtomicI64>,
    active: AtomicU32,
    freshness_window: Duration,
}

impl PollerHealth {
    pub fn new(pollers: usize, freshness_window: Duration) -> Self {
        Self {
            last_polls: (0..pollers.max(1)).map(|_| AtomicI64::new(0)).collect(),
            active: AtomicU32::new(0),
            freshness_window,
        }
    }

    pub fn poller_started(&self, index: usize) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.record_poll(index);
    }

    pub fn poller_stopped(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_poll(&self, index: usize) {
        if let Some(slot) = self.last_polls.get(index) {
            slot.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        }
    }

    pub fn active_pollers(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    /// True when every poller that ever started has polled within the window.
    pub fn all_fresh(&self) -> bool {
        let cutoff = Utc::now().timestamp_millis() - self.freshness_window.as_millis() as i64;
        self.last_polls
            .iter()
            .map(|p| p.load(Ordering::SeqCst))
            .filter(|ts| *ts > 0)
            .all(|ts| ts >= cutoff)
    }

    pub fn oldest_poll(&self) -> Option<DateTime<Utc>> {
        self.last_polls
            .iter()
            .map(|p| p.load(Ordering::SeqCst))
            .filter(|ts| *ts > 0)
            .min()
            .and_then(|ts| Utc.timestamp_millis_opt(ts).single())
    }
}

/// Parse one raw broker body into a routed message, attaching the broker's
/// physical delivery identity.
pub fn parse_body(
    parser: ParserType,
    body: &str,
    broker_message_id: Option<String>,
) -> Result<MessagePointer> {
    parser.parse(body).map(|m| m.with_broker_message_id(broker_message_id))
}
