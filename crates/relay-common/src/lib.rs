use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Core Message Types
// ============================================================================

/// The routed unit: a pointer to work that must be delivered to a target.
///
/// Carried as a JSON document in broker message bodies (camelCase fields).
/// Immutable once constructed; `broker_message_id` is attached by the
/// consumer at receive time and never changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    /// Application identity - stable across broker requeues.
    pub id: String,
    #[serde(default)]
    pub pool_code: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub mediation_type: MediationType,
    pub mediation_target: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
    #[serde(default)]
    pub high_priority: Option<bool>,
    #[serde(default)]
    pub batch_id: Option<String>,
    /// Broker identity of the physical delivery; changes across requeues.
    #[serde(default)]
    pub broker_message_id: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl MessagePointer {
    /// Attach the broker's physical delivery identity at receive time.
    pub fn with_broker_message_id(mut self, broker_message_id: Option<String>) -> Self {
        self.broker_message_id = broker_message_id;
        self
    }

    /// The key under which this message is tracked while in the pipeline.
    pub fn pipeline_key(&self) -> String {
        self.broker_message_id
            .clone()
            .unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediationType {
    HTTP,
}

/// Error reported by a broker when an ack/nack cannot be performed.
///
/// Never fatal to the router: callers log it and continue.
#[derive(Debug, thiserror::Error)]
#[error("broker ack error: {0}")]
pub struct BrokerAckError(pub String);

/// Per-message acknowledgement callback handed out by a queue consumer.
///
/// `ack` removes the message from the broker; `nack` is passive for brokers
/// that redeliver on their own (SQS visibility timeout, AMQP redelivery
/// policy) and explicit for the embedded queue.
///
/// The receipt-handle methods are a variant-specific capability: only
/// brokers whose delivery handle can go stale across redeliveries (SQS)
/// implement them. The defaults report the capability as absent.
#[async_trait]
pub trait AckCallback: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerAckError>;

    async fn nack(&self) -> Result<(), BrokerAckError>;

    fn receipt_handle(&self) -> Option<String> {
        None
    }

    /// Replace the stored receipt handle after a physical redelivery.
    /// Returns false when the broker variant has no such concept.
    fn update_receipt_handle(&self, _new_handle: &str) -> bool {
        false
    }
}

/// A message bundled with its acknowledgement callback, as delivered by a
/// consumer poll to the router.
pub struct BatchMessage {
    pub message: MessagePointer,
    pub callback: Arc<dyn AckCallback>,
    pub queue_identifier: String,
    pub broker_message_id: Option<String>,
}

impl BatchMessage {
    pub fn pipeline_key(&self) -> String {
        self.broker_message_id
            .clone()
            .unwrap_or_else(|| self.message.id.clone())
    }
}

impl std::fmt::Debug for BatchMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchMessage")
            .field("message_id", &self.message.id)
            .field("queue_identifier", &self.queue_identifier)
            .field("broker_message_id", &self.broker_message_id)
            .finish()
    }
}

/// Sink for batches produced by queue consumers.
///
/// Implemented by the queue manager; consumers only see this capability so
/// the queue crate stays independent of the router internals.
#[async_trait]
pub trait BatchRouter: Send + Sync {
    async fn route_batch(&self, batch: Vec<BatchMessage>);
}

// ============================================================================
// Mediation Types
// ============================================================================

/// Result of a mediation attempt. Only `Success` leads to an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationResult {
    /// Delivered and accepted (2xx).
    Success,
    /// Network-level failure (timeout, refused, circuit open) - retryable.
    ErrorConnection,
    /// Target returned 5xx - retryable via the broker.
    ErrorServer,
    /// Target rejected the message (4xx) - not retried by the router.
    ErrorProcess,
}

/// Outcome of mediation including the classified result and diagnostics.
#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl MediationOutcome {
    pub fn success(status_code: u16) -> Self {
        Self {
            result: MediationResult::Success,
            status_code: Some(status_code),
            error_message: None,
        }
    }

    pub fn connection_error(message: String) -> Self {
        Self {
            result: MediationResult::ErrorConnection,
            status_code: None,
            error_message: Some(message),
        }
    }

    pub fn server_error(status_code: u16, message: String) -> Self {
        Self {
            result: MediationResult::ErrorServer,
            status_code: Some(status_code),
            error_message: Some(message),
        }
    }

    pub fn process_error(status_code: Option<u16>, message: String) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            status_code,
            error_message: Some(message),
        }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub code: String,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

impl PoolConfig {
    pub fn new(code: impl Into<String>, concurrency: u32) -> Self {
        Self {
            code: code.into(),
            concurrency: Some(concurrency),
            rate_limit_per_minute: None,
        }
    }

    /// Worker count actually applied: explicit concurrency when positive,
    /// otherwise derived from the rate limit, otherwise 1.
    pub fn effective_concurrency(&self) -> u32 {
        match self.concurrency {
            Some(c) if c > 0 => c,
            _ => match self.rate_limit_per_minute {
                Some(rpm) if rpm > 0 => std::cmp::max(rpm / 60, 1),
                _ => 1,
            },
        }
    }
}

/// Broker credentials supplied by the control plane for queues that need
/// them (applied by the consumer factory; ignored by variants that
/// authenticate out of band).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueAuthConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub connections: Option<u32>,
    #[serde(default)]
    pub parser_type: Option<String>,
    #[serde(default)]
    pub auth: Option<QueueAuthConfig>,
}

impl QueueConfig {
    /// Unique identifier: the name when present, otherwise the URI.
    pub fn identifier(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.uri.clone())
            .unwrap_or_default()
    }
}

/// Declarative desired state pulled from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default)]
    pub processing_pools: Vec<PoolConfig>,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    /// Default poller count for queues that do not specify their own.
    #[serde(default)]
    pub connections: Option<u32>,
}

impl RouterConfig {
    pub fn connections_for(&self, queue: &QueueConfig) -> u32 {
        queue
            .connections
            .or(self.connections)
            .filter(|c| *c > 0)
            .unwrap_or(1)
    }
}

// ============================================================================
// Warning System Types
// ============================================================================

/// Stable warning codes surfaced to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    ConfigSyncFailed,
    PoolLimit,
    QueueFull,
    Routing,
    PipelineMapLeak,
    ConsumerRestart,
    ConsumerRestartFailed,
    ShutdownCleanupErrors,
}

impl std::fmt::Display for WarningCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WarningCode::ConfigSyncFailed => "CONFIG_SYNC_FAILED",
            WarningCode::PoolLimit => "POOL_LIMIT",
            WarningCode::QueueFull => "QUEUE_FULL",
            WarningCode::Routing => "ROUTING",
            WarningCode::PipelineMapLeak => "PIPELINE_MAP_LEAK",
            WarningCode::ConsumerRestart => "CONSUMER_RESTART",
            WarningCode::ConsumerRestartFailed => "CONSUMER_RESTART_FAILED",
            WarningCode::ShutdownCleanupErrors => "SHUTDOWN_CLEANUP_ERRORS",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningSeverity {
    Warn,
    Critical,
}

/// A structured operational warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub id: String,
    pub code: WarningCode,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        code: WarningCode,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}
