//! HTTP mediation: deliver one message to its target and classify the result.
//!
//! Fault tolerance is layered: bounded retries for connection-level
//! failures (with jitter), and a per-target circuit breaker so a dead
//! endpoint sheds load quickly instead of burning pool workers on timeouts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use relay_common::{MediationOutcome, MediationResult, MediationType, MessagePointer};

use crate::breaker::CircuitBreakerRegistry;

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";
pub const MESSAGE_GROUP_HEADER: &str = "X-Message-Group";

/// Delivers a message to its target. The HTTP variant is the only one
/// implemented today; the trait is the seam for future mediation kinds.
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn process(&self, message: &MessagePointer) -> MediationOutcome;
}

/// What goes in the POST body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// The raw payload as supplied in the queue message.
    #[default]
    DataOnly,
    /// A framed envelope: `{id, code, subject, timestamp, data}`.
    Envelope,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeBody<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Total attempts for connection-level failures.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_jitter: Duration,
    pub delivery_mode: DeliveryMode,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_jitter: Duration::from_millis(500),
            delivery_mode: DeliveryMode::DataOnly,
        }
    }
}

pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl HttpMediator {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self::with_config(HttpMediatorConfig::default(), breakers)
    }

    pub fn with_config(config: HttpMediatorConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("failed to build HTTP client");

        info!(
            timeout_secs = config.timeout.as_secs(),
            delivery_mode = ?config.delivery_mode,
            "HttpMediator initialized"
        );

        Self {
            client,
            config,
            breakers,
        }
    }

    fn body_for(&self, message: &MessagePointer) -> Result<String, serde_json::Error> {
        match self.config.delivery_mode {
            DeliveryMode::DataOnly => match &message.data {
                Some(data) => serde_json::to_string(data),
                // No payload was supplied: the target resolves the work by id.
                None => serde_json::to_string(&serde_json::json!({ "messageId": message.id })),
            },
            DeliveryMode::Envelope => serde_json::to_string(&EnvelopeBody {
                id: &message.id,
                code: message.code.as_deref(),
                subject: message.subject.as_deref(),
                timestamp: Utc::now().to_rfc3339(),
                data: message.data.as_ref(),
            }),
        }
    }

    async fn deliver_once(&self, message: &MessagePointer) -> MediationOutcome {
        if message.mediation_type != MediationType::HTTP {
            return MediationOutcome::process_error(
                None,
                format!("unsupported mediation type: {:?}", message.mediation_type),
            );
        }

        let breaker = self.breakers.for_target(&message.mediation_target);
        if !breaker.allow_request() {
            debug!(
                message_id = %message.id,
                target = %message.mediation_target,
                "Circuit open, short-circuiting delivery"
            );
            return MediationOutcome::connection_error("circuit breaker open".to_string());
        }

        let body = match self.body_for(message) {
            Ok(b) => b,
            Err(e) => {
                return MediationOutcome::process_error(
                    None,
                    format!("failed to serialize delivery body: {}", e),
                )
            }
        };

        let mut request = self
            .client
            .post(&message.mediation_target)
            .header("Content-Type", "application/json")
            .header(REQUEST_ID_HEADER, &message.id);

        if let Some(group) = &message.message_group_id {
            request = request.header(MESSAGE_GROUP_HEADER, group);
        }
        if let Some(token) = &message.auth_token {
            request = request.bearer_auth(token);
        }

        match request.body(body).send().await {
            Ok(response) => {
                let status = response.status();
                let status_code = status.as_u16();

                if status.is_success() {
                    breaker.record_success();
                    debug!(
                        message_id = %message.id,
                        status_code = status_code,
                        "Message delivered"
                    );
                    MediationOutcome::success(status_code)
                } else if status.is_client_error() {
                    // The endpoint is alive and rejected the message; the
                    // router will not retry this.
                    breaker.record_success();
                    warn!(
                        message_id = %message.id,
                        target = %message.mediation_target,
                        status_code = status_code,
                        "Client error from target"
                    );
                    MediationOutcome::process_error(
                        Some(status_code),
                        format!("HTTP {}: client error", status_code),
                    )
                } else if status.is_server_error() {
                    breaker.record_failure();
                    warn!(
                        message_id = %message.id,
                        target = %message.mediation_target,
                        status_code = status_code,
                        "Server error from target"
                    );
                    MediationOutcome::server_error(
                        status_code,
                        format!("HTTP {}: server error", status_code),
                    )
                } else {
                    breaker.record_failure();
                    warn!(
                        message_id = %message.id,
                        status_code = status_code,
                        "Unexpected status from target"
                    );
                    MediationOutcome::server_error(
                        status_code,
                        format!("HTTP {}: unexpected status", status_code),
                    )
                }
            }
            Err(e) => {
                breaker.record_failure();
                let reason = if e.is_timeout() {
                    "request timeout".to_string()
                } else if e.is_connect() {
                    format!("connection error: {}", e)
                } else {
                    format!("request failed: {}", e)
                };
                warn!(
                    message_id = %message.id,
                    target = %message.mediation_target,
                    error = %reason,
                    "Delivery failed"
                );
                MediationOutcome::connection_error(reason)
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.config.retry_max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.config.retry_base_delay * attempt.max(1) + jitter
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn process(&self, message: &MessagePointer) -> MediationOutcome {
        let mut attempt = 1;

        loop {
            let outcome = self.deliver_once(message).await;

            // Only connection-level failures are retried here; server and
            // processing errors go back through the broker.
            if outcome.result != MediationResult::ErrorConnection
                || attempt >= self.config.max_attempts
            {
                return outcome;
            }

            let delay = self.retry_delay(attempt);
            debug!(
                message_id = %message.id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying delivery after connection error"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
