//! SQS-like queue consumer.
//!
//! Each consumer owns N long-pollers against one queue URL. Acking deletes
//! the message by receipt handle; nacking is passive - the visibility
//! timeout makes the broker redeliver on its own. Because receipt handles
//! go stale across redeliveries, the callback implements the
//! receipt-handle capability so the router can refresh the stored handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use relay_common::{AckCallback, BatchMessage, BatchRouter, BrokerAckError};

use crate::{parse_body, ParserType, PollerHealth, QueueConsumer, QueueError, Result};

#[derive(Debug, Clone)]
pub struct SqsConsumerConfig {
    pub queue_url: String,
    pub queue_name: String,
    pub connections: u32,
    /// Long-poll wait. Short enough that `stop` is responsive; SQS max is 20.
    pub wait_time_seconds: i32,
    pub visibility_timeout_seconds: i32,
    pub max_batch: u32,
    pub parser: ParserType,
    pub freshness_window: Duration,
}

impl SqsConsumerConfig {
    pub fn new(queue_url: String, queue_name: String, connections: u32) -> Self {
        Self {
            queue_url,
            queue_name,
            connections: connections.max(1),
            wait_time_seconds: 5,
            visibility_timeout_seconds: 120,
            max_batch: 10,
            parser: ParserType::MessagePointer,
            freshness_window: Duration::from_secs(60),
        }
    }
}

pub struct SqsQueueConsumer {
    client: Client,
    config: SqsConsumerConfig,
    running: AtomicBool,
    started: AtomicBool,
    health: Arc<PollerHealth>,
    total_polled: AtomicU64,
    parse_errors: AtomicU64,
}

impl SqsQueueConsumer {
    pub fn new(client: Client, config: SqsConsumerConfig) -> Self {
        let health = Arc::new(PollerHealth::new(
            config.connections as usize,
            config.freshness_window,
        ));
        Self {
            client,
            config,
            running: AtomicBool::new(true),
            started: AtomicBool::new(false),
            health,
            total_polled: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        }
    }

    pub fn total_polled(&self) -> u64 {
        self.total_polled.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    async fn poll_once(&self) -> Result<Vec<BatchMessage>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.config.queue_url)
            .max_number_of_messages(self.config.max_batch.min(10) as i32)
            .visibility_timeout(self.config.visibility_timeout_seconds)
            .wait_time_seconds(self.config.wait_time_seconds)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let raw = result.messages.unwrap_or_default();
        let mut batch = Vec::with_capacity(raw.len());

        for sqs_msg in raw {
            let body = sqs_msg.body().unwrap_or_default();
            let broker_message_id = sqs_msg.message_id().map(|s| s.to_string());
            let receipt_handle = match sqs_msg.receipt_handle() {
                Some(h) => h.to_string(),
                None => continue,
            };

            match parse_body(self.config.parser, body, broker_message_id.clone()) {
                Ok(message) => {
                    let callback = Arc::new(SqsAckCallback {
                        client: self.client.clone(),
                        queue_url: self.config.queue_url.clone(),
                        queue_name: self.config.queue_name.clone(),
                        receipt_handle: RwLock::new(receipt_handle),
                    });
                    batch.push(BatchMessage {
                        message,
                        callback,
                        queue_identifier: self.config.queue_name.clone(),
                        broker_message_id,
                    });
                }
                Err(e) => {
                    // Unparseable body: nack immediately and count. For SQS a
                    // nack is passive - the visibility timeout redelivers and
                    // the dead-letter policy eventually drains the poison.
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        queue = %self.config.queue_name,
                        error = %e,
                        "Failed to parse SQS message body, leaving for redelivery"
                    );
                }
            }
        }

        if !batch.is_empty() {
            self.total_polled.fetch_add(batch.len() as u64, Ordering::Relaxed);
            debug!(queue = %self.config.queue_name, count = batch.len(), "Polled SQS batch");
        }

        Ok(batch)
    }

    async fn poll_loop(self: Arc<Self>, router: Arc<dyn BatchRouter>, index: usize) {
        self.health.poller_started(index);
        info!(queue = %self.config.queue_name, poller = index, "SQS poller started");

        while self.running.load(Ordering::SeqCst) {
            match self.poll_once().await {
                Ok(batch) => {
                    self.health.record_poll(index);
                    if !batch.is_empty() {
                        router.route_batch(batch).await;
                    }
                }
                Err(e) => {
                    warn!(
                        queue = %self.config.queue_name,
                        poller = index,
                        error = %e,
                        "SQS poll failed"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        self.health.poller_stopped();
        info!(queue = %self.config.queue_name, poller = index, "SQS poller exited");
    }
}

#[async_trait]
impl QueueConsumer for SqsQueueConsumer {
    fn queue_identifier(&self) -> &str {
        &self.config.queue_name
    }

    async fn start(self: Arc<Self>, router: Arc<dyn BatchRouter>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for i in 0..self.config.connections as usize {
            let consumer = self.clone();
            let router = router.clone();
            tokio::spawn(async move {
                consumer.poll_loop(router, i).await;
            });
        }
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.config.queue_name, "SQS consumer stop requested");
    }

    fn is_fully_stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst) && self.health.active_pollers() == 0
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.health.all_fresh()
    }

    fn last_poll_time(&self) -> Option<DateTime<Utc>> {
        self.health.oldest_poll()
    }

    async fn queue_depth(&self) -> Result<Option<u64>> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.config.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let available = result
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok());

        Ok(available)
    }
}

/// Ack callback for one SQS delivery. Holds the receipt handle behind a lock
/// because redeliveries replace it while the original is still in flight.
struct SqsAckCallback {
    client: Client,
    queue_url: String,
    queue_name: String,
    receipt_handle: RwLock<String>,
}

#[async_trait]
impl AckCallback for SqsAckCallback {
    async fn ack(&self) -> std::result::Result<(), BrokerAckError> {
        let handle = self.receipt_handle.read().clone();
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&handle)
            .send()
            .await
            .map_err(|e| BrokerAckError(e.to_string()))?;

        debug!(queue = %self.queue_name, "Message deleted from SQS");
        Ok(())
    }

    async fn nack(&self) -> std::result::Result<(), BrokerAckError> {
        // Passive: the visibility timeout returns the message to the queue.
        debug!(queue = %self.queue_name, "Nack is passive for SQS, broker will redeliver");
        Ok(())
    }

    fn receipt_handle(&self) -> Option<String> {
        Some(self.receipt_handle.read().clone())
    }

    fn update_receipt_handle(&self, new_handle: &str) -> bool {
        let mut handle = self.receipt_handle.write();
        if *handle != new_handle {
            debug!(queue = %self.queue_name, "Receipt handle refreshed after redelivery");
            *handle = new_handle.to_string();
        }
        true
    }
}
