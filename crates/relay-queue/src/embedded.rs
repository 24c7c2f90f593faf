//! Embedded SQLite-backed queue for local development and tests.
//!
//! Mimics FIFO broker semantics against local durable state: claimed rows
//! become invisible for the visibility timeout, ack deletes the row and
//! nack makes it immediately visible again (explicit, unlike the passive
//! brokered variants).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, error, info};

use relay_common::{AckCallback, BatchMessage, BatchRouter, BrokerAckError, MessagePointer};

use crate::{parse_body, ParserType, PollerHealth, QueueConsumer, Result};

#[derive(Debug, Clone)]
pub struct EmbeddedQueueConfig {
    pub queue_name: String,
    pub connections: u32,
    pub visibility_timeout_seconds: u32,
    pub max_batch: u32,
    pub poll_interval: Duration,
    pub parser: ParserType,
    pub freshness_window: Duration,
}

impl EmbeddedQueueConfig {
    pub fn new(queue_name: String, connections: u32) -> Self {
        Self {
            queue_name,
            connections: connections.max(1),
            visibility_timeout_seconds: 120,
            max_batch: 10,
            poll_interval: Duration::from_millis(250),
            parser: ParserType::MessagePointer,
            freshness_window: Duration::from_secs(60),
        }
    }
}

pub struct EmbeddedQueue {
    pool: Pool<Sqlite>,
    config: EmbeddedQueueConfig,
    running: AtomicBool,
    started: AtomicBool,
    health: Arc<PollerHealth>,
    parse_errors: AtomicU64,
}

impl EmbeddedQueue {
    pub fn new(pool: Pool<Sqlite>, config: EmbeddedQueueConfig) -> Self {
        let health = Arc::new(PollerHealth::new(
            config.connections as usize,
            config.freshness_window,
        ));
        Self {
            pool,
            config,
            running: AtomicBool::new(true),
            started: AtomicBool::new(false),
            health,
            parse_errors: AtomicU64::new(0),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_queue_messages (
                broker_id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                message_group_id TEXT,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_relay_queue_visible
            ON relay_queue_messages (queue_name, visible_at, message_group_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.config.queue_name, "Embedded queue schema initialized");
        Ok(())
    }

    /// Publish a message for later consumption. Dev/test seeding path.
    pub async fn publish(&self, message: &MessagePointer) -> Result<String> {
        let broker_id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(message)?;
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO relay_queue_messages
                (broker_id, queue_name, message_group_id, visible_at, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&broker_id)
        .bind(&self.config.queue_name)
        .bind(&message.message_group_id)
        .bind(now)
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(queue = %self.config.queue_name, message_id = %message.id, "Message published to embedded queue");
        Ok(broker_id)
    }

    /// Claim the next visible messages, one per message group to preserve
    /// FIFO, and make them invisible for the visibility timeout.
    async fn claim_batch(&self) -> Result<Vec<BatchMessage>> {
        let now = Utc::now().timestamp();
        let invisible_until = now + self.config.visibility_timeout_seconds as i64;

        let rows = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT broker_id, payload,
                       ROW_NUMBER() OVER (
                           PARTITION BY COALESCE(message_group_id, broker_id)
                           ORDER BY created_at
                       ) AS rn
                FROM relay_queue_messages
                WHERE queue_name = ? AND visible_at <= ?
            )
            SELECT broker_id, payload FROM eligible WHERE rn = 1 LIMIT ?
            "#,
        )
        .bind(&self.config.queue_name)
        .bind(now)
        .bind(self.config.max_batch as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut batch = Vec::with_capacity(rows.len());

        for row in rows {
            let broker_id: String = row.get("broker_id");
            let payload: String = row.get("payload");
            let receipt_handle = uuid::Uuid::new_v4().to_string();

            // Guard on visible_at so a concurrent poller cannot claim the
            // same row twice.
            let claimed = sqlx::query(
                r#"
                UPDATE relay_queue_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE broker_id = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(invisible_until)
            .bind(&broker_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                continue;
            }

            match parse_body(self.config.parser, &payload, Some(broker_id.clone())) {
                Ok(message) => {
                    let callback = Arc::new(EmbeddedAckCallback {
                        pool: self.pool.clone(),
                        queue_name: self.config.queue_name.clone(),
                        receipt_handle,
                    });
                    batch.push(BatchMessage {
                        message,
                        callback,
                        queue_identifier: self.config.queue_name.clone(),
                        broker_message_id: Some(broker_id),
                    });
                }
                Err(e) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        queue = %self.config.queue_name,
                        error = %e,
                        "Failed to parse embedded queue payload, returning to queue"
                    );
                    let _ = sqlx::query(
                        "UPDATE relay_queue_messages SET visible_at = ? WHERE broker_id = ?",
                    )
                    .bind(now)
                    .bind(&broker_id)
                    .execute(&self.pool)
                    .await;
                }
            }
        }

        Ok(batch)
    }

    async fn poll_loop(self: Arc<Self>, router: Arc<dyn BatchRouter>, index: usize) {
        self.health.poller_started(index);
        info!(queue = %self.config.queue_name, poller = index, "Embedded queue poller started");

        while self.running.load(Ordering::SeqCst) {
            match self.claim_batch().await {
                Ok(batch) => {
                    self.health.record_poll(index);
                    if batch.is_empty() {
                        tokio::time::sleep(self.config.poll_interval).await;
                    } else {
                        router.route_batch(batch).await;
                    }
                }
                Err(e) => {
                    error!(queue = %self.config.queue_name, error = %e, "Embedded queue poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        self.health.poller_stopped();
        info!(queue = %self.config.queue_name, poller = index, "Embedded queue poller exited");
    }
}

#[async_trait]
impl QueueConsumer for EmbeddedQueue {
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
        info!(queue = %self.config.queue_name, "Embedded queue stop requested");
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
        let now = Utc::now().timestamp();
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM relay_queue_messages WHERE queue_name = ? AND visible_at <= ?",
        )
        .bind(&self.config.queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("n");
        Ok(Some(count as u64))
    }
}

/// Explicit ack/nack against the local durable state.
struct EmbeddedAckCallback {
    pool: Pool<Sqlite>,
    queue_name: String,
    receipt_handle: String,
}

#[async_trait]
impl AckCallback for EmbeddedAckCallback {
    async fn ack(&self) -> std::result::Result<(), BrokerAckError> {
        let result = sqlx::query("DELETE FROM relay_queue_messages WHERE receipt_handle = ?")
            .bind(&self.receipt_handle)
            .execute(&self.pool)
            .await
            .map_err(|e| BrokerAckError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(BrokerAckError(format!(
                "unknown receipt handle: {}",
                self.receipt_handle
            )));
        }

        debug!(queue = %self.queue_name, "Embedded message acked (deleted)");
        Ok(())
    }

    async fn nack(&self) -> std::result::Result<(), BrokerAckError> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE relay_queue_messages SET visible_at = ? WHERE receipt_handle = ?")
            .bind(now)
            .bind(&self.receipt_handle)
            .execute(&self.pool)
            .await
            .map_err(|e| BrokerAckError(e.to_string()))?;

        debug!(queue = %self.queue_name, "Embedded message nacked (visible again)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::MediationType;
    use sqlx::sqlite::SqlitePoolOptions;

    fn pointer(id: &str, group: Option<&str>) -> MessagePointer {
        MessagePointer {
            id: id.to_string(),
            pool_code: "TEST".to_string(),
            auth_token: None,
            mediation_type: MediationType::HTTP,
            mediation_target: "http://localhost/hook".to_string(),
            message_group_id: group.map(|g| g.to_string()),
            high_priority: None,
            batch_id: None,
            broker_message_id: None,
            code: None,
            subject: None,
            data: None,
        }
    }

    async fn queue() -> EmbeddedQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let q = EmbeddedQueue::new(pool, EmbeddedQueueConfig::new("test-queue".into(), 1));
        q.init_schema().await.unwrap();
        q
    }

    #[tokio::test]
    async fn publish_claim_ack_roundtrip() {
        let q = queue().await;
        q.publish(&pointer("m1", None)).await.unwrap();

        let batch = q.claim_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message.id, "m1");
        assert!(batch[0].broker_message_id.is_some());

        // Claimed messages are invisible.
        assert!(q.claim_batch().await.unwrap().is_empty());

        batch[0].callback.ack().await.unwrap();
        assert_eq!(q.queue_depth().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn nack_makes_message_visible_again() {
        let q = queue().await;
        q.publish(&pointer("m1", None)).await.unwrap();

        let batch = q.claim_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        let first_broker_id = batch[0].broker_message_id.clone();

        batch[0].callback.nack().await.unwrap();

        let redelivered = q.claim_batch().await.unwrap();
        assert_eq!(redelivered.len(), 1);
        // Same physical message comes back with the same broker identity.
        assert_eq!(redelivered[0].broker_message_id, first_broker_id);
    }

    #[tokio::test]
    async fn claims_one_message_per_group() {
        let q = queue().await;
        q.publish(&pointer("m1", Some("g1"))).await.unwrap();
        q.publish(&pointer("m2", Some("g1"))).await.unwrap();
        q.publish(&pointer("m3", Some("g2"))).await.unwrap();

        let batch = q.claim_batch().await.unwrap();
        let ids: Vec<_> = batch.iter().map(|m| m.message.id.clone()).collect();
        assert!(ids.contains(&"m1".to_string()));
        assert!(ids.contains(&"m3".to_string()));
        assert!(!ids.contains(&"m2".to_string()), "second in group must wait");
    }
}
