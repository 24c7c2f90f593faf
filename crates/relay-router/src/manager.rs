//! QueueManager - central orchestrator for message routing.
//!
//! Owns pools by code, consumers by queue identifier, and the in-flight
//! tracker. Routes consumer batches with batch-level policies, reconciles
//! declarative configuration onto the running state, and drives graceful
//! shutdown. Constructed explicitly with its collaborators (tracker, pool
//! factory, consumer factory, warning sink); there is no ambient container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use relay_common::{
    BatchMessage, BatchRouter, MediationResult, PoolConfig, QueueConfig, RouterConfig,
    WarningCode, WarningSeverity,
};
use relay_queue::QueueConsumer;

use crate::error::RouterError;
use crate::metrics;
use crate::pool::{Completion, CompletionKind, CompletionSender, PoolFactory, PoolTask, ProcessPool};
use crate::tracker::{InFlightTracker, TrackOutcome};
use crate::warning::WarningService;
use crate::Result;

const DEFAULT_GROUP: &str = "__DEFAULT__";

/// Creates queue consumers for the manager during reconciliation and
/// health-driven replacement.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create_consumer(
        &self,
        config: &QueueConfig,
        connections: u32,
    ) -> Result<Arc<dyn QueueConsumer>>;
}

#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    pub default_pool_code: String,
    pub default_pool_concurrency: u32,
    pub max_pools: usize,
    pub pool_warning_threshold: usize,
    pub consumer_stop_timeout: Duration,
    pub pool_drain_timeout: Duration,
    /// Timeout handed to `update_concurrency` during reconciliation.
    pub concurrency_update_timeout: Duration,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            default_pool_code: "DEFAULT-POOL".to_string(),
            default_pool_concurrency: 20,
            max_pools: 2000,
            pool_warning_threshold: 1000,
            consumer_stop_timeout: Duration::from_secs(25),
            pool_drain_timeout: Duration::from_secs(60),
            concurrency_update_timeout: Duration::from_secs(60),
        }
    }
}

pub struct QueueManager {
    tracker: Arc<InFlightTracker>,
    pools: DashMap<String, Arc<dyn ProcessPool>>,
    draining_pools: DashMap<String, Arc<dyn ProcessPool>>,
    consumers: RwLock<HashMap<String, Arc<dyn QueueConsumer>>>,
    draining_consumers: RwLock<HashMap<String, Arc<dyn QueueConsumer>>>,
    pool_configs: RwLock<HashMap<String, PoolConfig>>,
    queue_configs: RwLock<HashMap<String, QueueConfig>>,
    pool_factory: Arc<dyn PoolFactory>,
    consumer_factory: Arc<dyn ConsumerFactory>,
    warnings: Arc<WarningService>,
    completion_tx: CompletionSender,
    /// Broker ids that finished successfully but whose ack failed; acked
    /// immediately on redelivery instead of being re-routed.
    pending_delete: Mutex<std::collections::HashSet<String>>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    /// Serializes reconciliation; held only over the reconcile step.
    reconcile_lock: tokio::sync::Mutex<()>,
    config: QueueManagerConfig,
    /// Handed to consumers as their batch router.
    self_ref: Weak<QueueManager>,
}

impl QueueManager {
    pub fn new(
        tracker: Arc<InFlightTracker>,
        pool_factory: Arc<dyn PoolFactory>,
        consumer_factory: Arc<dyn ConsumerFactory>,
        warnings: Arc<WarningService>,
        config: QueueManagerConfig,
    ) -> Arc<Self> {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let manager = Arc::new_cyclic(|self_ref: &Weak<Self>| Self {
            self_ref: self_ref.clone(),
            tracker,
            pools: DashMap::new(),
            draining_pools: DashMap::new(),
            consumers: RwLock::new(HashMap::new()),
            draining_consumers: RwLock::new(HashMap::new()),
            pool_configs: RwLock::new(HashMap::new()),
            queue_configs: RwLock::new(HashMap::new()),
            pool_factory,
            consumer_factory,
            warnings,
            completion_tx,
            pending_delete: Mutex::new(std::collections::HashSet::new()),
            running: AtomicBool::new(true),
            shutdown_tx,
            reconcile_lock: tokio::sync::Mutex::new(()),
            config,
        });

        manager.clone().spawn_completion_loop(completion_rx);
        manager
    }

    fn as_batch_router(&self) -> Option<Arc<dyn BatchRouter>> {
        self.self_ref
            .upgrade()
            .map(|manager| manager as Arc<dyn BatchRouter>)
    }

    pub fn tracker(&self) -> &Arc<InFlightTracker> {
        &self.tracker
    }

    pub fn warnings(&self) -> &Arc<WarningService> {
        &self.warnings
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn pool(&self, code: &str) -> Option<Arc<dyn ProcessPool>> {
        self.pools.get(code).map(|e| e.value().clone())
    }

    pub async fn consumer_ids(&self) -> Vec<String> {
        self.consumers.read().await.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Completion handling (pool -> manager, via channel, never re-entrant)
    // ------------------------------------------------------------------

    fn spawn_completion_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Completion>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    completion = rx.recv() => match completion {
                        Some(completion) => self.handle_completion(completion).await,
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Completion loop exited");
        });
    }

    async fn handle_completion(&self, completion: Completion) {
        match completion.kind {
            CompletionKind::Delivered(outcome) => {
                if outcome.result == MediationResult::Success {
                    self.ack(&completion.pipeline_key).await;
                } else {
                    debug!(
                        pipeline_key = %completion.pipeline_key,
                        pool_code = %completion.pool_code,
                        result = ?outcome.result,
                        status_code = ?outcome.status_code,
                        "Delivery failed, nacking"
                    );
                    self.nack(&completion.pipeline_key, true).await;
                }
            }
            CompletionKind::RateLimited => {
                self.nack(&completion.pipeline_key, false).await;
            }
            CompletionKind::Failed(reason) => {
                warn!(
                    pipeline_key = %completion.pipeline_key,
                    pool_code = %completion.pool_code,
                    reason = %reason,
                    "Pool-internal failure, nacking"
                );
                self.nack(&completion.pipeline_key, true).await;
            }
        }
    }

    /// Remove the tracked entry and ack on the broker. A failed ack leaves
    /// the broker id in the pending-delete set so the redelivery is culled.
    pub async fn ack(&self, pipeline_key: &str) {
        let Some(entry) = self.tracker.remove(pipeline_key) else {
            return;
        };
        metrics::set_tracker_size(self.tracker.len());
        metrics::record_message_processed(&entry.queue_identifier, true);

        if let Err(e) = entry.callback.ack().await {
            match &entry.message.broker_message_id {
                Some(broker_id) => {
                    warn!(
                        pipeline_key = %pipeline_key,
                        broker_message_id = %broker_id,
                        error = %e,
                        "Ack failed (receipt likely expired), scheduling delete on redelivery"
                    );
                    self.pending_delete.lock().insert(broker_id.clone());
                }
                None => {
                    error!(
                        pipeline_key = %pipeline_key,
                        error = %e,
                        "Ack failed and no broker id to track for pending delete"
                    );
                }
            }
        }
    }

    /// Remove the tracked entry and nack on the broker. `failure` separates
    /// processing failures from deferrals in the metrics.
    pub async fn nack(&self, pipeline_key: &str, failure: bool) {
        let Some(entry) = self.tracker.remove(pipeline_key) else {
            return;
        };
        metrics::set_tracker_size(self.tracker.len());
        if failure {
            metrics::record_message_processed(&entry.queue_identifier, false);
        } else {
            metrics::record_message_deferred(&entry.queue_identifier);
        }

        if let Err(e) = entry.callback.nack().await {
            warn!(pipeline_key = %pipeline_key, error = %e, "Nack failed");
        }
    }

    /// Deferred nack for a message that never entered the tracker.
    async fn defer(&self, msg: &BatchMessage) {
        metrics::record_message_deferred(&msg.queue_identifier);
        if let Err(e) = msg.callback.nack().await {
            warn!(message_id = %msg.message.id, error = %e, "Deferred nack failed");
        }
    }

    /// Ack a duplicate delivery that must be culled permanently.
    async fn cull(&self, msg: &BatchMessage) {
        metrics::record_message_processed(&msg.queue_identifier, true);
        if let Err(e) = msg.callback.ack().await {
            warn!(message_id = %msg.message.id, error = %e, "Duplicate cull ack failed");
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    async fn route_batch_inner(&self, batch: Vec<BatchMessage>) {
        if batch.is_empty() {
            return;
        }

        if !self.running.load(Ordering::SeqCst) {
            for msg in batch {
                self.defer(&msg).await;
            }
            return;
        }

        // Messages that already succeeded but whose ack failed: delete now.
        let mut remaining = Vec::with_capacity(batch.len());
        for msg in batch {
            let pending = msg
                .broker_message_id
                .as_ref()
                .map(|id| self.pending_delete.lock().remove(id))
                .unwrap_or(false);
            if pending {
                info!(
                    message_id = %msg.message.id,
                    broker_message_id = ?msg.broker_message_id,
                    "Message was already processed, deleting from broker"
                );
                self.cull(&msg).await;
            } else {
                remaining.push(msg);
            }
        }
        if remaining.is_empty() {
            return;
        }

        // Step 1: read-only snapshot so the whole batch sees one routing view.
        let snapshot: HashMap<String, Arc<dyn ProcessPool>> = self
            .pools
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        // Step 2: duplicate classification.
        let mut unique = Vec::with_capacity(remaining.len());
        for msg in remaining {
            if let Some(broker_id) = &msg.broker_message_id {
                if let Some(entry) = self.tracker.get(broker_id) {
                    // Physical redelivery: the broker handed us the same
                    // message again. Refresh the stored receipt handle so the
                    // eventual ack uses a live one, then defer.
                    if let Some(new_handle) = msg.callback.receipt_handle() {
                        entry.callback.update_receipt_handle(&new_handle);
                    }
                    debug!(
                        message_id = %msg.message.id,
                        broker_message_id = %broker_id,
                        "Physical redelivery of in-flight message, deferring"
                    );
                    self.defer(&msg).await;
                    continue;
                }
            }

            if let Some(existing_key) = self.tracker.pipeline_key_for(&msg.message.id) {
                if msg.pipeline_key() != existing_key {
                    // External requeue: same application id under a fresh
                    // broker identity while the original is still in flight.
                    // Ack to cull the duplicate permanently.
                    info!(
                        message_id = %msg.message.id,
                        existing_pipeline_key = %existing_key,
                        new_broker_id = ?msg.broker_message_id,
                        "Requeued duplicate of in-flight message, acking"
                    );
                    self.cull(&msg).await;
                } else {
                    if let Some(new_handle) = msg.callback.receipt_handle() {
                        if let Some(callback) = self.tracker.get_callback(&existing_key) {
                            callback.update_receipt_handle(&new_handle);
                        }
                    }
                    debug!(
                        message_id = %msg.message.id,
                        "Redelivery of in-flight message, deferring"
                    );
                    self.defer(&msg).await;
                }
                continue;
            }

            unique.push(msg);
        }

        // Step 3: group by pool code; unknown codes fall back to the default
        // pool.
        let mut by_pool: HashMap<String, Vec<BatchMessage>> = HashMap::new();
        for msg in unique {
            let code = msg.message.pool_code.clone();
            let resolved = if !code.is_empty() && snapshot.contains_key(&code) {
                code
            } else {
                metrics::record_default_pool_usage();
                if !code.is_empty() {
                    self.warnings.raise(
                        WarningCode::Routing,
                        WarningSeverity::Warn,
                        format!(
                            "unknown pool code [{}], routing message [{}] to {}",
                            code, msg.message.id, self.config.default_pool_code
                        ),
                        "QueueManager",
                    );
                }
                self.config.default_pool_code.clone()
            };
            by_pool.entry(resolved).or_default().push(msg);
        }

        for (pool_code, pool_messages) in by_pool {
            let pool = match snapshot.get(&pool_code) {
                Some(pool) => pool.clone(),
                None => match self.get_or_create_default_pool().await {
                    Ok(pool) => pool,
                    Err(e) => {
                        error!(pool_code = %pool_code, error = %e, "Failed to create default pool");
                        for msg in pool_messages {
                            self.defer(&msg).await;
                        }
                        continue;
                    }
                },
            };

            // Step 4: batch-level capacity check. Partial admission would
            // break per-group ordering, so the whole pool group defers.
            let available = pool.queue_capacity().saturating_sub(pool.queue_size()) as usize;
            if available < pool_messages.len() {
                warn!(
                    pool_code = %pool_code,
                    available = available,
                    requested = pool_messages.len(),
                    "Pool at capacity, deferring all messages for this pool"
                );
                self.warnings.raise(
                    WarningCode::QueueFull,
                    WarningSeverity::Warn,
                    format!(
                        "pool [{}] queue full, deferring {} messages from batch",
                        pool_code,
                        pool_messages.len()
                    ),
                    "QueueManager",
                );
                for msg in pool_messages {
                    self.defer(&msg).await;
                }
                continue;
            }

            // Step 5: FIFO within each message group. Insertion order is the
            // batch order, preserved by the IndexMap.
            let mut by_group: IndexMap<String, Vec<BatchMessage>> = IndexMap::new();
            for msg in pool_messages {
                let group = msg
                    .message
                    .message_group_id
                    .clone()
                    .filter(|g| !g.is_empty())
                    .unwrap_or_else(|| DEFAULT_GROUP.to_string());
                by_group.entry(group).or_default().push(msg);
            }

            for (group_id, group_messages) in by_group {
                let mut nack_remaining = false;

                for msg in group_messages {
                    if nack_remaining {
                        debug!(
                            message_id = %msg.message.id,
                            group_id = %group_id,
                            "Earlier message in group failed, deferring to preserve order"
                        );
                        self.defer(&msg).await;
                        continue;
                    }

                    // Step 6: track immediately before submit.
                    match self.tracker.track(
                        msg.message.clone(),
                        msg.callback.clone(),
                        msg.queue_identifier.clone(),
                    ) {
                        TrackOutcome::Duplicate { existing_pipeline_key } => {
                            debug!(
                                message_id = %msg.message.id,
                                existing_pipeline_key = %existing_pipeline_key,
                                "Lost admission race, deferring"
                            );
                            self.defer(&msg).await;
                            nack_remaining = true;
                        }
                        TrackOutcome::Tracked { pipeline_key } => {
                            metrics::set_tracker_size(self.tracker.len());
                            let submitted = pool
                                .submit(PoolTask {
                                    pipeline_key: pipeline_key.clone(),
                                    message: msg.message.clone(),
                                })
                                .await;

                            if !submitted {
                                self.tracker.remove(&pipeline_key);
                                metrics::set_tracker_size(self.tracker.len());
                                warn!(
                                    message_id = %msg.message.id,
                                    group_id = %group_id,
                                    pool_code = %pool_code,
                                    "Pool rejected submit, deferring rest of group"
                                );
                                self.defer(&msg).await;
                                nack_remaining = true;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn get_or_create_default_pool(&self) -> Result<Arc<dyn ProcessPool>> {
        if let Some(pool) = self.pools.get(&self.config.default_pool_code) {
            return Ok(pool.clone());
        }

        let pool_config = PoolConfig::new(
            self.config.default_pool_code.clone(),
            self.config.default_pool_concurrency,
        );
        let pool = self.create_pool(pool_config.clone());
        self.pool_configs
            .write()
            .await
            .insert(pool_config.code.clone(), pool_config.clone());
        info!(
            pool_code = %self.config.default_pool_code,
            concurrency = self.config.default_pool_concurrency,
            "Created default pool"
        );
        Ok(pool)
    }

    fn create_pool(&self, config: PoolConfig) -> Arc<dyn ProcessPool> {
        let code = config.code.clone();
        let pool = self
            .pool_factory
            .create(config, self.completion_tx.clone());
        self.pools.insert(code, pool.clone());
        metrics::set_pools_active(self.pools.len());
        pool
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Apply a desired configuration to the running state. Serialized by the
    /// reconcile lock; the lock is never held across pool worker waits.
    pub async fn reconcile(&self, config: RouterConfig) -> Result<()> {
        let _guard = self.reconcile_lock.lock().await;

        if !self.running.load(Ordering::SeqCst) {
            return Err(RouterError::ShutdownInProgress);
        }

        let new_pool_configs: HashMap<String, PoolConfig> = config
            .processing_pools
            .iter()
            .map(|p| (p.code.clone(), p.clone()))
            .collect();

        let mut pools_updated = 0;
        let mut pools_created = 0;
        let mut pools_removed = 0;

        let mut pool_configs = self.pool_configs.write().await;

        // Retired pools drain in the background; the reclaimer frees them.
        let existing_codes: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for code in existing_codes {
            if new_pool_configs.contains_key(&code) || code == self.config.default_pool_code {
                continue;
            }
            if let Some((code, pool)) = self.pools.remove(&code) {
                info!(
                    pool_code = %code,
                    queue_size = pool.queue_size(),
                    active_workers = pool.active_workers(),
                    "Pool removed from config, draining"
                );
                pool.drain().await;
                self.draining_pools.insert(code.clone(), pool);
                pool_configs.remove(&code);
                pools_removed += 1;
            }
        }

        // In-place updates preserve queued and in-flight work.
        for (code, new_config) in &new_pool_configs {
            let Some(pool) = self.pools.get(code).map(|e| e.value().clone()) else {
                continue;
            };
            let old_config = pool_configs.get(code).cloned();

            let concurrency_changed = old_config
                .as_ref()
                .map(|old| old.effective_concurrency() != new_config.effective_concurrency())
                .unwrap_or(true);
            let rate_changed = old_config
                .as_ref()
                .map(|old| old.rate_limit_per_minute != new_config.rate_limit_per_minute)
                .unwrap_or(true);

            if concurrency_changed {
                let applied = pool
                    .update_concurrency(
                        new_config.effective_concurrency(),
                        self.config.concurrency_update_timeout,
                    )
                    .await;
                if !applied {
                    warn!(pool_code = %code, "Concurrency update not applied");
                }
            }
            if rate_changed {
                pool.update_rate_limit(new_config.rate_limit_per_minute);
            }
            if concurrency_changed || rate_changed {
                pools_updated += 1;
            }
            pool_configs.insert(code.clone(), new_config.clone());
        }

        // New pools, gated by the pool cap.
        for pool_config in &config.processing_pools {
            if self.pools.contains_key(&pool_config.code) {
                continue;
            }

            let current = self.pools.len();
            if current >= self.config.max_pools {
                error!(
                    pool_code = %pool_config.code,
                    current = current,
                    max_pools = self.config.max_pools,
                    "Pool limit reached, refusing to create pool"
                );
                self.warnings.raise(
                    WarningCode::PoolLimit,
                    WarningSeverity::Critical,
                    format!(
                        "pool limit reached ({}/{}), cannot create pool [{}]",
                        current, self.config.max_pools, pool_config.code
                    ),
                    "QueueManager",
                );
                continue;
            }
            if current >= self.config.pool_warning_threshold {
                self.warnings.raise(
                    WarningCode::PoolLimit,
                    WarningSeverity::Warn,
                    format!(
                        "pool count {} approaching limit {} (threshold {})",
                        current, self.config.max_pools, self.config.pool_warning_threshold
                    ),
                    "QueueManager",
                );
            }

            self.create_pool(pool_config.clone());
            pool_configs.insert(pool_config.code.clone(), pool_config.clone());
            info!(
                pool_code = %pool_config.code,
                concurrency = pool_config.effective_concurrency(),
                rate_limit = ?pool_config.rate_limit_per_minute,
                "Created process pool"
            );
            pools_created += 1;
        }

        drop(pool_configs);

        let (consumers_created, consumers_removed) = self.sync_consumers(&config).await;

        info!(
            pools_updated = pools_updated,
            pools_created = pools_created,
            pools_removed = pools_removed,
            consumers_created = consumers_created,
            consumers_removed = consumers_removed,
            active_pools = self.pools.len(),
            draining_pools = self.draining_pools.len(),
            "Reconciliation complete"
        );
        metrics::set_pools_active(self.pools.len());

        Ok(())
    }

    async fn sync_consumers(&self, config: &RouterConfig) -> (usize, usize) {
        let mut created = 0;
        let mut removed = 0;

        let Some(router) = self.as_batch_router() else {
            return (0, 0);
        };

        let new_queue_configs: HashMap<String, QueueConfig> = config
            .queues
            .iter()
            .filter(|q| !q.identifier().is_empty())
            .map(|q| (q.identifier(), q.clone()))
            .collect();

        let mut consumers = self.consumers.write().await;
        let mut draining = self.draining_consumers.write().await;
        let mut queue_configs = self.queue_configs.write().await;

        // Phase out consumers whose queues disappeared.
        let existing: Vec<String> = consumers.keys().cloned().collect();
        for queue_id in existing {
            if new_queue_configs.contains_key(&queue_id) {
                continue;
            }
            if let Some(consumer) = consumers.remove(&queue_id) {
                info!(queue_id = %queue_id, "Queue removed from config, stopping consumer");
                consumer.stop().await;
                draining.insert(queue_id.clone(), consumer);
                queue_configs.remove(&queue_id);
                removed += 1;
            }
        }

        // Start consumers for new queues.
        for (queue_id, queue_config) in &new_queue_configs {
            if consumers.contains_key(queue_id) {
                continue;
            }

            let connections = config.connections_for(queue_config);
            match self
                .consumer_factory
                .create_consumer(queue_config, connections)
                .await
            {
                Ok(consumer) => {
                    consumer.clone().start(router.clone()).await;

                    // Remember the resolved poller count so a health-driven
                    // replacement matches the original.
                    let mut stored = queue_config.clone();
                    stored.connections = Some(connections);
                    queue_configs.insert(queue_id.clone(), stored);
                    consumers.insert(queue_id.clone(), consumer);
                    created += 1;
                    info!(queue_id = %queue_id, connections = connections, "Consumer created and started");
                }
                Err(e) => {
                    error!(queue_id = %queue_id, error = %e, "Failed to create consumer");
                    self.warnings.raise(
                        WarningCode::ConsumerRestartFailed,
                        WarningSeverity::Critical,
                        format!("failed to create consumer for queue [{}]: {}", queue_id, e),
                        "QueueManager",
                    );
                }
            }
        }

        (created, removed)
    }

    // ------------------------------------------------------------------
    // Background maintenance (driven by the lifecycle loops)
    // ------------------------------------------------------------------

    /// Reclaim retired pools and consumers that have gone quiescent.
    pub async fn cleanup_draining(&self) {
        let mut reclaimed_pools = Vec::new();
        for entry in self.draining_pools.iter() {
            if entry.value().is_fully_drained() {
                reclaimed_pools.push(entry.key().clone());
            }
        }
        for code in reclaimed_pools {
            if let Some((code, pool)) = self.draining_pools.remove(&code) {
                info!(pool_code = %code, "Draining pool finished, reclaiming");
                pool.shutdown().await;
                metrics::set_pool_queue_size(&code, 0);
                metrics::set_pool_active_workers(&code, 0);
            }
        }

        let mut draining = self.draining_consumers.write().await;
        let stopped: Vec<String> = draining
            .iter()
            .filter(|(_, c)| c.is_fully_stopped())
            .map(|(id, _)| id.clone())
            .collect();
        for id in stopped {
            info!(queue_id = %id, "Draining consumer fully stopped, reclaiming");
            draining.remove(&id);
        }
    }

    /// Replace consumers whose pollers have gone stale.
    pub async fn supervise_consumers(&self) {
        let Some(router) = self.as_batch_router() else {
            return;
        };

        let unhealthy: Vec<String> = {
            let consumers = self.consumers.read().await;
            consumers
                .iter()
                .filter(|(_, c)| !c.is_healthy())
                .map(|(id, _)| id.clone())
                .collect()
        };

        for queue_id in unhealthy {
            warn!(queue_id = %queue_id, "Unhealthy consumer detected, replacing");
            self.warnings.raise(
                WarningCode::ConsumerRestart,
                WarningSeverity::Warn,
                format!("consumer [{}] is unhealthy and is being replaced", queue_id),
                "QueueManager",
            );

            let queue_config = self.queue_configs.read().await.get(&queue_id).cloned();
            let Some(queue_config) = queue_config else {
                warn!(queue_id = %queue_id, "No stored config for unhealthy consumer");
                continue;
            };

            let mut consumers = self.consumers.write().await;
            if let Some(old) = consumers.remove(&queue_id) {
                old.stop().await;
                self.draining_consumers
                    .write()
                    .await
                    .insert(queue_id.clone(), old);
            }

            let connections = queue_config.connections.unwrap_or(1);
            match self
                .consumer_factory
                .create_consumer(&queue_config, connections)
                .await
            {
                Ok(consumer) => {
                    consumer.clone().start(router.clone()).await;
                    consumers.insert(queue_id.clone(), consumer);
                    info!(queue_id = %queue_id, "Consumer replaced");
                }
                Err(e) => {
                    error!(queue_id = %queue_id, error = %e, "Consumer replacement failed");
                    self.warnings.raise(
                        WarningCode::ConsumerRestartFailed,
                        WarningSeverity::Critical,
                        format!("failed to replace consumer [{}]: {}", queue_id, e),
                        "QueueManager",
                    );
                }
            }
        }
    }

    /// The tracker can never legitimately outgrow the pools that feed it.
    pub fn check_pipeline_leak(&self) -> bool {
        let bound: usize = self
            .pools
            .iter()
            .chain(self.draining_pools.iter())
            .map(|e| (e.value().queue_capacity() + e.value().concurrency()) as usize)
            .sum();

        let tracked = self.tracker.len();
        if tracked > bound {
            warn!(tracked = tracked, bound = bound, "In-flight tracker exceeds pool capacity");
            self.warnings.raise(
                WarningCode::PipelineMapLeak,
                WarningSeverity::Warn,
                format!(
                    "tracker holds {} messages but pool capacity bounds it at {}",
                    tracked, bound
                ),
                "QueueManager",
            );
            return false;
        }
        true
    }

    /// Publish the operator gauges.
    pub async fn refresh_gauges(&self) {
        metrics::set_tracker_size(self.tracker.len());
        metrics::set_pools_active(self.pools.len());
        for entry in self.pools.iter() {
            let pool = entry.value();
            metrics::set_pool_queue_size(pool.pool_code(), pool.queue_size());
            metrics::set_pool_active_workers(pool.pool_code(), pool.active_workers());
        }

        let consumers = self.consumers.read().await;
        for (queue_id, consumer) in consumers.iter() {
            match consumer.queue_depth().await {
                Ok(Some(available)) => metrics::set_broker_available(queue_id, available),
                Ok(None) => {}
                Err(e) => debug!(queue_id = %queue_id, error = %e, "Queue depth unavailable"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Graceful shutdown: stop consumers, drain pools, bulk-nack leftovers.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("QueueManager shutting down");

        // Stop every consumer in parallel and wait for quiescence.
        let consumers: Vec<Arc<dyn QueueConsumer>> = {
            let active = self.consumers.read().await;
            let draining = self.draining_consumers.read().await;
            active.values().chain(draining.values()).cloned().collect()
        };
        futures::future::join_all(consumers.iter().map(|c| c.stop())).await;

        let deadline = Instant::now() + self.config.consumer_stop_timeout;
        while Instant::now() < deadline {
            if consumers.iter().all(|c| c.is_fully_stopped()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        let stragglers = consumers.iter().filter(|c| !c.is_fully_stopped()).count();
        if stragglers > 0 {
            warn!(stragglers = stragglers, "Consumers still stopping at timeout");
        }

        // Drain every pool in parallel and wait.
        let pools: Vec<Arc<dyn ProcessPool>> = self
            .pools
            .iter()
            .chain(self.draining_pools.iter())
            .map(|e| e.value().clone())
            .collect();
        for pool in &pools {
            pool.drain().await;
        }

        let deadline = Instant::now() + self.config.pool_drain_timeout;
        while Instant::now() < deadline {
            if pools.iter().all(|p| p.is_fully_drained()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        // Stop the background loops and the completion dispatcher.
        let _ = self.shutdown_tx.send(());

        // Whatever is still tracked gets a terminal nack.
        let leftovers = self.tracker.clear();
        metrics::set_tracker_size(0);
        let mut errors = 0usize;
        if !leftovers.is_empty() {
            warn!(remaining = leftovers.len(), "Bulk-nacking messages still in flight");
        }
        for entry in leftovers {
            if entry.callback.nack().await.is_err() {
                errors += 1;
            }
        }
        if errors > 0 {
            self.warnings.raise(
                WarningCode::ShutdownCleanupErrors,
                WarningSeverity::Warn,
                format!("{} nack callbacks failed during shutdown cleanup", errors),
                "QueueManager",
            );
        }

        for pool in &pools {
            pool.shutdown().await;
        }
        self.pools.clear();
        self.draining_pools.clear();

        info!("QueueManager shutdown complete");
    }
}

#[async_trait]
impl BatchRouter for QueueManager {
    async fn route_batch(&self, batch: Vec<BatchMessage>) {
        self.route_batch_inner(batch).await;
    }
}
