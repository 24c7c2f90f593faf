//! Shared doubles for the router test suites.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use relay_common::{
    AckCallback, BatchMessage, BatchRouter, BrokerAckError, MediationOutcome, MediationType,
    MessagePointer, PoolConfig, QueueConfig,
};
use relay_queue::{QueueConsumer, QueueError};
use relay_router::{
    Completion, CompletionKind, CompletionSender, ConsumerFactory, InFlightTracker, Mediator,
    PoolFactory, PoolTask, ProcessPool, QueueManager, QueueManagerConfig, WarningService,
    WarningServiceConfig,
};

// ----------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------

pub fn pointer(id: &str, pool_code: &str, group: Option<&str>) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: pool_code.to_string(),
        auth_token: None,
        mediation_type: MediationType::HTTP,
        mediation_target: "http://localhost:9/hook".to_string(),
        message_group_id: group.map(|g| g.to_string()),
        high_priority: None,
        batch_id: None,
        broker_message_id: None,
        code: None,
        subject: None,
        data: None,
    }
}

pub fn batch_message(
    message: MessagePointer,
    callback: Arc<RecordingCallback>,
) -> BatchMessage {
    BatchMessage {
        broker_message_id: message.broker_message_id.clone(),
        queue_identifier: "test-queue".to_string(),
        message,
        callback,
    }
}

// ----------------------------------------------------------------------
// Recording ack callback
// ----------------------------------------------------------------------

/// Records terminal callbacks; optionally carries the SQS-like
/// receipt-handle capability.
pub struct RecordingCallback {
    pub acks: AtomicU32,
    pub nacks: AtomicU32,
    receipt: Option<RwLock<String>>,
    /// Receipt handle observed at ack time, when the capability is present.
    pub acked_with: Mutex<Option<String>>,
    pub fail_ack: AtomicBool,
    pub fail_nack: AtomicBool,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            acks: AtomicU32::new(0),
            nacks: AtomicU32::new(0),
            receipt: None,
            acked_with: Mutex::new(None),
            fail_ack: AtomicBool::new(false),
            fail_nack: AtomicBool::new(false),
        })
    }

    pub fn with_receipt(handle: &str) -> Arc<Self> {
        Arc::new(Self {
            acks: AtomicU32::new(0),
            nacks: AtomicU32::new(0),
            receipt: Some(RwLock::new(handle.to_string())),
            acked_with: Mutex::new(None),
            fail_ack: AtomicBool::new(false),
            fail_nack: AtomicBool::new(false),
        })
    }

    pub fn ack_count(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn nack_count(&self) -> u32 {
        self.nacks.load(Ordering::SeqCst)
    }

    pub fn terminal_count(&self) -> u32 {
        self.ack_count() + self.nack_count()
    }

    pub fn current_receipt(&self) -> Option<String> {
        self.receipt.as_ref().map(|r| r.read().clone())
    }
}

#[async_trait]
impl AckCallback for RecordingCallback {
    async fn ack(&self) -> Result<(), BrokerAckError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        *self.acked_with.lock() = self.current_receipt();
        if self.fail_ack.load(Ordering::SeqCst) {
            return Err(BrokerAckError("simulated ack failure".to_string()));
        }
        Ok(())
    }

    async fn nack(&self) -> Result<(), BrokerAckError> {
        self.nacks.fetch_add(1, Ordering::SeqCst);
        if self.fail_nack.load(Ordering::SeqCst) {
            return Err(BrokerAckError("simulated nack failure".to_string()));
        }
        Ok(())
    }

    fn receipt_handle(&self) -> Option<String> {
        self.current_receipt()
    }

    fn update_receipt_handle(&self, new_handle: &str) -> bool {
        match &self.receipt {
            Some(receipt) => {
                *receipt.write() = new_handle.to_string();
                true
            }
            None => false,
        }
    }
}

// ----------------------------------------------------------------------
// Mock mediator
// ----------------------------------------------------------------------

/// Mediator double: scripted outcome, optional delay, optional gate that
/// holds deliveries until released.
pub struct MockMediator {
    calls: AtomicU32,
    processed: Mutex<Vec<String>>,
    outcome: Mutex<MediationOutcome>,
    delay: Mutex<Duration>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockMediator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            processed: Mutex::new(Vec::new()),
            outcome: Mutex::new(MediationOutcome::success(200)),
            delay: Mutex::new(Duration::ZERO),
            gate: Mutex::new(None),
        })
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let mediator = Self::new();
        *mediator.delay.lock() = delay;
        mediator
    }

    pub fn failing() -> Arc<Self> {
        let mediator = Self::new();
        *mediator.outcome.lock() =
            MediationOutcome::server_error(500, "simulated failure".to_string());
        mediator
    }

    pub fn set_outcome(&self, outcome: MediationOutcome) {
        *self.outcome.lock() = outcome;
    }

    /// Hold subsequent deliveries until `release` is called once per held
    /// delivery.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn processed_ids(&self) -> Vec<String> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl Mediator for MockMediator {
    async fn process(&self, message: &MessagePointer) -> MediationOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.processed.lock().push(message.id.clone());

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.outcome.lock().clone()
    }
}

// ----------------------------------------------------------------------
// Mock pool
// ----------------------------------------------------------------------

/// Pool double that records submits and can be scripted to reject specific
/// message ids or report a fixed capacity headroom.
pub struct MockPool {
    code: String,
    pub submitted: Mutex<Vec<PoolTask>>,
    pub reject_ids: Mutex<HashSet<String>>,
    queue_size: AtomicU32,
    capacity: AtomicU32,
    draining: AtomicBool,
}

impl MockPool {
    pub fn new(code: &str) -> Arc<Self> {
        Arc::new(Self {
            code: code.to_string(),
            submitted: Mutex::new(Vec::new()),
            reject_ids: Mutex::new(HashSet::new()),
            queue_size: AtomicU32::new(0),
            capacity: AtomicU32::new(50),
            draining: AtomicBool::new(false),
        })
    }

    pub fn reject(&self, message_id: &str) {
        self.reject_ids.lock().insert(message_id.to_string());
    }

    pub fn set_occupancy(&self, queue_size: u32, capacity: u32) {
        self.queue_size.store(queue_size, Ordering::SeqCst);
        self.capacity.store(capacity, Ordering::SeqCst);
    }

    pub fn submitted_ids(&self) -> Vec<String> {
        self.submitted
            .lock()
            .iter()
            .map(|t| t.message.id.clone())
            .collect()
    }
}

#[async_trait]
impl ProcessPool for MockPool {
    fn pool_code(&self) -> &str {
        &self.code
    }

    async fn submit(&self, task: PoolTask) -> bool {
        if self.draining.load(Ordering::SeqCst) {
            return false;
        }
        if self.reject_ids.lock().contains(&task.message.id) {
            return false;
        }
        self.submitted.lock().push(task);
        true
    }

    async fn update_concurrency(&self, _new_concurrency: u32, _timeout: Duration) -> bool {
        true
    }

    fn update_rate_limit(&self, _per_minute: Option<u32>) {}

    async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    async fn shutdown(&self) {}

    fn is_fully_drained(&self) -> bool {
        true
    }

    fn concurrency(&self) -> u32 {
        4
    }

    fn rate_limit_per_minute(&self) -> Option<u32> {
        None
    }

    fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    fn queue_capacity(&self) -> u32 {
        self.capacity.load(Ordering::SeqCst)
    }

    fn active_workers(&self) -> u32 {
        0
    }
}

/// Factory that hands out pre-registered mock pools, creating plain ones on
/// demand for codes it has not seen (e.g. the default pool).
pub struct MockPoolFactory {
    pub pools: Mutex<Vec<(String, Arc<MockPool>)>>,
}

impl MockPoolFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, pool: Arc<MockPool>) {
        self.pools.lock().push((pool.pool_code().to_string(), pool));
    }

    pub fn created_codes(&self) -> Vec<String> {
        self.pools.lock().iter().map(|(code, _)| code.clone()).collect()
    }
}

impl PoolFactory for MockPoolFactory {
    fn create(&self, config: PoolConfig, _completions: CompletionSender) -> Arc<dyn ProcessPool> {
        let mut pools = self.pools.lock();
        if let Some((_, pool)) = pools.iter().find(|(code, _)| *code == config.code) {
            return pool.clone();
        }
        let pool = MockPool::new(&config.code);
        pools.push((config.code.clone(), pool.clone()));
        pool
    }
}

// ----------------------------------------------------------------------
// Mock consumers
// ----------------------------------------------------------------------

pub struct MockConsumer {
    identifier: String,
    pub healthy: AtomicBool,
    running: AtomicBool,
    pub started: AtomicBool,
}

impl MockConsumer {
    pub fn new(identifier: &str) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.to_string(),
            healthy: AtomicBool::new(true),
            running: AtomicBool::new(true),
            started: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl QueueConsumer for MockConsumer {
    fn queue_identifier(&self) -> &str {
        &self.identifier
    }

    async fn start(self: Arc<Self>, _router: Arc<dyn BatchRouter>) {
        self.started.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_fully_stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn last_poll_time(&self) -> Option<DateTime<Utc>> {
        Some(Utc::now())
    }
}

pub struct MockConsumerFactory {
    pub created: Mutex<Vec<Arc<MockConsumer>>>,
    pub fail: AtomicBool,
}

impl MockConsumerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl ConsumerFactory for MockConsumerFactory {
    async fn create_consumer(
        &self,
        config: &QueueConfig,
        _connections: u32,
    ) -> relay_router::Result<Arc<dyn QueueConsumer>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::Config("simulated factory failure".to_string()).into());
        }
        let consumer = MockConsumer::new(&config.identifier());
        self.created.lock().push(consumer.clone());
        Ok(consumer)
    }
}

// ----------------------------------------------------------------------
// Manager assembly
// ----------------------------------------------------------------------

pub struct ManagerHarness {
    pub manager: Arc<QueueManager>,
    pub warnings: Arc<WarningService>,
    pub consumer_factory: Arc<MockConsumerFactory>,
}

pub fn manager_with_pool_factory(pool_factory: Arc<dyn PoolFactory>) -> ManagerHarness {
    manager_with(pool_factory, QueueManagerConfig::default())
}

pub fn manager_with(
    pool_factory: Arc<dyn PoolFactory>,
    config: QueueManagerConfig,
) -> ManagerHarness {
    let warnings = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let consumer_factory = MockConsumerFactory::new();
    let manager = QueueManager::new(
        Arc::new(InFlightTracker::new()),
        pool_factory,
        consumer_factory.clone(),
        warnings.clone(),
        config,
    );
    ManagerHarness {
        manager,
        warnings,
        consumer_factory,
    }
}

/// Wait until `predicate` holds or the timeout elapses.
pub async fn wait_for<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

/// Drain helper for tests that read completions directly.
pub fn completion_kind_name(completion: &Completion) -> &'static str {
    match completion.kind {
        CompletionKind::Delivered(_) => "delivered",
        CompletionKind::RateLimited => "rate_limited",
        CompletionKind::Failed(_) => "failed",
    }
}
