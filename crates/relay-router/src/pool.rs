//! Process pools: bounded buffering, bounded concurrency, per-pool rate
//! limiting, hot parameter updates, graceful drain.
//!
//! The manager talks to pools through the `ProcessPool` trait and builds
//! them through a `PoolFactory`, so collaborators are injected at the
//! composition root. Workers report delivery outcomes back to the manager
//! over an async completion channel - never by calling back into the pool.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use relay_common::{MediationOutcome, MessagePointer, PoolConfig};

use crate::mediator::Mediator;
use crate::metrics;
use crate::rate_limit::{AcquireOutcome, PoolRateLimiter};
use crate::warning::WarningService;

const QUEUE_CAPACITY_MULTIPLIER: u32 = 2;
const MIN_QUEUE_CAPACITY: u32 = 50;

/// How long a worker may wait on a rate-limit permit before the message is
/// nacked back to the broker.
pub const DEFAULT_RATE_ACQUIRE_BUDGET: Duration = Duration::from_secs(60);

/// Unit of work handed to a pool: the message plus the key it is tracked
/// under while in flight.
#[derive(Debug, Clone)]
pub struct PoolTask {
    pub pipeline_key: String,
    pub message: MessagePointer,
}

/// Terminal outcome of one pool task, reported to the manager.
#[derive(Debug)]
pub enum CompletionKind {
    Delivered(MediationOutcome),
    /// The rate-limit permit wait ran out of budget or was cancelled.
    RateLimited,
    /// Pool-internal failure (worker panic, closed semaphore).
    Failed(String),
}

#[derive(Debug)]
pub struct Completion {
    pub pipeline_key: String,
    pub pool_code: String,
    pub kind: CompletionKind,
}

pub type CompletionSender = mpsc::UnboundedSender<Completion>;

#[async_trait]
pub trait ProcessPool: Send + Sync {
    fn pool_code(&self) -> &str;

    /// Enqueue a task. Returns false iff the buffer is full or the pool is
    /// draining; the caller keeps ownership of the ack decision in that case.
    async fn submit(&self, task: PoolTask) -> bool;

    /// Adjust the worker count in place. Blocks until idle slots permit the
    /// decrease or the timeout elapses; never aborts in-flight work and
    /// never reorders queued messages.
    async fn update_concurrency(&self, new_concurrency: u32, timeout: Duration) -> bool;

    /// Replace the rate-limit permit source atomically.
    fn update_rate_limit(&self, per_minute: Option<u32>);

    /// Stop admitting work; workers keep running until the buffer is empty.
    async fn drain(&self);

    /// Release resources. Only valid once `is_fully_drained` reports true.
    async fn shutdown(&self);

    fn is_fully_drained(&self) -> bool;
    fn concurrency(&self) -> u32;
    fn rate_limit_per_minute(&self) -> Option<u32>;
    fn queue_size(&self) -> u32;
    fn queue_capacity(&self) -> u32;
    fn active_workers(&self) -> u32;
}

pub trait PoolFactory: Send + Sync {
    fn create(&self, config: PoolConfig, completions: CompletionSender) -> Arc<dyn ProcessPool>;
}

/// Production pool: an unbounded channel as the FIFO buffer with admission
/// capped by an atomic size counter (so capacity can be re-derived on
/// concurrency updates without migrating the buffer), a dispatcher that
/// acquires the rate permit *before* a concurrency permit, and one spawned
/// task per delivery.
pub struct WorkerPool {
    code: String,
    mediator: Arc<dyn Mediator>,
    completions: CompletionSender,
    buffer_tx: mpsc::UnboundedSender<PoolTask>,
    concurrency: AtomicU32,
    semaphore: Arc<Semaphore>,
    rate_limiter: PoolRateLimiter,
    queue_size: AtomicU32,
    active_workers: AtomicU32,
    draining: AtomicBool,
    stopped: AtomicBool,
    shutdown_signal: Notify,
    warnings: Arc<WarningService>,
    rate_acquire_budget: Duration,
}

impl WorkerPool {
    pub fn start(
        config: PoolConfig,
        mediator: Arc<dyn Mediator>,
        completions: CompletionSender,
        warnings: Arc<WarningService>,
    ) -> Arc<Self> {
        Self::start_with_budget(
            config,
            mediator,
            completions,
            warnings,
            DEFAULT_RATE_ACQUIRE_BUDGET,
        )
    }

    pub fn start_with_budget(
        config: PoolConfig,
        mediator: Arc<dyn Mediator>,
        completions: CompletionSender,
        warnings: Arc<WarningService>,
        rate_acquire_budget: Duration,
    ) -> Arc<Self> {
        let concurrency = config.effective_concurrency();
        let (buffer_tx, buffer_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(Self {
            code: config.code.clone(),
            mediator,
            completions,
            buffer_tx,
            concurrency: AtomicU32::new(concurrency),
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            rate_limiter: PoolRateLimiter::new(config.rate_limit_per_minute),
            queue_size: AtomicU32::new(0),
            active_workers: AtomicU32::new(0),
            draining: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
            warnings,
            rate_acquire_budget,
        });

        info!(
            pool_code = %pool.code,
            concurrency = concurrency,
            rate_limit = ?config.rate_limit_per_minute,
            "Starting process pool"
        );

        tokio::spawn(pool.clone().dispatch(buffer_rx));
        pool
    }

    async fn dispatch(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PoolTask>) {
        loop {
            let task = tokio::select! {
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
                _ = self.shutdown_signal.notified() => break,
            };

            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            self.active_workers.fetch_add(1, Ordering::SeqCst);
            self.publish_gauges();

            // Rate limiting precedes concurrency acquisition so a
            // rate-limited message never holds a worker slot.
            match self
                .rate_limiter
                .acquire(self.rate_acquire_budget, &self.draining)
                .await
            {
                AcquireOutcome::Granted => {}
                AcquireOutcome::Exhausted | AcquireOutcome::Cancelled => {
                    self.finish_without_delivery(task, CompletionKind::RateLimited);
                    continue;
                }
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!(pool_code = %self.code, "Pool semaphore closed");
                        self.finish_without_delivery(
                            task,
                            CompletionKind::Failed("semaphore closed".to_string()),
                        );
                        break;
                    }
                },
                _ = self.shutdown_signal.notified() => {
                    self.finish_without_delivery(
                        task,
                        CompletionKind::Failed("pool shut down".to_string()),
                    );
                    break;
                }
            };

            let pool = self.clone();
            tokio::spawn(async move {
                let delivery = std::panic::AssertUnwindSafe(pool.mediator.process(&task.message))
                    .catch_unwind()
                    .await;

                let kind = match delivery {
                    Ok(outcome) => CompletionKind::Delivered(outcome),
                    Err(_) => {
                        error!(
                            pool_code = %pool.code,
                            message_id = %task.message.id,
                            "Worker panicked during delivery"
                        );
                        pool.warnings.raise(
                            relay_common::WarningCode::Routing,
                            relay_common::WarningSeverity::Warn,
                            format!(
                                "worker in pool [{}] panicked delivering message [{}]",
                                pool.code, task.message.id
                            ),
                            format!("ProcessPool:{}", pool.code),
                        );
                        CompletionKind::Failed("worker panicked".to_string())
                    }
                };

                let _ = pool.completions.send(Completion {
                    pipeline_key: task.pipeline_key,
                    pool_code: pool.code.clone(),
                    kind,
                });
                pool.active_workers.fetch_sub(1, Ordering::SeqCst);
                pool.publish_gauges();
                drop(permit);
            });
        }

        debug!(pool_code = %self.code, "Pool dispatcher exited");
    }

    fn finish_without_delivery(&self, task: PoolTask, kind: CompletionKind) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
        self.publish_gauges();
        let _ = self.completions.send(Completion {
            pipeline_key: task.pipeline_key,
            pool_code: self.code.clone(),
            kind,
        });
    }

    fn publish_gauges(&self) {
        metrics::set_pool_queue_size(&self.code, self.queue_size.load(Ordering::SeqCst));
        metrics::set_pool_active_workers(&self.code, self.active_workers.load(Ordering::SeqCst));
    }
}

#[async_trait]
impl ProcessPool for WorkerPool {
    fn pool_code(&self) -> &str {
        &self.code
    }

    async fn submit(&self, task: PoolTask) -> bool {
        if self.draining.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
            return false;
        }

        // Reserve a buffer slot; the capacity is re-derived from the current
        // concurrency, so a shrink never discards already-queued messages -
        // it only pauses admission until the backlog drains.
        loop {
            let current = self.queue_size.load(Ordering::SeqCst);
            if current >= self.queue_capacity() {
                debug!(
                    pool_code = %self.code,
                    queue_size = current,
                    capacity = self.queue_capacity(),
                    "Pool buffer full, rejecting submit"
                );
                return false;
            }
            if self
                .queue_size
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        if self.buffer_tx.send(task).is_err() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        self.publish_gauges();
        true
    }

    async fn update_concurrency(&self, new_concurrency: u32, timeout: Duration) -> bool {
        if new_concurrency == 0 {
            warn!(pool_code = %self.code, "Rejecting invalid concurrency limit: 0");
            return false;
        }

        let old = self.concurrency.load(Ordering::SeqCst);
        if new_concurrency == old {
            return true;
        }

        if new_concurrency > old {
            self.semaphore.add_permits((new_concurrency - old) as usize);
            self.concurrency.store(new_concurrency, Ordering::SeqCst);
            info!(
                pool_code = %self.code,
                old = old,
                new = new_concurrency,
                "Increased pool concurrency"
            );
            return true;
        }

        // Decrease: soak up the excess permits as workers go idle, then
        // forget them so capacity stays reduced.
        let excess = old - new_concurrency;
        match tokio::time::timeout(timeout, self.semaphore.acquire_many(excess)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                self.concurrency.store(new_concurrency, Ordering::SeqCst);
                info!(
                    pool_code = %self.code,
                    old = old,
                    new = new_concurrency,
                    "Decreased pool concurrency"
                );
                true
            }
            Ok(Err(_)) => {
                error!(pool_code = %self.code, "Pool semaphore closed during concurrency update");
                false
            }
            Err(_) => {
                warn!(
                    pool_code = %self.code,
                    old = old,
                    new = new_concurrency,
                    timeout_secs = timeout.as_secs(),
                    active_workers = self.active_workers.load(Ordering::SeqCst),
                    "Concurrency decrease timed out waiting for idle slots, retaining current limit"
                );
                false
            }
        }
    }

    fn update_rate_limit(&self, per_minute: Option<u32>) {
        self.rate_limiter.replace(per_minute);
    }

    async fn drain(&self) {
        info!(pool_code = %self.code, "Draining pool");
        self.draining.store(true, Ordering::SeqCst);
    }

    async fn shutdown(&self) {
        info!(pool_code = %self.code, "Shutting down pool");
        self.draining.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so the dispatcher also observes a
        // shutdown that fires before it parks on the signal.
        self.shutdown_signal.notify_one();
    }

    fn is_fully_drained(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0
            && self.active_workers.load(Ordering::SeqCst) == 0
    }

    fn concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::SeqCst)
    }

    fn rate_limit_per_minute(&self) -> Option<u32> {
        self.rate_limiter.per_minute()
    }

    fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    fn queue_capacity(&self) -> u32 {
        std::cmp::max(
            self.concurrency.load(Ordering::SeqCst) * QUEUE_CAPACITY_MULTIPLIER,
            MIN_QUEUE_CAPACITY,
        )
    }

    fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }
}

/// Factory for the production worker pool.
pub struct WorkerPoolFactory {
    mediator: Arc<dyn Mediator>,
    warnings: Arc<WarningService>,
    rate_acquire_budget: Duration,
}

impl WorkerPoolFactory {
    pub fn new(mediator: Arc<dyn Mediator>, warnings: Arc<WarningService>) -> Self {
        Self {
            mediator,
            warnings,
            rate_acquire_budget: DEFAULT_RATE_ACQUIRE_BUDGET,
        }
    }

    pub fn with_rate_acquire_budget(mut self, budget: Duration) -> Self {
        self.rate_acquire_budget = budget;
        self
    }
}

impl PoolFactory for WorkerPoolFactory {
    fn create(&self, config: PoolConfig, completions: CompletionSender) -> Arc<dyn ProcessPool> {
        WorkerPool::start_with_budget(
            config,
            self.mediator.clone(),
            completions,
            self.warnings.clone(),
            self.rate_acquire_budget,
        )
    }
}
