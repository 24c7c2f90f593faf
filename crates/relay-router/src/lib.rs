//! Relay Message Router
//!
//! Stateless, high-throughput message routing core:
//! - QueueManager: batch routing policies, reconciliation, lifecycle
//! - InFlightTracker: single source of truth for in-pipeline messages
//! - ProcessPool: bounded buffer + worker set with hot parameter updates
//! - HttpMediator: delivery with retry and per-target circuit breakers
//! - PoolRateLimiter: per-pool sliding-window permits
//! - ConfigSync: periodic pull of declarative config from the control plane
//! - WarningService: structured operational warnings
//! - Standby: optional hot-standby primary election

pub mod breaker;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod mediator;
pub mod metrics;
pub mod pool;
pub mod rate_limit;
pub mod standby;
pub mod sync;
pub mod tracker;
pub mod warning;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use error::RouterError;
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use manager::{ConsumerFactory, QueueManager, QueueManagerConfig};
pub use mediator::{DeliveryMode, HttpMediator, HttpMediatorConfig, Mediator};
pub use pool::{
    Completion, CompletionKind, CompletionSender, PoolFactory, PoolTask, ProcessPool, WorkerPool,
    WorkerPoolFactory,
};
pub use rate_limit::{AcquireOutcome, PoolRateLimiter};
pub use standby::{spawn_leadership_monitor, StandbyConfig, StandbyProcessor};
pub use sync::{spawn_sync_task, ConfigClient, ConfigSyncConfig, ConfigSyncService};
pub use tracker::{InFlightTracker, TrackOutcome, Tracked};
pub use warning::{WarningService, WarningServiceConfig};

pub type Result<T> = std::result::Result<T, RouterError>;
