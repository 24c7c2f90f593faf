//! Relay production router.
//!
//! Consumes messages from brokered queues and routes them through named
//! processing pools to HTTP targets, with hot configuration sync from the
//! control plane and optional hot-standby HA.
//!
//! Environment:
//! - `RELAY_CONFIG_URL`: control-plane config endpoint (required unless dev mode)
//! - `RELAY_CONFIG_INTERVAL`: sync interval seconds (default 300)
//! - `RELAY_DEV_MODE=true`: built-in embedded-queue configuration, no control plane
//! - `RELAY_DELIVERY_MODE`: `dataOnly` (default) or `envelope`
//! - `RELAY_STANDBY_ENABLED`, `RELAY_STANDBY_REDIS_URL`, `RELAY_STANDBY_LOCK_KEY`
//! - `LOCALSTACK_ENDPOINT`: SQS endpoint override for local development
//! - `METRICS_PORT`: Prometheus exporter port (default 9090)
//!
//! Exit codes: 0 on clean shutdown, non-zero when the initial configuration
//! fetch fails after all retries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::signal;
use tracing::{error, info, warn};

use relay_common::{PoolConfig, QueueConfig, RouterConfig};
use relay_queue::factory::ConsumerDefaults;
use relay_queue::{QueueConsumer, VariantConsumerFactory};
use relay_router::{
    CircuitBreakerRegistry, ConfigSyncConfig, ConfigSyncService, ConsumerFactory, DeliveryMode,
    HttpMediator, HttpMediatorConfig, InFlightTracker, LifecycleConfig, LifecycleManager,
    QueueManager, QueueManagerConfig, StandbyConfig, StandbyProcessor, WarningService,
    WarningServiceConfig, WorkerPoolFactory,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    relay_common::logging::init_logging();

    info!("Starting Relay Message Router");

    let dev_mode = env_flag("RELAY_DEV_MODE");

    // Metrics exporter. Failure is not fatal; the router runs blind instead.
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9090);
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
    {
        Ok(()) => info!(port = metrics_port, "Prometheus exporter listening"),
        Err(e) => warn!(error = %e, "Failed to install Prometheus exporter"),
    }

    let warnings = Arc::new(WarningService::new(WarningServiceConfig::default()));

    // Mediator with per-target circuit breakers.
    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let delivery_mode = match std::env::var("RELAY_DELIVERY_MODE").as_deref() {
        Ok("envelope") | Ok("ENVELOPE") => DeliveryMode::Envelope,
        _ => DeliveryMode::DataOnly,
    };
    let mediator = Arc::new(HttpMediator::with_config(
        HttpMediatorConfig {
            delivery_mode,
            ..Default::default()
        },
        breakers,
    ));

    let pool_factory = Arc::new(WorkerPoolFactory::new(mediator, warnings.clone()));
    let consumer_factory = build_consumer_factory(dev_mode).await?;

    let tracker = Arc::new(InFlightTracker::new());
    let manager = QueueManager::new(
        tracker,
        pool_factory,
        consumer_factory,
        warnings.clone(),
        QueueManagerConfig::default(),
    );

    // Hot-standby: wait for leadership before consuming.
    let standby = match StandbyProcessor::new(load_standby_config()).await {
        Ok(processor) => Arc::new(processor),
        Err(e) => {
            error!(error = %e, "Failed to initialize standby processor");
            return Err(anyhow::anyhow!("standby init failed: {}", e));
        }
    };
    standby
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("standby start failed: {}", e))?;

    if standby.is_enabled() && !standby.is_leader() {
        info!("Waiting for leadership before starting message processing");
        standby.wait_for_leadership().await;
        info!("Acquired leadership");
    }

    // Configuration: dev mode is self-contained, production pulls from the
    // control plane and refuses to start without it.
    let config_sync = if dev_mode {
        info!("Development mode: applying built-in configuration");
        let config = dev_config();
        manager
            .reconcile(config)
            .await
            .map_err(|e| anyhow::anyhow!("failed to apply dev config: {}", e))?;
        None
    } else {
        let config_url = std::env::var("RELAY_CONFIG_URL")
            .map_err(|_| anyhow::anyhow!("RELAY_CONFIG_URL is required (or set RELAY_DEV_MODE=true)"))?;

        let mut sync_config = ConfigSyncConfig::new(config_url);
        if let Some(secs) = std::env::var("RELAY_CONFIG_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            sync_config.sync_interval = Duration::from_secs(secs);
        }

        let sync = Arc::new(ConfigSyncService::new(
            sync_config,
            manager.clone(),
            warnings.clone(),
            Some(standby.clone()),
        ));

        if let Err(e) = sync.initial_sync().await {
            // Fatal by design: the supervisor restarts the process.
            error!(error = %e, "Initial configuration sync failed, exiting");
            std::process::exit(1);
        }
        Some(sync)
    };

    let _lifecycle = LifecycleManager::start(
        manager.clone(),
        warnings.clone(),
        LifecycleConfig::default(),
        config_sync,
        Some(standby.clone()),
    );

    info!("Relay Message Router started; press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("Shutdown signal received");

    manager.shutdown().await;
    standby.shutdown().await;

    info!("Relay Message Router shutdown complete");
    Ok(())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

async fn build_consumer_factory(dev_mode: bool) -> Result<Arc<dyn ConsumerFactory>> {
    let mut factory = VariantConsumerFactory::new(ConsumerDefaults::default());

    if dev_mode {
        let db_url = std::env::var("RELAY_DEV_DB")
            .unwrap_or_else(|_| "sqlite://relay-dev.db?mode=rwc".to_string());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        factory = factory.with_embedded_pool(pool);

        // Point SQS at LocalStack in case dev config references SQS URLs.
        let endpoint = std::env::var("LOCALSTACK_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4566".to_string());
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(&endpoint)
            .load()
            .await;
        factory = factory.with_sqs_client(aws_sdk_sqs::Client::new(&aws_config));
    } else {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        factory = factory.with_sqs_client(aws_sdk_sqs::Client::new(&aws_config));
    }

    Ok(Arc::new(BrokerConsumerFactory { inner: factory }))
}

/// Adapts the queue crate's variant factory to the manager's factory seam.
struct BrokerConsumerFactory {
    inner: VariantConsumerFactory,
}

#[async_trait]
impl ConsumerFactory for BrokerConsumerFactory {
    async fn create_consumer(
        &self,
        config: &QueueConfig,
        connections: u32,
    ) -> relay_router::Result<Arc<dyn QueueConsumer>> {
        self.inner
            .create(config, connections)
            .await
            .map_err(Into::into)
    }
}

fn load_standby_config() -> StandbyConfig {
    StandbyConfig {
        enabled: env_flag("RELAY_STANDBY_ENABLED"),
        redis_url: std::env::var("RELAY_STANDBY_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        lock_key: std::env::var("RELAY_STANDBY_LOCK_KEY")
            .unwrap_or_else(|_| "relay:router:primary".to_string()),
        lock_ttl_seconds: std::env::var("RELAY_STANDBY_LOCK_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30),
        heartbeat_interval_seconds: std::env::var("RELAY_STANDBY_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10),
        instance_id: std::env::var("RELAY_INSTANCE_ID")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_default(),
    }
}

/// Built-in development topology: one embedded queue, three pools.
fn dev_config() -> RouterConfig {
    RouterConfig {
        processing_pools: vec![
            PoolConfig::new("DEFAULT", 10),
            PoolConfig::new("HIGH", 20),
            PoolConfig {
                code: "LOW".to_string(),
                concurrency: Some(5),
                rate_limit_per_minute: Some(60),
            },
        ],
        queues: vec![QueueConfig {
            name: Some("relay-default".to_string()),
            uri: Some("embedded:relay-default".to_string()),
            connections: Some(1),
            parser_type: None,
            auth: None,
        }],
        connections: Some(1),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
