//! Configuration pull and the periodic sync loop.
//!
//! The client fetches declarative config from the control plane with
//! bounded retries. The sync service applies it through the manager's
//! reconcile step: the initial sync is load-bearing (the process exits
//! non-zero if it fails after all retries), later failures only warn and
//! the router keeps the last known-good configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use relay_common::{
    PoolConfig, QueueAuthConfig, QueueConfig, RouterConfig, WarningCode, WarningSeverity,
};

use crate::error::RouterError;
use crate::manager::QueueManager;
use crate::standby::StandbyProcessor;
use crate::warning::WarningService;
use crate::Result;

#[derive(Debug, Clone)]
pub struct ConfigSyncConfig {
    pub config_url: String,
    /// How often the loop re-fetches desired state.
    pub sync_interval: Duration,
    /// Delay before the first scheduled sync after startup.
    pub initial_delay: Duration,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for ConfigSyncConfig {
    fn default() -> Self {
        Self {
            config_url: String::new(),
            sync_interval: Duration::from_secs(300),
            initial_delay: Duration::from_secs(2),
            max_retry_attempts: 12,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ConfigSyncConfig {
    pub fn new(config_url: String) -> Self {
        Self {
            config_url,
            ..Default::default()
        }
    }
}

/// Wire shape served by the control plane. Unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfigResponse {
    #[serde(default)]
    pub processing_pools: Vec<PoolConfigResponse>,
    #[serde(default)]
    pub queues: Vec<QueueConfigResponse>,
    #[serde(default)]
    pub connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfigResponse {
    pub code: String,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfigResponse {
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub queue_uri: Option<String>,
    #[serde(default)]
    pub connections: Option<u32>,
    #[serde(default)]
    pub parser: Option<String>,
    #[serde(default)]
    pub auth: Option<QueueAuthConfig>,
}

impl From<RouterConfigResponse> for RouterConfig {
    fn from(response: RouterConfigResponse) -> Self {
        RouterConfig {
            processing_pools: response
                .processing_pools
                .into_iter()
                .map(|p| PoolConfig {
                    code: p.code,
                    concurrency: p.concurrency,
                    rate_limit_per_minute: p.rate_limit_per_minute,
                })
                .collect(),
            queues: response
                .queues
                .into_iter()
                .map(|q| QueueConfig {
                    name: q.queue_name,
                    uri: q.queue_uri,
                    connections: q.connections,
                    parser_type: q.parser,
                    auth: q.auth,
                })
                .collect(),
            connections: response.connections,
        }
    }
}

/// Pulls configuration from the control plane with bounded retries.
pub struct ConfigClient {
    http: reqwest::Client,
    config: ConfigSyncConfig,
}

impl ConfigClient {
    pub fn new(config: ConfigSyncConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { http, config }
    }

    pub async fn fetch(&self) -> Result<RouterConfig> {
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_retry_attempts {
            debug!(
                attempt = attempt,
                max_attempts = self.config.max_retry_attempts,
                url = %self.config.config_url,
                "Fetching configuration"
            );

            match self.fetch_once().await {
                Ok(config) => {
                    if attempt > 1 {
                        info!(attempt = attempt, "Configuration fetched after retries");
                    }
                    return Ok(config);
                }
                Err(e) => {
                    last_error = e;
                    if attempt < self.config.max_retry_attempts {
                        warn!(
                            attempt = attempt,
                            error = %last_error,
                            retry_delay_secs = self.config.retry_delay.as_secs(),
                            "Config fetch failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        error!(
            attempts = self.config.max_retry_attempts,
            error = %last_error,
            "Config fetch failed after all retries"
        );
        Err(RouterError::ConfigFetch(last_error))
    }

    async fn fetch_once(&self) -> std::result::Result<RouterConfig, String> {
        let response = self
            .http
            .get(&self.config.config_url)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("config service returned {}", response.status()));
        }

        let parsed: RouterConfigResponse = response
            .json()
            .await
            .map_err(|e| format!("failed to parse config response: {}", e))?;

        Ok(parsed.into())
    }
}

pub struct ConfigSyncService {
    client: ConfigClient,
    sync_interval: Duration,
    initial_delay: Duration,
    manager: Arc<QueueManager>,
    warnings: Arc<WarningService>,
    standby: Option<Arc<StandbyProcessor>>,
    last_config_hash: parking_lot::Mutex<Option<u64>>,
}

impl ConfigSyncService {
    pub fn new(
        config: ConfigSyncConfig,
        manager: Arc<QueueManager>,
        warnings: Arc<WarningService>,
        standby: Option<Arc<StandbyProcessor>>,
    ) -> Self {
        let sync_interval = config.sync_interval;
        let initial_delay = config.initial_delay;
        Self {
            client: ConfigClient::new(config),
            sync_interval,
            initial_delay,
            manager,
            warnings,
            standby,
            last_config_hash: parking_lot::Mutex::new(None),
        }
    }

    /// First fetch-and-apply. A failure here is fatal to the process.
    pub async fn initial_sync(&self) -> Result<RouterConfig> {
        info!("Performing initial configuration sync");

        let config = match self.client.fetch().await {
            Ok(config) => config,
            Err(e) => {
                self.warnings.raise(
                    WarningCode::ConfigSyncFailed,
                    WarningSeverity::Critical,
                    format!("initial config fetch failed: {}", e),
                    "ConfigSyncService",
                );
                return Err(e);
            }
        };

        if let Err(e) = self.manager.reconcile(config.clone()).await {
            self.warnings.raise(
                WarningCode::ConfigSyncFailed,
                WarningSeverity::Critical,
                format!("failed to apply initial config: {}", e),
                "ConfigSyncService",
            );
            return Err(e);
        }

        *self.last_config_hash.lock() = Some(Self::config_hash(&config));

        info!(
            pools = config.processing_pools.len(),
            queues = config.queues.len(),
            "Initial configuration applied"
        );
        Ok(config)
    }

    /// Scheduled sync. Fetch failures warn and keep the last good config.
    pub async fn sync(&self) {
        if let Some(standby) = &self.standby {
            if !standby.should_process() {
                debug!("Not primary, skipping configuration sync");
                return;
            }
        }

        let config = match self.client.fetch().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Scheduled config sync failed, keeping last known-good config");
                self.warnings.raise(
                    WarningCode::ConfigSyncFailed,
                    WarningSeverity::Warn,
                    format!("config sync failed: {}", e),
                    "ConfigSyncService",
                );
                return;
            }
        };

        let new_hash = Self::config_hash(&config);
        if *self.last_config_hash.lock() == Some(new_hash) {
            debug!("Configuration unchanged, skipping reconcile");
            return;
        }

        info!(
            pools = config.processing_pools.len(),
            queues = config.queues.len(),
            "Configuration changed, reconciling"
        );

        match self.manager.reconcile(config).await {
            Ok(()) => {
                *self.last_config_hash.lock() = Some(new_hash);
            }
            Err(e) => {
                error!(error = %e, "Failed to apply configuration");
                self.warnings.raise(
                    WarningCode::ConfigSyncFailed,
                    WarningSeverity::Warn,
                    format!("config reconcile failed: {}", e),
                    "ConfigSyncService",
                );
            }
        }
    }

    fn config_hash(config: &RouterConfig) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        for pool in &config.processing_pools {
            pool.code.hash(&mut hasher);
            pool.concurrency.hash(&mut hasher);
            pool.rate_limit_per_minute.hash(&mut hasher);
        }
        for queue in &config.queues {
            queue.name.hash(&mut hasher);
            queue.uri.hash(&mut hasher);
            queue.connections.hash(&mut hasher);
            queue.parser_type.hash(&mut hasher);
        }
        config.connections.hash(&mut hasher);
        hasher.finish()
    }
}

/// Spawn the periodic sync loop (initial delay, then fixed interval).
pub fn spawn_sync_task(
    sync: Arc<ConfigSyncService>,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(sync.initial_delay) => {}
            _ = shutdown_rx.recv() => return,
        }

        let mut ticker = tokio::time::interval(sync.sync_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running scheduled configuration sync");
                    sync.sync().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Config sync loop shutting down");
                    break;
                }
            }
        }
    })
}
