//! Hot-standby gating for the router.
//!
//! When enabled, only the primary (lease holder) consumes and syncs; a
//! standby instance idles until leadership arrives. Disabled deployments
//! skip Redis entirely and always process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use relay_standby::{LeaderElection, LeaderElectionConfig, LeadershipStatus, StandbyError};

#[derive(Debug, Clone)]
pub struct StandbyConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub lock_key: String,
    pub lock_ttl_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    /// Auto-generated when empty.
    pub instance_id: String,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "relay:router:primary".to_string(),
            lock_ttl_seconds: 30,
            heartbeat_interval_seconds: 10,
            instance_id: String::new(),
        }
    }
}

impl StandbyConfig {
    fn to_leader_config(&self) -> LeaderElectionConfig {
        LeaderElectionConfig {
            redis_url: self.redis_url.clone(),
            lock_key: self.lock_key.clone(),
            lock_ttl_seconds: self.lock_ttl_seconds,
            heartbeat_interval_seconds: self.heartbeat_interval_seconds,
            instance_id: if self.instance_id.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                self.instance_id.clone()
            },
        }
    }
}

pub enum StandbyProcessor {
    Enabled(Arc<LeaderElection>),
    Disabled,
}

impl StandbyProcessor {
    pub async fn new(config: StandbyConfig) -> Result<Self, StandbyError> {
        if !config.enabled {
            info!("Standby mode disabled, this instance is always active");
            return Ok(Self::Disabled);
        }

        let election = Arc::new(LeaderElection::new(config.to_leader_config()).await?);
        Ok(Self::Enabled(election))
    }

    pub async fn start(&self) -> Result<(), StandbyError> {
        match self {
            Self::Enabled(election) => election.clone().start().await,
            Self::Disabled => Ok(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }

    pub fn is_leader(&self) -> bool {
        match self {
            Self::Enabled(election) => election.is_leader(),
            Self::Disabled => true,
        }
    }

    pub fn should_process(&self) -> bool {
        self.is_leader()
    }

    pub fn status(&self) -> LeadershipStatus {
        match self {
            Self::Enabled(election) => election.status(),
            Self::Disabled => LeadershipStatus::Leader,
        }
    }

    pub fn instance_id(&self) -> &str {
        match self {
            Self::Enabled(election) => election.instance_id(),
            Self::Disabled => "standalone",
        }
    }

    pub async fn wait_for_leadership(&self) {
        match self {
            Self::Enabled(election) => election.wait_for_leadership().await,
            Self::Disabled => {}
        }
    }

    pub async fn shutdown(&self) {
        if let Self::Enabled(election) = self {
            election.shutdown().await;
        }
    }
}

/// Periodically log leadership transitions for operator visibility.
pub fn spawn_leadership_monitor(
    processor: Arc<StandbyProcessor>,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut was_leader = processor.is_leader();
        let mut ticker = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let is_leader = processor.is_leader();
                    if is_leader != was_leader {
                        info!(
                            instance_id = %processor.instance_id(),
                            is_leader = is_leader,
                            "Leadership changed"
                        );
                        was_leader = is_leader;
                    } else {
                        debug!(
                            instance_id = %processor.instance_id(),
                            status = ?processor.status(),
                            "Leadership status"
                        );
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}
