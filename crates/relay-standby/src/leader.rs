use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StandbyError;
use crate::Result;

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub redis_url: String,
    pub lock_key: String,
    pub lock_ttl_seconds: u64,
    /// Should be well under the TTL so the lease never lapses while alive.
    pub heartbeat_interval_seconds: u64,
    pub instance_id: String,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "relay:router:primary".to_string(),
            lock_ttl_seconds: 30,
            heartbeat_interval_seconds: 10,
            instance_id: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipStatus {
    Leader,
    Follower,
    Unknown,
}

/// Drives the lease acquisition/refresh loop and publishes status changes.
pub struct LeaderElection {
    config: LeaderElectionConfig,
    conn: ConnectionManager,
    is_leader: AtomicBool,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    status_tx: watch::Sender<LeadershipStatus>,
    status_rx: watch::Receiver<LeadershipStatus>,
}

impl LeaderElection {
    pub async fn new(config: LeaderElectionConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| StandbyError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let (status_tx, status_rx) = watch::channel(LeadershipStatus::Unknown);

        Ok(Self {
            config,
            conn,
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown_tx,
            status_tx,
            status_rx,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LeadershipStatus {
        *self.status_rx.borrow()
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipStatus> {
        self.status_rx.clone()
    }

    /// Block until this instance holds the lease.
    pub async fn wait_for_leadership(&self) {
        let mut rx = self.subscribe();
        while *rx.borrow() != LeadershipStatus::Leader {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StandbyError::AlreadyRunning);
        }

        info!(
            instance_id = %self.config.instance_id,
            lock_key = %self.config.lock_key,
            "Starting leader election"
        );

        let election = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                election.config.heartbeat_interval_seconds,
            ));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        election.election_tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        election.release().await;
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn election_tick(&self) {
        match self.try_acquire_or_refresh().await {
            Ok(is_leader) => {
                let was_leader = self.is_leader.swap(is_leader, Ordering::SeqCst);
                let status = if is_leader {
                    LeadershipStatus::Leader
                } else {
                    LeadershipStatus::Follower
                };
                let _ = self.status_tx.send(status);

                if is_leader && !was_leader {
                    info!(instance_id = %self.config.instance_id, "Acquired leadership");
                } else if !is_leader && was_leader {
                    warn!(instance_id = %self.config.instance_id, "Lost leadership");
                }
            }
            Err(e) => {
                error!(error = %e, "Leader election tick failed");
                // On Redis trouble, surrender leadership rather than risk a
                // split brain with a stale lease.
                if self.is_leader.swap(false, Ordering::SeqCst) {
                    warn!(instance_id = %self.config.instance_id, "Dropping leadership on election error");
                }
                let _ = self.status_tx.send(LeadershipStatus::Unknown);
            }
        }
    }

    /// SET NX PX to claim the lease; PEXPIRE to refresh when already held.
    async fn try_acquire_or_refresh(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = self.config.lock_ttl_seconds * 1000;

        let set_reply: Option<String> = redis::cmd("SET")
            .arg(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        if set_reply.is_some() {
            return Ok(true);
        }

        let holder: Option<String> = redis::cmd("GET")
            .arg(&self.config.lock_key)
            .query_async(&mut conn)
            .await?;

        if holder.as_deref() == Some(self.config.instance_id.as_str()) {
            let _refreshed: bool = redis::cmd("PEXPIRE")
                .arg(&self.config.lock_key)
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;
            debug!(instance_id = %self.config.instance_id, "Lease refreshed");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Release the lease if we hold it so a standby can take over promptly.
    async fn release(&self) {
        if !self.is_leader.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.status_tx.send(LeadershipStatus::Follower);

        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
            "#,
        );

        let mut conn = self.conn.clone();
        let released: Result<i32> = script
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .invoke_async(&mut conn)
            .await
            .map_err(Into::into);
        match released {
            Ok(_) => info!(instance_id = %self.config.instance_id, "Released leadership lease"),
            Err(e) => warn!(error = %e, "Failed to release leadership lease"),
        }
    }

    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}
