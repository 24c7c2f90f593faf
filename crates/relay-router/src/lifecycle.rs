//! Background loops that keep the router healthy.
//!
//! All loops are spawned once at startup, tick on their own intervals, and
//! exit on the manager's shutdown broadcast: the draining reclaimer, the
//! consumer health supervisor, the pipeline leak detector, the gauge
//! refresher and the warning-store cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::manager::QueueManager;
use crate::standby::{spawn_leadership_monitor, StandbyProcessor};
use crate::sync::{spawn_sync_task, ConfigSyncService};
use crate::warning::WarningService;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub draining_reclaim_interval: Duration,
    pub consumer_health_interval: Duration,
    pub leak_check_interval: Duration,
    pub gauge_refresh_interval: Duration,
    pub warning_cleanup_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            draining_reclaim_interval: Duration::from_secs(10),
            consumer_health_interval: Duration::from_secs(60),
            leak_check_interval: Duration::from_secs(30),
            gauge_refresh_interval: Duration::from_secs(15),
            warning_cleanup_interval: Duration::from_secs(300),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    /// Spawn every background loop. The returned handle only signals
    /// shutdown; the loops also stop with the manager's own broadcast.
    pub fn start(
        manager: Arc<QueueManager>,
        warnings: Arc<WarningService>,
        config: LifecycleConfig,
        config_sync: Option<Arc<ConfigSyncService>>,
        standby: Option<Arc<StandbyProcessor>>,
    ) -> Self {
        let shutdown_tx = manager.shutdown_sender();

        spawn_loop(
            "draining-reclaimer",
            config.draining_reclaim_interval,
            shutdown_tx.clone(),
            {
                let manager = manager.clone();
                move || {
                    let manager = manager.clone();
                    async move { manager.cleanup_draining().await }
                }
            },
        );

        spawn_loop(
            "consumer-health-supervisor",
            config.consumer_health_interval,
            shutdown_tx.clone(),
            {
                let manager = manager.clone();
                move || {
                    let manager = manager.clone();
                    async move { manager.supervise_consumers().await }
                }
            },
        );

        spawn_loop(
            "pipeline-leak-detector",
            config.leak_check_interval,
            shutdown_tx.clone(),
            {
                let manager = manager.clone();
                move || {
                    let manager = manager.clone();
                    async move {
                        manager.check_pipeline_leak();
                    }
                }
            },
        );

        spawn_loop(
            "gauge-refresher",
            config.gauge_refresh_interval,
            shutdown_tx.clone(),
            {
                let manager = manager.clone();
                move || {
                    let manager = manager.clone();
                    async move { manager.refresh_gauges().await }
                }
            },
        );

        spawn_loop(
            "warning-cleanup",
            config.warning_cleanup_interval,
            shutdown_tx.clone(),
            {
                let warnings = warnings.clone();
                move || {
                    let warnings = warnings.clone();
                    async move { warnings.cleanup() }
                }
            },
        );

        if let Some(sync) = config_sync {
            info!("Starting configuration sync loop");
            spawn_sync_task(sync, shutdown_tx.clone());
        }

        if let Some(standby) = standby {
            if standby.is_enabled() {
                info!("Starting leadership monitor");
                spawn_leadership_monitor(standby, shutdown_tx.clone());
            }
        }

        info!("Lifecycle loops started");
        Self { shutdown_tx }
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    mut tick: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so loops start quiet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!(task = name, "Lifecycle tick");
                    tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!(task = name, "Lifecycle loop shutting down");
                    break;
                }
            }
        }
    });
}
