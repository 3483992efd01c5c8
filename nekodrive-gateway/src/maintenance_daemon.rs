//! Maintenance Daemon
//!
//! Background task that keeps the manifest and the substrate in step:
//! - reclaims expired and abandoned upload sessions
//! - retries queued shard deletions
//! - purges trashed files past their retention period
//! - takes the periodic circular snapshot

use crate::config::MaintenanceSettings;
use crate::metrics;
use crate::state::AppState;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info};

/// Maintenance daemon configuration
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often to run a maintenance cycle
    pub cycle_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(300),
        }
    }
}

impl MaintenanceConfig {
    pub fn from_settings(settings: &MaintenanceSettings) -> Self {
        Self {
            cycle_interval: Duration::from_secs(settings.interval_secs.max(1)),
        }
    }
}

/// Running totals of maintenance work
#[derive(Debug, Default, Clone)]
pub struct MaintenanceMetrics {
    pub sessions_reclaimed: u64,
    pub shards_deleted: u64,
    pub shards_abandoned: u64,
    pub files_purged: u64,
    pub snapshots_taken: u64,
    pub last_cycle_at: Option<std::time::Instant>,
    pub last_cycle_duration_ms: u64,
    pub cycles_completed: u64,
}

/// Maintenance daemon
pub struct MaintenanceDaemon {
    config: MaintenanceConfig,
    metrics: Arc<RwLock<MaintenanceMetrics>>,
}

impl MaintenanceDaemon {
    pub fn new(config: MaintenanceConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(MaintenanceMetrics::default())),
        }
    }

    /// Start the background maintenance loop
    pub fn start(self: Arc<Self>, state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
        let daemon = self;
        let cycle_interval = daemon.config.cycle_interval;

        tokio::spawn(async move {
            let mut timer = interval(cycle_interval);

            let settings = state.lifecycle().settings();
            info!(
                interval_secs = cycle_interval.as_secs(),
                orphan_grace_secs = settings.orphan_grace_secs,
                trash_retention_days = settings.trash_retention_days,
                snapshot_interval_secs = settings.snapshot_interval_secs,
                snapshot_depth = settings.snapshot_depth,
                "Maintenance daemon started"
            );

            loop {
                timer.tick().await;

                if let Err(e) = daemon.run_cycle(&state).await {
                    error!(error = %e, "Maintenance cycle failed");
                }
            }
        })
    }

    /// Run a single maintenance cycle
    pub async fn run_cycle(&self, state: &AppState) -> anyhow::Result<()> {
        let start = std::time::Instant::now();
        let now = Utc::now();

        // Step 1: Reclaim sessions that can no longer complete
        let sweep = state.sweep_orphans(false).await?;

        // Step 2: Retry queued shard deletions
        let gc = state.lifecycle().retry_gc().await?;

        // Step 3: Purge trash past retention
        let purged = state.lifecycle().purge_expired_trash(now).await?;

        // Step 4: Periodic snapshot
        let mut snapshots = 0;
        if state.lifecycle().snapshot_due(now)? {
            let summary = state.lifecycle().snapshot().await?;
            debug!(snapshot_id = %summary.id, slot = summary.slot, "Periodic snapshot taken");
            snapshots = 1;
        }

        metrics::record_manifest_stats(&state.manifest().stats()?);
        metrics::record_circuit_state(state.breaker().state());

        let elapsed = start.elapsed();
        {
            let mut m = self.metrics.write().await;
            m.sessions_reclaimed += sweep.sessions_removed as u64;
            m.shards_deleted += (sweep.shards_deleted + gc.deleted) as u64;
            m.shards_abandoned += gc.abandoned as u64;
            m.files_purged += purged as u64;
            m.snapshots_taken += snapshots;
            m.last_cycle_at = Some(start);
            m.last_cycle_duration_ms = elapsed.as_millis() as u64;
            m.cycles_completed += 1;
        }

        if sweep.sessions_removed > 0 || gc.attempted > 0 || purged > 0 || snapshots > 0 {
            info!(
                sessions_reclaimed = sweep.sessions_removed,
                shards_deleted = sweep.shards_deleted + gc.deleted,
                gc_backlog = gc.backlog,
                files_purged = purged,
                snapshots,
                duration_ms = elapsed.as_millis() as u64,
                "Maintenance cycle completed"
            );
        } else {
            debug!(duration_ms = elapsed.as_millis() as u64, "Maintenance cycle idle");
        }

        Ok(())
    }

    /// Snapshot of the running totals
    pub async fn metrics(&self) -> MaintenanceMetrics {
        self.metrics.read().await.clone()
    }
}
