//! Per-container bounds on stored log volume.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::store::{Store, StoreError};
use crate::types::{RetentionPolicy, now_nanos};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub by_count: u64,
    pub by_age: u64,
}

impl Eviction {
    pub fn total(&self) -> u64 {
        self.by_count + self.by_age
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub containers: usize,
    pub evicted: u64,
    pub failures: usize,
}

#[derive(Clone)]
pub struct RetentionManager {
    store: Arc<dyn Store>,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Applies both limits of `policy`. Each limit is checked on its own.
    pub async fn enforce(
        &self,
        tracked_container_id: &str,
        policy: RetentionPolicy,
    ) -> Result<Eviction, StoreError> {
        let mut eviction = Eviction::default();

        if policy.max_line_count > 0 {
            let count = self.store.count_logs(tracked_container_id).await?;
            if count > policy.max_line_count {
                eviction.by_count = self
                    .store
                    .delete_oldest_logs(tracked_container_id, count - policy.max_line_count)
                    .await?;
            }
        }

        if policy.max_period_seconds > 0 {
            let cutoff = age_cutoff(now_nanos(), policy.max_period_seconds);
            eviction.by_age = self
                .store
                .delete_logs_before(tracked_container_id, cutoff)
                .await?;
        }

        Ok(eviction)
    }

    /// Enforces every container that has a policy. A failure on one
    /// container is logged and the sweep moves on.
    pub async fn sweep_all(&self) -> Result<SweepReport, StoreError> {
        let containers = self.store.containers_with_policy().await?;
        let mut report = SweepReport {
            containers: containers.len(),
            ..SweepReport::default()
        };

        for container in &containers {
            match self.enforce(&container.id, container.policy()).await {
                Ok(eviction) => {
                    if eviction.total() > 0 {
                        log::info!(
                            "Evicted {} log line(s) from {} ({} by count, {} by age)",
                            eviction.total(),
                            container.label(),
                            eviction.by_count,
                            eviction.by_age
                        );
                    }
                    report.evicted += eviction.total();
                }
                Err(e) => {
                    log::error!("Retention failed for {}: {e}", container.label());
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    pub async fn cleanup_orphans(&self) -> Result<u64, StoreError> {
        let removed = self.store.delete_orphan_logs().await?;
        if removed > 0 {
            log::info!("Removed {removed} orphaned log line(s)");
        }
        Ok(removed)
    }

    /// Sweeps on every tick until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep_all().await {
                Ok(report) => log::debug!(
                    "Retention sweep: {} container(s), {} evicted, {} failed",
                    report.containers,
                    report.evicted,
                    report.failures
                ),
                Err(e) => log::error!("Retention sweep failed: {e}"),
            }
            if let Err(e) = self.cleanup_orphans().await {
                log::error!("Orphan cleanup failed: {e}");
            }
            if let Err(e) = self.store.checkpoint_wal().await {
                log::warn!("WAL checkpoint failed: {e}");
            }
        }

        log::info!("Retention manager stopped");
    }
}

fn age_cutoff(now: i64, max_period_seconds: i64) -> i64 {
    now.saturating_sub(max_period_seconds.saturating_mul(NANOS_PER_SECOND))
}
