//! Reconciliation of tracked identities against the live runtime.
//!
//! On every tick the watcher compares each tracked container's runtime id
//! with the live inventory. When the workload behind a record has been
//! recreated under a new id, the record is moved onto the replacement
//! (a "swap") and a marker line is written into its history. Records that
//! still resolve get their status refreshed. The watcher never deletes a
//! record.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::collector::LogCollector;
use crate::hub::{Hub, Interest, StatusNotice, SwapNotice, WireMessage};
use crate::runtime::{RuntimeClient, RuntimeError, Workload};
use crate::store::{Store, StoreError};
use crate::types::{ContainerStatus, LogEntry, TrackedContainer, now_nanos, short_id};

const SEPARATORS: [char; 3] = ['-', '_', '.'];
const MIN_HASH_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherSettings {
    pub inspect_timeout: Duration,
    /// Number of entries re-sent to viewers after a swap.
    pub swap_resync_limit: i64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub swapped: usize,
    pub status_changes: usize,
}

pub struct ContainerWatcher {
    store: Arc<dyn Store>,
    runtime: Arc<dyn RuntimeClient>,
    hub: Hub,
    collector: Arc<LogCollector>,
    settings: WatcherSettings,
}

impl ContainerWatcher {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn RuntimeClient>,
        hub: Hub,
        collector: Arc<LogCollector>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            store,
            runtime,
            hub,
            collector,
            settings,
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let tracked = self.store.list_containers().await?;
        let inventory = self.runtime.list_workloads().await?;
        let live: HashSet<&str> = inventory.iter().map(|w| w.id.as_str()).collect();
        let mut claimed: HashSet<String> = tracked.iter().map(|c| c.runtime_id.clone()).collect();
        let mut report = ReconcileReport::default();

        for container in &tracked {
            let mut container = container.clone();

            if !live.contains(container.runtime_id.as_str()) {
                match select_replacement(&container, &inventory, &claimed) {
                    Some(workload) => match self.swap(&container, workload).await {
                        Ok(updated) => {
                            claimed.insert(workload.id.clone());
                            report.swapped += 1;
                            container = updated;
                        }
                        Err(e) => {
                            log::error!(
                                "Failed to swap {} to {}: {e}",
                                container.label(),
                                workload.name
                            );
                            continue;
                        }
                    },
                    None => {
                        log::debug!(
                            "No replacement for {} ({})",
                            container.label(),
                            short_id(&container.runtime_id)
                        );
                        if self.set_status(&container, ContainerStatus::Unknown).await {
                            report.status_changes += 1;
                        }
                        continue;
                    }
                }
            }

            let status = self.probe(&container).await;
            if self.set_status(&container, status).await {
                report.status_changes += 1;
            }
        }

        if report.swapped > 0 || report.status_changes > 0 {
            self.publish_containers().await;
        }
        Ok(report)
    }

    /// Moves `container` onto `workload` and records the move in its history.
    async fn swap(
        &self,
        container: &TrackedContainer,
        workload: &Workload,
    ) -> Result<TrackedContainer, StoreError> {
        // The old session must flush its checkpoint before the marker
        // timestamp is chosen.
        self.collector.stop(&container.id).await;

        let current = self
            .store
            .get_container(&container.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(container.id.clone()))?;
        let newest = self.store.latest_log_timestamp(&current.id).await?;
        let marker_ts = swap_timestamp(current.last_log_timestamp, newest);

        let marker = LogEntry::system(
            &current.id,
            &workload.id,
            marker_ts,
            &format!(
                "Container swapped from {} to {}",
                short_id(&current.runtime_id),
                short_id(&workload.id)
            ),
        );
        self.store
            .swap_runtime(
                &current.id,
                &workload.id,
                &workload.name,
                chrono::Utc::now().timestamp(),
                &marker,
            )
            .await?;

        log::info!(
            "Container {} swapped from {} to {} ({})",
            current.label(),
            short_id(&current.runtime_id),
            short_id(&workload.id),
            workload.name
        );

        let interest = Interest::Container(current.id.clone());
        self.hub.publish(
            &interest,
            &WireMessage::ContainerSwapped(SwapNotice {
                old_runtime_id: current.runtime_id.clone(),
                new_runtime_id: workload.id.clone(),
                new_name: workload.name.clone(),
            }),
        );
        match self
            .store
            .get_logs(&current.id, self.settings.swap_resync_limit, None)
            .await
        {
            Ok(mut logs) => {
                logs.reverse();
                self.hub.publish(&interest, &WireMessage::LogsBatch(logs));
            }
            Err(e) => log::warn!("Failed to load logs for {} after swap: {e}", current.label()),
        }

        let updated = self
            .store
            .get_container(&current.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(current.id.clone()))?;
        self.collector.start(updated.clone()).await;
        Ok(updated)
    }

    async fn probe(&self, container: &TrackedContainer) -> ContainerStatus {
        match tokio::time::timeout(
            self.settings.inspect_timeout,
            self.runtime.inspect(&container.runtime_id),
        )
        .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                log::debug!("Inspect failed for {}: {e}", container.label());
                ContainerStatus::Unknown
            }
            Err(_) => {
                log::warn!("Inspect timed out for {}", container.label());
                ContainerStatus::Unknown
            }
        }
    }

    /// Persists and announces a status change. Returns whether anything
    /// changed.
    async fn set_status(&self, container: &TrackedContainer, status: ContainerStatus) -> bool {
        if container.status == status {
            return false;
        }
        if let Err(e) = self.store.set_status(&container.id, status).await {
            log::error!("Failed to save status of {}: {e}", container.label());
            return false;
        }
        log::info!(
            "Container {} is now {status} (was {})",
            container.label(),
            container.status
        );
        self.hub.publish(
            &Interest::Container(container.id.clone()),
            &WireMessage::Status(StatusNotice {
                container_id: container.id.clone(),
                status,
            }),
        );
        true
    }

    async fn publish_containers(&self) {
        match self.store.list_containers().await {
            Ok(containers) => self
                .hub
                .publish_all(&WireMessage::Containers(containers)),
            Err(e) => log::error!("Failed to list containers for broadcast: {e}"),
        }
    }

    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.reconcile().await {
                Ok(report) => log::debug!(
                    "Reconciled: {} swapped, {} status change(s)",
                    report.swapped,
                    report.status_changes
                ),
                Err(e) => log::warn!("Reconciliation skipped: {e}"),
            }
        }

        log::info!("Container watcher stopped");
    }
}

/// Name prefix shared by recreations of the same workload: a trailing
/// separator-delimited counter or hash is dropped, keeping the separator.
pub fn base_name(name: &str) -> String {
    if name.ends_with(SEPARATORS) {
        return name.to_string();
    }
    if let Some(pos) = name.rfind(SEPARATORS) {
        let suffix = &name[pos + 1..];
        let numeric = suffix.chars().all(|c| c.is_ascii_digit());
        let hash = suffix.len() >= MIN_HASH_LEN && suffix.chars().all(|c| c.is_ascii_hexdigit());
        if numeric || hash {
            return name[..=pos].to_string();
        }
    }
    format!("{name}-")
}

/// Picks the live workload that replaces a vanished one. An exact name
/// match wins; otherwise the newest workload sharing the base name, with
/// the smallest id breaking ties. Workloads already claimed by a record are
/// skipped.
pub fn select_replacement<'a>(
    container: &TrackedContainer,
    inventory: &'a [Workload],
    claimed: &HashSet<String>,
) -> Option<&'a Workload> {
    let available = |w: &&Workload| w.id != container.runtime_id && !claimed.contains(&w.id);

    if let Some(exact) = inventory
        .iter()
        .filter(available)
        .find(|w| w.name == container.name)
    {
        return Some(exact);
    }

    let base = base_name(&container.name);
    inventory
        .iter()
        .filter(available)
        .filter(|w| w.name.starts_with(&base))
        .max_by(|a, b| match a.created.cmp(&b.created) {
            Ordering::Equal => b.id.cmp(&a.id),
            other => other,
        })
}

/// Strictly after everything already recorded for the identity.
fn swap_timestamp(checkpoint: i64, newest_stored: Option<i64>) -> i64 {
    let high = checkpoint.max(newest_stored.unwrap_or(0));
    if high > 0 { high + 1 } else { now_nanos() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorSettings;
    use crate::hub::Subscription;
    use crate::retention::RetentionManager;
    use crate::runtime::testing::FakeRuntime;
    use crate::store::SqliteStore;
    use crate::types::RetentionPolicy;
    use quickcheck_macros::quickcheck;

    struct Fixture {
        store: Arc<SqliteStore>,
        runtime: Arc<FakeRuntime>,
        hub: Hub,
        collector: Arc<LogCollector>,
        watcher: ContainerWatcher,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let runtime = Arc::new(FakeRuntime::new());
        runtime.hold_streams_open(true);
        let cancel = CancellationToken::new();
        let (hub, _) = Hub::spawn(64, cancel.clone());
        let collector = Arc::new(LogCollector::new(
            store.clone(),
            runtime.clone(),
            hub.clone(),
            RetentionManager::new(store.clone()),
            CollectorSettings {
                lookback: Duration::from_secs(3600),
                stop_grace: Duration::from_secs(1),
            },
            cancel,
        ));
        let watcher = ContainerWatcher::new(
            store.clone(),
            runtime.clone(),
            hub.clone(),
            collector.clone(),
            WatcherSettings {
                inspect_timeout: Duration::from_secs(1),
                swap_resync_limit: 1000,
            },
        );
        Fixture {
            store,
            runtime,
            hub,
            collector,
            watcher,
        }
    }

    async fn track(f: &Fixture, runtime_id: &str, name: &str) -> TrackedContainer {
        let container =
            TrackedContainer::new(runtime_id, name, "web", "local", RetentionPolicy::default());
        f.store.insert_container(&container).await.unwrap();
        container
    }

    fn workload(id: &str, name: &str, created: i64) -> Workload {
        Workload {
            id: id.to_string(),
            name: name.to_string(),
            state: "running".to_string(),
            created,
        }
    }

    async fn drain(hub: &Hub, sub: &mut Subscription) -> Vec<serde_json::Value> {
        hub.connection_count().await;
        let mut out = Vec::new();
        while let Ok(text) = sub.rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("web-1"), "web-");
        assert_eq!(base_name("api_3"), "api_");
        assert_eq!(base_name("job.5f3a9c0e12"), "job.");
        assert_eq!(base_name("web"), "web-");
        assert_eq!(base_name("web-abc"), "web-abc-");
        assert_eq!(base_name("stack_web_12"), "stack_web_");
        assert_eq!(base_name("web-"), "web-");
    }

    #[quickcheck]
    fn prop_base_name_strips_counter(stem: String, counter: u32) -> bool {
        let stem: String = stem.chars().filter(|c| c.is_ascii_alphabetic()).collect();
        if stem.is_empty() {
            return true;
        }
        base_name(&format!("{stem}-{counter}")) == format!("{stem}-")
    }

    #[quickcheck]
    fn prop_base_name_ends_with_separator(name: String) -> bool {
        base_name(&name).ends_with(SEPARATORS)
    }

    #[test]
    fn test_exact_name_wins_over_prefix() {
        let container =
            TrackedContainer::new("old", "web-1", "web", "local", RetentionPolicy::default());
        let inventory = vec![workload("b", "web-9", 500), workload("a", "web-1", 100)];
        let chosen = select_replacement(&container, &inventory, &HashSet::new()).unwrap();
        assert_eq!(chosen.id, "a");
    }

    #[test]
    fn test_newest_prefix_match_wins() {
        let container =
            TrackedContainer::new("old", "web-1", "web", "local", RetentionPolicy::default());
        let inventory = vec![
            workload("c", "web-2", 200),
            workload("d", "web-3", 300),
            workload("e", "db-1", 900),
        ];
        let chosen = select_replacement(&container, &inventory, &HashSet::new()).unwrap();
        assert_eq!(chosen.id, "d");
    }

    #[test]
    fn test_equal_age_prefers_smallest_id() {
        let container =
            TrackedContainer::new("old", "web-1", "web", "local", RetentionPolicy::default());
        let inventory = vec![workload("zz", "web-2", 300), workload("aa", "web-3", 300)];
        let chosen = select_replacement(&container, &inventory, &HashSet::new()).unwrap();
        assert_eq!(chosen.id, "aa");
    }

    #[test]
    fn test_claimed_workloads_are_skipped() {
        let container =
            TrackedContainer::new("old", "web-1", "web", "local", RetentionPolicy::default());
        let inventory = vec![workload("c", "web-2", 200), workload("d", "web-3", 300)];
        let claimed = HashSet::from(["d".to_string()]);
        let chosen = select_replacement(&container, &inventory, &claimed).unwrap();
        assert_eq!(chosen.id, "c");

        let claimed = HashSet::from(["c".to_string(), "d".to_string()]);
        assert!(select_replacement(&container, &inventory, &claimed).is_none());
    }

    #[test]
    fn test_swap_timestamp() {
        assert_eq!(swap_timestamp(10, None), 11);
        assert_eq!(swap_timestamp(10, Some(20)), 21);
        assert_eq!(swap_timestamp(30, Some(20)), 31);
        assert!(swap_timestamp(0, None) > 0);
    }

    #[tokio::test]
    async fn test_swap_preserves_identity_and_history() {
        let f = fixture().await;
        let container = track(&f, "old-runtime-id-0000", "web-1").await;
        for ts in [100, 200] {
            let entry = LogEntry::new(&container.id, "old-runtime-id-0000", ts, format!("pre {ts}"))
                .unwrap();
            f.store.insert_log(&entry).await.unwrap();
        }
        f.store.advance_checkpoint(&container.id, 200).await.unwrap();
        f.runtime
            .add_workload("new-runtime-id-1111", "web-2", 500, ContainerStatus::Running);
        let mut viewer = f.hub.register(Interest::Container(container.id.clone()));
        let mut aggregate = f.hub.register(Interest::Aggregate);

        let report = f.watcher.reconcile().await.unwrap();
        assert_eq!(report.swapped, 1);

        let stored = f.store.get_container(&container.id).await.unwrap().unwrap();
        assert_eq!(stored.runtime_id, "new-runtime-id-1111");
        assert_eq!(stored.name, "web-2");
        assert!(stored.swapped_at > 0);
        assert_eq!(stored.status, ContainerStatus::Running);

        let logs = f.store.get_logs(&container.id, 10, None).await.unwrap();
        let markers: Vec<_> = logs
            .iter()
            .filter(|l| l.message.starts_with("[SYSTEM]"))
            .collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].timestamp, 201);
        assert_eq!(
            markers[0].message,
            "[SYSTEM] Container swapped from old-runtime- to new-runtime-"
        );
        assert_eq!(logs.len(), 3);

        let messages = drain(&f.hub, &mut viewer).await;
        let kinds: Vec<_> = messages.iter().map(|m| m["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["containerSwapped", "logsBatch", "status", "containers"]);
        assert_eq!(messages[0]["payload"]["newName"], "web-2");
        // Resync batch is oldest first and ends with the marker.
        let batch = messages[1]["payload"].as_array().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2]["timestamp"], 201);

        let aggregate = drain(&f.hub, &mut aggregate).await;
        assert_eq!(aggregate.len(), 1);
        assert_eq!(aggregate[0]["type"], "containers");

        // Collection resumes under the new runtime id.
        assert!(f.collector.is_running(&container.id).await);
        for _ in 0..100 {
            if !f.runtime.stream_requests().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.runtime.stream_requests()[0].0, "new-runtime-id-1111");
        f.collector.stop_all().await;
    }

    #[tokio::test]
    async fn test_unresolved_record_goes_unknown_and_stays() {
        let f = fixture().await;
        let container = track(&f, "old", "web-1").await;
        f.store
            .set_status(&container.id, ContainerStatus::Running)
            .await
            .unwrap();
        f.runtime.add_workload("old", "web-1", 100, ContainerStatus::Running);
        f.runtime.add_workload("x", "db-1", 100, ContainerStatus::Running);
        f.runtime.remove_workload("old");

        let report = f.watcher.reconcile().await.unwrap();
        assert_eq!(report, ReconcileReport { swapped: 0, status_changes: 1 });

        let stored = f.store.get_container(&container.id).await.unwrap().unwrap();
        assert_eq!(stored.runtime_id, "old");
        assert_eq!(stored.status, ContainerStatus::Unknown);
    }

    #[tokio::test]
    async fn test_status_written_only_on_change() {
        let f = fixture().await;
        let container = track(&f, "rt-1", "web-1").await;
        f.runtime.add_workload("rt-1", "web-1", 100, ContainerStatus::Running);
        let mut aggregate = f.hub.register(Interest::Aggregate);

        let first = f.watcher.reconcile().await.unwrap();
        assert_eq!(first.status_changes, 1);
        let second = f.watcher.reconcile().await.unwrap();
        assert_eq!(second, ReconcileReport::default());
        assert_eq!(drain(&f.hub, &mut aggregate).await.len(), 1);

        f.runtime.set_status("rt-1", ContainerStatus::Exited);
        let third = f.watcher.reconcile().await.unwrap();
        assert_eq!(third.status_changes, 1);
        let stored = f.store.get_container(&container.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ContainerStatus::Exited);

        let updates = drain(&f.hub, &mut aggregate).await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["payload"][0]["status"], "exited");
    }

    #[tokio::test]
    async fn test_inventory_failure_changes_nothing() {
        let f = fixture().await;
        let container = track(&f, "rt-1", "web-1").await;
        f.runtime.fail_inventory(true);

        assert!(matches!(
            f.watcher.reconcile().await,
            Err(ReconcileError::Runtime(_))
        ));
        let stored = f.store.get_container(&container.id).await.unwrap().unwrap();
        assert_eq!(stored, container);
    }
}
