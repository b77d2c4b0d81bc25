//! Operations behind the request surface: adding, listing, editing and
//! removing tracked containers, and paging through their logs.

use std::sync::Arc;

use serde::Serialize;

use crate::collector::LogCollector;
use crate::hub::{Hub, WireMessage};
use crate::retention::RetentionManager;
use crate::runtime::{RuntimeClient, RuntimeError, Workload};
use crate::store::{ContainerUpdate, Store, StoreError};
use crate::types::{ContainerStatus, LogEntry, RetentionPolicy, TrackedContainer};

pub const DEFAULT_PAGE_SIZE: i64 = 100;
pub const MAX_PAGE_SIZE: i64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("Store error: {0}")]
    Store(StoreError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl From<StoreError> for TrackingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            e => Self::Store(e),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddRequest {
    /// Exact name, name prefix or id prefix of a live workload.
    pub name: String,
    pub alias: Option<String>,
    pub server_name: Option<String>,
    pub policy: RetentionPolicy,
}

#[derive(Debug, Clone)]
pub struct Added {
    pub container: TrackedContainer,
    pub already_tracked: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    /// Newest first.
    pub logs: Vec<LogEntry>,
    pub has_more: bool,
    pub total: i64,
}

#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn Store>,
    runtime: Arc<dyn RuntimeClient>,
    hub: Hub,
    collector: Arc<LogCollector>,
    retention: RetentionManager,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn RuntimeClient>,
        hub: Hub,
        collector: Arc<LogCollector>,
        retention: RetentionManager,
    ) -> Self {
        Self {
            store,
            runtime,
            hub,
            collector,
            retention,
        }
    }

    pub async fn add(&self, request: AddRequest) -> Result<Added, TrackingError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(TrackingError::Invalid("Container name is required".to_string()));
        }

        let inventory = self.runtime.list_workloads().await?;
        let workload = find_workload(&inventory, name)
            .ok_or_else(|| TrackingError::NotFound(format!("Container {name} not found")))?;

        if let Some(existing) = self.store.find_by_runtime_id(&workload.id).await? {
            return Ok(Added {
                container: existing,
                already_tracked: true,
            });
        }

        let alias = non_empty(request.alias).unwrap_or_else(|| workload.name.clone());
        let server_name =
            non_empty(request.server_name).unwrap_or_else(|| self.runtime.host_label());
        let mut container = TrackedContainer::new(
            &workload.id,
            &workload.name,
            alias,
            server_name,
            request.policy,
        );
        container.status = self
            .runtime
            .inspect(&workload.id)
            .await
            .unwrap_or(ContainerStatus::Unknown);

        self.store.insert_container(&container).await?;
        log::info!(
            "Tracking {} ({})",
            container.label(),
            crate::types::short_id(&container.runtime_id)
        );

        self.collector.start(container.clone()).await;
        self.publish_containers().await;
        Ok(Added {
            container,
            already_tracked: false,
        })
    }

    pub async fn list(&self) -> Result<Vec<TrackedContainer>, TrackingError> {
        Ok(self.store.list_containers().await?)
    }

    pub async fn update(
        &self,
        id: &str,
        update: ContainerUpdate,
    ) -> Result<TrackedContainer, TrackingError> {
        if update.name.trim().is_empty() || update.alias.trim().is_empty() {
            return Err(TrackingError::Invalid(
                "Container name and alias are required".to_string(),
            ));
        }

        let previous = self
            .store
            .get_container(id)
            .await?
            .ok_or_else(|| TrackingError::NotFound(format!("Container {id} not found")))?;
        let updated = self.store.update_container(id, &update).await?;

        if previous.policy() != updated.policy() {
            let policy = updated.policy();
            self.collector.update_policy(id, policy).await;
            if !policy.is_unbounded() {
                match self.retention.enforce(id, policy).await {
                    Ok(eviction) if eviction.total() > 0 => log::info!(
                        "Evicted {} log line(s) from {} after policy change",
                        eviction.total(),
                        updated.label()
                    ),
                    Ok(_) => {}
                    Err(e) => log::warn!("Retention failed for {}: {e}", updated.label()),
                }
            }
        }

        self.publish_containers().await;
        Ok(updated)
    }

    /// Stops collection, then deletes the record and its logs.
    pub async fn remove(&self, id: &str) -> Result<(), TrackingError> {
        self.collector.stop(id).await;
        if !self.store.remove_container(id).await? {
            return Err(TrackingError::NotFound(format!("Container {id} not found")));
        }
        log::info!("Stopped tracking {id}");
        self.publish_containers().await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<TrackedContainer, TrackingError> {
        self.store
            .get_container(id)
            .await?
            .ok_or_else(|| TrackingError::NotFound(format!("Container {id} not found")))
    }

    pub async fn get_logs(
        &self,
        id: &str,
        limit: Option<i64>,
        before: Option<i64>,
    ) -> Result<LogPage, TrackingError> {
        self.get(id).await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let logs = self.store.get_logs(id, limit, before).await?;
        let total = self.store.count_logs(id).await?;
        Ok(LogPage {
            has_more: logs.len() as i64 == limit,
            logs,
            total,
        })
    }

    /// Newest `limit` entries, oldest first, for a viewer's initial batch.
    pub async fn backfill(&self, id: &str, limit: i64) -> Result<Vec<LogEntry>, TrackingError> {
        let mut logs = self
            .store
            .get_logs(id, limit.clamp(1, MAX_PAGE_SIZE), None)
            .await?;
        logs.reverse();
        Ok(logs)
    }

    pub async fn inventory(&self) -> Result<Vec<Workload>, TrackingError> {
        Ok(self.runtime.list_workloads().await?)
    }

    pub async fn runtime_reachable(&self) -> bool {
        match self.runtime.ping().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Runtime ping failed: {e}");
                false
            }
        }
    }

    async fn publish_containers(&self) {
        match self.store.list_containers().await {
            Ok(containers) => self
                .hub
                .publish_all(&WireMessage::Containers(containers)),
            Err(e) => log::error!("Failed to list containers for broadcast: {e}"),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Exact name first, then name prefix, then id prefix. Among several
/// prefix matches the smallest name (or id) wins.
fn find_workload<'a>(inventory: &'a [Workload], query: &str) -> Option<&'a Workload> {
    inventory
        .iter()
        .find(|w| w.name == query)
        .or_else(|| {
            inventory
                .iter()
                .filter(|w| w.name.starts_with(query))
                .min_by(|a, b| a.name.cmp(&b.name))
        })
        .or_else(|| {
            inventory
                .iter()
                .filter(|w| w.id.starts_with(query))
                .min_by(|a, b| a.id.cmp(&b.id))
        })
}
