//! Durable storage for tracked containers and their log rows.
//!
//! The watcher, the collector, the retention manager and the request
//! handlers all share one [`Store`]. Mutations are either idempotent
//! (log inserts) or owned by a single component (status and runtime id by
//! the watcher, the checkpoint by the collector), so the store only has to
//! serialize individual statements.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::types::{ContainerStatus, LogEntry, RetentionPolicy, TrackedContainer};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Descriptive fields a user may change on a tracked container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerUpdate {
    pub name: String,
    pub alias: String,
    pub server_name: String,
    pub policy: RetentionPolicy,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_container(&self, container: &TrackedContainer) -> Result<(), StoreError>;

    async fn get_container(&self, id: &str) -> Result<Option<TrackedContainer>, StoreError>;

    /// Newest additions first.
    async fn list_containers(&self) -> Result<Vec<TrackedContainer>, StoreError>;

    async fn find_by_runtime_id(
        &self,
        runtime_id: &str,
    ) -> Result<Option<TrackedContainer>, StoreError>;

    /// Containers with at least one non-zero retention limit.
    async fn containers_with_policy(&self) -> Result<Vec<TrackedContainer>, StoreError>;

    async fn update_container(
        &self,
        id: &str,
        update: &ContainerUpdate,
    ) -> Result<TrackedContainer, StoreError>;

    /// Points the record at a new workload and stores `marker` in the same
    /// transaction. The record's `id` is unchanged.
    async fn swap_runtime(
        &self,
        id: &str,
        new_runtime_id: &str,
        new_name: &str,
        swapped_at: i64,
        marker: &LogEntry,
    ) -> Result<(), StoreError>;

    async fn set_status(&self, id: &str, status: ContainerStatus) -> Result<(), StoreError>;

    /// Removes the record together with every log row it owns.
    async fn remove_container(&self, id: &str) -> Result<bool, StoreError>;

    /// Moves `lastLogTimestamp` forward. Returns `false` when `timestamp` is
    /// not greater than the stored value.
    async fn advance_checkpoint(&self, id: &str, timestamp: i64) -> Result<bool, StoreError>;

    /// Returns `false` when an identical (container, timestamp, message)
    /// row already exists.
    async fn insert_log(&self, entry: &LogEntry) -> Result<bool, StoreError>;

    /// Newest first, strictly older than `before` when given.
    async fn get_logs(
        &self,
        tracked_container_id: &str,
        limit: i64,
        before: Option<i64>,
    ) -> Result<Vec<LogEntry>, StoreError>;

    async fn count_logs(&self, tracked_container_id: &str) -> Result<i64, StoreError>;

    async fn latest_log_timestamp(
        &self,
        tracked_container_id: &str,
    ) -> Result<Option<i64>, StoreError>;

    /// Deletes the `count` oldest rows by timestamp.
    async fn delete_oldest_logs(
        &self,
        tracked_container_id: &str,
        count: i64,
    ) -> Result<u64, StoreError>;

    async fn delete_logs_before(
        &self,
        tracked_container_id: &str,
        cutoff: i64,
    ) -> Result<u64, StoreError>;

    /// Deletes rows whose owning container no longer exists.
    async fn delete_orphan_logs(&self) -> Result<u64, StoreError>;

    async fn checkpoint_wal(&self) -> Result<(), StoreError>;
}
