//! Container runtime access.
//!
//! Everything the rest of the crate needs from the runtime goes through
//! [`RuntimeClient`]: the live inventory, a status probe for one workload,
//! and a cancelable stream of raw output lines.

mod docker;
#[cfg(test)]
pub mod testing;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::Serialize;

use crate::types::ContainerStatus;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("Workload not found: {0}")]
    NotFound(String),
    #[error("Log stream error: {0}")]
    Stream(String),
}

/// One entry of the live inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub id: String,
    /// Primary name without the leading `/`.
    pub name: String,
    pub state: String,
    /// Seconds since the epoch.
    pub created: i64,
}

/// A line of combined stdout/stderr exactly as the transport delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub data: Bytes,
    /// Nanoseconds since the epoch at which the line was read.
    pub received_at: i64,
}

/// Dropping the stream closes the underlying connection.
pub type LogStream = BoxStream<'static, Result<RawLine, RuntimeError>>;

#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Every workload known to the runtime, running or not.
    async fn list_workloads(&self) -> Result<Vec<Workload>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;

    /// Follows the workload's output starting at `since` (nanoseconds).
    fn stream_logs(&self, id: &str, since: i64) -> LogStream;

    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Label identifying the daemon, used as the default server name.
    fn host_label(&self) -> String;
}
