use bollard::models::ContainerStateStatusEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Live state of a tracked container as last observed by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Exited,
    Restarting,
    #[default]
    Unknown,
}

impl AsRef<str> for ContainerStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Restarting => "restarting",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = std::convert::Infallible;

    /// Unrecognised values read back as `Unknown` rather than failing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "exited" => Self::Exited,
            "restarting" => Self::Restarting,
            _ => Self::Unknown,
        })
    }
}

impl From<ContainerStateStatusEnum> for ContainerStatus {
    fn from(status: ContainerStateStatusEnum) -> Self {
        match status {
            ContainerStateStatusEnum::RUNNING => Self::Running,
            ContainerStateStatusEnum::RESTARTING => Self::Restarting,
            ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD => Self::Exited,
            ContainerStateStatusEnum::CREATED
            | ContainerStateStatusEnum::PAUSED
            | ContainerStateStatusEnum::REMOVING => Self::Stopped,
            ContainerStateStatusEnum::EMPTY => Self::Unknown,
        }
    }
}

/// Per-container retention limits. Zero disables the dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_period_seconds: i64,
    pub max_line_count: i64,
}

impl RetentionPolicy {
    pub fn new(max_period_seconds: i64, max_line_count: i64) -> Self {
        Self {
            max_period_seconds: max_period_seconds.max(0),
            max_line_count: max_line_count.max(0),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_period_seconds == 0 && self.max_line_count == 0
    }
}

/// A stable monitoring identity that outlives the workload it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedContainer {
    pub id: String,
    pub runtime_id: String,
    pub name: String,
    pub alias: String,
    pub server_name: String,
    /// Seconds since the epoch.
    pub added_at: i64,
    /// Seconds since the epoch, 0 if never swapped.
    pub swapped_at: i64,
    pub status: ContainerStatus,
    pub max_period_seconds: i64,
    pub max_line_count: i64,
    /// Nanoseconds since the epoch.
    pub last_log_timestamp: i64,
}

impl TrackedContainer {
    pub fn new(
        runtime_id: impl Into<String>,
        name: impl Into<String>,
        alias: impl Into<String>,
        server_name: impl Into<String>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            runtime_id: runtime_id.into(),
            name: name.into(),
            alias: alias.into(),
            server_name: server_name.into(),
            added_at: chrono::Utc::now().timestamp(),
            swapped_at: 0,
            status: ContainerStatus::Unknown,
            max_period_seconds: policy.max_period_seconds,
            max_line_count: policy.max_line_count,
            last_log_timestamp: 0,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.max_period_seconds, self.max_line_count)
    }

    /// Human readable label used in log lines.
    pub fn label(&self) -> &str {
        if self.alias.is_empty() {
            &self.name
        } else {
            &self.alias
        }
    }
}

/// One ingested line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub tracked_container_id: String,
    pub runtime_id: String,
    /// Nanoseconds since the epoch.
    pub timestamp: i64,
    pub message: String,
}

impl LogEntry {
    /// Returns `None` for an empty message, which is never stored.
    pub fn new(
        tracked_container_id: impl Into<String>,
        runtime_id: impl Into<String>,
        timestamp: i64,
        message: impl Into<String>,
    ) -> Option<Self> {
        let message = message.into();
        if message.is_empty() {
            return None;
        }
        Some(Self {
            id: Uuid::now_v7().to_string(),
            tracked_container_id: tracked_container_id.into(),
            runtime_id: runtime_id.into(),
            timestamp,
            message,
        })
    }

    /// A line the service writes itself, prefixed with `[SYSTEM]`.
    pub fn system(
        tracked_container_id: impl Into<String>,
        runtime_id: impl Into<String>,
        timestamp: i64,
        text: &str,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            tracked_container_id: tracked_container_id.into(),
            runtime_id: runtime_id.into(),
            timestamp,
            message: format!("[SYSTEM] {text}"),
        }
    }
}

/// Shortened runtime identifier, as printed by `docker ps`.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

pub fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}
