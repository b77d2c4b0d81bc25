use serde::{Deserialize, Serialize};

use crate::types::{ContainerStatus, LogEntry, TrackedContainer};

/// Everything the server sends to a viewer, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum WireMessage {
    Log(LogEntry),
    LogsBatch(Vec<LogEntry>),
    ContainerSwapped(SwapNotice),
    Containers(Vec<TrackedContainer>),
    Status(StatusNotice),
    Control(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapNotice {
    pub old_runtime_id: String,
    pub new_runtime_id: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotice {
    pub container_id: String,
    pub status: ContainerStatus,
}

/// Messages a viewer may send. Anything else is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ViewerMessage {
    Ping,
    Control(String),
}
