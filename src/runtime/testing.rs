//! Scripted in-process runtime for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use futures_util::StreamExt;

use super::{LogStream, RawLine, RuntimeClient, RuntimeError, Workload};
use crate::types::ContainerStatus;

#[derive(Default)]
struct FakeState {
    workloads: Vec<Workload>,
    statuses: HashMap<String, ContainerStatus>,
    logs: HashMap<String, Vec<Bytes>>,
    fail_inventory: bool,
    hold_open: bool,
    received_at: i64,
    stream_requests: Vec<(String, i64)>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_workload(&self, id: &str, name: &str, created: i64, status: ContainerStatus) {
        let mut state = self.state.lock().unwrap();
        state.workloads.push(Workload {
            id: id.to_string(),
            name: name.to_string(),
            state: status.to_string(),
            created,
        });
        state.statuses.insert(id.to_string(), status);
    }

    pub fn remove_workload(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.workloads.retain(|w| w.id != id);
        state.statuses.remove(id);
    }

    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(id.to_string(), status);
    }

    pub fn push_log(&self, id: &str, line: impl AsRef<[u8]>) {
        self.state
            .lock()
            .unwrap()
            .logs
            .entry(id.to_string())
            .or_default()
            .push(Bytes::copy_from_slice(line.as_ref()));
    }

    pub fn fail_inventory(&self, fail: bool) {
        self.state.lock().unwrap().fail_inventory = fail;
    }

    /// Keep streams open after the scripted lines, like a followed log.
    pub fn hold_streams_open(&self, hold: bool) {
        self.state.lock().unwrap().hold_open = hold;
    }

    pub fn set_received_at(&self, received_at: i64) {
        self.state.lock().unwrap().received_at = received_at;
    }

    pub fn stream_requests(&self) -> Vec<(String, i64)> {
        self.state.lock().unwrap().stream_requests.clone()
    }
}

#[async_trait::async_trait]
impl RuntimeClient for FakeRuntime {
    async fn list_workloads(&self) -> Result<Vec<Workload>, RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.fail_inventory {
            return Err(RuntimeError::Stream("inventory unavailable".to_string()));
        }
        Ok(state.workloads.clone())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .get(id)
            .copied()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn stream_logs(&self, id: &str, since: i64) -> LogStream {
        let mut state = self.state.lock().unwrap();
        state.stream_requests.push((id.to_string(), since));
        if !state.statuses.contains_key(id) {
            return futures_util::stream::iter(vec![Err(RuntimeError::NotFound(id.to_string()))])
                .boxed();
        }
        let received_at = state.received_at;
        let lines: Vec<_> = state
            .logs
            .get(id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|data| Ok(RawLine { data, received_at }))
            .collect();
        let scripted = futures_util::stream::iter(lines);
        if state.hold_open {
            scripted.chain(futures_util::stream::pending()).boxed()
        } else {
            scripted.boxed()
        }
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn host_label(&self) -> String {
        "fake://runtime".to_string()
    }
}
