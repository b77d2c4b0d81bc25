//! Docker runtime client using bollard.
//!
//! Connects with the local defaults (Unix socket on Linux/macOS, named
//! pipe on Windows, or `DOCKER_HOST` when set). Connecting does not touch
//! the daemon, so an unreachable daemon only shows up as failed calls.

use bollard::Docker;
use bollard::query_parameters::{
    InspectContainerOptions, InspectContainerOptionsBuilder, ListContainersOptions,
    ListContainersOptionsBuilder, LogsOptions, LogsOptionsBuilder,
};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{LogStream, RawLine, RuntimeClient, RuntimeError, Workload};
use crate::types::{ContainerStatus, now_nanos};

const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
const STREAM_BUFFER: usize = 256;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    host: String,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        let host =
            std::env::var("DOCKER_HOST").unwrap_or_else(|_| DEFAULT_DOCKER_HOST.to_string());
        Ok(Self { docker, host })
    }
}

fn map_not_found(id: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        e => RuntimeError::DockerApi(e),
    }
}

#[async_trait::async_trait]
impl RuntimeClient for DockerRuntime {
    async fn list_workloads(&self) -> Result<Vec<Workload>, RuntimeError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(true).build();
        let summaries = self.docker.list_containers(Some(options)).await?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Some(Workload {
                    id,
                    name,
                    state: summary
                        .state
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    created: summary.created.unwrap_or(0),
                })
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        let info = self
            .docker
            .inspect_container(id, Some(options))
            .await
            .map_err(|e| map_not_found(id, e))?;

        Ok(info
            .state
            .and_then(|state| state.status)
            .map(ContainerStatus::from)
            .unwrap_or(ContainerStatus::Unknown))
    }

    fn stream_logs(&self, id: &str, since: i64) -> LogStream {
        let options: LogsOptions = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .timestamps(true)
            .since(since_seconds(since))
            .build();

        let (tx, rx) = mpsc::channel::<Result<RawLine, RuntimeError>>(STREAM_BUFFER);
        let docker = self.docker.clone();
        let id = id.to_string();

        // The reader lives until the stream ends or the consumer goes away.
        tokio::spawn(async move {
            let mut frames = docker.logs(&id, Some(options));
            let mut splitter = LineSplitter::default();
            loop {
                let frame = tokio::select! {
                    _ = tx.closed() => return,
                    frame = frames.next() => frame,
                };
                match frame {
                    Some(Ok(output)) => {
                        let received_at = now_nanos();
                        for data in splitter.push(output.into_bytes()) {
                            if tx.send(Ok(RawLine { data, received_at })).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let err = match map_not_found(&id, e) {
                            RuntimeError::DockerApi(e) => RuntimeError::Stream(e.to_string()),
                            other => other,
                        };
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                    None => break,
                }
            }
            if let Some(data) = splitter.finish() {
                let _ = tx
                    .send(Ok(RawLine {
                        data,
                        received_at: now_nanos(),
                    }))
                    .await;
            }
        });

        futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    fn host_label(&self) -> String {
        self.host.clone()
    }
}

/// The daemon only accepts whole seconds. Rounding down re-reads part of a
/// second, which the store's uniqueness constraint absorbs.
fn since_seconds(since_nanos: i64) -> i32 {
    i32::try_from(since_nanos.max(0) / 1_000_000_000).unwrap_or(i32::MAX)
}

/// Reassembles newline-delimited lines from arbitrarily sized frames.
#[derive(Default)]
struct LineSplitter {
    pending: BytesMut,
}

impl LineSplitter {
    fn push(&mut self, chunk: Bytes) -> Vec<Bytes> {
        self.pending.extend_from_slice(&chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line = self.pending.split_to(pos + 1);
            lines.push(line.freeze().slice(..pos));
        }
        lines
    }

    fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }
}
