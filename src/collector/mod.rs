//! Streaming ingestion of container output.
//!
//! Each tracked container gets at most one session: a task that follows the
//! runtime's log stream from the last checkpoint, cleans every line, stores
//! it idempotently and publishes what was new. A session ends when the
//! stream ends, fails or is cancelled; the collection ticker starts a new
//! one on its next pass, which is the only retry there is.

mod parse;

use parse::parse_line;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::hub::{Hub, Interest, WireMessage};
use crate::retention::RetentionManager;
use crate::runtime::RuntimeClient;
use crate::store::Store;
use crate::types::{LogEntry, RetentionPolicy, TrackedContainer, now_nanos};

#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    /// How far back a container with no checkpoint is read.
    pub lookback: Duration,
    /// How long `stop` waits for a session to flush its checkpoint.
    pub stop_grace: Duration,
}

/// What one session ingested.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub inserted: u64,
    pub duplicates: u64,
    /// Newest timestamp inserted during the session.
    pub newest: Option<i64>,
}

struct Session {
    runtime_id: String,
    policy: watch::Sender<RetentionPolicy>,
    cancel: CancellationToken,
    handle: JoinHandle<SessionSummary>,
}

pub struct LogCollector {
    store: Arc<dyn Store>,
    runtime: Arc<dyn RuntimeClient>,
    hub: Hub,
    retention: RetentionManager,
    settings: CollectorSettings,
    sessions: Mutex<HashMap<String, Session>>,
    /// Parent of every session token.
    cancel: CancellationToken,
}

impl LogCollector {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn RuntimeClient>,
        hub: Hub,
        retention: RetentionManager,
        settings: CollectorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            runtime,
            hub,
            retention,
            settings,
            sessions: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Ingests one container until its stream ends or `cancel` fires, then
    /// advances the checkpoint. Failures are logged, never returned.
    ///
    /// `policy` is read after every insert, so a running session follows
    /// policy edits.
    pub async fn collect(
        &self,
        container: &TrackedContainer,
        policy: watch::Receiver<RetentionPolicy>,
        cancel: &CancellationToken,
    ) -> SessionSummary {
        let since = self.resume_point(container);
        let interest = Interest::Container(container.id.clone());
        let mut summary = SessionSummary::default();

        log::debug!(
            "Collecting {} ({}) since {since}",
            container.label(),
            container.runtime_id
        );
        let mut stream = self.runtime.stream_logs(&container.runtime_id, since);

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = stream.next() => item,
            };
            let raw = match item {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => {
                    log::warn!("Log stream for {} failed: {e}", container.label());
                    break;
                }
                None => break,
            };

            let Some(parsed) = parse_line(&raw.data, raw.received_at) else {
                continue;
            };
            let Some(entry) = LogEntry::new(
                &container.id,
                &container.runtime_id,
                parsed.timestamp,
                parsed.message,
            ) else {
                continue;
            };

            match self.store.insert_log(&entry).await {
                Ok(true) => {
                    summary.inserted += 1;
                    summary.newest = Some(
                        summary
                            .newest
                            .map_or(entry.timestamp, |n| n.max(entry.timestamp)),
                    );
                    self.hub.publish(&interest, &WireMessage::Log(entry));

                    let current = *policy.borrow();
                    if !current.is_unbounded() {
                        if let Err(e) = self.retention.enforce(&container.id, current).await {
                            log::warn!("Retention failed for {}: {e}", container.label());
                        }
                    }
                }
                Ok(false) => summary.duplicates += 1,
                Err(e) => log::error!("Failed to store log line for {}: {e}", container.label()),
            }
        }
        // Closes the runtime connection before the checkpoint write.
        drop(stream);

        if let Some(newest) = summary.newest {
            if let Err(e) = self.store.advance_checkpoint(&container.id, newest).await {
                log::error!("Failed to save checkpoint for {}: {e}", container.label());
            }
        }
        if summary.inserted > 0 {
            log::info!(
                "Collected {} line(s) from {}",
                summary.inserted,
                container.label()
            );
        }
        summary
    }

    fn resume_point(&self, container: &TrackedContainer) -> i64 {
        if container.last_log_timestamp > 0 {
            container.last_log_timestamp
        } else {
            let lookback = i64::try_from(self.settings.lookback.as_nanos()).unwrap_or(i64::MAX);
            now_nanos().saturating_sub(lookback)
        }
    }

    /// Starts a session for `container` unless one is already running.
    /// Returns whether a new session was started.
    pub async fn start(self: &Arc<Self>, container: TrackedContainer) -> bool {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&container.id) {
            if !session.handle.is_finished() {
                return false;
            }
        }

        let cancel = self.cancel.child_token();
        let (policy, policy_rx) = watch::channel(container.policy());
        let id = container.id.clone();
        let runtime_id = container.runtime_id.clone();
        let collector = Arc::clone(self);
        let session_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            collector
                .collect(&container, policy_rx, &session_cancel)
                .await
        });

        sessions.insert(
            id,
            Session {
                runtime_id,
                policy,
                cancel,
                handle,
            },
        );
        true
    }

    /// Cancels the container's session and waits, up to the stop grace, for
    /// it to flush its checkpoint.
    pub async fn stop(&self, id: &str) -> Option<SessionSummary> {
        let session = self.sessions.lock().await.remove(id)?;
        session.cancel.cancel();
        self.wait(id, session).await
    }

    async fn wait(&self, id: &str, session: Session) -> Option<SessionSummary> {
        let mut handle = session.handle;
        match tokio::time::timeout(self.settings.stop_grace, &mut handle).await {
            Ok(Ok(summary)) => Some(summary),
            Ok(Err(e)) => {
                log::error!("Collector session for {id} ended abnormally: {e}");
                None
            }
            Err(_) => {
                log::warn!(
                    "Collector session for {id} ({}) did not stop in time, aborting",
                    session.runtime_id
                );
                handle.abort();
                None
            }
        }
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, session) in &sessions {
            session.cancel.cancel();
        }
        for (id, session) in sessions {
            self.wait(&id, session).await;
        }
    }

    /// Applies a new policy to a running session.
    pub async fn update_policy(&self, id: &str, policy: RetentionPolicy) {
        if let Some(session) = self.sessions.lock().await.get(id) {
            session.policy.send_replace(policy);
        }
    }

    #[cfg(test)]
    pub async fn is_running(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(id)
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Starts a session for every tracked container without a live one and
    /// forgets sessions whose container is no longer tracked.
    pub async fn ensure_running(self: &Arc<Self>) -> usize {
        let containers = match self.store.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                log::error!("Failed to list tracked containers: {e}");
                return 0;
            }
        };

        let stale: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .keys()
                .filter(|id| !containers.iter().any(|c| &c.id == *id))
                .cloned()
                .collect()
        };
        for id in stale {
            self.stop(&id).await;
        }

        let mut started = 0;
        for container in containers {
            if self.start(container).await {
                started += 1;
            }
        }
        started
    }

    /// Collection ticker. Stops every session when `cancel` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let started = self.ensure_running().await;
            if started > 0 {
                log::debug!("Started {started} collector session(s)");
            }
        }

        self.stop_all().await;
        log::info!("Log collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::FakeRuntime;
    use crate::store::SqliteStore;
    use crate::types::ContainerStatus;

    const SECOND: i64 = 1_000_000_000;

    struct Fixture {
        store: Arc<SqliteStore>,
        runtime: Arc<FakeRuntime>,
        hub: Hub,
        collector: Arc<LogCollector>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let runtime = Arc::new(FakeRuntime::new());
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
        Fixture {
            store,
            runtime,
            hub,
            collector,
        }
    }

    async fn track(f: &Fixture, runtime_id: &str, name: &str, policy: RetentionPolicy) -> TrackedContainer {
        f.runtime
            .add_workload(runtime_id, name, 100, ContainerStatus::Running);
        let container = TrackedContainer::new(runtime_id, name, name, "local", policy);
        f.store.insert_container(&container).await.unwrap();
        container
    }

    async fn collect_once(f: &Fixture, container: &TrackedContainer) -> SessionSummary {
        let (_policy, policy_rx) = watch::channel(container.policy());
        f.collector
            .collect(container, policy_rx, &CancellationToken::new())
            .await
    }

    fn line(ts: i64, message: &str) -> String {
        let ts = chrono::DateTime::from_timestamp_nanos(ts);
        format!(
            "{} {message}",
            ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
        )
    }

    #[tokio::test]
    async fn test_first_session_uses_lookback() {
        let f = fixture().await;
        let container = track(&f, "rt-1", "web-1", RetentionPolicy::default()).await;

        let before = now_nanos();
        collect_once(&f, &container).await;

        let (id, since) = f.runtime.stream_requests()[0].clone();
        assert_eq!(id, "rt-1");
        let lookback = 3600 * SECOND;
        assert!(since >= before - lookback && since <= now_nanos() - lookback);
    }

    #[tokio::test]
    async fn test_resumes_from_checkpoint() {
        let f = fixture().await;
        let mut container = track(&f, "rt-1", "web-1", RetentionPolicy::default()).await;
        container.last_log_timestamp = 42 * SECOND;

        collect_once(&f, &container).await;
        assert_eq!(f.runtime.stream_requests()[0].1, 42 * SECOND);
    }

    #[tokio::test]
    async fn test_untimestamped_line_uses_receive_time() {
        let f = fixture().await;
        let container = track(&f, "rt-1", "web-1", RetentionPolicy::default()).await;
        f.runtime.set_received_at(77 * SECOND);
        f.runtime.push_log("rt-1", "no timestamp here");

        let summary = collect_once(&f, &container).await;
        assert_eq!(summary.newest, Some(77 * SECOND));
        let logs = f.store.get_logs(&container.id, 10, None).await.unwrap();
        assert_eq!(logs[0].timestamp, 77 * SECOND);
        assert_eq!(logs[0].message, "no timestamp here");
    }

    #[tokio::test]
    async fn test_ingests_publishes_and_checkpoints() {
        let f = fixture().await;
        let container = track(&f, "rt-1", "web-1", RetentionPolicy::default()).await;
        let mut viewer = f.hub.register(Interest::Container(container.id.clone()));
        f.runtime.push_log("rt-1", line(5 * SECOND, "first"));
        f.runtime.push_log("rt-1", "\x1b[0m   ");
        f.runtime.push_log("rt-1", line(9 * SECOND, "second"));

        let summary = collect_once(&f, &container).await;
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.newest, Some(9 * SECOND));

        let stored = f.store.get_container(&container.id).await.unwrap().unwrap();
        assert_eq!(stored.last_log_timestamp, 9 * SECOND);

        let logs = f.store.get_logs(&container.id, 10, None).await.unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["second", "first"]);

        // Delivery order follows stream order.
        let first = viewer.rx.recv().await.unwrap();
        let second = viewer.rx.recv().await.unwrap();
        assert!(first.contains("\"first\""));
        assert!(second.contains("\"second\""));
    }

    #[tokio::test]
    async fn test_replayed_lines_are_not_duplicated() {
        let f = fixture().await;
        let container = track(&f, "rt-1", "web-1", RetentionPolicy::default()).await;
        f.runtime.push_log("rt-1", line(5 * SECOND, "hello"));

        collect_once(&f, &container).await;
        let summary = collect_once(&f, &container).await;

        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(f.store.count_logs(&container.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_back() {
        let f = fixture().await;
        let container = track(&f, "rt-1", "web-1", RetentionPolicy::default()).await;
        f.store.advance_checkpoint(&container.id, 50 * SECOND).await.unwrap();
        f.runtime.push_log("rt-1", line(10 * SECOND, "late arrival"));

        collect_once(&f, &container).await;

        let stored = f.store.get_container(&container.id).await.unwrap().unwrap();
        assert_eq!(stored.last_log_timestamp, 50 * SECOND);
    }

    #[tokio::test]
    async fn test_line_count_policy_applies_while_ingesting() {
        let f = fixture().await;
        let container = track(&f, "rt-1", "web-1", RetentionPolicy::new(0, 2)).await;
        for ts in 1..=3 {
            f.runtime.push_log("rt-1", line(ts, &format!("line {ts}")));
        }

        collect_once(&f, &container).await;

        let logs = f.store.get_logs(&container.id, 10, None).await.unwrap();
        let timestamps: Vec<_> = logs.iter().map(|l| l.timestamp).collect();
        assert_eq!(timestamps, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_missing_workload_ends_session_quietly() {
        let f = fixture().await;
        let container = TrackedContainer::new("gone", "gone", "gone", "local", RetentionPolicy::default());
        f.store.insert_container(&container).await.unwrap();

        let summary = collect_once(&f, &container).await;
        assert_eq!(summary, SessionSummary::default());
    }

    #[tokio::test]
    async fn test_stop_flushes_checkpoint() {
        let f = fixture().await;
        let container = track(&f, "rt-1", "web-1", RetentionPolicy::default()).await;
        f.runtime.hold_streams_open(true);
        f.runtime.push_log("rt-1", line(7 * SECOND, "running"));

        assert!(f.collector.start(container.clone()).await);
        assert!(!f.collector.start(container.clone()).await);

        // Wait for the line to land before stopping.
        for _ in 0..100 {
            if f.store.count_logs(&container.id).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let summary = f.collector.stop(&container.id).await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert!(!f.collector.is_running(&container.id).await);

        let stored = f.store.get_container(&container.id).await.unwrap().unwrap();
        assert_eq!(stored.last_log_timestamp, 7 * SECOND);
    }

    #[tokio::test]
    async fn test_ensure_running_starts_and_reaps() {
        let f = fixture().await;
        f.runtime.hold_streams_open(true);
        let web = track(&f, "rt-1", "web-1", RetentionPolicy::default()).await;
        let db = track(&f, "rt-2", "db-1", RetentionPolicy::default()).await;

        assert_eq!(f.collector.ensure_running().await, 2);
        assert_eq!(f.collector.ensure_running().await, 0);

        f.store.remove_container(&db.id).await.unwrap();
        f.collector.ensure_running().await;
        assert!(f.collector.is_running(&web.id).await);
        assert!(!f.collector.is_running(&db.id).await);

        f.collector.stop_all().await;
        assert!(!f.collector.is_running(&web.id).await);
    }
}
