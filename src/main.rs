use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::collector::LogCollector;
use crate::config::LogkeeperConfig;
use crate::hub::Hub;
use crate::retention::RetentionManager;
use crate::runtime::{DockerRuntime, RuntimeClient};
use crate::store::{SqliteStore, Store};
use crate::tracking::Tracker;
use crate::watcher::ContainerWatcher;

mod api;
mod cli;
mod collector;
mod config;
mod config_file;
mod hub;
mod retention;
mod runtime;
mod signals;
mod store;
mod tracking;
mod types;
mod watcher;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match LogkeeperConfig::init() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Unable to load config: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let store: Arc<dyn Store> = match SqliteStore::open(&config.database).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            log::error!("Unable to open database {:?}: {err}", config.database);
            return ExitCode::FAILURE;
        }
    };

    let runtime: Arc<dyn RuntimeClient> = match DockerRuntime::connect() {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => {
            log::error!("Unable to configure Docker client: {err}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.ping().await {
        Ok(()) => log::info!("Connected to Docker at {}", runtime.host_label()),
        Err(err) => log::warn!(
            "Docker at {} is not reachable yet: {err}",
            runtime.host_label()
        ),
    }

    let listener = match TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("Unable to bind {}: {err}", config.listen);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    signals::handle_shutdown(cancel.clone());

    let (hub, hub_task) = Hub::spawn(config.hub_buffer, cancel.clone());
    let retention = RetentionManager::new(store.clone());
    let collector = Arc::new(LogCollector::new(
        store.clone(),
        runtime.clone(),
        hub.clone(),
        retention.clone(),
        config.collector_settings(),
        cancel.clone(),
    ));
    let watcher = ContainerWatcher::new(
        store.clone(),
        runtime.clone(),
        hub.clone(),
        collector.clone(),
        config.watcher_settings(),
    );
    let tracker = Tracker::new(
        store.clone(),
        runtime.clone(),
        hub.clone(),
        collector.clone(),
        retention.clone(),
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(watcher.run(config.watcher_interval, cancel.clone()));
    tasks.spawn(collector.run(config.collector_interval, cancel.clone()));
    tasks.spawn(retention.run(config.retention_interval, cancel.clone()));

    let state = Arc::new(AppState {
        tracker,
        hub,
        timing: config.connection_timing(),
        backfill_limit: config.backfill_limit,
    });
    let mut server = tokio::spawn(api::serve(listener, state, cancel.clone()));

    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    let mut exit = ExitCode::SUCCESS;
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = &mut server => {
            match result {
                Ok(Ok(())) => log::warn!("HTTP server stopped unexpectedly"),
                Ok(Err(err)) => log::error!("HTTP server failed: {err}"),
                Err(err) => log::error!("HTTP server task failed: {err}"),
            }
            exit = ExitCode::FAILURE;
            cancel.cancel();
        }
    }

    log::info!("Shutting down");
    let shutdown = async {
        while tasks.join_next().await.is_some() {}
        let _ = hub_task.await;
        if !server.is_finished() {
            let _ = server.await;
        }
    };
    if tokio::time::timeout(config.shutdown_grace, shutdown)
        .await
        .is_err()
    {
        log::warn!(
            "Shutdown did not finish within {:?}, exiting anyway",
            config.shutdown_grace
        );
    }

    exit
}
