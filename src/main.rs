// src/main.rs

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::{mask, Config};
use crate::dispatch::{BeamsPublisher, Dispatcher, Publisher};
use crate::metrics::{spawn_http_server, spawn_stats_logger, Metrics};
use crate::model::NotificationRequest;
use crate::shutdown::ShutdownCoordinator;
use crate::subscription::SubscriptionManager;
use crate::supervisor::StreamSupervisor;

mod config;
mod dispatch;
mod error;
mod filter;
mod logging;
mod metrics;
mod model;
mod shutdown;
mod subscription;
mod supervisor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from environment (env-only)
    let cfg = Config::from_env()?;

    // Initialize structured tracing (LOG_LEVEL, override with RUST_LOG)
    logging::init(cfg.log_level, cfg.log_format);

    // Version banner
    info!(target: "loka_config",
        app_version = env!("CARGO_PKG_VERSION"),
        log_level = %cfg.log_level,
        auth_token = %mask(&cfg.auth_token),
        pusher_instance_id = %cfg.pusher_instance_id,
        pusher_secret_key = %mask(&cfg.pusher_secret_key),
        devices = cfg.devices.len(),
        "starting"
    );
    if cfg.devices.is_empty() {
        warn!(target: "loka_config", "no devices configured; nothing will be subscribed");
    }

    // Shared notification for background tasks on shutdown
    let notify_shutdown = Arc::new(Notify::new());

    let metrics = Metrics::new(cfg.devices.len(), cfg.publish_buckets.clone());
    if let Some(addr) = cfg.metrics_addr.clone() {
        let _http_handle = spawn_http_server(metrics.clone(), addr, notify_shutdown.clone());
    }
    if let Some(period) = cfg.stats_interval {
        let _stats_handle = spawn_stats_logger(metrics.clone(), notify_shutdown.clone(), period);
    }

    // In-flight subscription and publish requests, drained on exit
    let tracker = TaskTracker::new();
    let client = reqwest::Client::new();

    let subscriptions = SubscriptionManager::new(
        client.clone(),
        cfg.api_url.clone(),
        &cfg.auth_token,
        tracker.clone(),
        metrics.clone(),
    );
    let _ = subscriptions.subscribe_all(&cfg.devices);

    let publisher: Arc<dyn Publisher> = Arc::new(BeamsPublisher::new(
        client,
        &cfg.pusher_instance_id,
        &cfg.pusher_secret_key,
        cfg.pusher_endpoint.as_deref(),
    ));
    let dispatcher = Dispatcher::new(
        publisher,
        cfg.push_interest.clone(),
        tracker.clone(),
        metrics.clone(),
    );

    // Unbounded: the stream reader never waits on notification delivery
    let (notify_tx, notify_rx) = mpsc::unbounded_channel::<NotificationRequest>();
    let dispatcher_handle = dispatcher.spawn_worker(notify_rx);

    let supervisor = StreamSupervisor::new(
        cfg.stream_url.clone(),
        &cfg.auth_token,
        notify_tx,
        metrics.clone(),
    );
    let coordinator = ShutdownCoordinator::new(subscriptions, cfg.devices.clone());

    tokio::select! {
        state = supervisor.run() => {
            warn!(target: "loka_stream", %state, "stream ended; exiting for external restart");
        }
        _ = shutdown::wait_for_signal() => {
            info!("Shutdown signal received.");
            let _ = coordinator.revoke_all();
        }
    }

    // The supervisor (and its queue sender) is dropped here, so the dispatcher drains and exits
    let _ = dispatcher_handle.await;
    notify_shutdown.notify_waiters();

    // A second Ctrl+C skips the rest of the grace period
    let _ = shutdown::drain(&tracker, cfg.exit_grace, shutdown::interrupted()).await;

    info!("Shutting down gracefully.");
    Ok(())
}
