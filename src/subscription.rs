use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::model::WatchedDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionKind {
    fn path_segment(&self) -> &'static str {
        match self {
            SubscriptionKind::Subscribe => "subscribe_terminal",
            SubscriptionKind::Unsubscribe => "unsubscribe_terminal",
        }
    }
}

/// Result of one subscribe/unsubscribe request, for logging and tests only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    Completed { status: u16 },
    Failed,
}

/// Issues fire-and-forget subscribe/unsubscribe calls against the telemetry API.
///
/// Each call runs on its own task and never blocks the caller. A device has at most one
/// in-flight request of each kind; a duplicate call while one is outstanding is skipped.
#[derive(Clone)]
pub struct SubscriptionManager {
    client: Client,
    api_url: String,
    token: Arc<str>,
    in_flight: Arc<Mutex<HashSet<(SubscriptionKind, String)>>>,
    tracker: TaskTracker,
    metrics: Metrics,
}

impl SubscriptionManager {
    pub fn new(
        client: Client,
        api_url: impl Into<String>,
        token: &str,
        tracker: TaskTracker,
        metrics: Metrics,
    ) -> Self {
        SubscriptionManager {
            client,
            api_url: api_url.into(),
            token: Arc::from(token),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tracker,
            metrics,
        }
    }

    pub fn subscribe(&self, device: &WatchedDevice) -> Option<JoinHandle<SubscriptionOutcome>> {
        self.issue(SubscriptionKind::Subscribe, device)
    }

    pub fn unsubscribe(&self, device: &WatchedDevice) -> Option<JoinHandle<SubscriptionOutcome>> {
        self.issue(SubscriptionKind::Unsubscribe, device)
    }

    /// One subscribe per device, none waiting on another.
    pub fn subscribe_all(&self, devices: &[WatchedDevice]) -> Vec<JoinHandle<SubscriptionOutcome>> {
        info!(target: "loka_subscription", count = devices.len(), "Subscribing devices...");
        devices
            .iter()
            .filter_map(|d| {
                info!(target: "loka_subscription", device = %d, "Subscribing");
                self.subscribe(d)
            })
            .collect()
    }

    pub fn unsubscribe_all(&self, devices: &[WatchedDevice]) -> Vec<JoinHandle<SubscriptionOutcome>> {
        info!(target: "loka_subscription", count = devices.len(), "Unsubscribing devices...");
        devices
            .iter()
            .filter_map(|d| {
                info!(target: "loka_subscription", device = %d, "Unsubscribing");
                self.unsubscribe(d)
            })
            .collect()
    }

    fn issue(
        &self,
        kind: SubscriptionKind,
        device: &WatchedDevice,
    ) -> Option<JoinHandle<SubscriptionOutcome>> {
        let key = (kind, device.id().to_string());
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(key.clone()) {
                debug!(target: "loka_subscription", device = %device, ?kind, "request already in flight; skipping");
                return None;
            }
        }

        let url = format!("{}/{}/{}", self.api_url, kind.path_segment(), device.id());
        let this = self.clone();
        let device = device.clone();
        Some(self.tracker.spawn(async move {
            let outcome = this.request(kind, &device, &url).await;
            this.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            outcome
        }))
    }

    async fn request(
        &self,
        kind: SubscriptionKind,
        device: &WatchedDevice,
        url: &str,
    ) -> SubscriptionOutcome {
        let res = self
            .client
            .get(url)
            .bearer_auth(&*self.token)
            .send()
            .await;

        let outcome = match res {
            Ok(resp) => {
                let status = resp.status();
                info!(target: "loka_subscription", device = %device, ?kind, status = status.as_u16(), "HTTP GET request statusCode");
                if kind == SubscriptionKind::Subscribe {
                    match resp.text().await {
                        Ok(body) => {
                            info!(target: "loka_subscription", device = %device, body = %body, "HTTP GET data")
                        }
                        Err(err) => {
                            warn!(target: "loka_subscription", device = %device, error = %err, "failed to read response body")
                        }
                    }
                }
                if !status.is_success() {
                    warn!(target: "loka_subscription", device = %device, ?kind, status = status.as_u16(), "request was not accepted");
                }
                SubscriptionOutcome::Completed {
                    status: status.as_u16(),
                }
            }
            Err(err) => {
                error!(target: "loka_subscription", device = %device, ?kind, error = %err, "HTTP GET Error");
                SubscriptionOutcome::Failed
            }
        };

        let ok = matches!(&outcome, SubscriptionOutcome::Completed { status } if (200..300).contains(status));
        match kind {
            SubscriptionKind::Subscribe => self.metrics.inc_subscribe(ok),
            SubscriptionKind::Unsubscribe => self.metrics.inc_unsubscribe(ok),
        }
        outcome
    }
}
