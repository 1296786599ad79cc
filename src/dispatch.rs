//! Notification dispatch to Pusher Beams.
//!
//! The [`Dispatcher`] turns a [`NotificationRequest`] into one publish call on its own task.
//! The outcome is logged and handed back through the task's join handle; it never flows back
//! into the stream supervisor, and failed publishes are not retried.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::error::PublishError;
use crate::metrics::Metrics;
use crate::model::{FcmData, FcmPayload, NotificationRequest, ProviderError, PublishBody, PublishResponse};

const MAX_INTERESTS: usize = 100;
const MAX_INTEREST_LEN: usize = 164;

/// Delivery seam for push notifications.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `body` and returns the provider's publish id.
    async fn publish(&self, body: &PublishBody) -> Result<String, PublishError>;
}

/// Publisher backed by the Beams HTTP publish API.
pub struct BeamsPublisher {
    client: Client,
    url: String,
    secret_key: String,
}

impl BeamsPublisher {
    /// `endpoint` overrides the default `https://{instance}.pushnotifications.pusher.com`.
    pub fn new(client: Client, instance_id: &str, secret_key: &str, endpoint: Option<&str>) -> Self {
        let base = endpoint
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("https://{}.pushnotifications.pusher.com", instance_id));
        BeamsPublisher {
            client,
            url: format!(
                "{}/publish_api/v1/instances/{}/publishes/interests",
                base, instance_id
            ),
            secret_key: secret_key.to_string(),
        }
    }
}

#[async_trait]
impl Publisher for BeamsPublisher {
    async fn publish(&self, body: &PublishBody) -> Result<String, PublishError> {
        validate_interests(&body.interests)?;

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.secret_key)
            .header("X-Pusher-Library", concat!("loka-push-bridge ", env!("CARGO_PKG_VERSION")))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            let parsed: PublishResponse = resp.json().await?;
            Ok(parsed.publish_id)
        } else {
            let text = resp.text().await.unwrap_or_default();
            let body = match serde_json::from_str::<ProviderError>(&text) {
                Ok(ProviderError {
                    error: Some(e),
                    description: Some(d),
                }) => format!("{}: {}", e, d),
                Ok(ProviderError { error: Some(e), .. }) => e,
                _ => text,
            };
            Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Interest names as the provider accepts them.
pub fn validate_interests(interests: &[String]) -> Result<(), PublishError> {
    if interests.is_empty() || interests.len() > MAX_INTERESTS {
        return Err(PublishError::InterestCount {
            count: interests.len(),
            max: MAX_INTERESTS,
        });
    }
    for interest in interests {
        let reason = if interest.is_empty() {
            Some("empty")
        } else if interest.chars().count() > MAX_INTEREST_LEN {
            Some("longer than 164 characters")
        } else if !interest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-=@,.;".contains(c))
        {
            Some("contains characters outside [A-Za-z0-9_-=@,.;]")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(PublishError::InvalidInterest {
                interest: interest.clone(),
                reason,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published(String),
    Failed,
}

#[derive(Clone)]
pub struct Dispatcher {
    publisher: Arc<dyn Publisher>,
    fixed_interest: Option<String>,
    tracker: TaskTracker,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        fixed_interest: Option<String>,
        tracker: TaskTracker,
        metrics: Metrics,
    ) -> Self {
        Dispatcher {
            publisher,
            fixed_interest,
            tracker,
            metrics,
        }
    }

    /// Interest a request is published to: the fixed one if configured, else the recipient.
    pub fn interest_for<'a>(&'a self, req: &'a NotificationRequest) -> &'a str {
        self.fixed_interest.as_deref().unwrap_or(&req.recipient)
    }

    pub fn build_body(&self, req: &NotificationRequest) -> PublishBody {
        PublishBody {
            interests: vec![self.interest_for(req).to_string()],
            fcm: FcmPayload {
                data: FcmData {
                    message_payload: req.payload_text(),
                    device_id: req.recipient.clone(),
                },
            },
        }
    }

    /// Starts the publish and returns immediately.
    pub fn dispatch(&self, req: NotificationRequest) -> JoinHandle<DispatchOutcome> {
        let body = self.build_body(&req);
        let publisher = self.publisher.clone();
        let metrics = self.metrics.clone();
        let interest = body.interests[0].clone();
        debug!(target: "loka_dispatch", recipient = %req.recipient, message = %req.message, ts_ms = ?req.timestamp_millis(), "dispatching");

        self.tracker.spawn(async move {
            let started = Instant::now();
            let res = publisher.publish(&body).await;
            metrics.observe_publish_secs(started.elapsed().as_secs_f64());
            match res {
                Ok(publish_id) => {
                    metrics.inc_published();
                    info!(target: "loka_dispatch", publish_id = %publish_id, interest = %interest, "Just published");
                    DispatchOutcome::Published(publish_id)
                }
                Err(err) => {
                    metrics.inc_publish_failure();
                    error!(target: "loka_dispatch", interest = %interest, error = %err, "publish failed");
                    DispatchOutcome::Failed
                }
            }
        })
    }

    /// Drains the request queue, dispatching each request as it arrives.
    pub fn spawn_worker(self, mut rx: UnboundedReceiver<NotificationRequest>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = self.dispatch(req);
            }
            debug!(target: "loka_dispatch", "notification queue closed; dispatcher exiting");
        })
    }
}
