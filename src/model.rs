use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A device identifier the bridge subscribes to on the telemetry source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchedDevice(String);

impl WatchedDevice {
    /// Returns `None` for an empty or whitespace-only identifier.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(WatchedDevice(trimmed.to_string()))
        }
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WatchedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One notification to publish, consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub recipient: String,
    pub message: String,
    /// `None` when the source event carried no usable timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

impl NotificationRequest {
    pub fn new(
        recipient: impl Into<String>,
        message: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        NotificationRequest {
            recipient: recipient.into(),
            message: message.into(),
            timestamp,
        }
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        self.timestamp.map(|t| t.timestamp_millis())
    }

    /// Text placed in the push payload, e.g. `Movement detected: (Tue Nov 14 2023 ...)\n`.
    pub fn payload_text(&self) -> String {
        format!("{}: ({})\n", self.message, render_time(self.timestamp))
    }
}

/// Renders a point in time the way a browser `Date` prints itself, pinned to UTC.
pub fn render_time(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(t) => t
            .format("%a %b %d %Y %H:%M:%S GMT+0000 (Coordinated Universal Time)")
            .to_string(),
        None => "Invalid Date".to_string(),
    }
}

// Beams publish API body
#[derive(Debug, Serialize)]
pub struct PublishBody {
    pub interests: Vec<String>,
    pub fcm: FcmPayload,
}

#[derive(Debug, Serialize)]
pub struct FcmPayload {
    pub data: FcmData,
}

#[derive(Debug, Serialize)]
pub struct FcmData {
    #[serde(rename = "myMessagePayload")]
    pub message_payload: String,
    #[serde(rename = "myDeviceId")]
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishResponse {
    #[serde(rename = "publishId")]
    pub publish_id: String,
}

/// Error body returned by the Beams API on non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ProviderError {
    pub error: Option<String>,
    pub description: Option<String>,
}
