use std::fmt;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::filter;
use crate::metrics::Metrics;
use crate::model::NotificationRequest;

pub const SERVER_RECIPIENT: &str = "Server";
pub const SERVER_STARTED: &str = "Server started";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Owns the single stream connection. One attempt, no reconnect: the process is expected to
/// be restarted externally once the stream is `Closed` or `Failed`.
pub struct StreamSupervisor {
    url: String,
    token: String,
    notify_tx: UnboundedSender<NotificationRequest>,
    metrics: Metrics,
    state: ConnectionState,
}

impl StreamSupervisor {
    pub fn new(
        url: impl Into<String>,
        token: &str,
        notify_tx: UnboundedSender<NotificationRequest>,
        metrics: Metrics,
    ) -> Self {
        StreamSupervisor {
            url: url.into(),
            token: token.to_string(),
            notify_tx,
            metrics,
            state: ConnectionState::Disconnected,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(target: "loka_stream", from = %self.state, to = %next, "state transition");
        self.state = next;
        self.metrics.set_connected(next == ConnectionState::Connected);
    }

    fn emit(&self, req: NotificationRequest) {
        if self.notify_tx.send(req).is_err() {
            warn!(target: "loka_stream", "notification queue closed; dropping request");
        }
    }

    /// Connects, then processes frames until the session ends. Returns the final state.
    pub async fn run(mut self) -> ConnectionState {
        self.transition(ConnectionState::Connecting);
        info!(target: "loka_stream", url = %self.url, "Connecting");

        let mut request = match self.url.as_str().into_client_request() {
            Ok(req) => req,
            Err(err) => {
                error!(target: "loka_stream", error = %err, "Connect Error: invalid stream URL");
                self.transition(ConnectionState::Failed);
                return self.state;
            }
        };
        match HeaderValue::from_str(&format!("Bearer {}", self.token)) {
            Ok(value) => {
                request.headers_mut().insert("Authorization", value);
            }
            Err(err) => {
                error!(target: "loka_stream", error = %err, "Connect Error: token is not a valid header value");
                self.transition(ConnectionState::Failed);
                return self.state;
            }
        }

        let mut socket = match connect_async(request).await {
            Ok((socket, response)) => {
                info!(target: "loka_stream", status = %response.status(), "WebSocket Client Connected.");
                socket
            }
            Err(err) => {
                error!(target: "loka_stream", error = %err, "Connect Error");
                self.transition(ConnectionState::Failed);
                return self.state;
            }
        };
        self.transition(ConnectionState::Connected);
        self.emit(NotificationRequest::new(
            SERVER_RECIPIENT,
            SERVER_STARTED,
            Some(Utc::now()),
        ));

        while let Some(next) = socket.next().await {
            match next {
                Ok(Message::Text(text)) => {
                    self.metrics.inc_received();
                    info!(target: "loka_stream", "Received: '{}'", text.as_str());
                    if let Some(req) = filter::evaluate_text(text.as_str()) {
                        self.metrics.inc_notable();
                        info!(target: "loka_stream", recipient = %req.recipient, ts_ms = ?req.timestamp_millis(), "notable event");
                        self.emit(req);
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!(target: "loka_stream", ?frame, "close frame received");
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(other) => {
                    self.metrics.inc_received();
                    self.metrics.inc_ignored();
                    debug!(target: "loka_stream", len = other.len(), "ignoring non-text frame");
                }
                // The socket yields nothing after a read error, so every error ends the session
                Err(WsError::Utf8 { .. }) => {
                    self.metrics.inc_stream_error();
                    error!(target: "loka_stream", "Connection Error: text frame with invalid UTF-8");
                    break;
                }
                Err(err) => {
                    self.metrics.inc_stream_error();
                    error!(target: "loka_stream", error = %err, "Connection Error");
                    break;
                }
            }
        }

        self.transition(ConnectionState::Closed);
        info!(target: "loka_stream", "Connection Closed");
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
    use tokio_tungstenite::tungstenite::protocol::frame::Frame;

    /// Serves one connection: records the Authorization header, sends `frames`, then closes.
    async fn serve_once(frames: Vec<Message>) -> (String, Arc<Mutex<Option<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let auth = Arc::new(Mutex::new(None));
        let auth_seen = auth.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *auth_seen.lock().unwrap() = req
                    .headers()
                    .get("Authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(resp)
            };
            let mut ws = accept_hdr_async(stream, callback).await.unwrap();
            for frame in frames {
                if ws.send(frame).await.is_err() {
                    return;
                }
            }
            let _ = ws.close(None).await;
            // Drain until the client acknowledges the close
            while let Some(Ok(_)) = ws.next().await {}
        });
        (format!("ws://{}/messages", addr), auth)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<NotificationRequest>) -> Vec<NotificationRequest> {
        let mut out = Vec::new();
        while let Ok(req) = rx.try_recv() {
            out.push(req);
        }
        out
    }

    #[tokio::test]
    async fn forwards_notable_events_after_server_started() {
        let (url, auth) = serve_once(vec![
            Message::Text(
                r#"{"gpio":{"port":"101","value":true},"src":"d1","timestamp":1700000000}"#.into(),
            ),
            Message::Text(r#"{"gpio":{"port":"99","value":true},"src":"d1","timestamp":1}"#.into()),
            Message::Text("not json".into()),
            Message::Binary(vec![0xff, 0xfe].into()),
            Message::Text(r#"{"gpio":{"port":101,"value":1},"src":42,"timestamp":"5"}"#.into()),
        ])
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let metrics = Metrics::new(1, vec![1.0]);
        let supervisor = StreamSupervisor::new(url, "tok", tx, metrics.clone());
        assert_eq!(supervisor.state, ConnectionState::Disconnected);

        let final_state = supervisor.run().await;
        assert_eq!(final_state, ConnectionState::Closed);
        assert!(!metrics.is_connected());
        assert_eq!(auth.lock().unwrap().as_deref(), Some("Bearer tok"));

        let reqs = drain(&mut rx);
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].recipient, SERVER_RECIPIENT);
        assert_eq!(reqs[0].message, SERVER_STARTED);
        assert_eq!(reqs[1].recipient, "d1");
        assert_eq!(reqs[1].message, "Movement detected");
        assert_eq!(reqs[1].timestamp_millis(), Some(1_700_000_000_000));
        assert_eq!(reqs[2].recipient, "42");
        assert_eq!(reqs[2].timestamp_millis(), Some(5000));

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("loka_bridge_messages_received_total 5"));
        assert!(rendered.contains("loka_bridge_notable_events_total 2"));
        assert!(rendered.contains("loka_bridge_messages_ignored_total 1"));
    }

    #[tokio::test]
    async fn connect_failure_is_terminal_without_retry() {
        // Reserve a port, then free it so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = StreamSupervisor::new(
            format!("ws://{}/messages", addr),
            "tok",
            tx,
            Metrics::new(0, vec![1.0]),
        );
        assert_eq!(supervisor.run().await, ConnectionState::Failed);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn invalid_url_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = StreamSupervisor::new("not a url", "tok", tx, Metrics::new(0, vec![1.0]));
        assert_eq!(supervisor.run().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn invalid_utf8_text_ends_the_session() {
        let bad_text = Frame::message(vec![0xff, 0xfe, 0xfd], OpCode::Data(Data::Text), true);
        let (url, _auth) = serve_once(vec![
            Message::Frame(bad_text),
            Message::Text(r#"{"gpio":{"port":101,"value":true},"src":"d9","timestamp":1}"#.into()),
        ])
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let metrics = Metrics::new(1, vec![1.0]);
        let supervisor = StreamSupervisor::new(url, "tok", tx, metrics.clone());
        assert_eq!(supervisor.run().await, ConnectionState::Closed);
        assert!(!metrics.is_connected());

        let reqs = drain(&mut rx);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].message, SERVER_STARTED);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("loka_bridge_stream_errors_total 1"));
        assert!(rendered.contains("loka_bridge_messages_received_total 0"));
    }
}
