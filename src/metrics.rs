use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct Metrics {
    messages_received_total: Arc<AtomicU64>,
    messages_ignored_total: Arc<AtomicU64>,
    notable_events_total: Arc<AtomicU64>,
    stream_errors_total: Arc<AtomicU64>,
    published_total: Arc<AtomicU64>,
    publish_failures_total: Arc<AtomicU64>,
    subscribe_total: Arc<AtomicU64>,
    subscribe_failures_total: Arc<AtomicU64>,
    unsubscribe_total: Arc<AtomicU64>,
    unsubscribe_failures_total: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    devices: usize,
    publish_hist: Arc<Histogram>,
}

impl Metrics {
    pub fn new(devices: usize, publish_buckets: Vec<f64>) -> Self {
        Metrics {
            messages_received_total: Arc::new(AtomicU64::new(0)),
            messages_ignored_total: Arc::new(AtomicU64::new(0)),
            notable_events_total: Arc::new(AtomicU64::new(0)),
            stream_errors_total: Arc::new(AtomicU64::new(0)),
            published_total: Arc::new(AtomicU64::new(0)),
            publish_failures_total: Arc::new(AtomicU64::new(0)),
            subscribe_total: Arc::new(AtomicU64::new(0)),
            subscribe_failures_total: Arc::new(AtomicU64::new(0)),
            unsubscribe_total: Arc::new(AtomicU64::new(0)),
            unsubscribe_failures_total: Arc::new(AtomicU64::new(0)),
            connected: Arc::new(AtomicBool::new(false)),
            devices,
            publish_hist: Arc::new(Histogram::new(publish_buckets)),
        }
    }

    pub fn inc_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_ignored(&self) {
        self.messages_ignored_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_notable(&self) {
        self.notable_events_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_stream_error(&self) {
        self.stream_errors_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_published(&self) {
        self.published_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_publish_failure(&self) {
        self.publish_failures_total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_subscribe(&self, ok: bool) {
        self.subscribe_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.subscribe_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }
    pub fn inc_unsubscribe(&self, ok: bool) {
        self.unsubscribe_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.unsubscribe_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }
    pub fn set_connected(&self, v: bool) {
        self.connected.store(v, Ordering::Relaxed);
    }
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
    pub fn observe_publish_secs(&self, secs: f64) {
        self.publish_hist.observe(secs);
    }

    pub fn render_prometheus(&self) -> String {
        let mut s = Vec::with_capacity(512);
        let name = env!("CARGO_PKG_NAME");
        let version = env!("CARGO_PKG_VERSION");
        let _ = writeln!(&mut s, "# HELP loka_bridge_build_info Build information");
        let _ = writeln!(&mut s, "# TYPE loka_bridge_build_info gauge");
        let _ = writeln!(
            &mut s,
            "loka_bridge_build_info{{name=\"{}\",version=\"{}\"}} 1",
            name, version
        );

        let _ = writeln!(&mut s, "# HELP loka_bridge_watched_devices Configured watched devices");
        let _ = writeln!(&mut s, "# TYPE loka_bridge_watched_devices gauge");
        let _ = writeln!(&mut s, "loka_bridge_watched_devices {}", self.devices);

        let _ = writeln!(&mut s, "# HELP loka_bridge_connected Stream connection is up");
        let _ = writeln!(&mut s, "# TYPE loka_bridge_connected gauge");
        let _ = writeln!(&mut s, "loka_bridge_connected {}", u8::from(self.is_connected()));

        let counters: [(&str, &str, &AtomicU64); 10] = [
            ("loka_bridge_messages_received_total", "Stream frames received", &*self.messages_received_total),
            ("loka_bridge_messages_ignored_total", "Frames that were not text", &*self.messages_ignored_total),
            ("loka_bridge_notable_events_total", "Frames matching the motion predicate", &*self.notable_events_total),
            ("loka_bridge_stream_errors_total", "Transport errors on the stream", &*self.stream_errors_total),
            ("loka_bridge_published_total", "Notifications accepted by the provider", &*self.published_total),
            ("loka_bridge_publish_failures_total", "Notifications that failed to publish", &*self.publish_failures_total),
            ("loka_bridge_subscribe_total", "Subscribe requests completed", &*self.subscribe_total),
            ("loka_bridge_subscribe_failures_total", "Subscribe requests that failed", &*self.subscribe_failures_total),
            ("loka_bridge_unsubscribe_total", "Unsubscribe requests completed", &*self.unsubscribe_total),
            ("loka_bridge_unsubscribe_failures_total", "Unsubscribe requests that failed", &*self.unsubscribe_failures_total),
        ];
        for (metric, help, value) in counters {
            let _ = writeln!(&mut s, "# HELP {} {}", metric, help);
            let _ = writeln!(&mut s, "# TYPE {} counter", metric);
            let _ = writeln!(&mut s, "{} {}", metric, value.load(Ordering::Relaxed));
        }

        self.publish_hist
            .render("loka_bridge_publish_duration_seconds", &mut s);

        String::from_utf8(s).unwrap_or_default()
    }
}

pub fn spawn_http_server(
    metrics: Metrics,
    addr: String,
    notify_shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("metrics_http_listen" = %addr, "Listening for /metrics and /health");
                loop {
                    tokio::select! {
                        _ = notify_shutdown.notified() => {
                            info!("metrics_http_shutdown" = true, "Shutting down metrics server");
                            break;
                        }
                        accept_res = listener.accept() => {
                            match accept_res {
                                Ok((socket, _peer)) => {
                                    let m = metrics.clone();
                                    tokio::spawn(async move {
                                        if let Err(e) = handle_conn(socket, m).await {
                                            debug!(error = %e, "metrics_http_conn_error");
                                        }
                                    });
                                }
                                Err(e) => {
                                    warn!(error = %e, "metrics_http_accept_error");
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to bind metrics HTTP server");
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Metrics,
    Health,
    Ready,
    NotFound,
}

impl Endpoint {
    fn from_request_line(req: &str) -> Self {
        let path = req
            .strip_prefix("GET ")
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap_or_default();
        match path {
            "/metrics" => Endpoint::Metrics,
            "/health" | "/" => Endpoint::Health,
            "/ready" => Endpoint::Ready,
            _ => Endpoint::NotFound,
        }
    }

    /// Status line and body; only `/metrics` is served in the exposition format.
    fn respond(self, metrics: &Metrics) -> (&'static str, String) {
        match self {
            Endpoint::Metrics => ("200 OK", metrics.render_prometheus()),
            Endpoint::Health => ("200 OK", "OK".to_string()),
            Endpoint::Ready if metrics.is_connected() => ("200 OK", "READY".to_string()),
            Endpoint::Ready => ("503 Service Unavailable", "NOT READY".to_string()),
            Endpoint::NotFound => ("404 Not Found", "Not Found".to_string()),
        }
    }
}

async fn handle_conn(
    mut socket: TcpStream,
    metrics: Metrics,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = [0u8; 1024];
    let n = socket.read(&mut buf).await?;
    let req = std::str::from_utf8(&buf[..n]).unwrap_or("");
    let endpoint = Endpoint::from_request_line(req);
    let (status, body) = endpoint.respond(&metrics);
    let content_type = if endpoint == Endpoint::Metrics {
        "text/plain; version=0.0.4"
    } else {
        "text/plain"
    };
    let resp = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    socket.write_all(resp.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}

pub fn spawn_stats_logger(
    metrics: Metrics,
    notify_shutdown: Arc<Notify>,
    period: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = Snapshot::from(&metrics);
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = notify_shutdown.notified() => break,
                _ = tick.tick() => {
                    let now = Snapshot::from(&metrics);
                    info!(target: "loka_stats",
                        received = now.received - last.received,
                        notable = now.notable - last.notable,
                        published = now.published - last.published,
                        publish_failures = now.publish_failures - last.publish_failures,
                        stream_errors = now.stream_errors - last.stream_errors,
                        connected = metrics.is_connected(),
                        "stats"
                    );
                    last = now;
                }
            }
        }
    })
}

#[derive(Clone, Copy, Default)]
struct Snapshot {
    received: u64,
    notable: u64,
    published: u64,
    publish_failures: u64,
    stream_errors: u64,
}

impl From<&Metrics> for Snapshot {
    fn from(m: &Metrics) -> Self {
        use std::sync::atomic::Ordering::Relaxed;
        Snapshot {
            received: m.messages_received_total.load(Relaxed),
            notable: m.notable_events_total.load(Relaxed),
            published: m.published_total.load(Relaxed),
            publish_failures: m.publish_failures_total.load(Relaxed),
            stream_errors: m.stream_errors_total.load(Relaxed),
        }
    }
}

struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(|a, b| a.total_cmp(b));
        let counts = (0..buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value_secs: f64) {
        let us = if value_secs.is_sign_positive() {
            (value_secs * 1_000_000.0) as u64
        } else {
            0
        };
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for (i, b) in self.buckets.iter().enumerate() {
            if value_secs <= *b {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    fn render(&self, name: &str, out: &mut Vec<u8>) {
        let _ = writeln!(out, "# HELP {} Histogram of {}", name, name);
        let _ = writeln!(out, "# TYPE {} histogram", name);
        let mut cumulative = 0u64;
        for (i, b) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, b, cumulative);
        }
        let total = self.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, total);
        let sum_secs = (self.sum_us.load(Ordering::Relaxed) as f64) / 1_000_000.0;
        let _ = writeln!(out, "{}_sum {}", name, sum_secs);
        let _ = writeln!(out, "{}_count {}", name, total);
    }
}
