use std::{env, path::Path, time::Duration};

use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::logging::{LogFormat, LogLevel};
use crate::model::WatchedDevice;

const DEFAULT_DEVICES_FILE: &str = "config.json";

pub struct Config {
    pub auth_token: String,
    pub pusher_instance_id: String,
    pub pusher_secret_key: String,
    pub pusher_endpoint: Option<String>,
    /// Fixed interest for every publish; `None` publishes to the recipient itself.
    pub push_interest: Option<String>,
    pub devices: Vec<WatchedDevice>,
    pub api_url: String,
    pub stream_url: String,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub metrics_addr: Option<String>,
    pub stats_interval: Option<Duration>,
    pub publish_buckets: Vec<f64>,
    pub exit_grace: Duration,
}

#[derive(Deserialize)]
struct DevicesFile {
    #[serde(default)]
    devices: Vec<Value>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let auth_token = required(&lookup, "LOKA_AUTH_TOKEN")?;
        let pusher_instance_id = required(&lookup, "PUSHER_INSTANCE_ID")?;
        let pusher_secret_key = required(&lookup, "PUSHER_SECRET_KEY")?;

        let mut ids: Vec<String> = Vec::new();
        match non_empty(lookup("DEVICES_FILE")) {
            Some(path) => ids.extend(read_devices_file(&path)?),
            None if Path::new(DEFAULT_DEVICES_FILE).exists() => {
                ids.extend(read_devices_file(DEFAULT_DEVICES_FILE)?)
            }
            None => {}
        }
        if let Some(list) = lookup("LOKA_DEVICES") {
            ids.extend(parse_list(&list));
        }
        if let Some(single) = lookup("LOKA_DEVICE_ID") {
            ids.push(single);
        }
        let devices = dedup_devices(ids);

        let api_url = non_empty(lookup("LOKA_API_URL"))
            .unwrap_or_else(|| "https://core.loka.systems".to_string())
            .trim_end_matches('/')
            .to_string();
        let stream_url = non_empty(lookup("LOKA_STREAM_URL"))
            .unwrap_or_else(|| "wss://core.loka.systems/messages".to_string());

        let log_level = match lookup("LOG_LEVEL") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                key: "LOG_LEVEL",
                value: v.clone(),
            })?,
            None => LogLevel::Warn,
        };
        let log_format = match lookup("LOG_FORMAT") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                key: "LOG_FORMAT",
                value: v.clone(),
            })?,
            None => LogFormat::Json,
        };

        // Empty string disables the metrics listener
        let metrics_addr = match lookup("METRICS_ADDR") {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v),
            None => Some("127.0.0.1:9899".to_string()),
        };

        let stats_interval = lookup("STATS_INTERVAL_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| if secs == 0 { None } else { Some(Duration::from_secs(secs)) })
            .unwrap_or_else(|| Some(Duration::from_secs(60)));

        let publish_buckets = parse_buckets(lookup("PUBLISH_BUCKETS").as_deref())
            .unwrap_or_else(|| vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]);

        let exit_grace = lookup("EXIT_GRACE_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(2000));

        Ok(Config {
            auth_token,
            pusher_instance_id,
            pusher_secret_key,
            pusher_endpoint: non_empty(lookup("PUSHER_ENDPOINT"))
                .map(|s| s.trim_end_matches('/').to_string()),
            push_interest: non_empty(lookup("PUSH_INTEREST")),
            devices,
            api_url,
            stream_url,
            log_level,
            log_format,
            metrics_addr,
            stats_interval,
            publish_buckets,
            exit_grace,
        })
    }
}

/// Shows only the first and last two characters of a secret.
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 4), tail)
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup(key)).ok_or(ConfigError::Missing(key))
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn read_devices_file(path: &str) -> Result<Vec<String>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::DevicesRead {
        path: path.to_string(),
        source,
    })?;
    parse_devices_json(&raw).map_err(|source| ConfigError::DevicesParse {
        path: path.to_string(),
        source,
    })
}

/// Accepts `{"devices": [...]}` with string or numeric ids.
fn parse_devices_json(raw: &str) -> Result<Vec<String>, serde_json::Error> {
    let file: DevicesFile = serde_json::from_str(raw)?;
    Ok(file
        .devices
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect())
}

fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn dedup_devices(ids: Vec<String>) -> Vec<WatchedDevice> {
    let mut out: Vec<WatchedDevice> = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(dev) = WatchedDevice::new(id) {
            if !out.contains(&dev) {
                out.push(dev);
            }
        }
    }
    out
}

fn parse_buckets(src: Option<&str>) -> Option<Vec<f64>> {
    let s = src?;
    let mut out = Vec::new();
    for part in s.split(',') {
        if part.trim().is_empty() { continue; }
        if let Ok(v) = part.trim().parse::<f64>() {
            if v.is_finite() { out.push(v); }
        }
    }
    if out.is_empty() { None } else { out.sort_by(|a, b| a.total_cmp(b)); Some(out) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const CREDS: [(&str, &str); 3] = [
        ("LOKA_AUTH_TOKEN", "tok"),
        ("PUSHER_INSTANCE_ID", "inst"),
        ("PUSHER_SECRET_KEY", "secret"),
    ];

    #[test]
    fn missing_credentials_are_fatal() {
        let err = Config::from_lookup(lookup_from(&[("LOKA_AUTH_TOKEN", "tok")]))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Missing("PUSHER_INSTANCE_ID")));

        let err = Config::from_lookup(lookup_from(&[])).err().unwrap();
        assert_eq!(err.to_string(), "LOKA_AUTH_TOKEN is not set");
    }

    #[test]
    fn defaults_apply() {
        let cfg = Config::from_lookup(lookup_from(&CREDS)).unwrap();
        assert_eq!(cfg.api_url, "https://core.loka.systems");
        assert_eq!(cfg.stream_url, "wss://core.loka.systems/messages");
        assert_eq!(cfg.log_level, LogLevel::Warn);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.metrics_addr.as_deref(), Some("127.0.0.1:9899"));
        assert_eq!(cfg.stats_interval, Some(Duration::from_secs(60)));
        assert_eq!(cfg.exit_grace, Duration::from_millis(2000));
        assert!(cfg.push_interest.is_none());
        assert!(cfg.pusher_endpoint.is_none());
    }

    #[test]
    fn single_and_multi_device_variants_merge() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("DEVICES_FILE", ""));
        pairs.push(("LOKA_DEVICES", "d1, d2,,d1"));
        pairs.push(("LOKA_DEVICE_ID", "d3"));
        let cfg = Config::from_lookup(lookup_from(&pairs)).unwrap();
        let ids: Vec<&str> = cfg.devices.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn devices_file_accepts_strings_and_numbers() {
        let ids = parse_devices_json(r#"{"devices": ["d1", 42, null, "d2"]}"#).unwrap();
        assert_eq!(ids, vec!["d1", "42", "d2"]);
        assert!(parse_devices_json("not json").is_err());
    }

    #[test]
    fn explicit_missing_devices_file_is_an_error() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("DEVICES_FILE", "/nonexistent/loka-devices.json"));
        let err = Config::from_lookup(lookup_from(&pairs)).err().unwrap();
        assert!(matches!(err, ConfigError::DevicesRead { .. }));
    }

    #[test]
    fn overrides_and_disables() {
        let mut pairs = CREDS.to_vec();
        pairs.extend([
            ("LOKA_API_URL", "http://127.0.0.1:8080/"),
            ("PUSH_INTEREST", "alerts"),
            ("METRICS_ADDR", ""),
            ("STATS_INTERVAL_SECS", "0"),
            ("LOG_LEVEL", "info"),
            ("PUBLISH_BUCKETS", "2,0.5,x,1"),
        ]);
        let cfg = Config::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(cfg.api_url, "http://127.0.0.1:8080");
        assert_eq!(cfg.push_interest.as_deref(), Some("alerts"));
        assert!(cfg.metrics_addr.is_none());
        assert!(cfg.stats_interval.is_none());
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert_eq!(cfg.publish_buckets, vec![0.5, 1.0, 2.0]);
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("LOG_LEVEL", "loud"));
        let err = Config::from_lookup(lookup_from(&pairs)).err().unwrap();
        assert!(matches!(err, ConfigError::Invalid { key: "LOG_LEVEL", .. }));
    }

    #[test]
    fn mask_hides_secrets() {
        assert_eq!(mask("abcdefgh"), "ab****gh");
        assert_eq!(mask("abc"), "***");
    }
}
