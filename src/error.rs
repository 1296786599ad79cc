use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("failed to read devices file {path}: {source}")]
    DevicesRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse devices file {path}: {source}")]
    DevicesParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of a single publish call. None of these leave the dispatcher.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid interest {interest:?}: {reason}")]
    InvalidInterest {
        interest: String,
        reason: &'static str,
    },

    #[error("publish must target between 1 and {max} interests, got {count}")]
    InterestCount { count: usize, max: usize },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected publish ({status}): {body}")]
    Rejected { status: u16, body: String },
}
