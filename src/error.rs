use thiserror::Error;

/// Errors surfaced by the REST client, the stream manager and the store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{context} failed with HTTP {status}: {body}")]
    Http {
        context: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to decode {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream transport error: {0}")]
    Transport(String),

    #[error("stream connection timed out after {0} seconds")]
    ConnectTimeout(u64),

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),

    #[error("request cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
