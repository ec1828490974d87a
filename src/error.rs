use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Malformed or absent conversation/message identifier. Dropped and logged.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Connect or reconnect failure of the push transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// A REST call failed. The affected list keeps its last-known-good state.
    #[error("fetch failed{}: {message}", http_suffix(.status))]
    Fetch { status: Option<u16>, message: String },

    /// The server never confirmed a request sent over the push transport.
    #[error("no acknowledgement for `{event}` within {after:?}")]
    AckTimeout { event: String, after: Duration },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    /// The owning actor or connection is gone.
    #[error("channel closed")]
    Closed,
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl SyncError {
    pub fn fetch(message: impl Into<String>) -> Self {
        SyncError::Fetch { status: None, message: message.into() }
    }

    /// Errors worth a user-visible notice. Identifier and decode problems are
    /// only ever logged.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Fetch { .. } | SyncError::AckTimeout { .. }
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Fetch {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(e: toml::ser::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}
