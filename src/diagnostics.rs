use serde::Serialize;

use crate::{core::unix_now_secs, stream::ConnectionState};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct StreamDiagnostics {
    pub connection_state: ConnectionState,
    pub last_connected_at: Option<u64>,
    pub last_stream_event_at: Option<u64>,
    pub stale_for_seconds: Option<u64>,
    pub last_error: Option<String>,
    pub backoff_seconds: u64,
    pub reconnect_attempts: u32,
}

impl StreamDiagnostics {
    pub(crate) fn capture(
        connection_state: ConnectionState,
        last_connected_at: Option<u64>,
        last_stream_event_at: Option<u64>,
        last_error: Option<String>,
        backoff_seconds: u64,
        reconnect_attempts: u32,
    ) -> Self {
        let now = unix_now_secs();
        Self {
            connection_state,
            last_connected_at,
            last_stream_event_at,
            stale_for_seconds: last_stream_event_at.map(|last| now.saturating_sub(last)),
            last_error,
            backoff_seconds,
            reconnect_attempts,
        }
    }

    pub fn summary(&self) -> String {
        let mut line = format!("state={}", self.connection_state);
        if let Some(stale) = self.stale_for_seconds {
            line.push_str(&format!(" stale={stale}s"));
        }
        if self.reconnect_attempts > 0 {
            line.push_str(&format!(
                " attempts={} backoff={}s",
                self.reconnect_attempts, self.backoff_seconds
            ));
        }
        if let Some(error) = &self.last_error {
            line.push_str(&format!(" error={error:?}"));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_mentions_backoff_only_while_retrying() {
        let healthy = StreamDiagnostics::capture(
            ConnectionState::Connected,
            Some(unix_now_secs()),
            Some(unix_now_secs()),
            None,
            0,
            0,
        );
        assert!(healthy.summary().starts_with("state=connected"));
        assert!(!healthy.summary().contains("backoff"));

        let retrying = StreamDiagnostics::capture(
            ConnectionState::Reconnecting,
            None,
            None,
            Some("Stream ended unexpectedly".to_string()),
            6,
            2,
        );
        assert_eq!(
            retrying.summary(),
            "state=reconnecting attempts=2 backoff=6s error=\"Stream ended unexpectedly\""
        );
    }
}
