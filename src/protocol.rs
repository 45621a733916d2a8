//! Push-channel wire format.
//!
//! Every event carries one JSON object with a `type` discriminator. Types this
//! client does not know decode to [`StreamMessage::Unknown`] and are ignored
//! downstream, so the backend can add event kinds without breaking sessions.

use serde::Deserialize;

use crate::{
    model::{Notification, NotificationId},
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    ConnectionEstablished {
        user_id: serde_json::Value,
    },
    NotificationMessage {
        notification: Notification,
    },
    NotificationRead {
        notification_ids: Vec<NotificationId>,
    },
    UnreadCountUpdate {
        unread_count: i64,
    },
    Heartbeat,
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl StreamMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::ConnectionEstablished { .. } => "connection_established",
            StreamMessage::NotificationMessage { .. } => "notification_message",
            StreamMessage::NotificationRead { .. } => "notification_read",
            StreamMessage::UnreadCountUpdate { .. } => "unread_count_update",
            StreamMessage::Heartbeat => "heartbeat",
            StreamMessage::Error { .. } => "error",
            StreamMessage::Unknown => "unknown",
        }
    }
}

pub fn decode_message(text: &str) -> Result<StreamMessage> {
    serde_json::from_str::<StreamMessage>(text).map_err(|source| Error::Decode {
        context: "stream message",
        source,
    })
}

/// Incremental `text/event-stream` parser.
///
/// Bytes arrive in arbitrary chunks; complete events are returned as the
/// concatenated `data:` payload. `event:`, `id:`, `retry:` and comment lines
/// are consumed without effect.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    data: String,
    has_data: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        events
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if !self.has_data {
                return None;
            }
            self.has_data = false;
            let mut event = std::mem::take(&mut self.data);
            if event.ends_with('\n') {
                event.pop();
            }
            return Some(event);
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push_str(value);
            self.data.push('\n');
            self.has_data = true;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_every_known_type() {
        let cases = [
            (r#"{"type":"connection_established","user_id":12}"#, "connection_established"),
            (r#"{"type":"notification_read","notification_ids":[1,2]}"#, "notification_read"),
            (r#"{"type":"unread_count_update","unread_count":3}"#, "unread_count_update"),
            (r#"{"type":"heartbeat"}"#, "heartbeat"),
            (r#"{"type":"heartbeat","timestamp":"2026-01-01T00:00:00Z"}"#, "heartbeat"),
            (r#"{"type":"error","message":"token expired"}"#, "error"),
            (r#"{"type":"presence_changed","online":true}"#, "unknown"),
        ];
        for (raw, kind) in cases {
            assert_eq!(decode_message(raw).unwrap().kind(), kind, "{raw}");
        }
    }

    #[test]
    fn decodes_notification_payload() {
        let raw = r#"{"type":"notification_message","notification":{
            "id":7,"type":"task","title":"Review visa file","is_read":false,
            "created_at":"2026-04-02T10:00:00Z"}}"#;
        match decode_message(raw).unwrap() {
            StreamMessage::NotificationMessage { notification } => {
                assert_eq!(notification.id, 7);
                assert_eq!(notification.title, "Review visa file");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn rejects_frames_missing_required_fields() {
        assert!(decode_message(r#"{"type":"notification_message"}"#).is_err());
        assert!(decode_message(r#"{"unread_count":3}"#).is_err());
        assert!(decode_message("not json").is_err());
    }

    #[test]
    fn event_stream_handles_split_chunks_and_comments() {
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.push(b": keep-alive\n\nda").is_empty());
        assert!(decoder.push(b"ta: {\"type\":").is_empty());
        let events = decoder.push(b"\"heartbeat\"}\r\n\r\n");
        assert_eq!(events, vec![r#"{"type":"heartbeat"}"#.to_string()]);
    }

    #[test]
    fn event_stream_joins_multiline_data() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(b"event: message\nid: 4\ndata: first\ndata:second\n\ndata: x\n\n");
        assert_eq!(events, vec!["first\nsecond".to_string(), "x".to_string()]);
    }

    #[test]
    fn event_stream_keeps_multibyte_chars_split_across_chunks() {
        let mut decoder = EventStreamDecoder::new();
        let bytes = "data: café\n\n".as_bytes();
        let (head, tail) = bytes.split_at(10);
        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.push(tail), vec!["café".to_string()]);
    }
}
