#![allow(dead_code)]

use async_trait::async_trait;
use opsboard_notify::{
    stream::{StreamConfig, StreamEvent},
    transport::{Connector, Transport},
    Error, Result,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

pub type FrameSender = mpsc::UnboundedSender<Result<String>>;

enum Step {
    Fail(String),
    Open(mpsc::UnboundedReceiver<Result<String>>),
}

/// Connector that replays a script of open outcomes, one per `open` call.
/// Once the script runs out every open fails.
#[derive(Default)]
pub struct ScriptedConnector {
    steps: Mutex<VecDeque<Step>>,
    opens: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_fail(&self, reason: &str) {
        self.steps
            .lock()
            .unwrap()
            .push_back(Step::Fail(reason.to_string()));
    }

    /// Queues a successful open; frames sent on the returned handle are
    /// delivered by that transport. Dropping the handle ends the stream.
    pub fn push_open(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.steps.lock().unwrap().push_back(Step::Open(rx));
        tx
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Open(frames)) => Ok(Box::new(ChannelTransport { frames })),
            Some(Step::Fail(reason)) => Err(Error::Transport(reason)),
            None => Err(Error::Transport("connection refused".to_string())),
        }
    }
}

struct ChannelTransport {
    frames: mpsc::UnboundedReceiver<Result<String>>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        self.frames.recv().await
    }

    async fn close(&mut self) {
        self.frames.close();
    }
}

pub fn quick_config() -> StreamConfig {
    StreamConfig {
        connect_timeout: Duration::from_secs(5),
        inactivity_window: Duration::from_secs(30),
        max_reconnect_attempts: 3,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(8),
        jitter: Duration::ZERO,
    }
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(3600), events.recv())
        .await
        .expect("timed out waiting for a stream event")
        .expect("stream event channel closed")
}

pub fn notification_json(id: i64, category: &str, read: bool) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": category,
        "title": format!("notification {id}"),
        "message": "",
        "read": read,
        "read_at": if read { serde_json::json!("2026-03-01T10:00:00Z") } else { serde_json::Value::Null },
        "is_completed": false,
        "created_at": "2026-03-01T09:30:00Z"
    })
}

pub fn frame(value: serde_json::Value) -> Result<String> {
    Ok(value.to_string())
}
