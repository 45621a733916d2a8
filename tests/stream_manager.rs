mod support;

use opsboard_notify::{
    protocol::StreamMessage,
    stream::{ConnectionState, StreamConfig, StreamEvent, StreamManager},
};
use serde_json::json;
use std::time::Duration;
use support::{frame, next_event, notification_json, quick_config, ScriptedConnector};

#[tokio::test(start_paused = true)]
async fn forwards_messages_in_order_and_skips_bad_frames() {
    let connector = ScriptedConnector::new();
    let tx = connector.push_open();
    let (manager, mut events) = StreamManager::new(quick_config(), connector.clone());
    manager.connect().unwrap();

    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);
    assert_eq!(manager.state(), ConnectionState::Connected);

    tx.send(frame(json!({"type": "connection_established", "user_id": 7})))
        .unwrap();
    tx.send(frame(json!({
        "type": "notification_message",
        "notification": notification_json(1, "task", false)
    })))
    .unwrap();
    tx.send(Ok("{not json".to_string())).unwrap();
    tx.send(frame(json!({"type": "heartbeat"}))).unwrap();
    tx.send(frame(json!({"type": "visa_expiry_digest", "count": 2})))
        .unwrap();
    tx.send(frame(json!({"type": "notification_read", "notification_ids": [1]})))
        .unwrap();
    tx.send(frame(json!({"type": "unread_count_update", "unread_count": 0})))
        .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        StreamEvent::Message(StreamMessage::ConnectionEstablished { user_id: json!(7) })
    );
    match next_event(&mut events).await {
        StreamEvent::Message(StreamMessage::NotificationMessage { notification }) => {
            assert_eq!(notification.id, 1)
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        next_event(&mut events).await,
        StreamEvent::Message(StreamMessage::NotificationRead {
            notification_ids: vec![1]
        })
    );
    assert_eq!(
        next_event(&mut events).await,
        StreamEvent::Message(StreamMessage::UnreadCountUpdate { unread_count: 0 })
    );
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_error_message_is_not_terminal() {
    let connector = ScriptedConnector::new();
    let tx = connector.push_open();
    let (manager, mut events) = StreamManager::new(quick_config(), connector.clone());
    manager.connect().unwrap();
    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);

    tx.send(frame(json!({"type": "error", "message": "rate limited"})))
        .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        StreamEvent::Error {
            message: "rate limited".to_string(),
            terminal: false
        }
    );
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_retry_budget() {
    let connector = ScriptedConnector::new();
    connector.push_fail("refused");
    connector.push_fail("refused");
    connector.push_fail("refused");
    let (manager, mut events) = StreamManager::new(quick_config(), connector.clone());
    manager.connect().unwrap();

    match next_event(&mut events).await {
        StreamEvent::Error { message, terminal } => {
            assert!(terminal);
            assert!(message.contains("after 3 failed attempts"), "{message}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(manager.state(), ConnectionState::GivenUp);
    assert_eq!(connector.opens(), 3);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.opens(), 3);
    assert_eq!(manager.state(), ConnectionState::GivenUp);

    let diagnostics = manager.diagnostics().unwrap();
    assert_eq!(diagnostics.reconnect_attempts, 3);
    assert!(diagnostics.last_error.unwrap().contains("refused"));
}

#[tokio::test(start_paused = true)]
async fn backoff_delays_grow_between_attempts() {
    let connector = ScriptedConnector::new();
    let (manager, _events) = StreamManager::new(quick_config(), connector.clone());
    let started = tokio::time::Instant::now();
    manager.connect().unwrap();

    let mut state_rx = manager.subscribe_state();
    state_rx
        .wait_for(|state| *state == ConnectionState::GivenUp)
        .await
        .unwrap();

    // 1s after the first failure, 2s after the second, then the budget is spent.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
    assert_eq!(connector.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn watchdog_cycles_a_silent_connection() {
    let connector = ScriptedConnector::new();
    let first = connector.push_open();
    let _second = connector.push_open();
    let config = StreamConfig {
        inactivity_window: Duration::from_secs(10),
        ..quick_config()
    };
    let (manager, mut events) = StreamManager::new(config, connector.clone());
    manager.connect().unwrap();

    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);
    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);

    assert_eq!(connector.opens(), 2);
    assert!(first.is_closed());
    assert_eq!(manager.diagnostics().unwrap().reconnect_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_the_connection() {
    let connector = ScriptedConnector::new();
    let tx = connector.push_open();
    let config = StreamConfig {
        inactivity_window: Duration::from_secs(10),
        ..quick_config()
    };
    let (manager, mut events) = StreamManager::new(config, connector.clone());
    manager.connect().unwrap();
    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(frame(json!({"type": "heartbeat"}))).unwrap();
    }

    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn undecodable_frames_do_not_count_as_activity() {
    let connector = ScriptedConnector::new();
    let first = connector.push_open();
    let _second = connector.push_open();
    let config = StreamConfig {
        inactivity_window: Duration::from_secs(10),
        ..quick_config()
    };
    let (manager, mut events) = StreamManager::new(config, connector.clone());
    manager.connect().unwrap();
    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(4)).await;
        let _ = first.send(Ok("garbage".to_string()));
    }

    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);
    assert_eq!(connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_backoff_cancels_the_retry() {
    let connector = ScriptedConnector::new();
    connector.push_fail("refused");
    let config = StreamConfig {
        base_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(10),
        ..quick_config()
    };
    let (manager, mut events) = StreamManager::new(config, connector.clone());
    let mut state_rx = manager.subscribe_state();
    manager.connect().unwrap();

    state_rx
        .wait_for(|state| *state == ConnectionState::Reconnecting)
        .await
        .unwrap();
    assert_eq!(manager.diagnostics().unwrap().backoff_seconds, 10);

    manager.disconnect().unwrap();
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn connection_established_resets_the_retry_budget() {
    let connector = ScriptedConnector::new();
    connector.push_fail("refused");
    let tx = connector.push_open();
    let config = StreamConfig {
        max_reconnect_attempts: 2,
        ..quick_config()
    };
    let (manager, mut events) = StreamManager::new(config, connector.clone());
    manager.connect().unwrap();

    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);
    tx.send(frame(json!({"type": "connection_established", "user_id": "u-1"})))
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        StreamEvent::Message(StreamMessage::ConnectionEstablished { .. })
    ));
    assert_eq!(manager.diagnostics().unwrap().reconnect_attempts, 0);
    drop(tx);

    // stream end counts as one failure, the refused reopen as the second
    match next_event(&mut events).await {
        StreamEvent::Error { terminal, .. } => assert!(terminal),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(connector.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn reconnect_replaces_the_previous_transport() {
    let connector = ScriptedConnector::new();
    let first = connector.push_open();
    let second = connector.push_open();
    let (manager, mut events) = StreamManager::new(quick_config(), connector.clone());

    manager.connect().unwrap();
    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);
    manager.connect().unwrap();
    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);

    tokio::time::timeout(Duration::from_secs(1), first.closed())
        .await
        .expect("previous transport was not released");
    assert!(!second.is_closed());
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_manager_releases_the_transport() {
    let connector = ScriptedConnector::new();
    let tx = connector.push_open();
    let (manager, mut events) = StreamManager::new(quick_config(), connector.clone());
    manager.connect().unwrap();
    assert_eq!(next_event(&mut events).await, StreamEvent::Connected);

    drop(manager);

    tokio::time::timeout(Duration::from_secs(1), tx.closed())
        .await
        .expect("transport outlived its manager");
}
