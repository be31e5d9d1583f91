//! Integration tests for live subscriptions over the committed log.

use bytes::Bytes;
use futures::StreamExt;
use tidelog::{
    spawn_writer, subscribe_all, Broker, Config, ExpectedVersion, ProposedEvent,
    SubscriptionMessage, TransactionLog,
};

fn proposed(event_type: &str) -> ProposedEvent {
    ProposedEvent {
        event_id: uuid::Uuid::new_v4(),
        event_type: event_type.to_string(),
        metadata: Bytes::new(),
        payload: Bytes::from_static(b"{}"),
    }
}

#[tokio::test]
async fn catch_up_then_caught_up_then_live() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join("transactions.log");
    let log = TransactionLog::open(&path).expect("open should succeed");
    let config = Config::with_data_path(&path);
    let broker = Broker::new(64);
    let (handle, read_index, join) = spawn_writer(log, &config, broker.clone());

    // History committed before the subscription exists.
    for i in 0..3u64 {
        handle
            .append(
                "ES",
                ExpectedVersion::Any,
                vec![proposed(&format!("Historic{i}"))],
            )
            .await
            .expect("append should succeed");
    }

    let stream = subscribe_all(read_index.clone(), &broker, 0);
    futures::pin_mut!(stream);

    // Phase 1: the three historical events, in commit order.
    for expected_global in 0..3u64 {
        match stream.next().await {
            Some(Ok(SubscriptionMessage::Event(event))) => {
                assert_eq!(event.global_position, expected_global);
            }
            other => panic!("expected historical event, got {other:?}"),
        }
    }

    // Phase 2: the caught-up marker.
    assert!(matches!(
        stream.next().await,
        Some(Ok(SubscriptionMessage::CaughtUp))
    ));

    // Phase 3: a live event committed after the subscription.
    handle
        .append("ES", ExpectedVersion::Any, vec![proposed("Live")])
        .await
        .expect("append should succeed");

    match stream.next().await {
        Some(Ok(SubscriptionMessage::Event(event))) => {
            assert_eq!(event.global_position, 3);
            assert_eq!(event.event_type, "Live");
        }
        other => panic!("expected live event, got {other:?}"),
    }

    drop(handle);
    join.await.expect("writer task should exit cleanly");
}

#[tokio::test]
async fn subscription_from_mid_log_skips_earlier_events() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join("transactions.log");
    let log = TransactionLog::open(&path).expect("open should succeed");
    let config = Config::with_data_path(&path);
    let broker = Broker::new(64);
    let (handle, read_index, join) = spawn_writer(log, &config, broker.clone());

    for i in 0..5u64 {
        handle
            .append("ES", ExpectedVersion::Any, vec![proposed(&format!("Evt{i}"))])
            .await
            .expect("append should succeed");
    }

    let stream = subscribe_all(read_index.clone(), &broker, 3);
    futures::pin_mut!(stream);

    for expected_global in 3..5u64 {
        match stream.next().await {
            Some(Ok(SubscriptionMessage::Event(event))) => {
                assert_eq!(event.global_position, expected_global);
            }
            other => panic!("expected historical event, got {other:?}"),
        }
    }
    assert!(matches!(
        stream.next().await,
        Some(Ok(SubscriptionMessage::CaughtUp))
    ));

    drop(handle);
    join.await.expect("writer task should exit cleanly");
}

#[tokio::test]
async fn rejected_appends_publish_nothing() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join("transactions.log");
    let log = TransactionLog::open(&path).expect("open should succeed");
    let config = Config::with_data_path(&path);
    let broker = Broker::new(64);
    let (handle, _read_index, join) = spawn_writer(log, &config, broker.clone());

    let mut rx = broker.subscribe();

    handle
        .append("ES", ExpectedVersion::NoStream, vec![proposed("First")])
        .await
        .expect("append should succeed");
    let _ = rx.recv().await.expect("committed event is published");

    // A conflicting append fails and must not reach subscribers.
    let result = handle
        .append("ES", ExpectedVersion::NoStream, vec![proposed("Conflict")])
        .await;
    assert!(result.is_err());

    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    drop(handle);
    join.await.expect("writer task should exit cleanly");
}
