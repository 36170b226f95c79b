mod common;

use chihiros_lib::commands;
use chihiros_lib::constants::NOT_FOUND_MSG;
use chihiros_lib::engine::{ConnectionEngine, DisconnectReason, SessionState};
use chihiros_lib::{EngineConfig, MessageIdCounter};
use common::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn ack_frame(value: u8) -> Frame {
    commands::doser_ack(&mut MessageIdCounter::new(), value)
}

fn engine() -> (ConnectionEngine<MockTransport>, MockTransport) {
    let mock = MockTransport::new();
    (ConnectionEngine::new(mock.clone()), mock)
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried_until_success() {
    let (engine, mock) = engine();
    mock.fail_next_writes(TransportError::Transient("GATT write failed".into()), 2);

    let started = Instant::now();
    engine.send_frame(&ack_frame(4)).await.expect("third attempt succeeds");

    assert_eq!(engine.state(), SessionState::Connected);
    assert_eq!(mock.connects(), 3);
    assert_eq!(mock.writes().len(), 1);
    assert_eq!(engine.last_disconnect_reason(), Some(DisconnectReason::Error));
    assert!(started.elapsed() >= Duration::from_millis(500), "two backoffs of 250 ms");
}

#[tokio::test(start_paused = true)]
async fn retry_budget_is_bounded() {
    let (engine, mock) = engine();
    mock.fail_next_writes(TransportError::Backend("org.bluez.Error.Failed".into()), 5);

    let err = engine.send_frame(&ack_frame(4)).await.unwrap_err();

    assert!(matches!(err, ChihirosError::Transport(TransportError::Backend(_))), "{err}");
    assert_eq!(mock.connects(), 3);
    assert_eq!(engine.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn configured_attempt_budget_is_honoured() {
    let mock = MockTransport::new();
    let config = EngineConfig {
        attempts: 1,
        ..Default::default()
    };
    let engine = ConnectionEngine::with_config(mock.clone(), config);
    mock.fail_next_writes(TransportError::Transient("link lost".into()), 1);

    assert!(engine.send_frame(&ack_frame(4)).await.is_err());
    assert_eq!(mock.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_is_not_retried() {
    let (engine, mock) = engine();
    mock.fail_next_connect(TransportError::NotFound("AA:BB:CC:DD:EE:FF".into()));

    let err = engine.send_frame(&ack_frame(4)).await.unwrap_err();

    assert!(matches!(err, ChihirosError::DeviceUnreachable { .. }));
    assert_eq!(err.to_string(), NOT_FOUND_MSG);
    assert_eq!(mock.connects(), 1);
    assert_eq!(engine.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn missing_characteristic_is_fatal() {
    let (engine, mock) = engine();
    mock.hide_characteristic(UART_TX);

    let err = engine.send_frame(&ack_frame(4)).await.unwrap_err();

    assert!(matches!(err, ChihirosError::CharacteristicMissing(uuid) if uuid == UART_TX));
    assert_eq!(mock.connects(), 1, "not retried");
    assert!(mock.writes().is_empty());
    assert_eq!(engine.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn frames_are_written_in_order() {
    let (engine, mock) = engine();
    let mut ids = MessageIdCounter::new();
    let frames = vec![commands::doser_ack(&mut ids, 4), commands::doser_ack(&mut ids, 5)];

    engine.send_command(&frames).await.unwrap();

    let expected: Vec<Vec<u8>> = frames.iter().map(|f| f.as_bytes().to_vec()).collect();
    assert_eq!(mock.writes(), expected);
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_coalesce() {
    let (engine, mock) = engine();
    mock.set_connect_delay(Duration::from_millis(300));

    let (a, b) = tokio::join!(engine.ensure_connected(), engine.ensure_connected());

    a.unwrap();
    b.unwrap();
    assert_eq!(mock.connects(), 1);
    assert_eq!(mock.start_notifies(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_disconnects_gracefully() {
    let (engine, mock) = engine();
    engine.ensure_connected().await.unwrap();

    tokio::time::sleep(Duration::from_secs(119)).await;
    assert_eq!(engine.state(), SessionState::Connected);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(engine.state(), SessionState::Disconnected);
    assert_eq!(engine.last_disconnect_reason(), Some(DisconnectReason::IdleTimeout));
    assert_eq!(mock.disconnects(), 1);
    assert_eq!(mock.stop_notifies(), 1);
}

#[tokio::test(start_paused = true)]
async fn activity_pushes_idle_deadline_back() {
    let (engine, _mock) = engine();
    engine.ensure_connected().await.unwrap();

    tokio::time::sleep(Duration::from_secs(100)).await;
    engine.send_frame(&ack_frame(4)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(100)).await;

    assert_eq!(engine.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn idle_timer_rearms_while_command_in_flight() {
    let (engine, mock) = engine();
    mock.set_write_delay(Duration::from_secs(200));

    let sender = engine.clone();
    let send = tokio::spawn(async move { sender.send_frame(&ack_frame(4)).await });

    tokio::time::sleep(Duration::from_secs(150)).await;
    assert!(engine.is_busy());
    assert_eq!(engine.state(), SessionState::Connected);

    send.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(engine.state(), SessionState::Connected, "re-armed deadline not reached yet");

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(engine.state(), SessionState::Disconnected);
    assert_eq!(engine.last_disconnect_reason(), Some(DisconnectReason::IdleTimeout));
}

#[tokio::test(start_paused = true)]
async fn unexpected_disconnect_is_recorded() {
    let (engine, mock) = engine();
    engine.ensure_connected().await.unwrap();

    mock.drop_link();

    assert_eq!(engine.state(), SessionState::Disconnected);
    assert_eq!(engine.last_disconnect_reason(), Some(DisconnectReason::Unexpected));

    engine.send_frame(&ack_frame(4)).await.unwrap();
    assert_eq!(mock.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_clears_listeners() {
    let (engine, mock) = engine();
    engine.ensure_connected().await.unwrap();
    engine.subscribe(|_| {});
    engine.subscribe(|_| {});
    assert_eq!(engine.listener_count(), 2);

    engine.disconnect().await;

    assert_eq!(engine.listener_count(), 0);
    assert_eq!(mock.stop_notifies(), 1);
    assert_eq!(mock.disconnects(), 1);
    assert_eq!(engine.last_disconnect_reason(), Some(DisconnectReason::Explicit));
}

#[tokio::test(start_paused = true)]
async fn notify_subscription_is_idempotent() {
    let (engine, mock) = engine();
    engine.start_notify().await.unwrap();
    engine.start_notify().await.unwrap();
    assert_eq!(mock.start_notifies(), 1);

    engine.stop_notify().await.unwrap();
    engine.stop_notify().await.unwrap();
    assert_eq!(mock.stop_notifies(), 1);

    engine.start_notify().await.unwrap();
    assert_eq!(mock.start_notifies(), 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_listener_does_not_block_others() {
    let (engine, mock) = engine();
    engine.ensure_connected().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.subscribe(|_| panic!("listener bug"));
    engine.subscribe(move |data| sink.lock().unwrap().push(data.to_vec()));

    mock.notify(&[0x5B, 0x01]);
    mock.notify(&[0xA5, 0x02]);

    assert_eq!(*seen.lock().unwrap(), vec![vec![0x5B, 0x01], vec![0xA5, 0x02]]);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_stops_delivery() {
    let (engine, mock) = engine();
    engine.ensure_connected().await.unwrap();

    let count = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&count);
    let id = engine.subscribe(move |_| *counter.lock().unwrap() += 1);
    mock.notify(&[1]);
    assert!(engine.unsubscribe(id));
    assert!(!engine.unsubscribe(id));
    mock.notify(&[2]);

    assert_eq!(*count.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn wait_for_notification_times_out_with_none() {
    let (engine, _mock) = engine();
    engine.ensure_connected().await.unwrap();

    let got = engine
        .wait_for_notification(|_| true, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(got, None);
    assert_eq!(engine.listener_count(), 0);
    assert_eq!(engine.state(), SessionState::Connected, "subscription survives the timeout");
}

#[tokio::test(start_paused = true)]
async fn wait_for_notification_filters_by_predicate() {
    let (engine, mock) = engine();
    engine.ensure_connected().await.unwrap();

    let wait = engine.wait_for_notification(|data| data.first() == Some(&0x5B), Duration::from_secs(2));
    let feed = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        mock.notify(&[0xA5, 0x00]);
        mock.notify(&[0x5B, 0x01]);
    };
    let (got, ()) = tokio::join!(wait, feed);

    assert_eq!(got.unwrap(), Some(vec![0x5B, 0x01]));
}

#[tokio::test(start_paused = true)]
async fn disconnect_resolves_pending_wait() {
    let (engine, _mock) = engine();
    engine.ensure_connected().await.unwrap();

    let wait = engine.wait_for_notification(|_| true, Duration::from_secs(30));
    let closer = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.disconnect().await;
    };
    let (got, ()) = tokio::join!(wait, closer);

    assert!(matches!(got, Err(ChihirosError::Disconnected)));
}

#[tokio::test(start_paused = true)]
async fn unexpected_drop_resolves_pending_wait() {
    let (engine, mock) = engine();
    engine.ensure_connected().await.unwrap();

    let wait = engine.wait_for_notification(|_| true, Duration::from_secs(30));
    let dropper = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        mock.drop_link();
    };
    let (got, ()) = tokio::join!(wait, dropper);

    assert!(matches!(got, Err(ChihirosError::Disconnected)));
}
