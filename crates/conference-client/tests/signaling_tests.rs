//! Signaling channel tests against an in-process WebSocket server.
//!
//! Real time is used throughout (the transport is a real socket), with
//! heartbeat intervals in the tens of milliseconds.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::secret::SecretString;
use conference_client::errors::ClientError;
use conference_client::signaling::{
    SignalingChannel, SignalingConfig, SignalingEvent, SignalingHandle, SignalingState,
};
use conference_test_utils::{next_matching, MockSignalingServer};
use serde_json::json;
use signaling_protocol::Envelope;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn fast_config(server: &MockSignalingServer) -> SignalingConfig {
    SignalingConfig::new(server.url())
        .with_heartbeat(Duration::from_millis(50), Duration::from_millis(40))
}

async fn connected_channel(
    server: &MockSignalingServer,
) -> (SignalingHandle, mpsc::UnboundedReceiver<SignalingEvent>) {
    let (handle, mut events, _task) =
        SignalingChannel::spawn(fast_config(server), CancellationToken::new());
    handle.connect(SecretString::from("ticket-1")).await.unwrap();
    wait_for_state(&mut events, SignalingState::Connected).await;
    (handle, events)
}

async fn wait_for_state(
    events: &mut mpsc::UnboundedReceiver<SignalingEvent>,
    state: SignalingState,
) {
    next_matching(events, |e| {
        matches!(e, SignalingEvent::ConnectionStateChanged(s) if *s == state)
    })
    .await;
}

// ============================================================================
// Connect and send
// ============================================================================

#[tokio::test]
async fn test_connect_passes_ticket_as_query_parameter() {
    let server = MockSignalingServer::start().await;
    let (handle, _events) = connected_channel(&server).await;

    assert!(handle.is_open());
    assert_eq!(server.tickets(), vec!["ticket-1".to_string()]);
}

#[tokio::test]
async fn test_send_before_connect_is_channel_closed() {
    let server = MockSignalingServer::start().await;
    let (handle, _events, _task) =
        SignalingChannel::spawn(fast_config(&server), CancellationToken::new());

    let result = handle
        .send(Envelope::new("chat", json!({ "action": "hello" })))
        .await;
    assert_eq!(result, Err(ClientError::ChannelClosed));
    assert_eq!(handle.state(), SignalingState::Connecting);
}

#[tokio::test]
async fn test_envelopes_flow_both_ways() {
    let server = MockSignalingServer::start().await;
    let (handle, mut events) = connected_channel(&server).await;

    handle
        .send(Envelope::new("chat", json!({ "action": "hello", "text": "hi" })))
        .await
        .unwrap();
    conference_test_utils::wait_for(|| !server.received().is_empty(), "client envelope").await;
    let received = server.received();
    assert_eq!(received[0].namespace, "chat");
    assert_eq!(received[0].action(), Some("hello"));

    server.send(Envelope::new("chat", json!({ "action": "reply" })));
    let event = next_matching(&mut events, |e| matches!(e, SignalingEvent::MessageReceived(_))).await;
    let SignalingEvent::MessageReceived(envelope) = event else {
        unreachable!("filtered above");
    };
    assert_eq!(envelope.action(), Some("reply"));
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test]
async fn test_echo_traffic_never_reaches_events() {
    let server = MockSignalingServer::start().await;
    let (_handle, mut events) = connected_channel(&server).await;

    conference_test_utils::wait_for(|| server.pings() >= 3, "heartbeat pings").await;

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(&event, SignalingEvent::MessageReceived(e) if e.is_echo()),
            "echo leaked: {event:?}"
        );
        assert_ne!(
            event,
            SignalingEvent::ConnectionStateChanged(SignalingState::Disconnected)
        );
    }
}

#[tokio::test]
async fn test_missing_echo_disconnects() {
    let server = MockSignalingServer::start().await;
    server.set_echo(false);
    let (handle, mut events) = connected_channel(&server).await;

    wait_for_state(&mut events, SignalingState::Disconnected).await;
    assert_eq!(handle.state(), SignalingState::Disconnected);

    let result = handle.send(Envelope::new("chat", json!({}))).await;
    assert_eq!(result, Err(ClientError::ChannelClosed));
}

// ============================================================================
// Close classification
// ============================================================================

#[tokio::test]
async fn test_normal_close_is_terminal() {
    let server = MockSignalingServer::start().await;
    let (handle, mut events) = connected_channel(&server).await;

    server.close(1000);
    wait_for_state(&mut events, SignalingState::Closed).await;

    let result = handle.connect(SecretString::from("ticket-2")).await;
    assert_eq!(result, Err(ClientError::ChannelClosed));
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_abnormal_close_can_reconnect() {
    let server = MockSignalingServer::start().await;
    let (handle, mut events) = connected_channel(&server).await;

    server.close(4001);
    wait_for_state(&mut events, SignalingState::Disconnected).await;

    handle.connect(SecretString::from("ticket-2")).await.unwrap();
    wait_for_state(&mut events, SignalingState::Connected).await;
    assert_eq!(server.connections(), 2);
    assert_eq!(server.tickets().last().map(String::as_str), Some("ticket-2"));
}

#[tokio::test]
async fn test_dropped_socket_disconnects() {
    let server = MockSignalingServer::start().await;
    let (_handle, mut events) = connected_channel(&server).await;

    server.drop_connections();
    wait_for_state(&mut events, SignalingState::Disconnected).await;
}

#[tokio::test]
async fn test_disconnect_closes_and_is_idempotent() {
    let server = MockSignalingServer::start().await;
    let (handle, mut events) = connected_channel(&server).await;

    handle.disconnect().await.unwrap();
    wait_for_state(&mut events, SignalingState::Closed).await;
    assert_eq!(handle.state(), SignalingState::Closed);

    handle.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SignalingEvent::ConnectionStateChanged(_)),
            "state changed after close: {event:?}"
        );
    }
}

#[tokio::test]
async fn test_connect_failure_reports_disconnected() {
    let (handle, mut events, _task) = SignalingChannel::spawn(
        SignalingConfig::new("ws://127.0.0.1:1/signaling"),
        CancellationToken::new(),
    );

    let result = handle.connect(SecretString::from("t")).await;
    assert!(matches!(result, Err(ClientError::Signaling(_))));
    wait_for_state(&mut events, SignalingState::Disconnected).await;
}
