//! Connection registry tests: single-flight creation, teardown races,
//! quality reservations, roster reconciliation and media routing.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use common::types::{MediaKind, QualitySetting};
use conference_client::connection::{PeerRole, TransportStats};
use conference_client::errors::ClientError;
use conference_client::quality::BackoffConfig;
use conference_client::registry::{ConnectionRegistry, ConsumerRef, RegistryEvent, SlotKind};
use conference_client::turn::{IceServer, IceServerSource};
use conference_test_utils::*;
use signaling_protocol::media::{
    ClientMediaAction, ServerMediaAction, SlowLinkDirection, StreamConfiguration,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn alice() -> common::types::MediaDescriptor {
    descriptor("alice", MediaKind::Video)
}

fn configure_of(action: &ClientMediaAction) -> Option<StreamConfiguration> {
    match action {
        ClientMediaAction::Configure { configuration, .. } => Some(*configuration),
        _ => None,
    }
}

fn configure_for(who: &'static str) -> impl Fn(&ClientMediaAction) -> bool {
    move |a| matches!(a, ClientMediaAction::Configure { target, .. } if target.0 == who)
}

// ============================================================================
// Single-flight creation
// ============================================================================

#[tokio::test]
async fn test_concurrent_ensure_connection_creates_once() {
    let factory = MockPeerConnectionFactory::new();
    factory.hold_creations();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    let (first, second, ()) = tokio::join!(
        registry.ensure_connection(alice()),
        registry.ensure_connection(alice()),
        async {
            factory.wait_for_started(1).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            factory.release_creations();
        }
    );

    assert_eq!(first.unwrap().id(), second.unwrap().id());
    assert_eq!(factory.creations_started(), 1);
    assert_eq!(factory.created().len(), 1);
}

#[tokio::test]
async fn test_ensure_connection_reuses_ready_connection() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    let first = registry.ensure_connection(alice()).await.unwrap();
    let second = registry.ensure_connection(alice()).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(factory.creations_started(), 1);
}

#[tokio::test]
async fn test_creation_failure_reaches_every_waiter() {
    let factory = MockPeerConnectionFactory::new();
    factory.fail_creations(true);
    factory.hold_creations();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    let (first, second, ()) = tokio::join!(
        registry.ensure_connection(alice()),
        registry.ensure_connection(alice()),
        async {
            factory.wait_for_started(1).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            factory.release_creations();
        }
    );

    let first = first.unwrap_err();
    assert!(matches!(first, ClientError::Peer(_)));
    assert_eq!(second.unwrap_err(), first);

    // The entry is left idle, so a later attempt starts a fresh creation.
    factory.fail_creations(false);
    registry.ensure_connection(alice()).await.unwrap();
    assert_eq!(factory.creations_started(), 2);
}

/// Panics on the first lookup, then serves STUN only.
#[derive(Default)]
struct PanickingOnceIceServers {
    calls: AtomicUsize,
}

#[async_trait]
impl IceServerSource for PanickingOnceIceServers {
    #[allow(clippy::panic)]
    async fn ice_servers(&self) -> Vec<IceServer> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("ICE source failed");
        }
        vec![IceServer::stun("stun:stun.test:3478")]
    }
}

#[tokio::test]
async fn test_panicking_creation_task_settles_the_slot() {
    let factory = MockPeerConnectionFactory::new();
    let (outbound_tx, _outbound) = mpsc::unbounded_channel();
    let (registry, _events, _task) = ConnectionRegistry::spawn(
        test_registry_config(),
        factory.clone(),
        Arc::new(PanickingOnceIceServers::default()),
        outbound_tx,
        CancellationToken::new(),
    );

    let first = tokio::time::timeout(Duration::from_secs(5), registry.ensure_connection(alice()))
        .await
        .expect("waiter should not hang");
    assert!(matches!(first, Err(ClientError::Connection(_))));
    wait_for_status(&registry, |s| {
        s.entry(&alice()).is_some_and(|e| e.slot == SlotKind::Idle)
    })
    .await;

    let second = registry.ensure_connection(alice()).await.unwrap();
    assert_eq!(second.role(), PeerRole::Subscriber);
    assert_eq!(factory.created().len(), 1);
}

#[tokio::test]
async fn test_subscribing_to_local_media_is_rejected() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    let result = registry
        .ensure_connection(descriptor("me", MediaKind::Video))
        .await;

    assert!(matches!(result, Err(ClientError::Connection(_))));
    assert_eq!(factory.creations_started(), 0);
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_during_creation_is_rejected() {
    let factory = MockPeerConnectionFactory::new();
    factory.hold_creations();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.ensure_connection(alice()).await }
    });
    factory.wait_for_started(1).await;

    let result = registry.unsubscribe(alice()).await;
    assert_eq!(result, Err(ClientError::CreationPending(alice().media_id())));

    factory.release_creations();
    pending.await.unwrap().unwrap();

    registry.unsubscribe(alice()).await.unwrap();
    let mock = factory.last(PeerRole::Subscriber).unwrap();
    wait_for(|| mock.is_closed(), "subscriber close").await;
    assert!(registry.status().await.unwrap().entries.is_empty());
}

#[tokio::test]
async fn test_unsubscribe_unknown_media_is_not_found() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, _outbound) = spawn_test_registry(factory);

    let result = registry.unsubscribe(alice()).await;
    assert!(matches!(result, Err(ClientError::NotFound(_))));
}

#[tokio::test]
async fn test_remove_subscriber_waits_out_creation() {
    let factory = MockPeerConnectionFactory::new();
    factory.hold_creations();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.ensure_connection(alice()).await }
    });
    factory.wait_for_started(1).await;

    registry.remove_subscriber(alice()).await.unwrap();
    let status = registry.status().await.unwrap();
    assert_eq!(status.entry(&alice()).unwrap().slot, SlotKind::Creating);

    factory.release_creations();
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::Connection(_))));

    let mock = factory.wait_for_created(1, PeerRole::Subscriber).await;
    wait_for(|| mock.is_closed(), "discarded peer close").await;
    wait_for_status(&registry, |s| s.entries.is_empty()).await;
}

#[tokio::test]
async fn test_ensure_after_remove_keeps_the_creation() {
    let factory = MockPeerConnectionFactory::new();
    factory.hold_creations();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    let first = tokio::spawn({
        let registry = registry.clone();
        async move { registry.ensure_connection(alice()).await }
    });
    factory.wait_for_started(1).await;
    registry.remove_subscriber(alice()).await.unwrap();

    let second = tokio::spawn({
        let registry = registry.clone();
        async move { registry.ensure_connection(alice()).await }
    });
    // Let the second request join the pending creation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    factory.release_creations();

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(factory.creations_started(), 1);
}

// ============================================================================
// Quality reservations
// ============================================================================

#[tokio::test]
async fn test_reservations_drive_subscription_quality() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, mut outbound) = spawn_test_registry(factory.clone());

    registry
        .update_participant(participant("alice", Some(published_state(QualitySetting::High)), None))
        .await
        .unwrap();
    // Published but unwatched: nothing to connect yet.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(factory.creations_started(), 0);

    registry
        .request_quality(alice(), QualitySetting::Low, ConsumerRef::from("tile-1"))
        .await
        .unwrap();
    registry
        .request_quality(alice(), QualitySetting::High, ConsumerRef::from("tile-2"))
        .await
        .unwrap();
    assert_eq!(
        registry.effective_target(alice()).await.unwrap(),
        QualitySetting::High
    );

    let subscribe = next_matching(&mut outbound, |a| {
        matches!(a, ClientMediaAction::Subscribe { .. })
    })
    .await;
    assert_eq!(
        subscribe,
        ClientMediaAction::Subscribe {
            target: "alice".into(),
            media_session_type: MediaKind::Video,
        }
    );

    let high = next_matching(&mut outbound, |a| configure_of(a).is_some()).await;
    assert_eq!(configure_of(&high).unwrap().substream, Some(2));

    registry
        .release_quality(ConsumerRef::from("tile-2"))
        .await
        .unwrap();
    assert_eq!(
        registry.effective_target(alice()).await.unwrap(),
        QualitySetting::Low
    );
    let low = next_matching(&mut outbound, |a| configure_of(a).is_some()).await;
    assert_eq!(configure_of(&low).unwrap().substream, Some(0));
    assert_eq!(factory.creations_started(), 1);
}

#[tokio::test]
async fn test_moving_a_consumer_releases_its_old_reservation() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, mut outbound) = spawn_test_registry(factory.clone());
    let bob = descriptor("bob", MediaKind::Video);

    for id in ["alice", "bob"] {
        registry
            .update_participant(participant(id, Some(published_state(QualitySetting::High)), None))
            .await
            .unwrap();
    }
    registry
        .request_quality(alice(), QualitySetting::Low, ConsumerRef::from("tile-1"))
        .await
        .unwrap();
    registry
        .request_quality(alice(), QualitySetting::High, ConsumerRef::from("tile-2"))
        .await
        .unwrap();
    let high = next_matching(&mut outbound, configure_for("alice")).await;
    assert_eq!(configure_of(&high).unwrap().substream, Some(2));

    // tile-2 now watches bob instead.
    registry
        .request_quality(bob.clone(), QualitySetting::High, ConsumerRef::from("tile-2"))
        .await
        .unwrap();

    assert_eq!(
        registry.effective_target(alice()).await.unwrap(),
        QualitySetting::Low
    );
    assert_eq!(
        registry.effective_target(bob).await.unwrap(),
        QualitySetting::High
    );
    let low = next_matching(&mut outbound, configure_for("alice")).await;
    assert_eq!(configure_of(&low).unwrap().substream, Some(0));
    assert_eq!(registry.status().await.unwrap().reservations, 2);
}

#[tokio::test]
async fn test_reservation_waits_for_publisher() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    registry
        .request_quality(alice(), QualitySetting::Medium, ConsumerRef::from("tile"))
        .await
        .unwrap();
    let status = registry.status().await.unwrap();
    let entry = status.entry(&alice()).unwrap();
    assert_eq!(entry.slot, SlotKind::Idle);
    assert_eq!(entry.effective_target, QualitySetting::Medium);

    registry
        .update_participant(participant("alice", Some(published_state(QualitySetting::High)), None))
        .await
        .unwrap();
    factory.wait_for_created(1, PeerRole::Subscriber).await;
    wait_for_status(&registry, |s| {
        s.entry(&alice()).is_some_and(|e| e.slot == SlotKind::Ready)
    })
    .await;
}

#[tokio::test]
async fn test_releasing_last_reservation_of_unknown_media_drops_entry() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, _outbound) = spawn_test_registry(factory);

    registry
        .request_quality(alice(), QualitySetting::High, ConsumerRef::from("tile"))
        .await
        .unwrap();
    assert_eq!(registry.status().await.unwrap().entries.len(), 1);

    registry.release_quality(ConsumerRef::from("tile")).await.unwrap();
    let status = registry.status().await.unwrap();
    assert!(status.entries.is_empty());
    assert_eq!(status.reservations, 0);
}

// ============================================================================
// Roster
// ============================================================================

#[tokio::test]
async fn test_publisher_stop_closes_subscriber_and_republish_recreates() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    registry
        .update_participant(participant("alice", Some(published_state(QualitySetting::High)), None))
        .await
        .unwrap();
    registry
        .request_quality(alice(), QualitySetting::High, ConsumerRef::from("tile"))
        .await
        .unwrap();
    let first = factory.wait_for_created(1, PeerRole::Subscriber).await;

    registry
        .update_participant(participant("alice", None, None))
        .await
        .unwrap();
    wait_for(|| first.is_closed(), "subscriber close").await;
    let status = wait_for_status(&registry, |s| {
        s.entry(&alice()).is_some_and(|e| e.slot == SlotKind::Idle)
    })
    .await;
    assert_eq!(status.reservations, 1);

    registry
        .update_participant(participant("alice", Some(published_state(QualitySetting::Low)), None))
        .await
        .unwrap();
    let second = factory.wait_for_created(2, PeerRole::Subscriber).await;
    assert!(!second.is_closed());
}

#[tokio::test]
async fn test_remove_participant_closes_its_subscribers() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    let screen = descriptor("alice", MediaKind::Screen);
    registry.ensure_connection(alice()).await.unwrap();
    registry.ensure_connection(screen.clone()).await.unwrap();
    registry
        .ensure_connection(descriptor("bob", MediaKind::Video))
        .await
        .unwrap();

    registry.remove_participant("alice".into()).await.unwrap();

    let status = wait_for_status(&registry, |s| s.entries.len() == 1).await;
    assert!(status.entry(&alice()).is_none());
    assert!(status.entry(&screen).is_none());
    wait_for(
        || factory.created().iter().filter(|m| m.is_closed()).count() == 2,
        "alice's connections to close",
    )
    .await;
}

#[tokio::test]
async fn test_local_participant_roster_is_ignored() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    registry
        .update_participant(participant("me", Some(published_state(QualitySetting::High)), None))
        .await
        .unwrap();

    assert!(registry.status().await.unwrap().entries.is_empty());
}

// ============================================================================
// Media routing
// ============================================================================

#[tokio::test]
async fn test_server_offer_is_answered_by_subscriber() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, mut outbound) = spawn_test_registry(factory.clone());
    registry.ensure_connection(alice()).await.unwrap();

    registry
        .route_media(ServerMediaAction::SdpOffer {
            target: Some("alice".into()),
            media_session_type: MediaKind::Video,
            sdp: "v=0 remote-offer".to_string(),
        })
        .await
        .unwrap();

    let answer = next_matching(&mut outbound, |a| {
        matches!(a, ClientMediaAction::SdpAnswer { .. })
    })
    .await;
    let ClientMediaAction::SdpAnswer { target, sdp, .. } = answer else {
        unreachable!("filtered above");
    };
    assert_eq!(target.as_str(), "alice");
    assert_eq!(sdp, "v=0 mock-answer-1");

    let mock = factory.last(PeerRole::Subscriber).unwrap();
    assert_eq!(mock.record().remote_descriptions.len(), 1);
}

#[tokio::test]
async fn test_webrtc_up_is_reported_for_current_connection() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, mut events, _outbound) = spawn_test_registry(factory);
    registry.ensure_connection(alice()).await.unwrap();

    registry
        .route_media(ServerMediaAction::WebrtcUp {
            target: Some("alice".into()),
            media_session_type: MediaKind::Video,
        })
        .await
        .unwrap();

    let event = next_matching(&mut events, |e| matches!(e, RegistryEvent::ConnectionUp(_))).await;
    assert_eq!(event, RegistryEvent::ConnectionUp(alice()));
}

#[tokio::test]
async fn test_media_for_unknown_connection_is_dropped() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    registry
        .route_media(ServerMediaAction::SdpOffer {
            target: Some("carol".into()),
            media_session_type: MediaKind::Video,
            sdp: "v=0".to_string(),
        })
        .await
        .unwrap();

    assert!(registry.status().await.unwrap().entries.is_empty());
    assert_eq!(factory.creations_started(), 0);
}

#[tokio::test]
async fn test_slow_uplink_lowers_publish_limit() {
    let factory = MockPeerConnectionFactory::new();
    let mut config = test_registry_config();
    config.publisher_backoff = BackoffConfig {
        base_interval: Duration::from_secs(30),
        max_interval: Duration::from_secs(120),
        ..BackoffConfig::publisher()
    };
    let (registry, _events, _outbound) = spawn_registry_with(config, factory);

    registry
        .route_media(ServerMediaAction::WebrtcSlow {
            target: None,
            media_session_type: MediaKind::Video,
            direction: SlowLinkDirection::Upstream,
        })
        .await
        .unwrap();

    wait_for_status(&registry, |s| s.publish_limit == QualitySetting::Medium).await;
}

// ============================================================================
// Statistics and resume
// ============================================================================

#[tokio::test]
async fn test_stats_are_aggregated_by_direction() {
    let factory = MockPeerConnectionFactory::new();
    let mut config = test_registry_config();
    config.stats_interval = Duration::from_millis(50);
    let (registry, mut events, _outbound) = spawn_registry_with(config, factory.clone());

    registry.ensure_connection(alice()).await.unwrap();
    let mock = factory.last(PeerRole::Subscriber).unwrap();
    mock.set_stats(TransportStats {
        bytes_received: 10_000,
        packets_received: 90,
        packets_lost: 10,
        ..TransportStats::default()
    });

    let event = next_matching(&mut events, |e| {
        matches!(e, RegistryEvent::Stats(s) if s.packets_received > 0)
    })
    .await;
    let RegistryEvent::Stats(summary) = event else {
        unreachable!("filtered above");
    };
    assert_eq!(summary.connections, 1);
    assert_eq!(summary.packets_sent, 0);
    assert_eq!(summary.downstream_packets_lost, 10);
    assert!((summary.downstream_loss() - 0.1).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_close_connections_then_resume_recreates_watched_media() {
    let factory = MockPeerConnectionFactory::new();
    let (registry, _events, _outbound) = spawn_test_registry(factory.clone());

    registry
        .update_participant(participant("alice", Some(published_state(QualitySetting::High)), None))
        .await
        .unwrap();
    registry
        .request_quality(alice(), QualitySetting::High, ConsumerRef::from("tile"))
        .await
        .unwrap();
    registry.publish(MediaKind::Video, camera_stream()).await.unwrap();
    wait_for_status(&registry, |s| {
        s.entries.len() == 2 && s.entries.iter().all(|e| e.slot == SlotKind::Ready)
    })
    .await;

    registry.close_connections().await.unwrap();
    assert!(factory.created().iter().all(|m| m.is_closed()));
    let status = registry.status().await.unwrap();
    assert_eq!(status.publications, vec![MediaKind::Video]);
    assert_eq!(status.reservations, 1);
    assert!(status.entries.iter().all(|e| e.slot == SlotKind::Idle));

    registry.resume().await.unwrap();
    factory.wait_for_created(4, PeerRole::Subscriber).await;
    wait_for_status(&registry, |s| {
        s.entries.len() == 2 && s.entries.iter().all(|e| e.slot == SlotKind::Ready)
    })
    .await;
}
