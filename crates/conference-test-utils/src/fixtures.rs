//! Test fixtures: ICE sources, roster entries, local streams, and room API
//! mocks.

use async_trait::async_trait;
use common::types::{MediaDescriptor, MediaKind, ParticipantId, QualitySetting};
use conference_client::connection::{LocalStream, LocalTrack, PeerConnectionFactory};
use conference_client::quality::BackoffConfig;
use conference_client::registry::{
    ConnectionRegistry, RegistryConfig, RegistryEvent, RegistryHandle, RegistryStatus,
};
use conference_client::turn::{IceServer, IceServerSource};
use serde_json::json;
use signaling_protocol::control::{MediaSessions, Participant};
use signaling_protocol::media::{ClientMediaAction, MediaSessionState, TrackKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Fixed ICE server list.
#[derive(Debug, Clone, Default)]
pub struct StaticIceServers(pub Vec<IceServer>);

impl StaticIceServers {
    #[must_use]
    pub fn stun_only() -> Arc<Self> {
        Arc::new(Self(vec![IceServer::stun("stun:stun.test:3478")]))
    }
}

#[async_trait]
impl IceServerSource for StaticIceServers {
    async fn ice_servers(&self) -> Vec<IceServer> {
        self.0.clone()
    }
}

/// Media session state with audio and video on at `quality`.
#[must_use]
pub fn published_state(quality: QualitySetting) -> MediaSessionState {
    MediaSessionState {
        audio_enabled: true,
        video_enabled: quality > QualitySetting::Off,
        quality,
    }
}

/// Roster entry for `id` with the given session states.
#[must_use]
pub fn participant(
    id: &str,
    video: Option<MediaSessionState>,
    screen: Option<MediaSessionState>,
) -> Participant {
    Participant {
        id: ParticipantId::new(id),
        display_name: Some(id.to_string()),
        media_sessions: MediaSessions { video, screen },
    }
}

#[must_use]
pub fn descriptor(id: &str, kind: MediaKind) -> MediaDescriptor {
    MediaDescriptor::new(id, kind)
}

/// Camera stream with one audio and one video track.
#[must_use]
pub fn camera_stream() -> LocalStream {
    LocalStream {
        audio: Some(LocalTrack::new("mic-1", TrackKind::Audio, "Microphone")),
        video: Some(LocalTrack::new("cam-1", TrackKind::Video, "Camera")),
    }
}

/// Registry tuning with short timers for tests.
#[must_use]
pub fn test_registry_config() -> RegistryConfig {
    let backoff = BackoffConfig {
        min_quality: QualitySetting::Low,
        base_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(2),
        lock_interval: None,
    };
    RegistryConfig {
        local_participant: ParticipantId::new("me"),
        stats_interval: Duration::from_secs(3600),
        max_publish_bitrate_bps: 1_000_000,
        publisher_backoff: backoff.clone(),
        subscriber_backoff: backoff,
        quality_debounce: Duration::from_millis(20),
        quality_debounce_max_wait: Duration::from_millis(60),
        ..RegistryConfig::default()
    }
}

/// A registry over `factory` with static ICE servers.
#[must_use]
pub fn spawn_test_registry(
    factory: Arc<dyn PeerConnectionFactory>,
) -> (
    RegistryHandle,
    mpsc::UnboundedReceiver<RegistryEvent>,
    mpsc::UnboundedReceiver<ClientMediaAction>,
) {
    spawn_registry_with(test_registry_config(), factory)
}

#[must_use]
pub fn spawn_registry_with(
    config: RegistryConfig,
    factory: Arc<dyn PeerConnectionFactory>,
) -> (
    RegistryHandle,
    mpsc::UnboundedReceiver<RegistryEvent>,
    mpsc::UnboundedReceiver<ClientMediaAction>,
) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (handle, events, _task) = ConnectionRegistry::spawn(
        config,
        factory,
        StaticIceServers::stun_only(),
        outbound_tx,
        CancellationToken::new(),
    );
    (handle, events, outbound_rx)
}

/// Mount `start`, `start_invited` and `turn` responses on a room API mock.
pub async fn mount_room_api(server: &MockServer, ticket: &str, participant_id: &str) {
    Mock::given(method("POST"))
        .and(path_regex(r"^/v1/rooms/[^/]+/start(_invited)?$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ticket": ticket,
            "resumption": format!("resume-{ticket}"),
            "participantId": participant_id,
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/v1/turn$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "uris": ["stun:stun.test:3478"] }
        ])))
        .mount(server)
        .await;
}

/// Wait for the next event matching `predicate`, skipping others.
///
/// # Panics
///
/// Panics if the channel closes or nothing matches within five seconds.
pub async fn next_matching<T: std::fmt::Debug>(
    events: &mut mpsc::UnboundedReceiver<T>,
    mut predicate: impl FnMut(&T) -> bool,
) -> T {
    let search = async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), search)
        .await
        .expect("timed out waiting for event")
}

/// Poll the registry until its status satisfies `check`.
///
/// # Panics
///
/// Panics if the registry stops or the status never matches within five
/// seconds.
pub async fn wait_for_status(
    registry: &RegistryHandle,
    mut check: impl FnMut(&RegistryStatus) -> bool,
) -> RegistryStatus {
    let polling = async {
        loop {
            let status = registry.status().await.expect("registry stopped");
            if check(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), polling)
        .await
        .expect("registry status never matched")
}
