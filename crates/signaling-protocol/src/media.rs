//! Media namespace actions.
//!
//! Client actions ([`ClientMediaAction`]) drive publishing and subscribing.
//! Of the server actions, only the ones in [`CONSUMED_SERVER_ACTIONS`] are
//! parsed into [`ServerMediaAction`]; everything else (mute requests,
//! presenter grants, errors) is application traffic and stays raw JSON.

use common::types::{MediaKind, ParticipantId, QualitySetting};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server media actions handled by the connection registry.
pub const CONSUMED_SERVER_ACTIONS: [&str; 8] = [
    "sdp_answer",
    "sdp_offer",
    "sdp_candidate",
    "sdp_end_of_candidates",
    "webrtc_up",
    "webrtc_down",
    "webrtc_slow",
    "media_status",
];

/// One ICE candidate as exchanged in `sdp_candidate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    pub candidate: String,
}

/// Published media state: what a publisher is sending and at which quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSessionState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub quality: QualitySetting,
}

impl Default for MediaSessionState {
    fn default() -> Self {
        Self {
            audio_enabled: false,
            video_enabled: false,
            quality: QualitySetting::Off,
        }
    }
}

impl MediaSessionState {
    /// Whether the stream carries anything worth subscribing to.
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.audio_enabled || self.video_enabled
    }
}

/// Which simulcast substream the server should forward to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfiguration {
    pub video: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substream: Option<u8>,
}

impl From<QualitySetting> for StreamConfiguration {
    fn from(quality: QualitySetting) -> Self {
        Self {
            video: quality > QualitySetting::Off,
            substream: quality.substream(),
        }
    }
}

/// Kind of a single media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Direction reported by `webrtc_slow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlowLinkDirection {
    Upstream,
    Downstream,
}

/// Client to server media actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMediaAction {
    Publish {
        target: ParticipantId,
        media_session_type: MediaKind,
        sdp: String,
    },
    PublishComplete {
        target: ParticipantId,
        media_session_type: MediaKind,
        media_session_state: MediaSessionState,
    },
    Unpublish {
        media_session_type: MediaKind,
    },
    Subscribe {
        target: ParticipantId,
        media_session_type: MediaKind,
    },
    SdpAnswer {
        target: ParticipantId,
        media_session_type: MediaKind,
        sdp: String,
    },
    SdpCandidate {
        target: ParticipantId,
        media_session_type: MediaKind,
        candidate: IceCandidate,
    },
    SdpEndOfCandidates {
        target: ParticipantId,
        media_session_type: MediaKind,
    },
    Configure {
        target: ParticipantId,
        media_session_type: MediaKind,
        configuration: StreamConfiguration,
    },
    UpdateMediaSession {
        media_session_type: MediaKind,
        media_session_state: MediaSessionState,
    },
}

impl ClientMediaAction {
    /// Wire name of the action, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientMediaAction::Publish { .. } => "publish",
            ClientMediaAction::PublishComplete { .. } => "publish_complete",
            ClientMediaAction::Unpublish { .. } => "unpublish",
            ClientMediaAction::Subscribe { .. } => "subscribe",
            ClientMediaAction::SdpAnswer { .. } => "sdp_answer",
            ClientMediaAction::SdpCandidate { .. } => "sdp_candidate",
            ClientMediaAction::SdpEndOfCandidates { .. } => "sdp_end_of_candidates",
            ClientMediaAction::Configure { .. } => "configure",
            ClientMediaAction::UpdateMediaSession { .. } => "update_media_session",
        }
    }
}

/// Server to client media actions consumed by the connection registry.
///
/// `target` names the remote publisher for subscriber traffic; it is absent
/// (or the local participant) for the local publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMediaAction {
    SdpAnswer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
        media_session_type: MediaKind,
        sdp: String,
    },
    SdpOffer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
        media_session_type: MediaKind,
        sdp: String,
    },
    SdpCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
        media_session_type: MediaKind,
        candidate: IceCandidate,
    },
    SdpEndOfCandidates {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
        media_session_type: MediaKind,
    },
    WebrtcUp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
        media_session_type: MediaKind,
    },
    WebrtcDown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
        media_session_type: MediaKind,
    },
    WebrtcSlow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
        media_session_type: MediaKind,
        direction: SlowLinkDirection,
    },
    MediaStatus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
        media_session_type: MediaKind,
        kind: TrackKind,
        receiving: bool,
    },
}

impl ServerMediaAction {
    #[must_use]
    pub fn target(&self) -> Option<&ParticipantId> {
        match self {
            ServerMediaAction::SdpAnswer { target, .. }
            | ServerMediaAction::SdpOffer { target, .. }
            | ServerMediaAction::SdpCandidate { target, .. }
            | ServerMediaAction::SdpEndOfCandidates { target, .. }
            | ServerMediaAction::WebrtcUp { target, .. }
            | ServerMediaAction::WebrtcDown { target, .. }
            | ServerMediaAction::WebrtcSlow { target, .. }
            | ServerMediaAction::MediaStatus { target, .. } => target.as_ref(),
        }
    }

    #[must_use]
    pub fn media_kind(&self) -> MediaKind {
        match self {
            ServerMediaAction::SdpAnswer {
                media_session_type, ..
            }
            | ServerMediaAction::SdpOffer {
                media_session_type, ..
            }
            | ServerMediaAction::SdpCandidate {
                media_session_type, ..
            }
            | ServerMediaAction::SdpEndOfCandidates {
                media_session_type, ..
            }
            | ServerMediaAction::WebrtcUp {
                media_session_type, ..
            }
            | ServerMediaAction::WebrtcDown {
                media_session_type, ..
            }
            | ServerMediaAction::WebrtcSlow {
                media_session_type, ..
            }
            | ServerMediaAction::MediaStatus {
                media_session_type, ..
            } => *media_session_type,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerMediaAction::SdpAnswer { .. } => "sdp_answer",
            ServerMediaAction::SdpOffer { .. } => "sdp_offer",
            ServerMediaAction::SdpCandidate { .. } => "sdp_candidate",
            ServerMediaAction::SdpEndOfCandidates { .. } => "sdp_end_of_candidates",
            ServerMediaAction::WebrtcUp { .. } => "webrtc_up",
            ServerMediaAction::WebrtcDown { .. } => "webrtc_down",
            ServerMediaAction::WebrtcSlow { .. } => "webrtc_slow",
            ServerMediaAction::MediaStatus { .. } => "media_status",
        }
    }
}

/// A decoded inbound media payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMedia {
    /// Handled by the connection registry, never re-emitted.
    Consumed(ServerMediaAction),
    /// Application-level action, forwarded unchanged.
    Passthrough(serde_json::Value),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            candidate: "candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host".to_string(),
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_configure_wire_shape() {
        let action = ClientMediaAction::Configure {
            target: ParticipantId::from("bob"),
            media_session_type: MediaKind::Video,
            configuration: StreamConfiguration::from(QualitySetting::Medium),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "configure",
                "target": "bob",
                "mediaSessionType": "video",
                "configuration": { "video": true, "substream": 1 }
            })
        );
    }

    #[test]
    fn test_configure_off_omits_substream() {
        let config = StreamConfiguration::from(QualitySetting::Off);
        let value = serde_json::to_value(config).unwrap();
        assert_eq!(value, json!({ "video": false }));
    }

    #[test]
    fn test_update_media_session_wire_shape() {
        let action = ClientMediaAction::UpdateMediaSession {
            media_session_type: MediaKind::Screen,
            media_session_state: MediaSessionState {
                audio_enabled: false,
                video_enabled: true,
                quality: QualitySetting::Low,
            },
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["action"], "update_media_session");
        assert_eq!(value["mediaSessionState"]["videoEnabled"], true);
        assert_eq!(value["mediaSessionState"]["quality"], "low");
    }

    #[test]
    fn test_server_action_without_target() {
        let action: ServerMediaAction = serde_json::from_value(json!({
            "action": "webrtc_slow",
            "mediaSessionType": "video",
            "direction": "upstream"
        }))
        .unwrap();
        assert_eq!(action.target(), None);
        assert_eq!(action.media_kind(), MediaKind::Video);
        assert_eq!(action.name(), "webrtc_slow");
    }

    #[test]
    fn test_media_status_parses_kind() {
        let action: ServerMediaAction = serde_json::from_value(json!({
            "action": "media_status",
            "target": "carol",
            "mediaSessionType": "screen",
            "kind": "audio",
            "receiving": false
        }))
        .unwrap();
        assert!(matches!(
            action,
            ServerMediaAction::MediaStatus {
                kind: TrackKind::Audio,
                receiving: false,
                ..
            }
        ));
        assert_eq!(action.target(), Some(&ParticipantId::from("carol")));
    }

    #[test]
    fn test_is_published() {
        assert!(!MediaSessionState::default().is_published());
        let state = MediaSessionState {
            audio_enabled: true,
            ..MediaSessionState::default()
        };
        assert!(state.is_published());
    }
}
