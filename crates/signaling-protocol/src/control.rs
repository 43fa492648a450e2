//! Control namespace actions: roster changes and admission.

use crate::media::MediaSessionState;
use common::types::{MediaKind, ParticipantId};
use serde::{Deserialize, Serialize};

/// Media sessions a participant currently publishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSessions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaSessionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<MediaSessionState>,
}

/// A participant as announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub media_sessions: MediaSessions,
}

impl Participant {
    #[must_use]
    pub fn media_state(&self, kind: MediaKind) -> Option<&MediaSessionState> {
        match kind {
            MediaKind::Video => self.media_sessions.video.as_ref(),
            MediaKind::Screen => self.media_sessions.screen.as_ref(),
        }
    }
}

/// Control actions the session orchestrator acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlAction {
    ParticipantJoined {
        participant: Participant,
    },
    ParticipantUpdated {
        participant: Participant,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    JoinBlocked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Control actions the orchestrator recognizes.
pub const HANDLED_CONTROL_ACTIONS: [&str; 4] = [
    "participant_joined",
    "participant_updated",
    "participant_left",
    "join_blocked",
];

/// A decoded inbound control payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundControl {
    Handled(ControlAction),
    Passthrough(serde_json::Value),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::QualitySetting;
    use serde_json::json;

    #[test]
    fn test_participant_joined_parses_media_sessions() {
        let action: ControlAction = serde_json::from_value(json!({
            "action": "participant_joined",
            "participant": {
                "id": "alice",
                "displayName": "Alice",
                "mediaSessions": {
                    "video": { "audioEnabled": true, "videoEnabled": true, "quality": "high" }
                }
            }
        }))
        .unwrap();

        let ControlAction::ParticipantJoined { participant } = action else {
            unreachable!("parsed wrong variant");
        };
        let video = participant.media_state(MediaKind::Video).unwrap();
        assert!(video.video_enabled);
        assert_eq!(video.quality, QualitySetting::High);
        assert!(participant.media_state(MediaKind::Screen).is_none());
    }

    #[test]
    fn test_participant_without_sessions_defaults() {
        let participant: Participant = serde_json::from_value(json!({ "id": "dave" })).unwrap();
        assert_eq!(participant.media_sessions, MediaSessions::default());
    }

    #[test]
    fn test_participant_left_uses_camel_case() {
        let action: ControlAction = serde_json::from_value(json!({
            "action": "participant_left",
            "participantId": "erin"
        }))
        .unwrap();
        assert_eq!(
            action,
            ControlAction::ParticipantLeft {
                participant_id: ParticipantId::from("erin")
            }
        );
    }

    #[test]
    fn test_join_blocked_reason_optional() {
        let action: ControlAction =
            serde_json::from_value(json!({ "action": "join_blocked" })).unwrap();
        assert_eq!(action, ControlAction::JoinBlocked { reason: None });
    }
}
