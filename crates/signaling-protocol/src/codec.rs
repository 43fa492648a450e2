//! Codec for encoding and decoding signaling envelopes.

use crate::control::{ControlAction, InboundControl, HANDLED_CONTROL_ACTIONS};
use crate::envelope::{Envelope, CONTROL_NAMESPACE, MEDIA_NAMESPACE};
use crate::media::{ClientMediaAction, InboundMedia, ServerMediaAction, CONSUMED_SERVER_ACTIONS};
use serde::Serialize;

/// Error type for codec operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Text frame is not a valid envelope
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Envelope arrived in a different namespace than expected
    #[error("Unexpected namespace: expected {expected}, got {actual}")]
    UnexpectedNamespace {
        expected: &'static str,
        actual: String,
    },

    /// Payload has no string `action` field
    #[error("Missing action")]
    MissingAction,

    /// Payload does not match the shape of its action
    #[error("Invalid payload for {action}: {reason}")]
    InvalidPayload { action: String, reason: String },

    /// Serialization failed
    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Encode an envelope as a WebSocket text frame.
///
/// # Errors
///
/// Returns `CodecError::Encode` if the payload cannot be serialized.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a WebSocket text frame into an envelope.
///
/// # Errors
///
/// Returns `CodecError::InvalidEnvelope` if the text is not an envelope.
pub fn decode_envelope(text: &str) -> Result<Envelope, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::InvalidEnvelope(e.to_string()))
}

/// Wrap a client media action in a timestamped media envelope.
///
/// # Errors
///
/// Returns `CodecError::Encode` if the action cannot be serialized.
pub fn encode_media_action(action: &ClientMediaAction) -> Result<Envelope, CodecError> {
    to_envelope(MEDIA_NAMESPACE, action)
}

/// Wrap a server media action in a media envelope.
///
/// # Errors
///
/// Returns `CodecError::Encode` if the action cannot be serialized.
pub fn encode_server_media_action(action: &ServerMediaAction) -> Result<Envelope, CodecError> {
    to_envelope(MEDIA_NAMESPACE, action)
}

/// Wrap a control action in a control envelope.
///
/// # Errors
///
/// Returns `CodecError::Encode` if the action cannot be serialized.
pub fn encode_control_action(action: &ControlAction) -> Result<Envelope, CodecError> {
    to_envelope(CONTROL_NAMESPACE, action)
}

/// Decode a client media action, as a server (or a test double) would.
///
/// # Errors
///
/// Fails on a non-media namespace or a payload that is not a client action.
pub fn decode_client_media_action(envelope: &Envelope) -> Result<ClientMediaAction, CodecError> {
    expect_namespace(envelope, MEDIA_NAMESPACE)?;
    let action = action_name(envelope)?;
    serde_json::from_value(envelope.payload.clone()).map_err(|e| CodecError::InvalidPayload {
        action: action.to_string(),
        reason: e.to_string(),
    })
}

/// Split an inbound media envelope into consumed and passthrough actions.
///
/// # Errors
///
/// Fails on a non-media namespace, a missing action, or a consumed action
/// whose payload is malformed. Unknown actions are never an error.
pub fn decode_inbound_media(envelope: &Envelope) -> Result<InboundMedia, CodecError> {
    expect_namespace(envelope, MEDIA_NAMESPACE)?;
    let action = action_name(envelope)?;

    if !CONSUMED_SERVER_ACTIONS.contains(&action) {
        return Ok(InboundMedia::Passthrough(envelope.payload.clone()));
    }

    serde_json::from_value(envelope.payload.clone())
        .map(InboundMedia::Consumed)
        .map_err(|e| CodecError::InvalidPayload {
            action: action.to_string(),
            reason: e.to_string(),
        })
}

/// Split an inbound control envelope into handled and passthrough actions.
///
/// # Errors
///
/// Fails on a non-control namespace, a missing action, or a handled action
/// whose payload is malformed.
pub fn decode_inbound_control(envelope: &Envelope) -> Result<InboundControl, CodecError> {
    expect_namespace(envelope, CONTROL_NAMESPACE)?;
    let action = action_name(envelope)?;

    if !HANDLED_CONTROL_ACTIONS.contains(&action) {
        return Ok(InboundControl::Passthrough(envelope.payload.clone()));
    }

    serde_json::from_value(envelope.payload.clone())
        .map(InboundControl::Handled)
        .map_err(|e| CodecError::InvalidPayload {
            action: action.to_string(),
            reason: e.to_string(),
        })
}

fn to_envelope<T: Serialize>(namespace: &str, action: &T) -> Result<Envelope, CodecError> {
    let payload = serde_json::to_value(action).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(Envelope::stamped(namespace, payload))
}

fn expect_namespace(envelope: &Envelope, expected: &'static str) -> Result<(), CodecError> {
    if envelope.namespace == expected {
        Ok(())
    } else {
        Err(CodecError::UnexpectedNamespace {
            expected,
            actual: envelope.namespace.clone(),
        })
    }
}

fn action_name(envelope: &Envelope) -> Result<&str, CodecError> {
    envelope.action().ok_or(CodecError::MissingAction)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{IceCandidate, MediaSessionState, StreamConfiguration};
    use common::types::{MediaKind, ParticipantId, QualitySetting};
    use serde_json::json;

    fn through_the_wire(action: &ClientMediaAction) -> ClientMediaAction {
        let envelope = encode_media_action(action).unwrap();
        let text = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&text).unwrap();
        assert_eq!(decoded, envelope);
        decode_client_media_action(&decoded).unwrap()
    }

    #[test]
    fn test_candidate_round_trip_keeps_nested_fields() {
        let action = ClientMediaAction::SdpCandidate {
            target: ParticipantId::from("alice"),
            media_session_type: MediaKind::Video,
            candidate: IceCandidate {
                sdp_mid: Some("1".to_string()),
                sdp_m_line_index: Some(1),
                candidate: "candidate:842163049 1 udp 1677729535 203.0.113.7 3478 typ srflx"
                    .to_string(),
            },
        };
        assert_eq!(through_the_wire(&action), action);
    }

    #[test]
    fn test_candidate_round_trip_with_absent_mid() {
        let action = ClientMediaAction::SdpCandidate {
            target: ParticipantId::from("alice"),
            media_session_type: MediaKind::Screen,
            candidate: IceCandidate {
                sdp_mid: None,
                sdp_m_line_index: None,
                candidate: String::new(),
            },
        };
        assert_eq!(through_the_wire(&action), action);
    }

    #[test]
    fn test_publish_complete_round_trip() {
        let action = ClientMediaAction::PublishComplete {
            target: ParticipantId::from("bob"),
            media_session_type: MediaKind::Video,
            media_session_state: MediaSessionState {
                audio_enabled: true,
                video_enabled: false,
                quality: QualitySetting::Medium,
            },
        };
        assert_eq!(through_the_wire(&action), action);
    }

    #[test]
    fn test_configure_round_trip() {
        let action = ClientMediaAction::Configure {
            target: ParticipantId::from("bob"),
            media_session_type: MediaKind::Video,
            configuration: StreamConfiguration {
                video: true,
                substream: Some(2),
            },
        };
        assert_eq!(through_the_wire(&action), action);
    }

    #[test]
    fn test_media_envelope_is_stamped() {
        let envelope = encode_media_action(&ClientMediaAction::Unpublish {
            media_session_type: MediaKind::Screen,
        })
        .unwrap();
        assert_eq!(envelope.namespace, "media");
        assert!(envelope.timestamp.is_some());
    }

    #[test]
    fn test_inbound_consumed_action() {
        let envelope = Envelope::new(
            "media",
            json!({ "action": "sdp_offer", "target": "alice", "mediaSessionType": "video", "sdp": "v=0" }),
        );
        let decoded = decode_inbound_media(&envelope).unwrap();
        assert!(matches!(
            decoded,
            InboundMedia::Consumed(ServerMediaAction::SdpOffer { .. })
        ));
    }

    #[test]
    fn test_inbound_unknown_action_passes_through_unchanged() {
        let payload = json!({ "action": "mute_request", "kind": "audio", "from": "host" });
        let envelope = Envelope::new("media", payload.clone());
        assert_eq!(
            decode_inbound_media(&envelope).unwrap(),
            InboundMedia::Passthrough(payload)
        );
    }

    #[test]
    fn test_inbound_malformed_consumed_action_is_error() {
        let envelope = Envelope::new("media", json!({ "action": "sdp_answer" }));
        let err = decode_inbound_media(&envelope).unwrap_err();
        assert!(matches!(err, CodecError::InvalidPayload { ref action, .. } if action == "sdp_answer"));
    }

    #[test]
    fn test_missing_action() {
        let envelope = Envelope::new("control", json!({ "participant": {} }));
        assert_eq!(
            decode_inbound_control(&envelope).unwrap_err(),
            CodecError::MissingAction
        );
    }

    #[test]
    fn test_wrong_namespace() {
        let envelope = Envelope::new("control", json!({ "action": "sdp_offer" }));
        let err = decode_inbound_media(&envelope).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedNamespace {
                expected: "media",
                actual: "control".to_string()
            }
        );
    }

    #[test]
    fn test_control_passthrough_and_handled() {
        let handled = encode_control_action(&ControlAction::JoinBlocked {
            reason: Some("room locked".to_string()),
        })
        .unwrap();
        assert!(matches!(
            decode_inbound_control(&handled).unwrap(),
            InboundControl::Handled(ControlAction::JoinBlocked { .. })
        ));

        let other = Envelope::new("control", json!({ "action": "recording_started" }));
        assert!(matches!(
            decode_inbound_control(&other).unwrap(),
            InboundControl::Passthrough(_)
        ));
    }

    #[test]
    fn test_decode_garbage_text() {
        assert!(matches!(
            decode_envelope("not json"),
            Err(CodecError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", CodecError::MissingAction), "Missing action");
        assert_eq!(
            format!(
                "{}",
                CodecError::InvalidPayload {
                    action: "publish".to_string(),
                    reason: "missing field `sdp`".to_string()
                }
            ),
            "Invalid payload for publish: missing field `sdp`"
        );
    }
}
