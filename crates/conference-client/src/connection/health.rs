//! Subscriber stream health.
//!
//! Health is a pure function of what the publisher declared, what the peer
//! connection reports, and what the remote tracks look like. The subscriber
//! recomputes it after every relevant change and reports transitions only.

use super::peer::PeerConnectionState;
use common::types::QualitySetting;
use signaling_protocol::media::{MediaSessionState, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamHealth {
    /// Nothing is published for this stream.
    #[default]
    Offline,
    Ok,
    /// Both audio and video are expected but missing.
    Broken,
    AudioBroken,
    VideoBroken,
    /// The media path is down (or not up yet).
    Disconnected,
    Failed,
}

impl StreamHealth {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StreamHealth::Offline => "offline",
            StreamHealth::Ok => "ok",
            StreamHealth::Broken => "broken",
            StreamHealth::AudioBroken => "audio_broken",
            StreamHealth::VideoBroken => "video_broken",
            StreamHealth::Disconnected => "disconnected",
            StreamHealth::Failed => "failed",
        }
    }
}

/// Liveness of one remote track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackLiveness {
    pub present: bool,
    pub muted: bool,
    pub ended: bool,
    /// Last `media_status` from the server; `true` until told otherwise.
    pub server_receiving: bool,
}

impl TrackLiveness {
    #[must_use]
    pub fn absent() -> Self {
        Self {
            present: false,
            muted: false,
            ended: false,
            server_receiving: true,
        }
    }

    fn is_live(self) -> bool {
        self.present && !self.muted && !self.ended && self.server_receiving
    }
}

/// Everything stream health depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthInputs {
    pub declared: Option<MediaSessionState>,
    pub peer_state: PeerConnectionState,
    pub up: bool,
    pub applied_quality: QualitySetting,
    pub audio: TrackLiveness,
    pub video: TrackLiveness,
}

impl HealthInputs {
    #[must_use]
    pub fn new() -> Self {
        Self {
            declared: None,
            peer_state: PeerConnectionState::New,
            up: false,
            applied_quality: QualitySetting::Off,
            audio: TrackLiveness::absent(),
            video: TrackLiveness::absent(),
        }
    }

    pub fn track_mut(&mut self, kind: TrackKind) -> &mut TrackLiveness {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }
}

impl Default for HealthInputs {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use]
pub fn compute_health(inputs: &HealthInputs) -> StreamHealth {
    let Some(declared) = inputs.declared.filter(MediaSessionState::is_published) else {
        return StreamHealth::Offline;
    };

    match inputs.peer_state {
        PeerConnectionState::Failed => return StreamHealth::Failed,
        PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
            return StreamHealth::Disconnected
        }
        _ => {}
    }

    if !inputs.up {
        return StreamHealth::Disconnected;
    }

    // Video is only expected while we actually receive a layer of it.
    let expect_video = declared.video_enabled && inputs.applied_quality > QualitySetting::Off;
    let audio_broken = declared.audio_enabled && !inputs.audio.is_live();
    let video_broken = expect_video && !inputs.video.is_live();

    match (audio_broken, video_broken) {
        (true, true) => StreamHealth::Broken,
        (true, false) => StreamHealth::AudioBroken,
        (false, true) => StreamHealth::VideoBroken,
        (false, false) => StreamHealth::Ok,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn live() -> TrackLiveness {
        TrackLiveness {
            present: true,
            ..TrackLiveness::absent()
        }
    }

    fn healthy() -> HealthInputs {
        HealthInputs {
            declared: Some(MediaSessionState {
                audio_enabled: true,
                video_enabled: true,
                quality: QualitySetting::High,
            }),
            peer_state: PeerConnectionState::Connected,
            up: true,
            applied_quality: QualitySetting::High,
            audio: live(),
            video: live(),
        }
    }

    #[test]
    fn test_healthy_stream_is_ok() {
        assert_eq!(compute_health(&healthy()), StreamHealth::Ok);
    }

    #[test]
    fn test_unpublished_is_offline() {
        let mut inputs = healthy();
        inputs.declared = Some(MediaSessionState::default());
        assert_eq!(compute_health(&inputs), StreamHealth::Offline);
        inputs.declared = None;
        assert_eq!(compute_health(&inputs), StreamHealth::Offline);
    }

    #[test]
    fn test_peer_state_dominates_tracks() {
        let mut inputs = healthy();
        inputs.audio.muted = true;
        inputs.peer_state = PeerConnectionState::Failed;
        assert_eq!(compute_health(&inputs), StreamHealth::Failed);
        inputs.peer_state = PeerConnectionState::Disconnected;
        assert_eq!(compute_health(&inputs), StreamHealth::Disconnected);
    }

    #[test]
    fn test_not_up_is_disconnected() {
        let mut inputs = healthy();
        inputs.up = false;
        assert_eq!(compute_health(&inputs), StreamHealth::Disconnected);
    }

    #[test]
    fn test_track_breakage() {
        let mut inputs = healthy();
        inputs.audio.muted = true;
        assert_eq!(compute_health(&inputs), StreamHealth::AudioBroken);

        inputs.video.ended = true;
        assert_eq!(compute_health(&inputs), StreamHealth::Broken);

        inputs.audio.muted = false;
        assert_eq!(compute_health(&inputs), StreamHealth::VideoBroken);
    }

    #[test]
    fn test_server_not_receiving_breaks_track() {
        let mut inputs = healthy();
        inputs.video.server_receiving = false;
        assert_eq!(compute_health(&inputs), StreamHealth::VideoBroken);
    }

    #[test]
    fn test_video_not_expected_at_quality_off() {
        let mut inputs = healthy();
        inputs.video = TrackLiveness::absent();
        inputs.applied_quality = QualitySetting::Off;
        assert_eq!(compute_health(&inputs), StreamHealth::Ok);
    }
}
