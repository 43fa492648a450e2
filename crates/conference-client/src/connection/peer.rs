//! Native peer connection seam.
//!
//! The conference client never talks to a media engine directly. A
//! [`PeerConnectionFactory`] hands out [`PeerConnection`] objects plus a
//! stream of [`PeerEvent`]s; production embeds a real engine, tests use the
//! mocks in `conference-test-utils`.

use crate::errors::ClientError;
use crate::turn::IceServer;
use async_trait::async_trait;
use signaling_protocol::media::{IceCandidate, TrackKind};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which side of the media exchange a peer connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    Publisher,
    Subscriber,
}

impl PeerRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Publisher => "publisher",
            PeerRole::Subscriber => "subscriber",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// ICE/DTLS connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A local capture track (or a generated placeholder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
    pub enabled: bool,
    /// Generated blank track used to park a sender.
    pub placeholder: bool,
}

impl LocalTrack {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            enabled: true,
            placeholder: false,
        }
    }

    /// Blank track that keeps a sender's encodings alive while parked.
    #[must_use]
    pub fn placeholder(kind: TrackKind) -> Self {
        Self {
            id: format!("placeholder-{}", uuid::Uuid::new_v4()),
            kind,
            label: "placeholder".to_string(),
            enabled: true,
            placeholder: true,
        }
    }
}

/// The local media handed to `publish`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalStream {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl LocalStream {
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn track_mut(&mut self, kind: TrackKind) -> &mut Option<LocalTrack> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }
}

/// Parameters of one simulcast encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingParameters {
    pub rid: String,
    pub active: bool,
    pub max_bitrate_bps: u32,
    pub scale_resolution_down_by: f64,
}

/// Cumulative transport counters since the connection was created.
///
/// For a publisher `packets_lost` is the remote-reported loss of sent
/// packets; for a subscriber it is the loss of inbound packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
}

/// A remote track that showed up on a subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub muted: bool,
}

/// Asynchronous notifications from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    IceGatheringComplete,
    ConnectionStateChanged(PeerConnectionState),
    NegotiationNeeded,
    TrackAdded(RemoteTrack),
    TrackMuted(TrackKind),
    TrackUnmuted(TrackKind),
    TrackEnded(TrackKind),
}

/// One native peer connection. Failures are reported as `ClientError::Peer`.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, ClientError>;

    async fn create_answer(&self) -> Result<String, ClientError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), ClientError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), ClientError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), ClientError>;

    /// Add a sending track. One sender per track kind.
    async fn add_track(&self, track: &LocalTrack) -> Result<(), ClientError>;

    /// Swap the track on the sender of `kind`; `None` detaches it.
    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), ClientError>;

    /// Apply simulcast encodings to the video sender.
    async fn set_encodings(&self, encodings: &[EncodingParameters]) -> Result<(), ClientError>;

    async fn stats(&self) -> Result<TransportStats, ClientError>;

    async fn close(&self);
}

/// Receiver of engine events for one peer connection.
pub type PeerEvents = mpsc::Receiver<PeerEvent>;

/// Creates peer connections configured with the given ICE servers.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns `ClientError::Peer` if the engine refuses to create a connection.
    async fn create(
        &self,
        ice_servers: &[IceServer],
        role: PeerRole,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), ClientError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_tracks_are_unique() {
        let a = LocalTrack::placeholder(TrackKind::Video);
        let b = LocalTrack::placeholder(TrackKind::Video);
        assert!(a.placeholder && b.placeholder);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_stream_track_access() {
        let mut stream = LocalStream {
            audio: Some(LocalTrack::new("mic", TrackKind::Audio, "Microphone")),
            video: None,
        };
        assert!(stream.track(TrackKind::Video).is_none());
        *stream.track_mut(TrackKind::Video) =
            Some(LocalTrack::new("cam", TrackKind::Video, "Camera"));
        assert_eq!(stream.track(TrackKind::Video).unwrap().id, "cam");
    }
}
