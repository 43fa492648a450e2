//! Common data types for the conference client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a conference participant, as assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Kind of media a participant can publish.
///
/// Serialized as the wire `mediaSessionType` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Camera and microphone.
    Video,
    /// Screen share.
    Screen,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Screen => "screen",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of one media stream: who publishes it and which kind it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    pub participant_id: ParticipantId,
    pub kind: MediaKind,
}

impl MediaDescriptor {
    #[must_use]
    pub fn new(participant_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            participant_id: ParticipantId::new(participant_id),
            kind,
        }
    }

    /// Canonical map key for this descriptor.
    #[must_use]
    pub fn media_id(&self) -> MediaId {
        MediaId(format!("{}/{}", self.participant_id, self.kind))
    }
}

impl fmt::Display for MediaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.participant_id, self.kind)
    }
}

/// Canonical `participantId/mediaKind` key derived from a [`MediaDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaId(String);

impl MediaId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&MediaDescriptor> for MediaId {
    fn from(descriptor: &MediaDescriptor) -> Self {
        descriptor.media_id()
    }
}

/// Ordered video quality level.
///
/// The derived ordering is `Off < Low < Medium < High`, so the quality a
/// connection actually uses is `min(target, limit)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QualitySetting {
    Off,
    Low,
    Medium,
    #[default]
    High,
}

impl QualitySetting {
    /// All settings, lowest first.
    pub const ALL: [QualitySetting; 4] = [
        QualitySetting::Off,
        QualitySetting::Low,
        QualitySetting::Medium,
        QualitySetting::High,
    ];

    /// One stage lower, saturating at `Off`.
    #[must_use]
    pub fn lower(self) -> Self {
        match self {
            QualitySetting::Off | QualitySetting::Low => QualitySetting::Off,
            QualitySetting::Medium => QualitySetting::Low,
            QualitySetting::High => QualitySetting::Medium,
        }
    }

    /// One stage higher, saturating at `High`.
    #[must_use]
    pub fn raise(self) -> Self {
        match self {
            QualitySetting::Off => QualitySetting::Low,
            QualitySetting::Low => QualitySetting::Medium,
            QualitySetting::Medium | QualitySetting::High => QualitySetting::High,
        }
    }

    /// Simulcast substream index the server should forward, `None` when off.
    #[must_use]
    pub fn substream(self) -> Option<u8> {
        match self {
            QualitySetting::Off => None,
            QualitySetting::Low => Some(0),
            QualitySetting::Medium => Some(1),
            QualitySetting::High => Some(2),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QualitySetting::Off => "off",
            QualitySetting::Low => "low",
            QualitySetting::Medium => "medium",
            QualitySetting::High => "high",
        }
    }
}

impl fmt::Display for QualitySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
