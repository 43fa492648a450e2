//! Events the room reports to the application.

use crate::connection::StreamHealth;
use crate::registry::{RegistryEvent, StatsSummary};
use crate::signaling::SignalingState;
use common::types::{MediaDescriptor, ParticipantId};
use serde_json::Value;
use signaling_protocol::control::Participant;
use signaling_protocol::Envelope;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// The room session started (or resumed) and signaling is connected.
    Joined {
        participant_id: Option<ParticipantId>,
        resumed: bool,
    },
    StateChanged(SignalingState),
    /// The server refused admission; a rejoin is scheduled.
    JoinBlocked { reason: Option<String> },
    Rejoining { attempt: u32, delay: Duration },

    /// Media namespace action the registry does not consume.
    Media(Value),
    /// Control namespace action the room does not handle.
    Control(Value),
    /// Any other namespace, unchanged.
    Message(Envelope),

    ParticipantJoined(Participant),
    ParticipantUpdated(Participant),
    ParticipantLeft(ParticipantId),

    ConnectionUp(MediaDescriptor),
    ConnectionDown(MediaDescriptor),
    StreamHealthChanged {
        descriptor: MediaDescriptor,
        health: StreamHealth,
    },
    ConnectionClosed(MediaDescriptor),
    Stats(StatsSummary),

    /// Emitted exactly once; nothing follows it.
    Shutdown(ShutdownReason),
}

impl From<RegistryEvent> for RoomEvent {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::ConnectionUp(descriptor) => RoomEvent::ConnectionUp(descriptor),
            RegistryEvent::ConnectionDown(descriptor) => RoomEvent::ConnectionDown(descriptor),
            RegistryEvent::StreamHealthChanged { descriptor, health } => {
                RoomEvent::StreamHealthChanged { descriptor, health }
            }
            RegistryEvent::ConnectionClosed(descriptor) => RoomEvent::ConnectionClosed(descriptor),
            RegistryEvent::Stats(summary) => RoomEvent::Stats(summary),
        }
    }
}

/// Why a room session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `leave()` was called.
    Left,
    /// The server closed signaling normally.
    Closed,
    /// Every rejoin attempt failed.
    RejoinFailed,
}

impl ShutdownReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownReason::Left => "left",
            ShutdownReason::Closed => "closed",
            ShutdownReason::RejoinFailed => "rejoin_failed",
        }
    }
}
