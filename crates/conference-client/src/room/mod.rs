//! Session orchestrator.
//!
//! [`ConferenceRoom`] owns one room session: it starts it over the room API,
//! connects signaling, routes inbound envelopes to the registry or to the
//! application, writes the registry's outbound media actions to signaling,
//! and rejoins after transport loss.
//!
//! ```text
//! Idle ──join──▶ Joining ──▶ Joined ──disconnected──▶ Rejoining ──▶ Joined
//!                                │                        │
//!                                └──closed / leave────────┴──limit──▶ Closed
//! ```

mod actor;
mod events;

pub use actor::{ConferenceRoom, RoomParts};
pub use events::{RoomEvent, ShutdownReason};

use crate::config::{DEFAULT_MAX_REJOIN_ATTEMPTS, DEFAULT_REJOIN_DELAY_MS};
use crate::connection::{ConnectionHandle, LocalStream, LocalTrack};
use crate::errors::ClientError;
use crate::registry::{ConsumerRef, RegistryHandle};
use crate::signaling::SignalingHandle;
use common::types::{MediaDescriptor, MediaKind, QualitySetting};
use signaling_protocol::media::TrackKind;
use signaling_protocol::Envelope;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Mailbox capacity for room commands.
const ROOM_CHANNEL_BUFFER: usize = 64;

/// First rejoin delay after a transport loss.
pub const DEFAULT_REJOIN_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Cap on the rejoin delay.
pub const DEFAULT_REJOIN_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConfig {
    pub room_id: String,
    /// Join through `start_invited` instead of `start`.
    pub invited: bool,
    /// Wait before retrying after `join_blocked`.
    pub rejoin_delay: Duration,
    pub max_rejoin_attempts: u32,
    pub rejoin_backoff_base: Duration,
    pub rejoin_backoff_max: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            room_id: String::new(),
            invited: false,
            rejoin_delay: Duration::from_millis(DEFAULT_REJOIN_DELAY_MS),
            max_rejoin_attempts: DEFAULT_MAX_REJOIN_ATTEMPTS,
            rejoin_backoff_base: DEFAULT_REJOIN_BACKOFF_BASE,
            rejoin_backoff_max: DEFAULT_REJOIN_BACKOFF_MAX,
        }
    }
}

impl RoomConfig {
    /// Delay before rejoin `attempt` (1-based): `base * 2^(attempt - 1)`,
    /// capped at `rejoin_backoff_max`.
    #[must_use]
    pub fn rejoin_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.rejoin_backoff_base.checked_mul(factor))
            .map_or(self.rejoin_backoff_max, |delay| {
                delay.min(self.rejoin_backoff_max)
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Idle,
    Joining,
    Joined,
    Rejoining,
    Closed,
}

impl RoomState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RoomState::Idle => "idle",
            RoomState::Joining => "joining",
            RoomState::Joined => "joined",
            RoomState::Rejoining => "rejoining",
            RoomState::Closed => "closed",
        }
    }
}

#[derive(Debug)]
pub(crate) enum RoomMessage {
    Join {
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    Leave {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a running room.
///
/// Media operations go straight to the registry; only the session lifecycle
/// passes through the room actor.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    state: watch::Receiver<RoomState>,
    registry: RegistryHandle,
    signaling: SignalingHandle,
    cancel_token: CancellationToken,
}

impl RoomHandle {
    /// Start the room session and connect signaling.
    ///
    /// # Errors
    ///
    /// Returns the room API or signaling error; `ChannelClosed` once the room
    /// has shut down.
    pub async fn join(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Join { respond_to: tx })
            .await
            .map_err(|_| ClientError::ChannelClosed)?;
        rx.await.map_err(|_| ClientError::ChannelClosed)?
    }

    /// Close every connection, disconnect signaling and end the session.
    /// Calling it again is a no-op.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RoomMessage::Leave { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Send an application-level envelope.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` unless signaling is connected.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.signaling.send(envelope).await
    }

    #[must_use]
    pub fn state(&self) -> RoomState {
        *self.state.borrow()
    }

    /// Watch room state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<RoomState> {
        self.state.clone()
    }

    /// The session's connection registry.
    #[must_use]
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// # Errors
    ///
    /// See [`RegistryHandle::publish`].
    pub async fn publish(
        &self,
        kind: MediaKind,
        stream: LocalStream,
    ) -> Result<ConnectionHandle, ClientError> {
        self.registry.publish(kind, stream).await
    }

    /// # Errors
    ///
    /// See [`RegistryHandle::unpublish`].
    pub async fn unpublish(&self, kind: MediaKind) -> Result<(), ClientError> {
        self.registry.unpublish(kind).await
    }

    /// # Errors
    ///
    /// See [`RegistryHandle::set_publish_quality`].
    pub async fn set_publish_quality(
        &self,
        kind: MediaKind,
        quality: QualitySetting,
    ) -> Result<(), ClientError> {
        self.registry.set_publish_quality(kind, quality).await
    }

    /// # Errors
    ///
    /// See [`RegistryHandle::replace_track`].
    pub async fn replace_track(
        &self,
        kind: MediaKind,
        track_kind: TrackKind,
        track: Option<LocalTrack>,
    ) -> Result<(), ClientError> {
        self.registry.replace_track(kind, track_kind, track).await
    }

    /// # Errors
    ///
    /// See [`RegistryHandle::set_track_enabled`].
    pub async fn set_track_enabled(
        &self,
        kind: MediaKind,
        track_kind: TrackKind,
        enabled: bool,
    ) -> Result<(), ClientError> {
        self.registry
            .set_track_enabled(kind, track_kind, enabled)
            .await
    }

    /// # Errors
    ///
    /// See [`RegistryHandle::request_quality`].
    pub async fn request_quality(
        &self,
        descriptor: MediaDescriptor,
        target: QualitySetting,
        consumer: ConsumerRef,
    ) -> Result<(), ClientError> {
        self.registry
            .request_quality(descriptor, target, consumer)
            .await
    }

    /// # Errors
    ///
    /// See [`RegistryHandle::release_quality`].
    pub async fn release_quality(&self, consumer: ConsumerRef) -> Result<(), ClientError> {
        self.registry.release_quality(consumer).await
    }

    /// Stop the room and everything under it without a graceful close.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejoin_backoff_doubles_to_cap() {
        let config = RoomConfig::default();
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| config.rejoin_backoff(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_rejoin_backoff_never_overflows() {
        let config = RoomConfig::default();
        assert_eq!(config.rejoin_backoff(40), DEFAULT_REJOIN_BACKOFF_MAX);
        assert_eq!(config.rejoin_backoff(u32::MAX), DEFAULT_REJOIN_BACKOFF_MAX);
    }

    #[test]
    fn test_config_defaults() {
        let config = RoomConfig::default();
        assert_eq!(config.rejoin_delay, Duration::from_secs(5));
        assert_eq!(config.max_rejoin_attempts, 5);
        assert!(!config.invited);
    }
}
