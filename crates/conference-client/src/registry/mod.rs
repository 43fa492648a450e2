//! Connection registry.
//!
//! The registry is the single owner of every publisher and subscriber in a
//! session. It maps each media (`participantId/kind`) to at most one
//! connection and mediates every race around creating and tearing them
//! down:
//!
//! - creation is single-flight: concurrent requests for the same media wait
//!   on the same creation and observe the same [`ConnectionHandle`]
//! - a direct [`RegistryHandle::unsubscribe`] during creation is rejected;
//!   [`RegistryHandle::remove_subscriber`] defers until creation settles
//! - quality reservations from many consumers are consolidated per media
//! - a statistics loop aggregates transport stats and drives the shared
//!   publisher backoff controller

mod actor;
mod entry;

pub use actor::ConnectionRegistry;
pub use entry::{ConsumerRef, SlotKind};

use crate::config::{DEFAULT_MAX_PUBLISH_BITRATE_BPS, DEFAULT_STATS_INTERVAL_MS};
use crate::connection::{
    ratio, ConnectionHandle, ConnectionId, LocalStream, LocalTrack, PeerRole, StatsSample,
    StreamHealth,
};
use crate::connection::subscriber::{DEFAULT_QUALITY_DEBOUNCE, DEFAULT_QUALITY_DEBOUNCE_MAX_WAIT};
use crate::errors::ClientError;
use crate::quality::BackoffConfig;
use common::types::{MediaDescriptor, MediaId, MediaKind, ParticipantId, QualitySetting};
use signaling_protocol::control::Participant;
use signaling_protocol::media::{MediaSessionState, ServerMediaAction, TrackKind};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Mailbox capacity for registry commands.
const REGISTRY_CHANNEL_BUFFER: usize = 256;

/// Aggregate upstream loss above which the publisher backs off.
///
/// Half the subscriber threshold: uplink loss is only seen through remote
/// reports, so it is acted on earlier.
pub const DEFAULT_UPSTREAM_LOSS_THRESHOLD: f64 = 0.025;

/// Placeholder identity of the local participant until the room API
/// assigns one.
pub const DEFAULT_LOCAL_PARTICIPANT: &str = "local";

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Identity used for the local publishers' descriptors and for matching
    /// server media actions addressed to us.
    pub local_participant: ParticipantId,
    pub stats_interval: Duration,
    pub max_publish_bitrate_bps: u32,
    pub publisher_backoff: BackoffConfig,
    pub subscriber_backoff: BackoffConfig,
    pub upstream_loss_threshold: f64,
    pub quality_debounce: Duration,
    pub quality_debounce_max_wait: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            local_participant: ParticipantId::new(DEFAULT_LOCAL_PARTICIPANT),
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            max_publish_bitrate_bps: DEFAULT_MAX_PUBLISH_BITRATE_BPS,
            publisher_backoff: BackoffConfig::publisher(),
            subscriber_backoff: BackoffConfig::subscriber(),
            upstream_loss_threshold: DEFAULT_UPSTREAM_LOSS_THRESHOLD,
            quality_debounce: DEFAULT_QUALITY_DEBOUNCE,
            quality_debounce_max_wait: DEFAULT_QUALITY_DEBOUNCE_MAX_WAIT,
        }
    }
}

/// Events the registry reports to the room.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    ConnectionUp(MediaDescriptor),
    ConnectionDown(MediaDescriptor),
    StreamHealthChanged {
        descriptor: MediaDescriptor,
        health: StreamHealth,
    },
    /// A connection ended on its own and its entry was removed.
    ConnectionClosed(MediaDescriptor),
    Stats(StatsSummary),
}

/// Transport statistics aggregated over every live connection for one
/// polling interval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSummary {
    pub connections: usize,
    pub upstream_bps: u64,
    pub downstream_bps: u64,
    pub packets_sent: u64,
    pub upstream_packets_lost: u64,
    pub packets_received: u64,
    pub downstream_packets_lost: u64,
}

impl StatsSummary {
    pub fn add(&mut self, sample: &StatsSample) {
        self.connections += 1;
        self.upstream_bps = self.upstream_bps.saturating_add(sample.upstream_bps());
        self.downstream_bps = self.downstream_bps.saturating_add(sample.downstream_bps());
        match sample.role {
            PeerRole::Publisher => {
                self.packets_sent = self.packets_sent.saturating_add(sample.packets_sent);
                self.upstream_packets_lost =
                    self.upstream_packets_lost.saturating_add(sample.packets_lost);
            }
            PeerRole::Subscriber => {
                self.packets_received = self.packets_received.saturating_add(sample.packets_received);
                self.downstream_packets_lost =
                    self.downstream_packets_lost.saturating_add(sample.packets_lost);
            }
        }
    }

    /// Lost fraction of everything the publishers sent.
    #[must_use]
    pub fn upstream_loss(&self) -> f64 {
        ratio(self.upstream_packets_lost, self.packets_sent)
    }

    #[must_use]
    pub fn downstream_loss(&self) -> f64 {
        ratio(
            self.downstream_packets_lost,
            self.packets_received.saturating_add(self.downstream_packets_lost),
        )
    }
}

/// Diagnostic view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStatus {
    pub descriptor: MediaDescriptor,
    pub media_id: MediaId,
    pub role: PeerRole,
    pub slot: SlotKind,
    pub connection_id: Option<ConnectionId>,
    pub declared: Option<MediaSessionState>,
    pub effective_target: QualitySetting,
}

/// Diagnostic view of the whole registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    /// Sorted by media id.
    pub entries: Vec<EntryStatus>,
    pub reservations: usize,
    pub publications: Vec<MediaKind>,
    pub publish_limit: QualitySetting,
}

impl RegistryStatus {
    #[must_use]
    pub fn entry(&self, descriptor: &MediaDescriptor) -> Option<&EntryStatus> {
        self.entries.iter().find(|e| &e.descriptor == descriptor)
    }
}

#[derive(Debug)]
pub(crate) enum RegistryMessage {
    SetLocalParticipant(ParticipantId),
    EnsureConnection {
        descriptor: MediaDescriptor,
        respond_to: oneshot::Sender<Result<ConnectionHandle, ClientError>>,
    },
    Unsubscribe {
        descriptor: MediaDescriptor,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    RemoveSubscriber {
        descriptor: MediaDescriptor,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    Publish {
        kind: MediaKind,
        stream: LocalStream,
        respond_to: oneshot::Sender<Result<ConnectionHandle, ClientError>>,
    },
    Unpublish {
        kind: MediaKind,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    SetPublishQuality {
        kind: MediaKind,
        quality: QualitySetting,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    ReplaceTrack {
        kind: MediaKind,
        track_kind: TrackKind,
        track: Option<LocalTrack>,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    SetTrackEnabled {
        kind: MediaKind,
        track_kind: TrackKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    RequestQuality {
        descriptor: MediaDescriptor,
        target: QualitySetting,
        consumer: ConsumerRef,
        respond_to: oneshot::Sender<()>,
    },
    ReleaseQuality {
        consumer: ConsumerRef,
        respond_to: oneshot::Sender<()>,
    },
    EffectiveTarget {
        descriptor: MediaDescriptor,
        respond_to: oneshot::Sender<QualitySetting>,
    },
    UpdateParticipant(Participant),
    RemoveParticipant(ParticipantId),
    RouteMedia(ServerMediaAction),
    CloseConnections {
        respond_to: oneshot::Sender<()>,
    },
    Resume {
        respond_to: oneshot::Sender<()>,
    },
    Status {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to the running registry.
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RegistryHandle {
    /// Set the identity the server assigned to the local participant.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn set_local_participant(&self, id: ParticipantId) -> Result<(), ClientError> {
        self.post(RegistryMessage::SetLocalParticipant(id)).await
    }

    /// Get or create the subscriber for `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns the creation error shared by every caller waiting on it.
    pub async fn ensure_connection(
        &self,
        descriptor: MediaDescriptor,
    ) -> Result<ConnectionHandle, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::EnsureConnection {
            descriptor,
            respond_to: tx,
        })
        .await?;
        receive(rx).await?
    }

    /// Close and remove a subscriber.
    ///
    /// # Errors
    ///
    /// `ClientError::CreationPending` while its creation is in flight (use
    /// [`Self::remove_subscriber`] instead); `ClientError::NotFound` if there
    /// is no entry.
    pub async fn unsubscribe(&self, descriptor: MediaDescriptor) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::Unsubscribe {
            descriptor,
            respond_to: tx,
        })
        .await?;
        receive(rx).await?
    }

    /// Remove a subscriber, waiting out an in-flight creation first.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn remove_subscriber(&self, descriptor: MediaDescriptor) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::RemoveSubscriber {
            descriptor,
            respond_to: tx,
        })
        .await?;
        receive(rx).await?
    }

    /// Publish local media of `kind`. Publishing again replaces the stream.
    ///
    /// # Errors
    ///
    /// Returns the peer connection creation error.
    pub async fn publish(
        &self,
        kind: MediaKind,
        stream: LocalStream,
    ) -> Result<ConnectionHandle, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::Publish {
            kind,
            stream,
            respond_to: tx,
        })
        .await?;
        receive(rx).await?
    }

    /// # Errors
    ///
    /// `ClientError::NotFound` if nothing of `kind` is published.
    pub async fn unpublish(&self, kind: MediaKind) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::Unpublish {
            kind,
            respond_to: tx,
        })
        .await?;
        receive(rx).await?
    }

    /// Cap the publish quality of `kind`. The applied quality is still
    /// bounded by the publisher backoff limit.
    ///
    /// # Errors
    ///
    /// `ClientError::NotFound` if nothing of `kind` is published.
    pub async fn set_publish_quality(
        &self,
        kind: MediaKind,
        quality: QualitySetting,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::SetPublishQuality {
            kind,
            quality,
            respond_to: tx,
        })
        .await?;
        receive(rx).await?
    }

    /// Replace (or detach, with `None`) a local track of a publication.
    ///
    /// # Errors
    ///
    /// `ClientError::NotFound` if nothing of `kind` is published, or the
    /// publisher's error.
    pub async fn replace_track(
        &self,
        kind: MediaKind,
        track_kind: TrackKind,
        track: Option<LocalTrack>,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::ReplaceTrack {
            kind,
            track_kind,
            track,
            respond_to: tx,
        })
        .await?;
        receive(rx).await?
    }

    /// # Errors
    ///
    /// `ClientError::NotFound` if there is no such publication or track.
    pub async fn set_track_enabled(
        &self,
        kind: MediaKind,
        track_kind: TrackKind,
        enabled: bool,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::SetTrackEnabled {
            kind,
            track_kind,
            enabled,
            respond_to: tx,
        })
        .await?;
        receive(rx).await?
    }

    /// Reserve `target` quality on `descriptor` for `consumer`, replacing any
    /// earlier reservation by the same consumer.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn request_quality(
        &self,
        descriptor: MediaDescriptor,
        target: QualitySetting,
        consumer: ConsumerRef,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::RequestQuality {
            descriptor,
            target,
            consumer,
            respond_to: tx,
        })
        .await?;
        receive(rx).await
    }

    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn release_quality(&self, consumer: ConsumerRef) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::ReleaseQuality {
            consumer,
            respond_to: tx,
        })
        .await?;
        receive(rx).await
    }

    /// Maximum reserved target on `descriptor`, `Off` if none.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn effective_target(
        &self,
        descriptor: MediaDescriptor,
    ) -> Result<QualitySetting, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::EffectiveTarget {
            descriptor,
            respond_to: tx,
        })
        .await?;
        receive(rx).await
    }

    /// Apply a roster update (`participant_joined` / `participant_updated`).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn update_participant(&self, participant: Participant) -> Result<(), ClientError> {
        self.post(RegistryMessage::UpdateParticipant(participant))
            .await
    }

    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn remove_participant(&self, id: ParticipantId) -> Result<(), ClientError> {
        self.post(RegistryMessage::RemoveParticipant(id)).await
    }

    /// Deliver a consumed server media action to its connection.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn route_media(&self, action: ServerMediaAction) -> Result<(), ClientError> {
        self.post(RegistryMessage::RouteMedia(action)).await
    }

    /// Close every connection but keep the registry, its publications and
    /// its reservations.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn close_connections(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::CloseConnections { respond_to: tx })
            .await?;
        receive(rx).await
    }

    /// Recreate publishers for every publication and subscribers for every
    /// published media with a reservation.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn resume(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::Resume { respond_to: tx })
            .await?;
        receive(rx).await
    }

    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has stopped.
    pub async fn status(&self) -> Result<RegistryStatus, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::Status { respond_to: tx })
            .await?;
        receive(rx).await
    }

    /// Close every connection, stop the statistics loop and the publisher
    /// backoff, and end the registry.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the registry has already stopped.
    pub async fn close(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(RegistryMessage::Close { respond_to: tx })
            .await?;
        receive(rx).await
    }

    /// Stop the registry without closing connections gracefully.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn post(&self, message: RegistryMessage) -> Result<(), ClientError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| ClientError::Internal(format!("channel send failed: {e}")))
    }
}

async fn receive<T>(rx: oneshot::Receiver<T>) -> Result<T, ClientError> {
    rx.await
        .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample(role: PeerRole, sent: u64, received: u64, lost: u64) -> StatsSample {
        StatsSample {
            connection_id: ConnectionId::new(),
            media_id: MediaDescriptor::new("alice", MediaKind::Video).media_id(),
            role,
            interval: Duration::from_secs(1),
            bytes_sent: 1000,
            bytes_received: 2000,
            packets_sent: sent,
            packets_received: received,
            packets_lost: lost,
        }
    }

    #[test]
    fn test_summary_separates_directions() {
        let mut summary = StatsSummary::default();
        summary.add(&sample(PeerRole::Publisher, 1000, 0, 30));
        summary.add(&sample(PeerRole::Subscriber, 0, 900, 100));

        assert_eq!(summary.connections, 2);
        assert_eq!(summary.upstream_bps, 16_000);
        assert_eq!(summary.downstream_bps, 32_000);
        assert!((summary.upstream_loss() - 0.03).abs() < 1e-9);
        assert!((summary.downstream_loss() - 0.1).abs() < 1e-9);
        assert!(summary.upstream_loss() > DEFAULT_UPSTREAM_LOSS_THRESHOLD);
    }

    #[test]
    fn test_config_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.stats_interval, Duration::from_secs(2));
        assert_eq!(config.max_publish_bitrate_bps, 1_200_000);
        assert_eq!(config.quality_debounce, Duration::from_millis(500));
        assert_eq!(config.local_participant.as_str(), "local");
    }
}
