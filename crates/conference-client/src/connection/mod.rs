//! Publisher and subscriber connections.
//!
//! Each connection is an actor owning one [`PeerConnection`]. The registry
//! drives it through a [`ConnectionHandle`]; the connection reports back on
//! an unbounded [`ConnectionEvent`] channel and writes outbound media
//! actions to an unbounded channel drained by the room.
//!
//! - [`peer`] - native peer connection seam
//! - [`simulcast`] - publisher layer layout
//! - [`health`] - subscriber stream health
//! - [`publisher`] / [`subscriber`] - the two actors

mod base;
pub mod health;
pub mod peer;
pub mod publisher;
pub mod simulcast;
pub mod subscriber;

pub use base::StatsSample;
pub(crate) use base::ratio;
pub use health::StreamHealth;
pub use peer::{
    EncodingParameters, LocalStream, LocalTrack, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, PeerEvents, PeerRole, RemoteTrack, SdpKind, TransportStats,
};
pub use publisher::{PublisherConfig, PublisherConnection};
pub use subscriber::{SubscriberConfig, SubscriberConnection};

use crate::errors::ClientError;
use common::types::{MediaDescriptor, MediaId, QualitySetting};
use signaling_protocol::media::{ClientMediaAction, MediaSessionState, ServerMediaAction, TrackKind};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Mailbox capacity for connection commands.
const CONNECTION_CHANNEL_BUFFER: usize = 64;

/// Identity of one connection object. A new id is minted per creation, so a
/// late event from a replaced connection never matches the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events a connection reports to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Up {
        media_id: MediaId,
        connection_id: ConnectionId,
    },
    Down {
        media_id: MediaId,
        connection_id: ConnectionId,
    },
    StreamHealthChanged {
        media_id: MediaId,
        connection_id: ConnectionId,
        health: StreamHealth,
    },
    Closed {
        media_id: MediaId,
        connection_id: ConnectionId,
    },
}

/// Snapshot of a connection for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub id: ConnectionId,
    pub role: PeerRole,
    pub media_id: MediaId,
    pub target: QualitySetting,
    pub limit: QualitySetting,
    /// `min(target, limit)`.
    pub quality: QualitySetting,
    pub up: bool,
    pub peer_state: PeerConnectionState,
    /// Subscriber only.
    pub health: Option<StreamHealth>,
    /// Publisher only: last announced media session state.
    pub announced: Option<MediaSessionState>,
    /// Publisher only: video sender carries a placeholder.
    pub parked: bool,
}

#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    Route(ServerMediaAction),
    SetTarget(QualitySetting),
    UpdateDeclaredState(Option<MediaSessionState>),
    RequestQuality {
        target: QualitySetting,
        respond_to: oneshot::Sender<Result<QualityReservation, ClientError>>,
    },
    ReleaseQuality {
        target: QualitySetting,
    },
    ReplaceTrack {
        kind: TrackKind,
        track: Option<LocalTrack>,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    SetTrackEnabled {
        kind: TrackKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    PollStats {
        respond_to: oneshot::Sender<Result<StatsSample, ClientError>>,
    },
    Status {
        respond_to: oneshot::Sender<ConnectionStatus>,
    },
    Unpublish {
        respond_to: oneshot::Sender<()>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// Everything a connection actor needs from its creator.
pub struct ConnectionParts {
    pub id: ConnectionId,
    pub descriptor: MediaDescriptor,
    pub peer: Arc<dyn PeerConnection>,
    pub peer_events: PeerEvents,
    pub events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    pub outbound_tx: mpsc::UnboundedSender<ClientMediaAction>,
    pub cancel_token: CancellationToken,
}

/// One outstanding quality request on a subscriber.
///
/// Hand it back with [`QualityReservation::release`]; the subscriber then
/// recomputes its effective target.
#[derive(Debug)]
pub struct QualityReservation {
    target: QualitySetting,
    sender: mpsc::Sender<ConnectionCommand>,
}

impl QualityReservation {
    #[must_use]
    pub fn target(&self) -> QualitySetting {
        self.target
    }

    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the connection is gone (its
    /// reservations went with it).
    pub async fn release(self) -> Result<(), ClientError> {
        self.sender
            .send(ConnectionCommand::ReleaseQuality {
                target: self.target,
            })
            .await
            .map_err(|e| ClientError::Internal(format!("channel send failed: {e}")))
    }
}

/// Handle to a running publisher or subscriber.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    role: PeerRole,
    descriptor: MediaDescriptor,
    sender: mpsc::Sender<ConnectionCommand>,
    cancel_token: CancellationToken,
}

impl ConnectionHandle {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> PeerRole {
        self.role
    }

    #[must_use]
    pub fn descriptor(&self) -> &MediaDescriptor {
        &self.descriptor
    }

    /// Deliver a server media action.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the connection has stopped.
    pub async fn route(&self, action: ServerMediaAction) -> Result<(), ClientError> {
        self.post(ConnectionCommand::Route(action)).await
    }

    /// Set the publisher's quality target. Subscribers derive their target
    /// from reservations instead.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the connection has stopped.
    pub async fn set_target(&self, target: QualitySetting) -> Result<(), ClientError> {
        self.post(ConnectionCommand::SetTarget(target)).await
    }

    /// Tell a subscriber what the publisher currently declares.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the connection has stopped.
    pub async fn update_declared_state(
        &self,
        state: Option<MediaSessionState>,
    ) -> Result<(), ClientError> {
        self.post(ConnectionCommand::UpdateDeclaredState(state)).await
    }

    /// Reserve `target` quality on a subscriber.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Connection` on a publisher, or
    /// `ClientError::Internal` if the connection has stopped.
    pub async fn request_quality(
        &self,
        target: QualitySetting,
    ) -> Result<QualityReservation, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(ConnectionCommand::RequestQuality {
            target,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))?
    }

    /// Swap the local track of `kind` on a publisher.
    ///
    /// # Errors
    ///
    /// Returns the peer error, `ClientError::Connection` on a subscriber, or
    /// `ClientError::Internal` if the connection has stopped.
    pub async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<LocalTrack>,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(ConnectionCommand::ReplaceTrack {
            kind,
            track,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))?
    }

    /// Enable or disable the local track of `kind` on a publisher.
    ///
    /// # Errors
    ///
    /// `ClientError::NotFound` if there is no such track; otherwise as
    /// [`Self::replace_track`].
    pub async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(ConnectionCommand::SetTrackEnabled {
            kind,
            enabled,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))?
    }

    /// Sample transport statistics since the previous poll.
    ///
    /// # Errors
    ///
    /// Returns the peer error, or `ClientError::Internal` if the connection
    /// has stopped.
    pub async fn poll_stats(&self) -> Result<StatsSample, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(ConnectionCommand::PollStats { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))?
    }

    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the connection has stopped.
    pub async fn status(&self) -> Result<ConnectionStatus, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.post(ConnectionCommand::Status { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))
    }

    /// Send `unpublish` and close. On a subscriber this is a plain close.
    pub async fn unpublish(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .post(ConnectionCommand::Unpublish { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Close the connection and wait for it to finish. Idempotent.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .post(ConnectionCommand::Close { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Stop the actor without the close handshake.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn post(&self, command: ConnectionCommand) -> Result<(), ClientError> {
        self.sender
            .send(command)
            .await
            .map_err(|e| ClientError::Internal(format!("channel send failed: {e}")))
    }
}

/// Outcome of one command or event in a connection actor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}
