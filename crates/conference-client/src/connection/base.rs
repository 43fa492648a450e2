//! State shared by publisher and subscriber actors.

use super::peer::{PeerConnection, PeerConnectionState, PeerRole, SdpKind, TransportStats};
use super::{ConnectionEvent, ConnectionId, ConnectionParts};
use crate::errors::ClientError;
use common::types::{MediaDescriptor, MediaId, QualitySetting};
use signaling_protocol::media::{ClientMediaAction, IceCandidate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Transport counters for one polling interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSample {
    pub connection_id: ConnectionId,
    pub media_id: MediaId,
    pub role: PeerRole,
    pub interval: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
}

impl StatsSample {
    #[must_use]
    pub fn upstream_bps(&self) -> u64 {
        bits_per_second(self.bytes_sent, self.interval)
    }

    #[must_use]
    pub fn downstream_bps(&self) -> u64 {
        bits_per_second(self.bytes_received, self.interval)
    }

    /// Fraction of inbound packets lost during the interval.
    #[must_use]
    pub fn inbound_loss(&self) -> f64 {
        ratio(
            self.packets_lost,
            self.packets_received.saturating_add(self.packets_lost),
        )
    }

    /// Fraction of sent packets the remote reported lost.
    #[must_use]
    pub fn outbound_loss(&self) -> f64 {
        ratio(self.packets_lost, self.packets_sent)
    }
}

fn bits_per_second(bytes: u64, interval: Duration) -> u64 {
    let millis = interval.as_millis();
    if millis == 0 {
        return 0;
    }
    let bps = u128::from(bytes) * 8 * 1000 / millis;
    u64::try_from(bps).unwrap_or(u64::MAX)
}

// Packet counts stay far below 2^53.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64
}

/// One peer connection plus the bookkeeping both roles need: quality
/// resolution, liveness, remote candidate queueing and stats deltas.
pub(crate) struct BaseConnection {
    pub(crate) id: ConnectionId,
    pub(crate) descriptor: MediaDescriptor,
    pub(crate) media_id: MediaId,
    pub(crate) role: PeerRole,
    pub(crate) peer: Arc<dyn PeerConnection>,
    pub(crate) peer_state: PeerConnectionState,

    target: QualitySetting,
    limit: QualitySetting,
    up: bool,

    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    last_stats: Option<(TransportStats, Instant)>,

    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    outbound_tx: mpsc::UnboundedSender<ClientMediaAction>,
}

impl BaseConnection {
    pub(crate) fn new(
        parts: &ConnectionParts,
        role: PeerRole,
        target: QualitySetting,
        limit: QualitySetting,
    ) -> Self {
        Self {
            id: parts.id,
            media_id: parts.descriptor.media_id(),
            descriptor: parts.descriptor.clone(),
            role,
            peer: Arc::clone(&parts.peer),
            peer_state: PeerConnectionState::New,
            target,
            limit,
            up: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            last_stats: None,
            events_tx: parts.events_tx.clone(),
            outbound_tx: parts.outbound_tx.clone(),
        }
    }

    pub(crate) fn target(&self) -> QualitySetting {
        self.target
    }

    pub(crate) fn limit(&self) -> QualitySetting {
        self.limit
    }

    /// Applied quality: `min(target, limit)`.
    pub(crate) fn quality(&self) -> QualitySetting {
        self.target.min(self.limit)
    }

    pub(crate) fn is_up(&self) -> bool {
        self.up
    }

    /// Returns whether the applied quality changed.
    pub(crate) fn set_target(&mut self, target: QualitySetting) -> bool {
        let before = self.quality();
        self.target = target;
        before != self.quality()
    }

    /// Returns whether the applied quality changed.
    pub(crate) fn set_limit(&mut self, limit: QualitySetting) -> bool {
        let before = self.quality();
        self.limit = limit;
        before != self.quality()
    }

    /// Record server-reported liveness. Returns whether it changed.
    pub(crate) fn set_up(&mut self, up: bool) -> bool {
        if self.up == up {
            return false;
        }
        self.up = up;

        let event = if up {
            ConnectionEvent::Up {
                media_id: self.media_id.clone(),
                connection_id: self.id,
            }
        } else {
            ConnectionEvent::Down {
                media_id: self.media_id.clone(),
                connection_id: self.id,
            }
        };
        self.emit(event);
        true
    }

    /// Apply a remote description and flush candidates that arrived early.
    pub(crate) async fn apply_remote_description(
        &mut self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), ClientError> {
        self.peer.set_remote_description(kind, sdp).await?;
        self.remote_description_set = true;

        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(
                target: "cc.connection",
                media_id = %self.media_id,
                count = pending.len(),
                "Applying queued remote candidates"
            );
        }
        for candidate in &pending {
            self.peer.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Add a remote candidate, or queue it until the remote description lands.
    pub(crate) async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), ClientError> {
        if self.remote_description_set {
            self.peer.add_ice_candidate(&candidate).await
        } else {
            self.pending_candidates.push(candidate);
            Ok(())
        }
    }

    /// Poll cumulative counters and return the delta since the previous poll.
    pub(crate) async fn sample_stats(&mut self) -> Result<StatsSample, ClientError> {
        let stats = self.peer.stats().await?;
        let now = Instant::now();

        let (previous, since) = self
            .last_stats
            .unwrap_or((TransportStats::default(), now));
        self.last_stats = Some((stats, now));

        Ok(StatsSample {
            connection_id: self.id,
            media_id: self.media_id.clone(),
            role: self.role,
            interval: now.saturating_duration_since(since),
            bytes_sent: stats.bytes_sent.saturating_sub(previous.bytes_sent),
            bytes_received: stats.bytes_received.saturating_sub(previous.bytes_received),
            packets_sent: stats.packets_sent.saturating_sub(previous.packets_sent),
            packets_received: stats
                .packets_received
                .saturating_sub(previous.packets_received),
            packets_lost: stats.packets_lost.saturating_sub(previous.packets_lost),
        })
    }

    /// Queue an outbound media action for the signaling channel.
    pub(crate) fn send(&self, action: ClientMediaAction) {
        let name = action.name();
        if self.outbound_tx.send(action).is_err() {
            warn!(
                target: "cc.connection",
                media_id = %self.media_id,
                action = name,
                "Outbound channel closed, dropping media action"
            );
        }
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        if self.events_tx.send(event).is_err() {
            debug!(target: "cc.connection", media_id = %self.media_id, "Registry gone, dropping connection event");
        }
    }

    /// Close the peer and report `Closed`.
    pub(crate) async fn shutdown(&mut self) {
        self.peer.close().await;
        self.peer_state = PeerConnectionState::Closed;
        self.emit(ConnectionEvent::Closed {
            media_id: self.media_id.clone(),
            connection_id: self.id,
        });
    }
}
