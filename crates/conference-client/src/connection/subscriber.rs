//! `SubscriberConnection` - one inbound stream from a remote publisher.
//!
//! The quality **target** comes from reservations: every
//! [`QualityReservation`] counts towards its target and the effective target
//! is the highest target with a non-zero count. Reservation churn is
//! coalesced by a debounce window; when it fires the live counts are read, so
//! the newest maximum always wins and no update is lost.
//!
//! The quality **limit** comes from a private backoff controller fed by
//! inbound loss. The subscriber sends `configure` with `min(target, limit)`
//! whenever that value changes.

use super::base::{BaseConnection, StatsSample};
use super::health::{compute_health, HealthInputs, StreamHealth};
use super::peer::{PeerEvent, PeerEvents, PeerRole, SdpKind};
use super::{
    ConnectionCommand, ConnectionEvent, ConnectionHandle, ConnectionParts, ConnectionStatus,
    Flow, QualityReservation, CONNECTION_CHANNEL_BUFFER,
};
use crate::errors::ClientError;
use crate::quality::{BackoffConfig, QualityBackoffController, QualityBackoffHandle};
use crate::timing::{deadline_after, sleep_until_deadline};
use common::types::QualitySetting;
use signaling_protocol::media::{
    ClientMediaAction, ServerMediaAction, SlowLinkDirection, StreamConfiguration,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default quiet period before applying reservation changes.
pub const DEFAULT_QUALITY_DEBOUNCE: Duration = Duration::from_millis(500);

/// Default upper bound on how long reservation changes can be held back.
pub const DEFAULT_QUALITY_DEBOUNCE_MAX_WAIT: Duration = Duration::from_millis(1000);

/// Inbound loss above which a sample counts as bad.
const HIGH_LOSS_THRESHOLD: f64 = 0.05;

/// Inbound loss below which a sample counts as good.
const LOW_LOSS_THRESHOLD: f64 = 0.01;

/// Bad-sample count that triggers a downgrade.
const LOSS_COUNTER_TRIGGER: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Base interval is randomized per subscriber.
    pub backoff: BackoffConfig,
    pub debounce: Duration,
    pub debounce_max_wait: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::subscriber(),
            debounce: DEFAULT_QUALITY_DEBOUNCE,
            debounce_max_wait: DEFAULT_QUALITY_DEBOUNCE_MAX_WAIT,
        }
    }
}

/// Trailing debounce with a maximum wait.
#[derive(Debug, Clone)]
pub(crate) struct Debounce {
    delay: Duration,
    max_wait: Duration,
    window_start: Option<Instant>,
    deadline: Option<Instant>,
}

impl Debounce {
    pub(crate) fn new(delay: Duration, max_wait: Duration) -> Self {
        Self {
            delay,
            max_wait,
            window_start: None,
            deadline: None,
        }
    }

    /// Record a change at `now`, opening a window if none is open.
    pub(crate) fn touch(&mut self, now: Instant) {
        let start = *self.window_start.get_or_insert(now);
        let trailing = deadline_after(now, self.delay);
        self.deadline = Some(trailing.min(deadline_after(start, self.max_wait)));
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Close the window; the next change opens a new one.
    pub(crate) fn reset(&mut self) {
        self.window_start = None;
        self.deadline = None;
    }
}

/// Reservation counts per target.
#[derive(Debug, Clone, Default)]
pub(crate) struct TargetCounts(BTreeMap<QualitySetting, usize>);

impl TargetCounts {
    pub(crate) fn increment(&mut self, target: QualitySetting) {
        *self.0.entry(target).or_insert(0) += 1;
    }

    /// Returns `false` if nothing was held at `target`.
    pub(crate) fn decrement(&mut self, target: QualitySetting) -> bool {
        match self.0.get_mut(&target) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.0.remove(&target);
                true
            }
            None => false,
        }
    }

    /// Highest target with a non-zero count, `Off` when empty.
    pub(crate) fn effective(&self) -> QualitySetting {
        self.0
            .keys()
            .next_back()
            .copied()
            .unwrap_or(QualitySetting::Off)
    }
}

/// Actor for one inbound stream.
pub struct SubscriberConnection {
    base: BaseConnection,
    receiver: mpsc::Receiver<ConnectionCommand>,
    sender: mpsc::Sender<ConnectionCommand>,
    peer_events: PeerEvents,
    cancel_token: CancellationToken,

    backoff: QualityBackoffHandle,
    limit_rx: watch::Receiver<QualitySetting>,

    reservations: TargetCounts,
    debounce: Debounce,
    configured: Option<QualitySetting>,
    loss_counter: u32,

    health_inputs: HealthInputs,
    health: StreamHealth,
}

impl SubscriberConnection {
    /// Spawn a subscriber. It sends `subscribe` immediately.
    #[must_use]
    pub fn spawn(
        parts: ConnectionParts,
        config: &SubscriberConfig,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        let (backoff, _backoff_task) = QualityBackoffController::spawn(
            "subscriber",
            &config.backoff.randomized(),
            parts.cancel_token.child_token(),
        );
        let limit_rx = backoff.subscribe();
        let limit = *limit_rx.borrow();

        let base = BaseConnection::new(&parts, PeerRole::Subscriber, QualitySetting::Off, limit);

        let handle = ConnectionHandle {
            id: parts.id,
            role: PeerRole::Subscriber,
            descriptor: parts.descriptor.clone(),
            sender: sender.clone(),
            cancel_token: parts.cancel_token.clone(),
        };

        let actor = Self {
            base,
            receiver,
            sender,
            peer_events: parts.peer_events,
            cancel_token: parts.cancel_token,
            backoff,
            limit_rx,
            reservations: TargetCounts::default(),
            debounce: Debounce::new(config.debounce, config.debounce_max_wait),
            configured: None,
            loss_counter: 0,
            health_inputs: HealthInputs::new(),
            health: StreamHealth::Offline,
        };

        let task_handle = tokio::spawn(actor.run());
        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "cc.connection.subscriber",
        fields(media_id = %self.base.media_id, connection_id = %self.base.id)
    )]
    async fn run(mut self) {
        info!(target: "cc.connection.subscriber", media_id = %self.base.media_id, "Subscribing");
        self.base.send(ClientMediaAction::Subscribe {
            target: self.base.descriptor.participant_id.clone(),
            media_session_type: self.base.descriptor.kind,
        });

        let mut close_reply: Option<oneshot::Sender<()>> = None;

        loop {
            let deadline = self.debounce.deadline();

            let flow = tokio::select! {
                () = self.cancel_token.cancelled() => Ok(Flow::Stop),

                cmd = self.receiver.recv() => match cmd {
                    Some(ConnectionCommand::Close { respond_to })
                    | Some(ConnectionCommand::Unpublish { respond_to }) => {
                        close_reply = Some(respond_to);
                        Ok(Flow::Stop)
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => Ok(Flow::Stop),
                },

                event = self.peer_events.recv() => match event {
                    Some(event) => {
                        self.handle_peer_event(event);
                        Ok(Flow::Continue)
                    }
                    None => Err(ClientError::Peer("peer event stream ended".to_string())),
                },

                Ok(()) = self.limit_rx.changed() => {
                    let limit = *self.limit_rx.borrow_and_update();
                    if self.base.set_limit(limit) {
                        debug!(
                            target: "cc.connection.subscriber",
                            media_id = %self.base.media_id,
                            limit = limit.as_str(),
                            "Quality limit changed"
                        );
                    }
                    self.apply_quality();
                    Ok(Flow::Continue)
                }

                () = sleep_until_deadline(deadline) => {
                    self.debounce.reset();
                    let effective = self.reservations.effective();
                    self.base.set_target(effective);
                    self.apply_quality();
                    Ok(Flow::Continue)
                }
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    warn!(
                        target: "cc.connection.subscriber",
                        media_id = %self.base.media_id,
                        error = %e,
                        "Subscriber failed, closing"
                    );
                    break;
                }
            }
        }

        self.backoff.cancel();
        self.base.shutdown().await;
        if let Some(reply) = close_reply {
            let _ = reply.send(());
        }
        info!(target: "cc.connection.subscriber", media_id = %self.base.media_id, "Subscriber closed");
    }

    async fn handle_command(&mut self, cmd: ConnectionCommand) -> Result<Flow, ClientError> {
        match cmd {
            ConnectionCommand::Route(action) => self.handle_server_action(action).await?,
            ConnectionCommand::UpdateDeclaredState(state) => {
                self.health_inputs.declared = state;
                self.refresh_health();
            }
            ConnectionCommand::RequestQuality { target, respond_to } => {
                self.reservations.increment(target);
                self.debounce.touch(Instant::now());
                let _ = respond_to.send(Ok(QualityReservation {
                    target,
                    sender: self.sender.clone(),
                }));
            }
            ConnectionCommand::ReleaseQuality { target } => {
                if self.reservations.decrement(target) {
                    self.debounce.touch(Instant::now());
                } else {
                    warn!(
                        target: "cc.connection.subscriber",
                        media_id = %self.base.media_id,
                        target_quality = target.as_str(),
                        "Release without a matching reservation"
                    );
                }
            }
            ConnectionCommand::PollStats { respond_to } => {
                let result = self.base.sample_stats().await;
                if let Ok(sample) = &result {
                    self.observe_loss(sample).await;
                }
                let _ = respond_to.send(result);
            }
            ConnectionCommand::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            ConnectionCommand::SetTarget(_) => {
                debug!(target: "cc.connection.subscriber", "Ignoring direct target on subscriber");
            }
            ConnectionCommand::ReplaceTrack { respond_to, .. }
            | ConnectionCommand::SetTrackEnabled { respond_to, .. } => {
                let _ = respond_to.send(Err(ClientError::Connection(
                    "subscriber has no local tracks".to_string(),
                )));
            }
            ConnectionCommand::Close { .. } | ConnectionCommand::Unpublish { .. } => {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_server_action(&mut self, action: ServerMediaAction) -> Result<(), ClientError> {
        match action {
            ServerMediaAction::SdpOffer { sdp, .. } => {
                self.base.apply_remote_description(SdpKind::Offer, &sdp).await?;
                let answer = self.base.peer.create_answer().await?;
                self.base
                    .peer
                    .set_local_description(SdpKind::Answer, &answer)
                    .await?;
                self.base.send(ClientMediaAction::SdpAnswer {
                    target: self.base.descriptor.participant_id.clone(),
                    media_session_type: self.base.descriptor.kind,
                    sdp: answer,
                });
                debug!(target: "cc.connection.subscriber", media_id = %self.base.media_id, "Answered offer");
            }
            ServerMediaAction::SdpCandidate { candidate, .. } => {
                self.base.add_remote_candidate(candidate).await?;
            }
            ServerMediaAction::SdpEndOfCandidates { .. } => {
                debug!(target: "cc.connection.subscriber", media_id = %self.base.media_id, "Remote candidates complete");
            }
            ServerMediaAction::WebrtcUp { .. } => {
                if self.base.set_up(true) {
                    self.refresh_health();
                }
            }
            ServerMediaAction::WebrtcDown { .. } => {
                if self.base.set_up(false) {
                    self.refresh_health();
                }
            }
            ServerMediaAction::WebrtcSlow { direction, .. } => {
                if direction == SlowLinkDirection::Downstream {
                    self.backoff.downgrade_temporarily().await?;
                }
            }
            ServerMediaAction::MediaStatus {
                kind, receiving, ..
            } => {
                self.health_inputs.track_mut(kind).server_receiving = receiving;
                self.refresh_health();
            }
            ServerMediaAction::SdpAnswer { .. } => {
                warn!(
                    target: "cc.connection.subscriber",
                    media_id = %self.base.media_id,
                    "Unexpected sdp_answer on subscriber"
                );
            }
        }
        Ok(())
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                self.base.send(ClientMediaAction::SdpCandidate {
                    target: self.base.descriptor.participant_id.clone(),
                    media_session_type: self.base.descriptor.kind,
                    candidate,
                });
            }
            PeerEvent::IceGatheringComplete => {
                self.base.send(ClientMediaAction::SdpEndOfCandidates {
                    target: self.base.descriptor.participant_id.clone(),
                    media_session_type: self.base.descriptor.kind,
                });
            }
            PeerEvent::ConnectionStateChanged(state) => {
                self.base.peer_state = state;
                self.refresh_health();
            }
            PeerEvent::NegotiationNeeded => {
                // The server drives subscriber offers.
            }
            PeerEvent::TrackAdded(track) => {
                let liveness = self.health_inputs.track_mut(track.kind);
                liveness.present = true;
                liveness.muted = track.muted;
                liveness.ended = false;
                self.refresh_health();
            }
            PeerEvent::TrackMuted(kind) => {
                self.health_inputs.track_mut(kind).muted = true;
                self.refresh_health();
            }
            PeerEvent::TrackUnmuted(kind) => {
                self.health_inputs.track_mut(kind).muted = false;
                self.refresh_health();
            }
            PeerEvent::TrackEnded(kind) => {
                self.health_inputs.track_mut(kind).ended = true;
                self.refresh_health();
            }
        }
    }

    /// Feed one stats sample into the loss counter.
    async fn observe_loss(&mut self, sample: &StatsSample) {
        let loss = sample.inbound_loss();
        if loss > HIGH_LOSS_THRESHOLD {
            self.loss_counter = self.loss_counter.saturating_add(1);
            if self.loss_counter >= LOSS_COUNTER_TRIGGER {
                debug!(
                    target: "cc.connection.subscriber",
                    media_id = %self.base.media_id,
                    loss,
                    "Sustained inbound loss, downgrading"
                );
                if let Err(e) = self.backoff.downgrade_temporarily().await {
                    warn!(target: "cc.connection.subscriber", error = %e, "Backoff controller unavailable");
                }
            }
        } else if loss < LOW_LOSS_THRESHOLD {
            self.loss_counter = self.loss_counter.saturating_sub(1);
        }
    }

    /// Send `configure` if the applied quality changed since the last one.
    fn apply_quality(&mut self) {
        let applied = self.base.quality();
        self.health_inputs.applied_quality = applied;

        if self.configured != Some(applied) {
            info!(
                target: "cc.connection.subscriber",
                media_id = %self.base.media_id,
                target_quality = self.base.target().as_str(),
                limit = self.base.limit().as_str(),
                applied = applied.as_str(),
                "Configuring subscription"
            );
            self.base.send(ClientMediaAction::Configure {
                target: self.base.descriptor.participant_id.clone(),
                media_session_type: self.base.descriptor.kind,
                configuration: StreamConfiguration::from(applied),
            });
            self.configured = Some(applied);
        }

        self.refresh_health();
    }

    fn refresh_health(&mut self) {
        self.health_inputs.peer_state = self.base.peer_state;
        self.health_inputs.up = self.base.is_up();

        let health = compute_health(&self.health_inputs);
        if health != self.health {
            debug!(
                target: "cc.connection.subscriber",
                media_id = %self.base.media_id,
                from = self.health.as_str(),
                to = health.as_str(),
                "Stream health changed"
            );
            self.health = health;
            self.base.emit(ConnectionEvent::StreamHealthChanged {
                media_id: self.base.media_id.clone(),
                connection_id: self.base.id,
                health,
            });
        }
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.base.id,
            role: PeerRole::Subscriber,
            media_id: self.base.media_id.clone(),
            target: self.base.target(),
            limit: self.base.limit(),
            quality: self.base.quality(),
            up: self.base.is_up(),
            peer_state: self.base.peer_state,
            health: Some(self.health),
            announced: None,
            parked: false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_target_is_max_of_held() {
        let mut counts = TargetCounts::default();
        assert_eq!(counts.effective(), QualitySetting::Off);

        counts.increment(QualitySetting::Low);
        counts.increment(QualitySetting::High);
        counts.increment(QualitySetting::Medium);
        assert_eq!(counts.effective(), QualitySetting::High);

        assert!(counts.decrement(QualitySetting::High));
        assert_eq!(counts.effective(), QualitySetting::Medium);
    }

    #[test]
    fn test_duplicate_targets_are_counted() {
        let mut counts = TargetCounts::default();
        counts.increment(QualitySetting::High);
        counts.increment(QualitySetting::High);
        counts.increment(QualitySetting::Low);

        assert!(counts.decrement(QualitySetting::High));
        assert_eq!(counts.effective(), QualitySetting::High);
        assert!(counts.decrement(QualitySetting::High));
        assert_eq!(counts.effective(), QualitySetting::Low);
        assert!(!counts.decrement(QualitySetting::High));
    }

    #[test]
    fn test_debounce_trails_changes() {
        let start = Instant::now();
        let mut debounce = Debounce::new(Duration::from_millis(500), Duration::from_millis(1000));
        assert!(debounce.deadline().is_none());

        debounce.touch(start);
        assert_eq!(debounce.deadline(), Some(start + Duration::from_millis(500)));

        debounce.touch(start + Duration::from_millis(300));
        assert_eq!(debounce.deadline(), Some(start + Duration::from_millis(800)));
    }

    #[test]
    fn test_debounce_capped_by_max_wait() {
        let start = Instant::now();
        let mut debounce = Debounce::new(Duration::from_millis(500), Duration::from_millis(1000));

        debounce.touch(start);
        debounce.touch(start + Duration::from_millis(400));
        debounce.touch(start + Duration::from_millis(800));
        assert_eq!(debounce.deadline(), Some(start + Duration::from_millis(1000)));

        debounce.reset();
        debounce.touch(start + Duration::from_millis(1100));
        assert_eq!(debounce.deadline(), Some(start + Duration::from_millis(1600)));
    }

    #[test]
    fn test_debounce_with_huge_delays_does_not_overflow() {
        let start = Instant::now();
        let mut debounce = Debounce::new(Duration::MAX, Duration::MAX);

        debounce.touch(start);
        assert!(debounce.deadline().unwrap() > start + Duration::from_secs(3600));
    }
}
