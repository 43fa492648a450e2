//! `PublisherConnection` - the local outgoing stream of one media kind.
//!
//! Negotiation: add tracks, apply simulcast encodings, create an offer and
//! send `publish`; apply the `sdp_answer`; send `publish_complete` once.
//! Later renegotiations repeat the offer/`publish` cycle, and one requested
//! while an answer is outstanding waits for that answer.
//!
//! Quality `Off` parks the video sender on a placeholder track instead of
//! deactivating every encoding; rising above `Off` swaps the real track back
//! and re-applies the encodings. The announced media session state is sent
//! again only when it differs from the last one.

use super::base::BaseConnection;
use super::peer::{LocalStream, LocalTrack, PeerEvent, PeerEvents, PeerRole, SdpKind};
use super::simulcast;
use super::{
    ConnectionCommand, ConnectionHandle, ConnectionParts, ConnectionStatus, Flow,
    CONNECTION_CHANNEL_BUFFER,
};
use crate::config::DEFAULT_MAX_PUBLISH_BITRATE_BPS;
use crate::errors::ClientError;
use common::types::QualitySetting;
use signaling_protocol::media::{ClientMediaAction, MediaSessionState, ServerMediaAction, TrackKind};
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherConfig {
    pub max_bitrate_bps: u32,
    /// Initial quality target.
    pub target: QualitySetting,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_bitrate_bps: DEFAULT_MAX_PUBLISH_BITRATE_BPS,
            target: QualitySetting::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    /// No offer sent yet.
    Idle,
    AwaitingAnswer { renegotiate: bool },
    Stable,
}

/// Actor for one local outgoing stream.
pub struct PublisherConnection {
    base: BaseConnection,
    receiver: mpsc::Receiver<ConnectionCommand>,
    peer_events: PeerEvents,
    cancel_token: CancellationToken,
    limit_rx: watch::Receiver<QualitySetting>,

    max_bitrate_bps: u32,
    stream: LocalStream,
    senders: HashSet<TrackKind>,
    /// Set while the video sender carries a placeholder.
    placeholder: Option<LocalTrack>,
    /// Quality last applied to the video sender.
    applied: Option<QualitySetting>,

    negotiation: Negotiation,
    completed: bool,
    announced: Option<MediaSessionState>,
}

impl PublisherConnection {
    /// Spawn a publisher for `stream`. The quality limit comes from the
    /// shared publisher backoff controller.
    #[must_use]
    pub fn spawn(
        parts: ConnectionParts,
        stream: LocalStream,
        config: PublisherConfig,
        limit_rx: watch::Receiver<QualitySetting>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let limit = *limit_rx.borrow();
        let base = BaseConnection::new(&parts, PeerRole::Publisher, config.target, limit);

        let handle = ConnectionHandle {
            id: parts.id,
            role: PeerRole::Publisher,
            descriptor: parts.descriptor.clone(),
            sender,
            cancel_token: parts.cancel_token.clone(),
        };

        let actor = Self {
            base,
            receiver,
            peer_events: parts.peer_events,
            cancel_token: parts.cancel_token,
            limit_rx,
            max_bitrate_bps: config.max_bitrate_bps,
            stream,
            senders: HashSet::new(),
            placeholder: None,
            applied: None,
            negotiation: Negotiation::Idle,
            completed: false,
            announced: None,
        };

        let task_handle = tokio::spawn(actor.run());
        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "cc.connection.publisher",
        fields(media_id = %self.base.media_id, connection_id = %self.base.id)
    )]
    async fn run(mut self) {
        if let Err(e) = self.start().await {
            warn!(
                target: "cc.connection.publisher",
                media_id = %self.base.media_id,
                error = %e,
                "Publisher failed to start, closing"
            );
            self.base.shutdown().await;
            return;
        }

        let mut close_reply: Option<oneshot::Sender<()>> = None;

        loop {
            let flow = tokio::select! {
                () = self.cancel_token.cancelled() => Ok(Flow::Stop),

                cmd = self.receiver.recv() => match cmd {
                    Some(ConnectionCommand::Close { respond_to }) => {
                        close_reply = Some(respond_to);
                        Ok(Flow::Stop)
                    }
                    Some(ConnectionCommand::Unpublish { respond_to }) => {
                        self.base.send(ClientMediaAction::Unpublish {
                            media_session_type: self.base.descriptor.kind,
                        });
                        close_reply = Some(respond_to);
                        Ok(Flow::Stop)
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => Ok(Flow::Stop),
                },

                event = self.peer_events.recv() => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => Err(ClientError::Peer("peer event stream ended".to_string())),
                },

                Ok(()) = self.limit_rx.changed() => {
                    let limit = *self.limit_rx.borrow_and_update();
                    if self.base.set_limit(limit) {
                        debug!(
                            target: "cc.connection.publisher",
                            media_id = %self.base.media_id,
                            limit = limit.as_str(),
                            "Publish limit changed"
                        );
                    }
                    self.apply_quality().await.map(|()| Flow::Continue)
                }
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    warn!(
                        target: "cc.connection.publisher",
                        media_id = %self.base.media_id,
                        error = %e,
                        "Publisher failed, closing"
                    );
                    break;
                }
            }
        }

        self.base.shutdown().await;
        if let Some(reply) = close_reply {
            let _ = reply.send(());
        }
        info!(target: "cc.connection.publisher", media_id = %self.base.media_id, "Publisher closed");
    }

    async fn start(&mut self) -> Result<(), ClientError> {
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if let Some(track) = self.stream.track(kind) {
                self.base.peer.add_track(track).await?;
                self.senders.insert(kind);
            }
        }

        self.apply_quality().await?;
        self.offer().await?;

        info!(
            target: "cc.connection.publisher",
            media_id = %self.base.media_id,
            quality = self.base.quality().as_str(),
            "Publishing"
        );
        Ok(())
    }

    /// Create an offer and send `publish`.
    async fn offer(&mut self) -> Result<(), ClientError> {
        let sdp = self.base.peer.create_offer().await?;
        self.base
            .peer
            .set_local_description(SdpKind::Offer, &sdp)
            .await?;
        self.base.send(ClientMediaAction::Publish {
            target: self.base.descriptor.participant_id.clone(),
            media_session_type: self.base.descriptor.kind,
            sdp,
        });
        self.negotiation = Negotiation::AwaitingAnswer { renegotiate: false };
        Ok(())
    }

    async fn handle_command(&mut self, cmd: ConnectionCommand) -> Result<Flow, ClientError> {
        match cmd {
            ConnectionCommand::Route(action) => self.handle_server_action(action).await?,
            ConnectionCommand::SetTarget(target) => {
                self.base.set_target(target);
                self.apply_quality().await?;
            }
            ConnectionCommand::ReplaceTrack {
                kind,
                track,
                respond_to,
            } => {
                let result = self.replace_track(kind, track).await;
                let failed = result.is_err();
                let _ = respond_to.send(result.clone());
                if failed {
                    return result.map(|()| Flow::Stop);
                }
            }
            ConnectionCommand::SetTrackEnabled {
                kind,
                enabled,
                respond_to,
            } => {
                let result = self.set_track_enabled(kind, enabled).await;
                let _ = respond_to.send(result.clone());
                // A missing track is the caller's mistake, not a broken connection.
                if let Err(e @ ClientError::Peer(_)) = result {
                    return Err(e);
                }
            }
            ConnectionCommand::PollStats { respond_to } => {
                let _ = respond_to.send(self.base.sample_stats().await);
            }
            ConnectionCommand::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            ConnectionCommand::UpdateDeclaredState(_) => {}
            ConnectionCommand::RequestQuality { respond_to, .. } => {
                let _ = respond_to.send(Err(ClientError::Connection(
                    "quality reservations apply to subscribers".to_string(),
                )));
            }
            ConnectionCommand::ReleaseQuality { .. } => {}
            ConnectionCommand::Close { .. } | ConnectionCommand::Unpublish { .. } => {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_server_action(&mut self, action: ServerMediaAction) -> Result<(), ClientError> {
        let name = action.name();
        match action {
            ServerMediaAction::SdpAnswer { sdp, .. } => {
                let Negotiation::AwaitingAnswer { renegotiate } = self.negotiation else {
                    warn!(
                        target: "cc.connection.publisher",
                        media_id = %self.base.media_id,
                        "Ignoring sdp_answer without an outstanding offer"
                    );
                    return Ok(());
                };

                self.base.apply_remote_description(SdpKind::Answer, &sdp).await?;
                self.negotiation = Negotiation::Stable;

                if self.completed {
                    self.announce_if_changed();
                } else {
                    let state = self.media_state();
                    self.base.send(ClientMediaAction::PublishComplete {
                        target: self.base.descriptor.participant_id.clone(),
                        media_session_type: self.base.descriptor.kind,
                        media_session_state: state,
                    });
                    self.announced = Some(state);
                    self.completed = true;
                    info!(target: "cc.connection.publisher", media_id = %self.base.media_id, "Publish complete");
                }

                if renegotiate {
                    debug!(target: "cc.connection.publisher", media_id = %self.base.media_id, "Running deferred renegotiation");
                    self.offer().await?;
                }
            }
            ServerMediaAction::SdpCandidate { candidate, .. } => {
                self.base.add_remote_candidate(candidate).await?;
            }
            ServerMediaAction::WebrtcUp { .. } => {
                self.base.set_up(true);
            }
            ServerMediaAction::WebrtcDown { .. } => {
                self.base.set_up(false);
            }
            ServerMediaAction::SdpEndOfCandidates { .. }
            | ServerMediaAction::WebrtcSlow { .. }
            | ServerMediaAction::MediaStatus { .. } => {
                debug!(target: "cc.connection.publisher", action = name, "No publisher action needed");
            }
            ServerMediaAction::SdpOffer { .. } => {
                warn!(
                    target: "cc.connection.publisher",
                    media_id = %self.base.media_id,
                    "Unexpected sdp_offer on publisher"
                );
            }
        }
        Ok(())
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<Flow, ClientError> {
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
                debug!(target: "cc.connection.publisher", state = ?state, "Peer state changed");
                self.base.peer_state = state;
            }
            PeerEvent::NegotiationNeeded => match self.negotiation {
                Negotiation::Idle => {}
                Negotiation::AwaitingAnswer { .. } => {
                    self.negotiation = Negotiation::AwaitingAnswer { renegotiate: true };
                }
                Negotiation::Stable => self.offer().await?,
            },
            PeerEvent::TrackAdded(_)
            | PeerEvent::TrackMuted(_)
            | PeerEvent::TrackUnmuted(_)
            | PeerEvent::TrackEnded(_) => {}
        }
        Ok(Flow::Continue)
    }

    /// Bring the video sender in line with `min(target, limit)`.
    async fn apply_quality(&mut self) -> Result<(), ClientError> {
        let quality = self.base.quality();
        if self.applied == Some(quality) {
            return Ok(());
        }

        if self.stream.video.is_some() {
            if quality == QualitySetting::Off {
                self.park().await?;
            } else {
                self.unpark().await?;
                self.base
                    .peer
                    .set_encodings(&simulcast::encodings(quality, self.max_bitrate_bps))
                    .await?;
            }
        }

        debug!(
            target: "cc.connection.publisher",
            media_id = %self.base.media_id,
            from = self.applied.map(QualitySetting::as_str),
            to = quality.as_str(),
            "Applied publish quality"
        );
        self.applied = Some(quality);
        self.announce_if_changed();
        Ok(())
    }

    async fn park(&mut self) -> Result<(), ClientError> {
        if self.placeholder.is_some() || !self.senders.contains(&TrackKind::Video) {
            return Ok(());
        }
        let placeholder = LocalTrack::placeholder(TrackKind::Video);
        self.base
            .peer
            .replace_track(TrackKind::Video, Some(&placeholder))
            .await?;
        self.placeholder = Some(placeholder);
        info!(target: "cc.connection.publisher", media_id = %self.base.media_id, "Video sender parked");
        Ok(())
    }

    async fn unpark(&mut self) -> Result<(), ClientError> {
        if self.placeholder.is_none() {
            return Ok(());
        }
        self.base
            .peer
            .replace_track(TrackKind::Video, self.stream.video.as_ref())
            .await?;
        self.placeholder = None;
        info!(target: "cc.connection.publisher", media_id = %self.base.media_id, "Video sender resumed");
        Ok(())
    }

    async fn replace_track(
        &mut self,
        kind: TrackKind,
        track: Option<LocalTrack>,
    ) -> Result<(), ClientError> {
        *self.stream.track_mut(kind) = track;

        if !self.senders.contains(&kind) {
            // First track of this kind: a new sender, negotiated via NegotiationNeeded.
            if let Some(track) = self.stream.track(kind) {
                self.base.peer.add_track(track).await?;
                self.senders.insert(kind);
                if kind == TrackKind::Video {
                    self.applied = None;
                    self.apply_quality().await?;
                }
            }
        } else if kind == TrackKind::Video {
            self.replace_video().await?;
        } else {
            self.base
                .peer
                .replace_track(kind, self.stream.track(kind))
                .await?;
        }

        self.announce_if_changed();
        Ok(())
    }

    /// Put the current video track on an existing sender, honouring `Off`.
    async fn replace_video(&mut self) -> Result<(), ClientError> {
        if self.stream.video.is_none() {
            self.base.peer.replace_track(TrackKind::Video, None).await?;
            if self.placeholder.take().is_some() {
                info!(
                    target: "cc.connection.publisher",
                    media_id = %self.base.media_id,
                    "Video track removed while parked, sender detached"
                );
            }
            return Ok(());
        }

        let quality = self.base.quality();
        if quality == QualitySetting::Off {
            // Parked: the new track goes on the sender when quality rises.
            return self.park().await;
        }

        self.base
            .peer
            .replace_track(TrackKind::Video, self.stream.video.as_ref())
            .await?;
        self.base
            .peer
            .set_encodings(&simulcast::encodings(quality, self.max_bitrate_bps))
            .await
    }

    async fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<(), ClientError> {
        let Some(track) = self.stream.track_mut(kind).as_mut() else {
            return Err(ClientError::NotFound(format!("no local {kind} track")));
        };
        if track.enabled == enabled {
            return Ok(());
        }
        track.enabled = enabled;

        let parked = kind == TrackKind::Video && self.placeholder.is_some();
        if !parked {
            self.base
                .peer
                .replace_track(kind, self.stream.track(kind))
                .await?;
        }

        self.announce_if_changed();
        Ok(())
    }

    /// What this publisher currently sends.
    fn media_state(&self) -> MediaSessionState {
        let audio_enabled = self.stream.audio.as_ref().is_some_and(|t| t.enabled);
        let video_enabled = self.placeholder.is_none()
            && self.applied.is_some_and(|q| q > QualitySetting::Off)
            && self.stream.video.as_ref().is_some_and(|t| t.enabled);

        MediaSessionState {
            audio_enabled,
            video_enabled,
            quality: if video_enabled {
                self.base.quality()
            } else {
                QualitySetting::Off
            },
        }
    }

    /// Send `update_media_session` if the state moved since the last announcement.
    fn announce_if_changed(&mut self) {
        if !self.completed {
            return;
        }
        let state = self.media_state();
        if self.announced == Some(state) {
            return;
        }

        debug!(
            target: "cc.connection.publisher",
            media_id = %self.base.media_id,
            audio = state.audio_enabled,
            video = state.video_enabled,
            quality = state.quality.as_str(),
            "Announcing media session state"
        );
        self.base.send(ClientMediaAction::UpdateMediaSession {
            media_session_type: self.base.descriptor.kind,
            media_session_state: state,
        });
        self.announced = Some(state);
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.base.id,
            role: PeerRole::Publisher,
            media_id: self.base.media_id.clone(),
            target: self.base.target(),
            limit: self.base.limit(),
            quality: self.base.quality(),
            up: self.base.is_up(),
            peer_state: self.base.peer_state,
            health: None,
            announced: self.announced,
            parked: self.placeholder.is_some(),
        }
    }
}
