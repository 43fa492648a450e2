//! `ConferenceRoom` actor.

use super::{
    RoomConfig, RoomEvent, RoomHandle, RoomMessage, RoomState, ShutdownReason,
    ROOM_CHANNEL_BUFFER,
};
use crate::api::{ConferenceApi, RoomSession};
use crate::config::ClientConfig;
use crate::connection::PeerConnectionFactory;
use crate::errors::ClientError;
use crate::observability::metrics;
use crate::registry::{ConnectionRegistry, RegistryEvent, RegistryHandle};
use crate::signaling::{SignalingChannel, SignalingEvent, SignalingHandle, SignalingState};
use crate::timing::{deadline_after, sleep_until_deadline};
use crate::turn::TurnCredentialCache;
use common::types::ParticipantId;
use signaling_protocol::codec::{decode_inbound_control, decode_inbound_media, encode_media_action};
use signaling_protocol::control::{ControlAction, InboundControl};
use signaling_protocol::envelope::{CONTROL_NAMESPACE, MEDIA_NAMESPACE};
use signaling_protocol::media::{ClientMediaAction, InboundMedia};
use signaling_protocol::Envelope;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// The components a room drives, already spawned.
pub struct RoomParts {
    pub api: Arc<ConferenceApi>,
    pub signaling: SignalingHandle,
    pub signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    pub registry: RegistryHandle,
    pub registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
    /// Outbound media actions written by the registry's connections.
    pub outbound_rx: mpsc::UnboundedReceiver<ClientMediaAction>,
}

/// Why a rejoin is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RejoinReason {
    Disconnected,
    JoinBlocked,
}

impl RejoinReason {
    fn as_str(self) -> &'static str {
        match self {
            RejoinReason::Disconnected => "disconnected",
            RejoinReason::JoinBlocked => "join_blocked",
        }
    }
}

/// Outcome of handling one input.
enum Flow {
    Continue,
    Shutdown(ShutdownReason),
}

/// Actor owning one room session.
pub struct ConferenceRoom {
    config: RoomConfig,
    api: Arc<ConferenceApi>,
    signaling: SignalingHandle,
    signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    registry: RegistryHandle,
    registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
    outbound_rx: mpsc::UnboundedReceiver<ClientMediaAction>,
    receiver: mpsc::Receiver<RoomMessage>,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
    state_tx: watch::Sender<RoomState>,
    cancel_token: CancellationToken,

    state: RoomState,
    session: Option<RoomSession>,
    rejoin_at: Option<Instant>,
    rejoin_reason: RejoinReason,
    rejoin_attempt: u32,
}

impl ConferenceRoom {
    /// Spawn a room over already running components.
    #[must_use]
    pub fn spawn(
        config: RoomConfig,
        parts: RoomParts,
        cancel_token: CancellationToken,
    ) -> (RoomHandle, mpsc::UnboundedReceiver<RoomEvent>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RoomState::Idle);

        let handle = RoomHandle {
            sender,
            state: state_rx,
            registry: parts.registry.clone(),
            signaling: parts.signaling.clone(),
            cancel_token: cancel_token.clone(),
        };

        let actor = Self {
            config,
            api: parts.api,
            signaling: parts.signaling,
            signaling_events: parts.signaling_events,
            registry: parts.registry,
            registry_events: parts.registry_events,
            outbound_rx: parts.outbound_rx,
            receiver,
            events_tx,
            state_tx,
            cancel_token,
            state: RoomState::Idle,
            session: None,
            rejoin_at: None,
            rejoin_reason: RejoinReason::Disconnected,
            rejoin_attempt: 0,
        };

        let task_handle = tokio::spawn(actor.run());
        (handle, events_rx, task_handle)
    }

    /// Build and spawn the whole client stack for one room from `config`.
    ///
    /// Signaling, the registry and the room share `cancel_token` as parent.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn start(
        config: &ClientConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        cancel_token: CancellationToken,
    ) -> Result<(RoomHandle, mpsc::UnboundedReceiver<RoomEvent>, JoinHandle<()>), ClientError>
    {
        let api = Arc::new(ConferenceApi::new(
            config.api_url.clone(),
            config.api_token.clone(),
            config.http_timeout,
        )?);
        let ice = Arc::new(TurnCredentialCache::new(
            Arc::clone(&api),
            config.turn_cache_config(),
        ));

        let (signaling, signaling_events, _signaling_task) =
            SignalingChannel::spawn(config.signaling_config(), cancel_token.child_token());

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (registry, registry_events, _registry_task) = ConnectionRegistry::spawn(
            config.registry_config(),
            factory,
            ice,
            outbound_tx,
            cancel_token.child_token(),
        );

        let parts = RoomParts {
            api,
            signaling,
            signaling_events,
            registry,
            registry_events,
            outbound_rx,
        };

        Ok(Self::spawn(config.room_config(), parts, cancel_token))
    }

    #[instrument(skip_all, name = "cc.room", fields(room_id = %self.config.room_id))]
    async fn run(mut self) {
        info!(target: "cc.room", room_id = %self.config.room_id, "Room started");

        let reason = loop {
            let flow = tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "cc.room", "Room cancelled");
                    self.set_state(RoomState::Closed);
                    return;
                }

                msg = self.receiver.recv() => match msg {
                    Some(RoomMessage::Join { respond_to }) => {
                        let result = self.join().await;
                        let _ = respond_to.send(result);
                        Flow::Continue
                    }
                    Some(RoomMessage::Leave { respond_to }) => {
                        self.shutdown(ShutdownReason::Left).await;
                        let _ = respond_to.send(());
                        Flow::Shutdown(ShutdownReason::Left)
                    }
                    None => Flow::Shutdown(ShutdownReason::Left),
                },

                Some(event) = self.signaling_events.recv() => self.handle_signaling_event(event).await,

                Some(event) = self.registry_events.recv() => {
                    self.emit(RoomEvent::from(event));
                    Flow::Continue
                }

                Some(action) = self.outbound_rx.recv() => {
                    self.send_media_action(&action).await;
                    Flow::Continue
                }

                () = sleep_until_deadline(self.rejoin_at) => self.attempt_rejoin().await,
            };

            if let Flow::Shutdown(reason) = flow {
                self.shutdown(reason).await;
                break reason;
            }
        };

        info!(target: "cc.room", reason = reason.as_str(), "Room stopped");
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    async fn join(&mut self) -> Result<(), ClientError> {
        match self.state {
            RoomState::Closed => return Err(ClientError::ChannelClosed),
            RoomState::Joined => return Ok(()),
            RoomState::Idle | RoomState::Joining | RoomState::Rejoining => {}
        }

        self.set_state(RoomState::Joining);
        match self.start_session(false).await {
            Ok(participant_id) => {
                self.set_state(RoomState::Joined);
                self.emit(RoomEvent::Joined {
                    participant_id,
                    resumed: false,
                });
                Ok(())
            }
            Err(e) => {
                warn!(target: "cc.room", error = %e, "Join failed");
                self.set_state(RoomState::Idle);
                Err(e)
            }
        }
    }

    /// Start (or resume) the room session over the API and connect signaling.
    async fn start_session(&mut self, resume: bool) -> Result<Option<ParticipantId>, ClientError> {
        let resumption = if resume {
            self.session.as_ref().map(|s| s.resumption.clone())
        } else {
            None
        };

        let session = self
            .api
            .start_room(&self.config.room_id, self.config.invited, resumption.as_ref())
            .await?;

        if let Some(participant_id) = &session.participant_id {
            self.registry
                .set_local_participant(participant_id.clone())
                .await?;
        }

        self.signaling.connect(session.ticket.clone()).await?;

        let participant_id = session.participant_id.clone();
        self.session = Some(session);
        info!(
            target: "cc.room",
            room_id = %self.config.room_id,
            resumed = resume,
            "Room session started"
        );
        Ok(participant_id)
    }

    fn schedule_rejoin(&mut self, reason: RejoinReason) -> Flow {
        self.rejoin_attempt += 1;
        if self.rejoin_attempt > self.config.max_rejoin_attempts {
            error!(
                target: "cc.room",
                attempts = self.config.max_rejoin_attempts,
                "Rejoin attempts exhausted"
            );
            return Flow::Shutdown(ShutdownReason::RejoinFailed);
        }

        let delay = match reason {
            RejoinReason::JoinBlocked => self.config.rejoin_delay,
            RejoinReason::Disconnected => self.config.rejoin_backoff(self.rejoin_attempt),
        };
        info!(
            target: "cc.room",
            attempt = self.rejoin_attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            reason = reason.as_str(),
            "Rejoin scheduled"
        );

        self.rejoin_reason = reason;
        self.rejoin_at = Some(deadline_after(Instant::now(), delay));
        self.set_state(RoomState::Rejoining);
        self.emit(RoomEvent::Rejoining {
            attempt: self.rejoin_attempt,
            delay,
        });
        Flow::Continue
    }

    async fn attempt_rejoin(&mut self) -> Flow {
        self.rejoin_at = None;
        let reason = self.rejoin_reason;
        metrics::record_rejoin_attempt(reason.as_str());

        match self.start_session(true).await {
            Ok(participant_id) => {
                info!(target: "cc.room", attempt = self.rejoin_attempt, "Rejoined room");
                self.rejoin_attempt = 0;
                if let Err(e) = self.registry.resume().await {
                    warn!(target: "cc.room", error = %e, "Registry resume failed");
                }
                self.set_state(RoomState::Joined);
                self.emit(RoomEvent::Joined {
                    participant_id,
                    resumed: true,
                });
                Flow::Continue
            }
            Err(e) => {
                warn!(
                    target: "cc.room",
                    attempt = self.rejoin_attempt,
                    error = %e,
                    "Rejoin failed"
                );
                self.schedule_rejoin(reason)
            }
        }
    }

    /// Close the registry, disconnect signaling and emit `Shutdown`.
    async fn shutdown(&mut self, reason: ShutdownReason) {
        if self.state == RoomState::Closed {
            return;
        }
        info!(target: "cc.room", reason = reason.as_str(), "Shutting down room");

        self.rejoin_at = None;
        if let Err(e) = self.registry.close().await {
            debug!(target: "cc.room", error = %e, "Registry already stopped");
        }
        if let Err(e) = self.signaling.disconnect().await {
            debug!(target: "cc.room", error = %e, "Signaling already stopped");
        }

        self.set_state(RoomState::Closed);
        self.emit(RoomEvent::Shutdown(reason));
    }

    // ========================================================================
    // Signaling
    // ========================================================================

    async fn handle_signaling_event(&mut self, event: SignalingEvent) -> Flow {
        match event {
            SignalingEvent::ConnectionStateChanged(state) => {
                self.emit(RoomEvent::StateChanged(state));
                self.handle_signaling_state(state).await
            }
            SignalingEvent::MessageReceived(envelope) => self.route(envelope).await,
        }
    }

    async fn handle_signaling_state(&mut self, state: SignalingState) -> Flow {
        match state {
            SignalingState::Closed => {
                if self.state == RoomState::Closed {
                    return Flow::Continue;
                }
                info!(target: "cc.room", "Signaling closed by server");
                Flow::Shutdown(ShutdownReason::Closed)
            }
            SignalingState::Disconnected => {
                if self.state != RoomState::Joined {
                    // Failed connects during join/rejoin are handled where
                    // they happen.
                    return Flow::Continue;
                }
                warn!(target: "cc.room", "Signaling lost, closing connections before rejoin");
                if let Err(e) = self.registry.close_connections().await {
                    warn!(target: "cc.room", error = %e, "Closing connections failed");
                }
                self.schedule_rejoin(RejoinReason::Disconnected)
            }
            SignalingState::Connecting | SignalingState::Connected => Flow::Continue,
        }
    }

    async fn route(&mut self, envelope: Envelope) -> Flow {
        match envelope.namespace.as_str() {
            MEDIA_NAMESPACE => {
                match decode_inbound_media(&envelope) {
                    Ok(InboundMedia::Consumed(action)) => {
                        if let Err(e) = self.registry.route_media(action).await {
                            warn!(target: "cc.room", error = %e, "Media action not routed");
                        }
                    }
                    Ok(InboundMedia::Passthrough(payload)) => self.emit(RoomEvent::Media(payload)),
                    Err(e) => warn!(target: "cc.room", error = %e, "Dropping malformed media action"),
                }
                Flow::Continue
            }
            CONTROL_NAMESPACE => match decode_inbound_control(&envelope) {
                Ok(InboundControl::Handled(action)) => self.handle_control(action).await,
                Ok(InboundControl::Passthrough(payload)) => {
                    self.emit(RoomEvent::Control(payload));
                    Flow::Continue
                }
                Err(e) => {
                    warn!(target: "cc.room", error = %e, "Dropping malformed control action");
                    Flow::Continue
                }
            },
            _ => {
                self.emit(RoomEvent::Message(envelope));
                Flow::Continue
            }
        }
    }

    async fn handle_control(&mut self, action: ControlAction) -> Flow {
        match action {
            ControlAction::ParticipantJoined { participant } => {
                debug!(target: "cc.room", participant_id = %participant.id, "Participant joined");
                if let Err(e) = self.registry.update_participant(participant.clone()).await {
                    warn!(target: "cc.room", error = %e, "Roster update failed");
                }
                self.emit(RoomEvent::ParticipantJoined(participant));
            }
            ControlAction::ParticipantUpdated { participant } => {
                if let Err(e) = self.registry.update_participant(participant.clone()).await {
                    warn!(target: "cc.room", error = %e, "Roster update failed");
                }
                self.emit(RoomEvent::ParticipantUpdated(participant));
            }
            ControlAction::ParticipantLeft { participant_id } => {
                debug!(target: "cc.room", participant_id = %participant_id, "Participant left");
                if let Err(e) = self.registry.remove_participant(participant_id.clone()).await {
                    warn!(target: "cc.room", error = %e, "Roster update failed");
                }
                self.emit(RoomEvent::ParticipantLeft(participant_id));
            }
            ControlAction::JoinBlocked { reason } => {
                warn!(target: "cc.room", reason = ?reason, "Join blocked by server");
                self.emit(RoomEvent::JoinBlocked { reason });
                if self.rejoin_at.is_none() {
                    return self.schedule_rejoin(RejoinReason::JoinBlocked);
                }
            }
        }
        Flow::Continue
    }

    async fn send_media_action(&self, action: &ClientMediaAction) {
        let envelope = match encode_media_action(action) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(target: "cc.room", action = action.name(), error = %e, "Failed to encode media action");
                return;
            }
        };
        if let Err(e) = self.signaling.send(envelope).await {
            debug!(
                target: "cc.room",
                action = action.name(),
                error = %e,
                "Media action dropped, signaling not open"
            );
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn set_state(&mut self, state: RoomState) {
        if self.state != state {
            debug!(
                target: "cc.room",
                from = self.state.as_str(),
                to = state.as_str(),
                "Room state changed"
            );
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    fn emit(&self, event: RoomEvent) {
        if self.events_tx.send(event).is_err() {
            debug!(target: "cc.room", "Room event receiver dropped");
        }
    }
}
