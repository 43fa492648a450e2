//! `ConnectionRegistry` actor.

use super::entry::{ConnectionEntry, ConnectionSlot, CreationWaiter, Reservations};
use super::{
    ConsumerRef, EntryStatus, RegistryConfig, RegistryEvent, RegistryHandle, RegistryMessage,
    RegistryStatus, StatsSummary, REGISTRY_CHANNEL_BUFFER,
};
use crate::connection::{
    ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionParts, LocalStream, LocalTrack,
    PeerConnection, PeerConnectionFactory, PeerEvents, PeerRole, PublisherConfig,
    PublisherConnection, QualityReservation, StatsSample, SubscriberConfig, SubscriberConnection,
};
use crate::errors::ClientError;
use crate::observability::metrics;
use crate::quality::{QualityBackoffController, QualityBackoffHandle};
use crate::timing::deadline_after;
use crate::turn::IceServerSource;
use common::types::{MediaDescriptor, MediaId, MediaKind, ParticipantId, QualitySetting};
use futures::future::join_all;
use signaling_protocol::control::Participant;
use signaling_protocol::media::{ClientMediaAction, ServerMediaAction, SlowLinkDirection, TrackKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Upper bound on waiting for connections to close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Both media kinds, in roster order.
const MEDIA_KINDS: [MediaKind; 2] = [MediaKind::Video, MediaKind::Screen];

/// Results posted back by tasks the registry spawns.
enum Internal {
    CreationFinished {
        media_id: MediaId,
        creation_id: u64,
        result: Result<(Arc<dyn PeerConnection>, PeerEvents), ClientError>,
    },
    StatsCollected(Vec<Result<StatsSample, ClientError>>),
}

/// What the application asked to publish for one media kind.
struct Publication {
    stream: LocalStream,
    target: QualitySetting,
}

/// Actor owning every connection in a session.
pub struct ConnectionRegistry {
    config: RegistryConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    ice: Arc<dyn IceServerSource>,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,

    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    connection_events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection_events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    outbound_tx: mpsc::UnboundedSender<ClientMediaAction>,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,

    entries: HashMap<MediaId, ConnectionEntry>,
    reservations: Reservations,
    publications: HashMap<MediaKind, Publication>,
    publisher_backoff: QualityBackoffHandle,

    next_creation_id: u64,
    stats_in_flight: bool,
}

impl ConnectionRegistry {
    /// Spawn the registry.
    ///
    /// Connections write their outbound media actions to `outbound_tx`; the
    /// returned receiver carries [`RegistryEvent`]s.
    #[must_use]
    pub fn spawn(
        config: RegistryConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        ice: Arc<dyn IceServerSource>,
        outbound_tx: mpsc::UnboundedSender<ClientMediaAction>,
        cancel_token: CancellationToken,
    ) -> (
        RegistryHandle,
        mpsc::UnboundedReceiver<RegistryEvent>,
        JoinHandle<()>,
    ) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (connection_events_tx, connection_events_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let (publisher_backoff, _backoff_task) = QualityBackoffController::spawn(
            "publisher",
            &config.publisher_backoff,
            cancel_token.child_token(),
        );

        let actor = Self {
            config,
            factory,
            ice,
            receiver,
            cancel_token: cancel_token.clone(),
            internal_tx,
            internal_rx,
            connection_events_tx,
            connection_events_rx,
            outbound_tx,
            events_tx,
            entries: HashMap::new(),
            reservations: Reservations::default(),
            publications: HashMap::new(),
            publisher_backoff,
            next_creation_id: 0,
            stats_in_flight: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RegistryHandle {
            sender,
            cancel_token,
        };

        (handle, events_rx, task_handle)
    }

    #[instrument(skip_all, name = "cc.registry", fields(local = %self.config.local_participant))]
    async fn run(mut self) {
        info!(target: "cc.registry", "Connection registry started");

        // A zero period would make the interval panic.
        let period = self.config.stats_interval.max(Duration::from_millis(1));
        let mut stats_tick =
            tokio::time::interval_at(deadline_after(Instant::now(), period), period);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "cc.registry", "Connection registry cancelled");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(RegistryMessage::Close { respond_to }) => {
                            self.shutdown().await;
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(target: "cc.registry", "Registry channel closed, exiting");
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                Some(internal) = self.internal_rx.recv() => {
                    match internal {
                        Internal::CreationFinished { media_id, creation_id, result } => {
                            self.finish_creation(media_id, creation_id, result).await;
                        }
                        Internal::StatsCollected(results) => self.handle_stats(results).await,
                    }
                }

                Some(event) = self.connection_events_rx.recv() => {
                    self.handle_connection_event(event).await;
                }

                _ = stats_tick.tick() => self.poll_stats(),
            }
        }

        self.publisher_backoff.cancel();
        info!(
            target: "cc.registry",
            entries = self.entries.len(),
            "Connection registry stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::SetLocalParticipant(id) => self.set_local_participant(id),
            RegistryMessage::EnsureConnection {
                descriptor,
                respond_to,
            } => self.ensure_connection(descriptor, respond_to),
            RegistryMessage::Unsubscribe {
                descriptor,
                respond_to,
            } => {
                let _ = respond_to.send(self.unsubscribe(&descriptor));
            }
            RegistryMessage::RemoveSubscriber {
                descriptor,
                respond_to,
            } => {
                self.remove_subscriber(&descriptor);
                let _ = respond_to.send(Ok(()));
            }
            RegistryMessage::Publish {
                kind,
                stream,
                respond_to,
            } => self.publish(kind, stream, respond_to),
            RegistryMessage::Unpublish { kind, respond_to } => {
                let _ = respond_to.send(self.unpublish(kind));
            }
            RegistryMessage::SetPublishQuality {
                kind,
                quality,
                respond_to,
            } => {
                let result = self.set_publish_quality(kind, quality).await;
                let _ = respond_to.send(result);
            }
            RegistryMessage::ReplaceTrack {
                kind,
                track_kind,
                track,
                respond_to,
            } => {
                let result = self.replace_track(kind, track_kind, track).await;
                let _ = respond_to.send(result);
            }
            RegistryMessage::SetTrackEnabled {
                kind,
                track_kind,
                enabled,
                respond_to,
            } => {
                let result = self.set_track_enabled(kind, track_kind, enabled).await;
                let _ = respond_to.send(result);
            }
            RegistryMessage::RequestQuality {
                descriptor,
                target,
                consumer,
                respond_to,
            } => {
                self.request_quality(descriptor, target, consumer).await;
                let _ = respond_to.send(());
            }
            RegistryMessage::ReleaseQuality {
                consumer,
                respond_to,
            } => {
                self.release_quality(&consumer).await;
                let _ = respond_to.send(());
            }
            RegistryMessage::EffectiveTarget {
                descriptor,
                respond_to,
            } => {
                let target = self.reservations.effective_target(&descriptor.media_id());
                let _ = respond_to.send(target);
            }
            RegistryMessage::UpdateParticipant(participant) => {
                self.update_participant(&participant).await;
            }
            RegistryMessage::RemoveParticipant(id) => self.remove_participant(&id),
            RegistryMessage::RouteMedia(action) => self.route_media(action).await,
            RegistryMessage::CloseConnections { respond_to } => {
                self.close_connections().await;
                let _ = respond_to.send(());
            }
            RegistryMessage::Resume { respond_to } => {
                self.resume();
                let _ = respond_to.send(());
            }
            RegistryMessage::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            // Handled in the run loop
            RegistryMessage::Close { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    fn is_local(&self, participant_id: &ParticipantId) -> bool {
        participant_id == &self.config.local_participant
    }

    fn local_descriptor(&self, kind: MediaKind) -> MediaDescriptor {
        MediaDescriptor {
            participant_id: self.config.local_participant.clone(),
            kind,
        }
    }

    fn set_local_participant(&mut self, id: ParticipantId) {
        if id == self.config.local_participant {
            return;
        }
        let publishers = self
            .entries
            .values()
            .filter(|e| e.role == PeerRole::Publisher)
            .count();
        if publishers > 0 {
            // Publishers keep their old descriptor until the next resume.
            warn!(
                target: "cc.registry",
                old = %self.config.local_participant,
                new = %id,
                publishers,
                "Local participant changed with live publishers"
            );
        }
        info!(target: "cc.registry", participant_id = %id, "Local participant set");
        self.config.local_participant = id;
    }

    // ========================================================================
    // Creation
    // ========================================================================

    fn start_creation(&mut self, media_id: &MediaId, waiters: Vec<CreationWaiter>) {
        self.next_creation_id += 1;
        let creation_id = self.next_creation_id;

        let Some(entry) = self.entries.get_mut(media_id) else {
            return;
        };
        entry.slot = ConnectionSlot::Creating {
            creation_id,
            waiters,
            remove_after: false,
        };
        let role = entry.role;

        debug!(
            target: "cc.registry",
            media_id = %media_id,
            role = role.as_str(),
            creation_id,
            "Creating connection"
        );

        let factory = Arc::clone(&self.factory);
        let ice = Arc::clone(&self.ice);
        let internal_tx = self.internal_tx.clone();
        let cancel_token = self.cancel_token.clone();
        let media_id = media_id.clone();

        tokio::spawn(async move {
            // Run creation in its own task so a panic in the ICE source or
            // the engine still settles the slot.
            let create = tokio::spawn(async move {
                let servers = ice.ice_servers().await;
                factory.create(&servers, role).await
            });
            let abort = create.abort_handle();
            tokio::select! {
                () = cancel_token.cancelled() => abort.abort(),
                joined = create => {
                    let result = joined.unwrap_or_else(|e| {
                        Err(ClientError::Connection(format!(
                            "connection creation task failed: {e}"
                        )))
                    });
                    let _ = internal_tx.send(Internal::CreationFinished {
                        media_id,
                        creation_id,
                        result,
                    });
                }
            }
        });
    }

    async fn finish_creation(
        &mut self,
        media_id: MediaId,
        creation_id: u64,
        result: Result<(Arc<dyn PeerConnection>, PeerEvents), ClientError>,
    ) {
        let current = self.entries.get(&media_id).is_some_and(|entry| {
            matches!(
                &entry.slot,
                ConnectionSlot::Creating { creation_id: id, .. } if *id == creation_id
            )
        });
        if !current {
            debug!(
                target: "cc.registry",
                media_id = %media_id,
                creation_id,
                "Discarding stale connection creation"
            );
            if let Ok((peer, _events)) = result {
                tokio::spawn(async move { peer.close().await });
            }
            return;
        }

        let Some(entry) = self.entries.get_mut(&media_id) else {
            return;
        };
        let ConnectionSlot::Creating {
            waiters,
            remove_after,
            ..
        } = std::mem::replace(&mut entry.slot, ConnectionSlot::Idle)
        else {
            return;
        };
        let descriptor = entry.descriptor.clone();
        let role = entry.role;
        let declared = entry.state;

        let (peer, peer_events) = match result {
            Ok(created) => created,
            Err(e) => {
                warn!(
                    target: "cc.registry",
                    media_id = %media_id,
                    error = %e,
                    "Connection creation failed"
                );
                fail_waiters(waiters, &e);
                if remove_after {
                    self.entries.remove(&media_id);
                }
                return;
            }
        };

        let publication = match role {
            PeerRole::Publisher => self
                .publications
                .get(&descriptor.kind)
                .map(|p| (p.stream.clone(), p.target)),
            PeerRole::Subscriber => None,
        };

        if remove_after || (role == PeerRole::Publisher && publication.is_none()) {
            debug!(
                target: "cc.registry",
                media_id = %media_id,
                "Connection removed while it was being created"
            );
            tokio::spawn(async move { peer.close().await });
            fail_waiters(
                waiters,
                &ClientError::Connection(format!("{media_id} removed during creation")),
            );
            self.entries.remove(&media_id);
            return;
        }

        let parts = ConnectionParts {
            id: ConnectionId::new(),
            descriptor,
            peer,
            peer_events,
            events_tx: self.connection_events_tx.clone(),
            outbound_tx: self.outbound_tx.clone(),
            cancel_token: self.cancel_token.child_token(),
        };

        let handle = match publication {
            Some((stream, target)) => {
                let config = PublisherConfig {
                    max_bitrate_bps: self.config.max_publish_bitrate_bps,
                    target,
                };
                PublisherConnection::spawn(parts, stream, config, self.publisher_backoff.subscribe())
                    .0
            }
            None => SubscriberConnection::spawn(parts, &self.subscriber_config()).0,
        };

        info!(
            target: "cc.registry",
            media_id = %media_id,
            role = role.as_str(),
            connection_id = %handle.id(),
            waiters = waiters.len(),
            "Connection ready"
        );

        if let Some(entry) = self.entries.get_mut(&media_id) {
            entry.slot = ConnectionSlot::Ready(handle.clone());
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(handle.clone()));
        }
        self.update_connection_metrics();

        if role == PeerRole::Subscriber {
            if let Err(e) = handle.update_declared_state(declared).await {
                warn!(target: "cc.registry", media_id = %media_id, error = %e, "Declared state not delivered");
            }
            self.acquire_guards(&media_id).await;
        }
    }

    fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            backoff: self.config.subscriber_backoff.clone(),
            debounce: self.config.quality_debounce,
            debounce_max_wait: self.config.quality_debounce_max_wait,
        }
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    fn ensure_connection(
        &mut self,
        descriptor: MediaDescriptor,
        respond_to: oneshot::Sender<Result<ConnectionHandle, ClientError>>,
    ) {
        if self.is_local(&descriptor.participant_id) {
            let _ = respond_to.send(Err(ClientError::Connection(format!(
                "cannot subscribe to local media {descriptor}"
            ))));
            return;
        }

        let media_id = descriptor.media_id();
        let entry = self
            .entries
            .entry(media_id.clone())
            .or_insert_with(|| ConnectionEntry::new(descriptor, PeerRole::Subscriber));

        match &mut entry.slot {
            ConnectionSlot::Ready(handle) => {
                let _ = respond_to.send(Ok(handle.clone()));
            }
            ConnectionSlot::Creating {
                waiters,
                remove_after,
                ..
            } => {
                *remove_after = false;
                waiters.push(respond_to);
            }
            ConnectionSlot::Idle | ConnectionSlot::Closing(_) => {
                self.start_creation(&media_id, vec![respond_to]);
            }
        }
    }

    fn unsubscribe(&mut self, descriptor: &MediaDescriptor) -> Result<(), ClientError> {
        let media_id = descriptor.media_id();
        let Some(entry) = self.entries.get(&media_id) else {
            return Err(ClientError::NotFound(media_id.to_string()));
        };

        if matches!(entry.slot, ConnectionSlot::Creating { .. }) {
            error!(
                target: "cc.registry",
                media_id = %media_id,
                "Unsubscribe while connection creation is pending"
            );
            return Err(ClientError::CreationPending(media_id));
        }

        self.remove_entry(&media_id);
        Ok(())
    }

    /// Like `unsubscribe`, but an in-flight creation is torn down once it
    /// settles instead of being rejected.
    fn remove_subscriber(&mut self, descriptor: &MediaDescriptor) {
        let media_id = descriptor.media_id();
        match self.entries.get_mut(&media_id).map(|e| &mut e.slot) {
            Some(ConnectionSlot::Creating { remove_after, .. }) => {
                debug!(
                    target: "cc.registry",
                    media_id = %media_id,
                    "Subscriber removal deferred until creation settles"
                );
                *remove_after = true;
            }
            Some(_) => self.remove_entry(&media_id),
            None => {}
        }
    }

    /// Drop an entry that is not being created, closing its connection in
    /// the background.
    fn remove_entry(&mut self, media_id: &MediaId) {
        let Some(entry) = self.entries.remove(media_id) else {
            return;
        };
        self.reservations.forget_guards(media_id);
        if let Some(handle) = entry.slot.connection().cloned() {
            info!(target: "cc.registry", media_id = %media_id, "Closing connection");
            tokio::spawn(async move { handle.close().await });
        }
        self.update_connection_metrics();
    }

    // ========================================================================
    // Quality reservations
    // ========================================================================

    async fn request_quality(
        &mut self,
        descriptor: MediaDescriptor,
        target: QualitySetting,
        consumer: ConsumerRef,
    ) {
        if self.is_local(&descriptor.participant_id) {
            debug!(target: "cc.registry", media_id = %descriptor, "Ignoring reservation on local media");
            return;
        }

        let media_id = descriptor.media_id();
        debug!(
            target: "cc.registry",
            consumer = %consumer,
            media_id = %media_id,
            target = target.as_str(),
            "Quality requested"
        );

        if let Some(previous) = self
            .reservations
            .insert(consumer, descriptor.clone(), target)
        {
            release_guard(previous.guard).await;
            if previous.media_id != media_id {
                self.reconcile(&previous.media_id).await;
            }
        }

        self.entries
            .entry(media_id.clone())
            .or_insert_with(|| ConnectionEntry::new(descriptor, PeerRole::Subscriber));
        self.reconcile(&media_id).await;
    }

    async fn release_quality(&mut self, consumer: &ConsumerRef) {
        let Some(reservation) = self.reservations.remove(consumer) else {
            debug!(target: "cc.registry", consumer = %consumer, "No reservation to release");
            return;
        };
        release_guard(reservation.guard).await;
        self.reconcile(&reservation.media_id).await;
    }

    /// Bring one subscriber entry in line with its reservations and the
    /// roster: create it when there is something to watch, drop it when
    /// nothing refers to it, and hand reservations to a live subscriber.
    async fn reconcile(&mut self, media_id: &MediaId) {
        let effective = self.reservations.effective_target(media_id);
        let Some(entry) = self.entries.get(media_id) else {
            return;
        };
        if entry.role != PeerRole::Subscriber {
            return;
        }

        match entry.slot {
            ConnectionSlot::Ready(_) => self.acquire_guards(media_id).await,
            ConnectionSlot::Idle => {
                let published = entry.is_published();
                if published && effective > QualitySetting::Off {
                    self.start_creation(media_id, Vec::new());
                } else if entry.state.is_none() && effective == QualitySetting::Off {
                    self.entries.remove(media_id);
                }
            }
            ConnectionSlot::Creating { .. } | ConnectionSlot::Closing(_) => {}
        }
    }

    async fn acquire_guards(&mut self, media_id: &MediaId) {
        let Some(handle) = self
            .entries
            .get(media_id)
            .and_then(|e| e.slot.ready())
            .cloned()
        else {
            return;
        };
        if handle.role() != PeerRole::Subscriber {
            return;
        }

        for (consumer, target) in self.reservations.unguarded(media_id) {
            match handle.request_quality(target).await {
                Ok(guard) => {
                    if let Some(reservation) = self.reservations.get_mut(&consumer) {
                        reservation.guard = Some(guard);
                    }
                }
                Err(e) => {
                    warn!(
                        target: "cc.registry",
                        media_id = %media_id,
                        consumer = %consumer,
                        error = %e,
                        "Quality reservation not placed"
                    );
                }
            }
        }
    }

    // ========================================================================
    // Roster
    // ========================================================================

    async fn update_participant(&mut self, participant: &Participant) {
        if self.is_local(&participant.id) {
            return;
        }

        for kind in MEDIA_KINDS {
            let descriptor = MediaDescriptor {
                participant_id: participant.id.clone(),
                kind,
            };
            let media_id = descriptor.media_id();
            let state = participant.media_state(kind).copied();
            let published = state.is_some_and(|s| s.is_published());

            if !self.entries.contains_key(&media_id) {
                if !published {
                    continue;
                }
                self.entries.insert(
                    media_id.clone(),
                    ConnectionEntry::new(descriptor, PeerRole::Subscriber),
                );
            }

            let Some(entry) = self.entries.get_mut(&media_id) else {
                continue;
            };
            entry.state = state;

            if let Some(handle) = entry.slot.ready().cloned() {
                if published {
                    if let Err(e) = handle.update_declared_state(state).await {
                        warn!(target: "cc.registry", media_id = %media_id, error = %e, "Declared state not delivered");
                    }
                } else {
                    info!(
                        target: "cc.registry",
                        media_id = %media_id,
                        "Publisher stopped, closing subscriber"
                    );
                    entry.slot = ConnectionSlot::Closing(handle.clone());
                    self.reservations.forget_guards(&media_id);
                    tokio::spawn(async move { handle.close().await });
                }
            }

            self.reconcile(&media_id).await;
        }
    }

    fn remove_participant(&mut self, participant_id: &ParticipantId) {
        let media_ids: Vec<MediaId> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.role == PeerRole::Subscriber && &e.descriptor.participant_id == participant_id
            })
            .map(|(id, _)| id.clone())
            .collect();

        for media_id in media_ids {
            let Some(entry) = self.entries.remove(&media_id) else {
                continue;
            };
            self.reservations.forget_guards(&media_id);
            match entry.slot {
                ConnectionSlot::Ready(handle) | ConnectionSlot::Closing(handle) => {
                    tokio::spawn(async move { handle.close().await });
                }
                ConnectionSlot::Creating { waiters, .. } => {
                    fail_waiters(
                        waiters,
                        &ClientError::Connection(format!("{participant_id} left")),
                    );
                }
                ConnectionSlot::Idle => {}
            }
        }

        info!(target: "cc.registry", participant_id = %participant_id, "Participant removed");
        self.update_connection_metrics();
    }

    // ========================================================================
    // Server media actions
    // ========================================================================

    async fn route_media(&mut self, action: ServerMediaAction) {
        let participant_id = match action.target() {
            Some(target) if !self.is_local(target) => target.clone(),
            _ => self.config.local_participant.clone(),
        };
        let local = self.is_local(&participant_id);

        if local
            && matches!(
                action,
                ServerMediaAction::WebrtcSlow {
                    direction: SlowLinkDirection::Upstream,
                    ..
                }
            )
        {
            info!(target: "cc.registry", "Server reports slow uplink");
            if let Err(e) = self.publisher_backoff.downgrade_temporarily().await {
                warn!(target: "cc.registry", error = %e, "Publisher downgrade failed");
            }
            return;
        }

        let descriptor = MediaDescriptor {
            participant_id,
            kind: action.media_kind(),
        };
        let media_id = descriptor.media_id();

        match self.entries.get(&media_id).and_then(|e| e.slot.ready()) {
            Some(handle) => {
                if let Err(e) = handle.route(action).await {
                    warn!(target: "cc.registry", media_id = %media_id, error = %e, "Media action not delivered");
                }
            }
            None => {
                debug!(
                    target: "cc.registry",
                    media_id = %media_id,
                    action = action.name(),
                    "No connection for media action, dropping"
                );
            }
        }
    }

    // ========================================================================
    // Publications
    // ========================================================================

    fn publish(
        &mut self,
        kind: MediaKind,
        stream: LocalStream,
        respond_to: oneshot::Sender<Result<ConnectionHandle, ClientError>>,
    ) {
        let target = self
            .publications
            .get(&kind)
            .map_or(QualitySetting::High, |p| p.target);
        self.publications.insert(kind, Publication { stream, target });

        let descriptor = self.local_descriptor(kind);
        let media_id = descriptor.media_id();
        info!(target: "cc.registry", media_id = %media_id, "Publishing");

        let entry = self
            .entries
            .entry(media_id.clone())
            .or_insert_with(|| ConnectionEntry::new(descriptor, PeerRole::Publisher));

        match &mut entry.slot {
            ConnectionSlot::Creating {
                waiters,
                remove_after,
                ..
            } => {
                // The publisher picks up the newest stream when creation settles.
                *remove_after = false;
                waiters.push(respond_to);
            }
            ConnectionSlot::Ready(handle) => {
                let previous = handle.clone();
                tokio::spawn(async move { previous.close().await });
                self.start_creation(&media_id, vec![respond_to]);
            }
            ConnectionSlot::Idle | ConnectionSlot::Closing(_) => {
                self.start_creation(&media_id, vec![respond_to]);
            }
        }
    }

    fn unpublish(&mut self, kind: MediaKind) -> Result<(), ClientError> {
        if self.publications.remove(&kind).is_none() {
            return Err(ClientError::NotFound(format!("no {kind} publication")));
        }

        let media_id = self.local_descriptor(kind).media_id();
        info!(target: "cc.registry", media_id = %media_id, "Unpublishing");

        match self.entries.get_mut(&media_id).map(|e| &mut e.slot) {
            Some(ConnectionSlot::Creating { remove_after, .. }) => *remove_after = true,
            Some(_) => {
                if let Some(entry) = self.entries.remove(&media_id) {
                    if let Some(handle) = entry.slot.connection().cloned() {
                        tokio::spawn(async move { handle.unpublish().await });
                    }
                }
                self.update_connection_metrics();
            }
            None => {}
        }
        Ok(())
    }

    fn ready_publisher(&self, kind: MediaKind) -> Option<ConnectionHandle> {
        self.entries
            .get(&self.local_descriptor(kind).media_id())
            .and_then(|e| e.slot.ready())
            .cloned()
    }

    async fn set_publish_quality(
        &mut self,
        kind: MediaKind,
        quality: QualitySetting,
    ) -> Result<(), ClientError> {
        let publication = self
            .publications
            .get_mut(&kind)
            .ok_or_else(|| ClientError::NotFound(format!("no {kind} publication")))?;
        publication.target = quality;

        match self.ready_publisher(kind) {
            Some(handle) => handle.set_target(quality).await,
            None => Ok(()),
        }
    }

    async fn replace_track(
        &mut self,
        kind: MediaKind,
        track_kind: TrackKind,
        track: Option<LocalTrack>,
    ) -> Result<(), ClientError> {
        let publication = self
            .publications
            .get_mut(&kind)
            .ok_or_else(|| ClientError::NotFound(format!("no {kind} publication")))?;
        *publication.stream.track_mut(track_kind) = track.clone();

        match self.ready_publisher(kind) {
            Some(handle) => handle.replace_track(track_kind, track).await,
            None => Ok(()),
        }
    }

    async fn set_track_enabled(
        &mut self,
        kind: MediaKind,
        track_kind: TrackKind,
        enabled: bool,
    ) -> Result<(), ClientError> {
        let publication = self
            .publications
            .get_mut(&kind)
            .ok_or_else(|| ClientError::NotFound(format!("no {kind} publication")))?;
        let track = publication
            .stream
            .track_mut(track_kind)
            .as_mut()
            .ok_or_else(|| ClientError::NotFound(format!("no {track_kind} track")))?;
        track.enabled = enabled;

        match self.ready_publisher(kind) {
            Some(handle) => handle.set_track_enabled(track_kind, enabled).await,
            None => Ok(()),
        }
    }

    // ========================================================================
    // Connection events
    // ========================================================================

    fn current_entry(&self, media_id: &MediaId, connection_id: ConnectionId) -> Option<&ConnectionEntry> {
        self.entries.get(media_id).filter(|e| {
            e.slot
                .connection()
                .is_some_and(|handle| handle.id() == connection_id)
        })
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Up {
                media_id,
                connection_id,
            } => {
                if let Some(entry) = self.current_entry(&media_id, connection_id) {
                    self.emit(RegistryEvent::ConnectionUp(entry.descriptor.clone()));
                }
            }
            ConnectionEvent::Down {
                media_id,
                connection_id,
            } => {
                if let Some(entry) = self.current_entry(&media_id, connection_id) {
                    self.emit(RegistryEvent::ConnectionDown(entry.descriptor.clone()));
                }
            }
            ConnectionEvent::StreamHealthChanged {
                media_id,
                connection_id,
                health,
            } => {
                if let Some(entry) = self.current_entry(&media_id, connection_id) {
                    self.emit(RegistryEvent::StreamHealthChanged {
                        descriptor: entry.descriptor.clone(),
                        health,
                    });
                }
            }
            ConnectionEvent::Closed {
                media_id,
                connection_id,
            } => self.connection_closed(&media_id, connection_id).await,
        }
    }

    async fn connection_closed(&mut self, media_id: &MediaId, connection_id: ConnectionId) {
        let Some(entry) = self.current_entry(media_id, connection_id) else {
            debug!(
                target: "cc.registry",
                media_id = %media_id,
                connection_id = %connection_id,
                "Ignoring close of a replaced connection"
            );
            return;
        };

        if matches!(entry.slot, ConnectionSlot::Closing(_)) {
            // We asked for this close; keep the entry and its roster state.
            if let Some(entry) = self.entries.get_mut(media_id) {
                entry.slot = ConnectionSlot::Idle;
            }
            self.update_connection_metrics();
            self.reconcile(media_id).await;
            return;
        }

        let descriptor = entry.descriptor.clone();
        warn!(
            target: "cc.registry",
            media_id = %media_id,
            connection_id = %connection_id,
            "Connection closed itself, removing entry"
        );
        self.entries.remove(media_id);
        self.reservations.forget_guards(media_id);
        self.update_connection_metrics();
        self.emit(RegistryEvent::ConnectionClosed(descriptor));
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    fn poll_stats(&mut self) {
        if self.stats_in_flight {
            debug!(target: "cc.registry", "Previous stats poll still running, skipping");
            return;
        }
        let handles: Vec<ConnectionHandle> = self
            .entries
            .values()
            .filter_map(|e| e.slot.ready().cloned())
            .collect();
        if handles.is_empty() {
            return;
        }

        self.stats_in_flight = true;
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let results = join_all(handles.iter().map(ConnectionHandle::poll_stats)).await;
            let _ = internal_tx.send(Internal::StatsCollected(results));
        });
    }

    async fn handle_stats(&mut self, results: Vec<Result<StatsSample, ClientError>>) {
        self.stats_in_flight = false;

        let mut summary = StatsSummary::default();
        for result in results {
            match result {
                Ok(sample) => summary.add(&sample),
                Err(e) => {
                    warn!(target: "cc.registry", error = %e, "Stats poll failed, skipping connection");
                    metrics::record_stats_poll_failure();
                }
            }
        }

        let upstream_loss = summary.upstream_loss();
        metrics::set_transport_stats(summary.upstream_bps, summary.downstream_bps, upstream_loss);
        debug!(
            target: "cc.registry",
            connections = summary.connections,
            upstream_bps = summary.upstream_bps,
            downstream_bps = summary.downstream_bps,
            upstream_loss,
            "Transport stats"
        );

        if upstream_loss > self.config.upstream_loss_threshold {
            info!(target: "cc.registry", upstream_loss, "Upstream loss high, backing off publishers");
            if let Err(e) = self.publisher_backoff.downgrade_temporarily().await {
                warn!(target: "cc.registry", error = %e, "Publisher downgrade failed");
            }
        }

        self.emit(RegistryEvent::Stats(summary));
    }

    // ========================================================================
    // Teardown and resume
    // ========================================================================

    /// Close every connection and wait for them, keeping publications,
    /// reservations and roster state.
    async fn close_connections(&mut self) {
        let mut handles = Vec::new();
        let mut publishers = Vec::new();

        for (media_id, entry) in &mut self.entries {
            match std::mem::replace(&mut entry.slot, ConnectionSlot::Idle) {
                ConnectionSlot::Ready(handle) | ConnectionSlot::Closing(handle) => {
                    handles.push(handle);
                }
                ConnectionSlot::Creating { waiters, .. } => {
                    fail_waiters(waiters, &ClientError::Connection("connections closed".to_string()));
                }
                ConnectionSlot::Idle => {}
            }
            if entry.role == PeerRole::Publisher {
                publishers.push(media_id.clone());
            }
        }
        for media_id in publishers {
            self.entries.remove(&media_id);
        }
        self.reservations.forget_all_guards();

        info!(target: "cc.registry", connections = handles.len(), "Closing all connections");
        let closing = join_all(handles.iter().map(ConnectionHandle::close));
        if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            warn!(target: "cc.registry", "Connection close timed out, cancelling");
            for handle in &handles {
                handle.cancel();
            }
        }
        self.update_connection_metrics();
    }

    /// Recreate publishers for every publication and subscribers for
    /// published media somebody still watches.
    fn resume(&mut self) {
        let kinds: Vec<MediaKind> = self.publications.keys().copied().collect();
        for kind in kinds {
            let descriptor = self.local_descriptor(kind);
            let media_id = descriptor.media_id();
            let entry = self
                .entries
                .entry(media_id.clone())
                .or_insert_with(|| ConnectionEntry::new(descriptor, PeerRole::Publisher));
            if matches!(entry.slot, ConnectionSlot::Idle) {
                self.start_creation(&media_id, Vec::new());
            }
        }

        let subscribers: Vec<MediaId> = self
            .entries
            .iter()
            .filter(|(id, e)| {
                e.role == PeerRole::Subscriber
                    && matches!(e.slot, ConnectionSlot::Idle)
                    && e.is_published()
                    && self.reservations.effective_target(id) > QualitySetting::Off
            })
            .map(|(id, _)| id.clone())
            .collect();
        for media_id in &subscribers {
            self.start_creation(media_id, Vec::new());
        }

        info!(
            target: "cc.registry",
            publications = self.publications.len(),
            subscribers = subscribers.len(),
            "Resuming connections"
        );
    }

    async fn shutdown(&mut self) {
        self.close_connections().await;
        self.publisher_backoff.cancel();
        self.entries.clear();
        self.reservations.clear();
        self.publications.clear();
        self.update_connection_metrics();
    }

    // ========================================================================
    // Status and helpers
    // ========================================================================

    fn status(&self) -> RegistryStatus {
        let mut entries: Vec<EntryStatus> = self
            .entries
            .iter()
            .map(|(media_id, entry)| EntryStatus {
                descriptor: entry.descriptor.clone(),
                media_id: media_id.clone(),
                role: entry.role,
                slot: entry.slot.kind(),
                connection_id: entry.slot.connection().map(ConnectionHandle::id),
                declared: entry.state,
                effective_target: self.reservations.effective_target(media_id),
            })
            .collect();
        entries.sort_by(|a, b| a.media_id.cmp(&b.media_id));

        let mut publications: Vec<MediaKind> = self.publications.keys().copied().collect();
        publications.sort();

        RegistryStatus {
            entries,
            reservations: self.reservations.len(),
            publications,
            publish_limit: self.publisher_backoff.quality_limit(),
        }
    }

    fn update_connection_metrics(&self) {
        let mut publishers = 0;
        let mut subscribers = 0;
        for entry in self.entries.values() {
            if entry.slot.ready().is_some() {
                match entry.role {
                    PeerRole::Publisher => publishers += 1,
                    PeerRole::Subscriber => subscribers += 1,
                }
            }
        }
        metrics::set_connections_active(PeerRole::Publisher.as_str(), publishers);
        metrics::set_connections_active(PeerRole::Subscriber.as_str(), subscribers);
    }

    fn emit(&self, event: RegistryEvent) {
        if self.events_tx.send(event).is_err() {
            debug!(target: "cc.registry", "Registry event receiver dropped");
        }
    }
}

fn fail_waiters(waiters: Vec<CreationWaiter>, error: &ClientError) {
    for waiter in waiters {
        let _ = waiter.send(Err(error.clone()));
    }
}

async fn release_guard(guard: Option<QualityReservation>) {
    if let Some(guard) = guard {
        if let Err(e) = guard.release().await {
            debug!(target: "cc.registry", error = %e, "Reservation released on a closed connection");
        }
    }
}
