//! Registry bookkeeping: one entry per media, plus quality reservations.

use crate::connection::{ConnectionHandle, PeerRole, QualityReservation};
use crate::errors::ClientError;
use common::types::{MediaDescriptor, MediaId, QualitySetting};
use signaling_protocol::media::MediaSessionState;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::oneshot;

pub(crate) type CreationWaiter = oneshot::Sender<Result<ConnectionHandle, ClientError>>;

/// Lifecycle of the connection behind one media.
///
/// A connection and an in-flight creation can never coexist: they are
/// different variants.
pub(crate) enum ConnectionSlot {
    Idle,
    Creating {
        creation_id: u64,
        waiters: Vec<CreationWaiter>,
        /// Tear down as soon as creation settles.
        remove_after: bool,
    },
    Ready(ConnectionHandle),
    Closing(ConnectionHandle),
}

impl ConnectionSlot {
    pub(crate) fn kind(&self) -> SlotKind {
        match self {
            ConnectionSlot::Idle => SlotKind::Idle,
            ConnectionSlot::Creating { .. } => SlotKind::Creating,
            ConnectionSlot::Ready(_) => SlotKind::Ready,
            ConnectionSlot::Closing(_) => SlotKind::Closing,
        }
    }

    pub(crate) fn ready(&self) -> Option<&ConnectionHandle> {
        match self {
            ConnectionSlot::Ready(handle) => Some(handle),
            _ => None,
        }
    }

    /// The handle in `Ready` or `Closing`.
    pub(crate) fn connection(&self) -> Option<&ConnectionHandle> {
        match self {
            ConnectionSlot::Ready(handle) | ConnectionSlot::Closing(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Public view of a [`ConnectionSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Idle,
    Creating,
    Ready,
    Closing,
}

pub(crate) struct ConnectionEntry {
    pub(crate) descriptor: MediaDescriptor,
    pub(crate) role: PeerRole,
    /// What the publisher declares; `None` until the roster says anything.
    pub(crate) state: Option<MediaSessionState>,
    pub(crate) slot: ConnectionSlot,
}

impl ConnectionEntry {
    pub(crate) fn new(descriptor: MediaDescriptor, role: PeerRole) -> Self {
        Self {
            descriptor,
            role,
            state: None,
            slot: ConnectionSlot::Idle,
        }
    }

    pub(crate) fn is_published(&self) -> bool {
        self.state.is_some_and(|s| s.is_published())
    }
}

/// Opaque identity of a quality consumer (a UI tile, a recorder, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerRef(String);

impl ConsumerRef {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for ConsumerRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConsumerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) struct Reservation {
    pub(crate) media_id: MediaId,
    pub(crate) target: QualitySetting,
    /// Held on the live subscriber; `None` while there is none.
    pub(crate) guard: Option<QualityReservation>,
}

/// Reservations by consumer.
#[derive(Default)]
pub(crate) struct Reservations(HashMap<ConsumerRef, Reservation>);

impl Reservations {
    /// Insert or replace the consumer's reservation, returning the old one.
    pub(crate) fn insert(
        &mut self,
        consumer: ConsumerRef,
        descriptor: MediaDescriptor,
        target: QualitySetting,
    ) -> Option<Reservation> {
        self.0.insert(
            consumer,
            Reservation {
                media_id: descriptor.media_id(),
                target,
                guard: None,
            },
        )
    }

    pub(crate) fn remove(&mut self, consumer: &ConsumerRef) -> Option<Reservation> {
        self.0.remove(consumer)
    }

    /// Maximum target over every reservation on `media_id`, `Off` if none.
    pub(crate) fn effective_target(&self, media_id: &MediaId) -> QualitySetting {
        self.0
            .values()
            .filter(|r| &r.media_id == media_id)
            .map(|r| r.target)
            .max()
            .unwrap_or(QualitySetting::Off)
    }

    /// Reservations on `media_id` that have no guard on a live subscriber.
    pub(crate) fn unguarded(&self, media_id: &MediaId) -> Vec<(ConsumerRef, QualitySetting)> {
        self.0
            .iter()
            .filter(|(_, r)| &r.media_id == media_id && r.guard.is_none())
            .map(|(c, r)| (c.clone(), r.target))
            .collect()
    }

    pub(crate) fn get_mut(&mut self, consumer: &ConsumerRef) -> Option<&mut Reservation> {
        self.0.get_mut(consumer)
    }

    /// Drop every guard on `media_id` (the subscriber is gone).
    pub(crate) fn forget_guards(&mut self, media_id: &MediaId) {
        for reservation in self.0.values_mut().filter(|r| &r.media_id == media_id) {
            reservation.guard = None;
        }
    }

    pub(crate) fn forget_all_guards(&mut self) {
        for reservation in self.0.values_mut() {
            reservation.guard = None;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::MediaKind;

    fn alice() -> MediaDescriptor {
        MediaDescriptor::new("alice", MediaKind::Video)
    }

    #[test]
    fn test_effective_target_is_max() {
        let mut reservations = Reservations::default();
        let media_id = alice().media_id();
        assert_eq!(reservations.effective_target(&media_id), QualitySetting::Off);

        reservations.insert("tile-1".into(), alice(), QualitySetting::Low);
        reservations.insert("tile-2".into(), alice(), QualitySetting::High);
        reservations.insert("tile-3".into(), alice(), QualitySetting::Medium);
        assert_eq!(reservations.effective_target(&media_id), QualitySetting::High);

        reservations.remove(&"tile-2".into());
        assert_eq!(reservations.effective_target(&media_id), QualitySetting::Medium);
    }

    #[test]
    fn test_insert_returns_previous_media() {
        let mut reservations = Reservations::default();
        let bob = MediaDescriptor::new("bob", MediaKind::Screen);

        assert!(reservations
            .insert("tile".into(), alice(), QualitySetting::High)
            .is_none());
        let previous = reservations
            .insert("tile".into(), bob.clone(), QualitySetting::Low)
            .unwrap();

        assert_eq!(previous.media_id, alice().media_id());
        assert_eq!(reservations.effective_target(&alice().media_id()), QualitySetting::Off);
        assert_eq!(reservations.effective_target(&bob.media_id()), QualitySetting::Low);
        assert_eq!(reservations.len(), 1);
    }

    #[test]
    fn test_unguarded_lists_reservations_without_subscriber() {
        let mut reservations = Reservations::default();
        reservations.insert("a".into(), alice(), QualitySetting::High);
        reservations.insert("b".into(), alice(), QualitySetting::Low);

        let mut unguarded = reservations.unguarded(&alice().media_id());
        unguarded.sort_by_key(|(_, target)| *target);
        assert_eq!(
            unguarded,
            vec![
                (ConsumerRef::from("b"), QualitySetting::Low),
                (ConsumerRef::from("a"), QualitySetting::High)
            ]
        );
    }
}
