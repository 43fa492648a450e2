//! Mock peer connection and factory.
//!
//! [`MockPeerConnection`] records everything the client does to it (sender
//! tracks per kind, applied encodings, descriptions, candidates) and lets the
//! test inject engine events and transport stats.
//!
//! [`MockPeerConnectionFactory`] hands out mock connections and can hold
//! every creation until released, which is how race tests keep a
//! connection in the `Creating` state.

use async_trait::async_trait;
use conference_client::connection::{
    EncodingParameters, LocalTrack, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents,
    PeerRole, SdpKind, TransportStats,
};
use conference_client::errors::ClientError;
use conference_client::turn::IceServer;
use signaling_protocol::media::{IceCandidate, TrackKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Capacity of each mock's event channel.
const MOCK_EVENT_BUFFER: usize = 64;

/// Everything a mock connection has observed.
#[derive(Debug, Clone, Default)]
pub struct MockPeerRecord {
    pub offers_created: usize,
    pub answers_created: usize,
    pub local_descriptions: Vec<(SdpKind, String)>,
    pub remote_descriptions: Vec<(SdpKind, String)>,
    pub candidates: Vec<IceCandidate>,
    /// `add_track` calls in order.
    pub added_tracks: Vec<LocalTrack>,
    /// Current track on each sender; `None` after a detach.
    pub senders: HashMap<TrackKind, Option<LocalTrack>>,
    /// Every `replace_track` call in order.
    pub replacements: Vec<(TrackKind, Option<LocalTrack>)>,
    /// Every `set_encodings` call in order.
    pub encodings: Vec<Vec<EncodingParameters>>,
    pub closed: bool,
}

/// Mock native peer connection.
#[derive(Debug)]
pub struct MockPeerConnection {
    role: PeerRole,
    ice_servers: Vec<IceServer>,
    events_tx: mpsc::Sender<PeerEvent>,
    record: Mutex<MockPeerRecord>,
    stats: Mutex<TransportStats>,
    fail_stats: AtomicBool,
}

impl MockPeerConnection {
    /// Create a mock and the event receiver the client reads.
    #[must_use]
    pub fn new(role: PeerRole, ice_servers: Vec<IceServer>) -> (Arc<Self>, PeerEvents) {
        let (events_tx, events_rx) = mpsc::channel(MOCK_EVENT_BUFFER);
        let mock = Arc::new(Self {
            role,
            ice_servers,
            events_tx,
            record: Mutex::new(MockPeerRecord::default()),
            stats: Mutex::new(TransportStats::default()),
            fail_stats: AtomicBool::new(false),
        });
        (mock, events_rx)
    }

    #[must_use]
    pub fn role(&self) -> PeerRole {
        self.role
    }

    #[must_use]
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Inject an engine event.
    pub async fn emit(&self, event: PeerEvent) {
        self.events_tx
            .send(event)
            .await
            .expect("peer event receiver dropped");
    }

    /// Set the cumulative counters returned by the next `stats()` calls.
    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn fail_stats(&self, fail: bool) {
        self.fail_stats.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of what the connection has observed.
    #[must_use]
    pub fn record(&self) -> MockPeerRecord {
        self.record.lock().unwrap().clone()
    }

    /// Track currently on the sender of `kind`.
    #[must_use]
    pub fn sender_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.record
            .lock()
            .unwrap()
            .senders
            .get(&kind)
            .cloned()
            .flatten()
    }

    /// Encodings applied most recently.
    #[must_use]
    pub fn last_encodings(&self) -> Option<Vec<EncodingParameters>> {
        self.record.lock().unwrap().encodings.last().cloned()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.record.lock().unwrap().closed
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<String, ClientError> {
        let mut record = self.record.lock().unwrap();
        record.offers_created += 1;
        Ok(format!("v=0 mock-offer-{}", record.offers_created))
    }

    async fn create_answer(&self) -> Result<String, ClientError> {
        let mut record = self.record.lock().unwrap();
        record.answers_created += 1;
        Ok(format!("v=0 mock-answer-{}", record.answers_created))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), ClientError> {
        self.record
            .lock()
            .unwrap()
            .local_descriptions
            .push((kind, sdp.to_string()));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), ClientError> {
        self.record
            .lock()
            .unwrap()
            .remote_descriptions
            .push((kind, sdp.to_string()));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), ClientError> {
        self.record
            .lock()
            .unwrap()
            .candidates
            .push(candidate.clone());
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), ClientError> {
        let mut record = self.record.lock().unwrap();
        record.added_tracks.push(track.clone());
        record.senders.insert(track.kind, Some(track.clone()));
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), ClientError> {
        let mut record = self.record.lock().unwrap();
        if !record.senders.contains_key(&kind) {
            return Err(ClientError::Peer(format!("no {kind} sender")));
        }
        record.replacements.push((kind, track.cloned()));
        record.senders.insert(kind, track.cloned());
        Ok(())
    }

    async fn set_encodings(&self, encodings: &[EncodingParameters]) -> Result<(), ClientError> {
        self.record
            .lock()
            .unwrap()
            .encodings
            .push(encodings.to_vec());
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, ClientError> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(ClientError::Peer("stats unavailable".to_string()));
        }
        Ok(*self.stats.lock().unwrap())
    }

    async fn close(&self) {
        self.record.lock().unwrap().closed = true;
    }
}

/// Mock factory producing [`MockPeerConnection`]s.
#[derive(Debug)]
pub struct MockPeerConnectionFactory {
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
    started: AtomicUsize,
    fail: AtomicBool,
    gate_tx: watch::Sender<bool>,
    gate_rx: watch::Receiver<bool>,
}

impl MockPeerConnectionFactory {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (gate_tx, gate_rx) = watch::channel(true);
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate_tx,
            gate_rx,
        })
    }

    /// Block every creation until [`Self::release_creations`].
    pub fn hold_creations(&self) {
        self.gate_tx.send_replace(false);
    }

    pub fn release_creations(&self) {
        self.gate_tx.send_replace(true);
    }

    /// Make creations fail with `ClientError::Peer`.
    pub fn fail_creations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of `create` calls, including held ones.
    #[must_use]
    pub fn creations_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Connections created so far, in order.
    #[must_use]
    pub fn created(&self) -> Vec<Arc<MockPeerConnection>> {
        self.created.lock().unwrap().clone()
    }

    /// Most recent connection created for `role`.
    #[must_use]
    pub fn last(&self, role: PeerRole) -> Option<Arc<MockPeerConnection>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.role() == role)
            .cloned()
    }

    /// Wait until `count` creations have started.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within five seconds.
    pub async fn wait_for_started(&self, count: usize) {
        wait_for(|| self.creations_started() >= count, "creations to start").await;
    }

    /// Wait until `count` connections exist and return the newest for `role`.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within five seconds.
    pub async fn wait_for_created(&self, count: usize, role: PeerRole) -> Arc<MockPeerConnection> {
        wait_for(|| self.created.lock().unwrap().len() >= count, "connections to be created").await;
        self.last(role).expect("no connection with that role")
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerConnectionFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        role: PeerRole,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), ClientError> {
        self.started.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate_rx.clone();
        gate.wait_for(|open| *open)
            .await
            .map_err(|e| ClientError::Peer(format!("gate closed: {e}")))?;

        if self.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Peer("mock creation failure".to_string()));
        }

        let (mock, events) = MockPeerConnection::new(role, ice_servers.to_vec());
        self.created.lock().unwrap().push(Arc::clone(&mock));
        let peer: Arc<dyn PeerConnection> = mock;
        Ok((peer, events))
    }
}

/// Poll `condition` every 10ms until it holds.
///
/// # Panics
///
/// Panics after five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let polling = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), polling)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
