//! TURN credential cache.
//!
//! ICE servers come from `GET /v1/turn`. STUN entries carry no credentials
//! and never expire. TURN entries expire `ttl` seconds after they were
//! fetched; the whole list is refetched once any entry is within
//! `refresh_buffer` of its expiry.
//!
//! Fetches are single-flight: the cache is behind an async mutex, so callers
//! arriving while a fetch is running wait for it and share its result.
//!
//! A failed fetch is not fatal. Callers get whatever cached entries are still
//! unexpired (possibly none) and connections proceed with degraded NAT
//! traversal.

use crate::api::{ConferenceApi, TurnServerEntry};
use async_trait::async_trait;
use common::secret::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Default safety margin before a TURN entry's expiry.
pub const DEFAULT_TURN_REFRESH_BUFFER: Duration = Duration::from_secs(30);

/// One ICE server as handed to a peer connection.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<SecretString>,
}

impl IceServer {
    /// STUN server without credentials.
    #[must_use]
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Whether this entry is a TURN relay (has credentials).
    #[must_use]
    pub fn is_relay(&self) -> bool {
        self.credential.is_some()
    }
}

/// Source of ICE servers for new peer connections.
#[async_trait]
pub trait IceServerSource: Send + Sync {
    /// Current ICE servers. Never fails; an empty list is a valid answer.
    async fn ice_servers(&self) -> Vec<IceServer>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnCacheConfig {
    pub refresh_buffer: Duration,
}

impl Default for TurnCacheConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: DEFAULT_TURN_REFRESH_BUFFER,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedServer {
    server: IceServer,
    /// `None` for STUN.
    expires_at: Option<Instant>,
}

impl CachedServer {
    fn from_entry(entry: TurnServerEntry, fetched_at: Instant) -> Self {
        let expires_at = match (&entry.password, entry.ttl) {
            // A TTL past the clock's range never expires.
            (Some(_), Some(ttl)) => fetched_at.checked_add(Duration::from_secs(ttl)),
            _ => None,
        };

        Self {
            server: IceServer {
                urls: entry.uris,
                username: entry.username,
                credential: entry.password,
            },
            expires_at,
        }
    }

    /// Usable now, but not necessarily worth keeping.
    fn is_unexpired(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }

    /// Usable for at least `buffer` longer.
    fn is_fresh(&self, now: Instant, buffer: Duration) -> bool {
        self.expires_at.map_or(true, |at| {
            now.checked_add(buffer)
                .is_some_and(|deadline| deadline < at)
        })
    }
}

/// Caching [`IceServerSource`] backed by the room API.
#[derive(Debug)]
pub struct TurnCredentialCache {
    api: Arc<ConferenceApi>,
    config: TurnCacheConfig,
    entries: Mutex<Vec<CachedServer>>,
}

impl TurnCredentialCache {
    #[must_use]
    pub fn new(api: Arc<ConferenceApi>, config: TurnCacheConfig) -> Self {
        Self {
            api,
            config,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Drop every cached entry so the next call refetches.
    pub async fn invalidate(&self) {
        self.entries.lock().await.clear();
    }
}

#[async_trait]
impl IceServerSource for TurnCredentialCache {
    #[instrument(skip_all, name = "cc.turn.ice_servers")]
    async fn ice_servers(&self) -> Vec<IceServer> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if !entries.is_empty()
            && entries
                .iter()
                .all(|e| e.is_fresh(now, self.config.refresh_buffer))
        {
            debug!(target: "cc.turn", count = entries.len(), "Using cached ICE servers");
            return entries.iter().map(|e| e.server.clone()).collect();
        }

        match self.api.turn_servers().await {
            Ok(fetched) => {
                let fetched_at = Instant::now();
                *entries = fetched
                    .into_iter()
                    .map(|entry| CachedServer::from_entry(entry, fetched_at))
                    .collect();
                info!(
                    target: "cc.turn",
                    count = entries.len(),
                    relays = entries.iter().filter(|e| e.server.is_relay()).count(),
                    "Fetched ICE servers"
                );
                entries.iter().map(|e| e.server.clone()).collect()
            }
            Err(e) => {
                entries.retain(|entry| entry.is_unexpired(now));
                warn!(
                    target: "cc.turn",
                    error = %e,
                    remaining = entries.len(),
                    "TURN fetch failed, continuing with cached servers"
                );
                entries.iter().map(|e| e.server.clone()).collect()
            }
        }
    }
}
