//! Room API client.
//!
//! Two endpoints are used before and during a session:
//!
//! - `POST /v1/rooms/{roomId}/start` (or `start_invited`) returns the
//!   signaling ticket and a resumption token.
//! - `GET /v1/turn` returns ICE server entries.
//!
//! Tickets, resumption tokens and TURN passwords are `SecretString`s and are
//! never logged.

use crate::errors::ClientError;
use common::secret::{ExposeSecret, SecretString};
use common::types::ParticipantId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Connection timeout for the HTTP client.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of starting (or resuming) a room session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSession {
    /// One-shot ticket for the signaling WebSocket.
    pub ticket: SecretString,
    /// Token that lets a later `start` call resume this session.
    pub resumption: SecretString,
    /// Server-assigned identity of the local participant, when provided.
    #[serde(default)]
    pub participant_id: Option<ParticipantId>,
}

/// One ICE server entry from `GET /v1/turn`.
///
/// STUN entries carry no credentials and no TTL.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnServerEntry {
    pub uris: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Lifetime in seconds from issuance.
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Serialize)]
struct StartRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    resumption: Option<&'a str>,
}

/// HTTP client for the room API.
#[derive(Clone)]
pub struct ConferenceApi {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl std::fmt::Debug for ConferenceApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConferenceApi")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl ConferenceApi {
    /// Build a client for `base_url` (no trailing slash needed).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<SecretString>,
        http_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        })
    }

    /// Start a room session, or resume one when `resumption` is given.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Http` on transport failure, a non-success status,
    /// or an unparseable body.
    #[instrument(skip_all, fields(room_id = %room_id, invited, resuming = resumption.is_some()))]
    pub async fn start_room(
        &self,
        room_id: &str,
        invited: bool,
        resumption: Option<&SecretString>,
    ) -> Result<RoomSession, ClientError> {
        let endpoint = if invited { "start_invited" } else { "start" };
        let url = format!("{}/v1/rooms/{room_id}/{endpoint}", self.base_url);

        let body = StartRequest {
            resumption: resumption.map(ExposeSecret::expose_secret),
        };

        let response = self
            .authorize(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                debug!(target: "cc.api", error = %e, "Room start request failed");
                ClientError::Http(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(target: "cc.api", status = %status, room_id = %room_id, "Room start rejected");
            return Err(ClientError::Http(format!("room start failed: {status}")));
        }

        response.json::<RoomSession>().await.map_err(|e| {
            warn!(target: "cc.api", error = %e, "Failed to parse room start response");
            ClientError::Http(format!("invalid room start response: {e}"))
        })
    }

    /// Fetch the current ICE server list.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Http` on transport failure, a non-success status,
    /// or an unparseable body.
    #[instrument(skip_all)]
    pub async fn turn_servers(&self) -> Result<Vec<TurnServerEntry>, ClientError> {
        let url = format!("{}/v1/turn", self.base_url);

        let response = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Http(format!("turn fetch failed: {status}")));
        }

        response
            .json::<Vec<TurnServerEntry>>()
            .await
            .map_err(|e| ClientError::Http(format!("invalid turn response: {e}")))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}
