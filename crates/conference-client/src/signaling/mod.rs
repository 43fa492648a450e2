//! WebSocket signaling channel.
//!
//! ```text
//! Connecting ──open──▶ Connected ⇄ Disconnected
//!      │                   │            │
//!      └───────────────────┴────────────┴──▶ Closed (terminal)
//! ```
//!
//! `Disconnected` means the session may be resumed (abnormal close code,
//! heartbeat timeout, transport error). `Closed` means the server or the
//! client ended the session gracefully and the caller must start over.

mod channel;

pub use channel::{SignalingChannel, SignalingHandle};

use signaling_protocol::Envelope;
use std::time::Duration;

/// Default heartbeat ping interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default time to wait for a heartbeat echo.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket close code for a graceful close.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingConfig {
    /// WebSocket endpoint; the ticket is appended as a `ticket` query parameter.
    pub url: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl SignalingConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl SignalingState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SignalingState::Connecting => "connecting",
            SignalingState::Connected => "connected",
            SignalingState::Disconnected => "disconnected",
            SignalingState::Closed => "closed",
        }
    }
}

/// Events emitted by the channel. Echo (heartbeat) traffic never appears here.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    ConnectionStateChanged(SignalingState),
    MessageReceived(Envelope),
}

/// Map a WebSocket close code to the state it leaves the channel in.
///
/// Only a normal close (1000) is terminal; anything else, including a missing
/// close frame, can be resumed.
#[must_use]
pub fn classify_close(code: Option<u16>) -> SignalingState {
    match code {
        Some(NORMAL_CLOSE_CODE) => SignalingState::Closed,
        _ => SignalingState::Disconnected,
    }
}
