//! Namespaced signaling envelope.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Reserved namespace for heartbeat pings and their echoes.
pub const ECHO_NAMESPACE: &str = "echo";

/// Namespace for SDP exchange, simulcast configuration and link status.
pub const MEDIA_NAMESPACE: &str = "media";

/// Namespace for roster and admission updates.
pub const CONTROL_NAMESPACE: &str = "control";

/// Heartbeat action carried in the echo namespace.
pub const PING_ACTION: &str = "ping";

/// One signaling message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub namespace: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    #[must_use]
    pub fn new(namespace: impl Into<String>, payload: Value) -> Self {
        Self {
            namespace: namespace.into(),
            payload,
            timestamp: None,
        }
    }

    /// Envelope stamped with the current UTC time (RFC 3339).
    #[must_use]
    pub fn stamped(namespace: impl Into<String>, payload: Value) -> Self {
        Self {
            namespace: namespace.into(),
            payload,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Heartbeat ping with a sequence number the server echoes back.
    #[must_use]
    pub fn echo_ping(seq: u64) -> Self {
        Self::new(ECHO_NAMESPACE, json!({ "action": PING_ACTION, "seq": seq }))
    }

    #[must_use]
    pub fn is_echo(&self) -> bool {
        self.namespace == ECHO_NAMESPACE
    }

    /// Sequence number of an echo envelope, if it carries one.
    #[must_use]
    pub fn echo_seq(&self) -> Option<u64> {
        if !self.is_echo() {
            return None;
        }
        self.payload.get("seq").and_then(Value::as_u64)
    }

    /// The `action` field of the payload, if present.
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(Value::as_str)
    }
}
