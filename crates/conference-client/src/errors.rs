//! Conference client error types.
//!
//! Errors carry string payloads so they can be cloned to every caller waiting
//! on the same single-flight connection creation.

use common::types::MediaId;
use signaling_protocol::CodecError;
use thiserror::Error;

/// Conference client error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The signaling channel is not open (never connected, disconnected or closed).
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// WebSocket transport failure.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Envelope or action could not be encoded/decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Room API or TURN endpoint request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Native peer connection operation failed.
    #[error("Peer connection error: {0}")]
    Peer(String),

    /// A connection closed itself or is gone.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A direct unsubscribe raced an in-flight creation for the same media.
    #[error("Connection creation pending for {0}")]
    CreationPending(MediaId),

    /// No connection or entry for the requested media.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor mailbox gone, response dropped).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether the session can recover by resuming rather than starting over.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ChannelClosed | ClientError::Signaling(_) | ClientError::Http(_)
        )
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::{MediaDescriptor, MediaKind};

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", ClientError::ChannelClosed),
            "Signaling channel closed"
        );
        assert_eq!(
            format!("{}", ClientError::Peer("offer failed".to_string())),
            "Peer connection error: offer failed"
        );
        let media_id = MediaDescriptor::new("alice", MediaKind::Video).media_id();
        assert_eq!(
            format!("{}", ClientError::CreationPending(media_id)),
            "Connection creation pending for alice/video"
        );
    }

    #[test]
    fn test_codec_error_conversion() {
        let err: ClientError = CodecError::MissingAction.into();
        assert_eq!(err, ClientError::Protocol("Missing action".to_string()));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::ChannelClosed.is_retryable());
        assert!(ClientError::Http("503".to_string()).is_retryable());
        assert!(!ClientError::Config("bad".to_string()).is_retryable());
        assert!(!ClientError::Internal("gone".to_string()).is_retryable());
    }
}
