//! Fabric error types.

use std::time::Duration;

use crate::identity::Identity;

/// Errors that can occur anywhere in the weave_net crate.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The connection is not `Connected`, or is already closing.
    #[error("Connection disconnected")]
    Disconnected,

    /// The stream ended in the middle of a frame.
    #[error("Short read: stream ended mid-frame")]
    ShortRead,

    /// A frame header announced a body larger than the configured cap.
    #[error("Frame body too large: {len} > {max}")]
    BodyTooLarge { len: usize, max: usize },

    /// The peer violated the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The authenticator rejected the presented credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The acceptor issued a handshake command the dialer cannot answer.
    #[error("Handshake action not supported: {0}")]
    AuthActionNotFound(String),

    /// The handshake finish frame did not carry a connection id.
    #[error("Handshake finish carried no connection id")]
    AckResultFailed,

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// No live connection exists for the target identity.
    #[error("No route to {0}")]
    RouteNotFound(Identity),

    /// A node identity already owns a live connection.
    #[error("Identity {0} already has a live connection")]
    DuplicateIdentity(Identity),

    /// A handler tried to answer the same request twice.
    #[error("Response already sent")]
    DoubleResponse,

    /// The outbound queue of a connection is full.
    #[error("Outbound queue full")]
    QueueFull,

    /// The remote side answered a request with a non-zero error code.
    #[error("Remote error code {0}")]
    Remote(i16),

    /// Payload marshalling failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Discovery backend error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A transport-level error (socket or WebSocket).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The gate or node is not running.
    #[error("Not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Whether the error leaves the underlying connection unusable.
    ///
    /// Fatal errors close the connection; the others are reported to the
    /// caller of a single operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Disconnected
                | Self::ShortRead
                | Self::BodyTooLarge { .. }
                | Self::Protocol(_)
                | Self::Transport(_)
                | Self::Io(_)
        )
    }
}

impl From<serde_json::Error> for NetError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<prost::DecodeError> for NetError {
    fn from(e: prost::DecodeError) -> Self {
        Self::Codec(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(NetError::ShortRead.is_fatal());
        assert!(NetError::BodyTooLarge { len: 70_000, max: 65_534 }.is_fatal());
        assert!(NetError::Protocol("bad kind".into()).is_fatal());
        assert!(!NetError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!NetError::DoubleResponse.is_fatal());
        assert!(!NetError::QueueFull.is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = NetError::BodyTooLarge { len: 10, max: 4 };
        assert_eq!(err.to_string(), "Frame body too large: 10 > 4");
        let err = NetError::Remote(2);
        assert_eq!(err.to_string(), "Remote error code 2");
    }

    #[test]
    fn test_json_error_maps_to_codec() {
        let err: NetError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, NetError::Codec(_)));
    }
}
