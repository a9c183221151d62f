//! Error types for the call engine

/// Result type alias using the call engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or running a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform refused camera/microphone access
    #[error("media access denied: {0}")]
    MediaAccessDenied(String),

    /// No capture device is present
    #[error("no capture device found: {0}")]
    NoDeviceFound(String),

    /// Local/remote media track error
    #[error("media track error: {0}")]
    MediaTrack(String),

    /// A signaling message could not be delivered
    #[error("signaling send failed: {0}")]
    SignalingSendFailed(String),

    /// Malformed or out-of-sequence offer/answer exchange
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// The peer connection disconnected or failed
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Automatic reconnection gave up
    #[error("could not reconnect after {attempts} attempts: {reason}")]
    ReconnectExhausted { attempts: u32, reason: String },

    /// Invalid configuration parameter
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Internal error (should not occur in normal operation)
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingSendFailed(_) | Error::ConnectionLost(_) | Error::Io(_)
        )
    }

    /// Check if this error comes from local media capture
    ///
    /// Media errors are user-actionable (grant permission, plug in a device)
    /// and must never be retried automatically.
    pub fn is_media_error(&self) -> bool {
        matches!(
            self,
            Error::MediaAccessDenied(_) | Error::NoDeviceFound(_) | Error::MediaTrack(_)
        )
    }

    /// Check if this error terminates the current call attempt
    pub fn is_fatal(&self) -> bool {
        self.is_media_error()
            || matches!(
                self,
                Error::NegotiationFailed(_)
                    | Error::ReconnectExhausted { .. }
                    | Error::InvalidConfig(_)
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "invalid configuration: test");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::SignalingSendFailed("test".to_string()).is_retryable());
        assert!(Error::ConnectionLost("test".to_string()).is_retryable());
        assert!(!Error::MediaAccessDenied("test".to_string()).is_retryable());
        assert!(!Error::NegotiationFailed("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_media_error() {
        assert!(Error::MediaAccessDenied("test".to_string()).is_media_error());
        assert!(Error::NoDeviceFound("test".to_string()).is_media_error());
        assert!(!Error::SignalingSendFailed("test".to_string()).is_media_error());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::NoDeviceFound("test".to_string()).is_fatal());
        assert!(Error::ReconnectExhausted {
            attempts: 3,
            reason: "test".to_string()
        }
        .is_fatal());
        assert!(!Error::SignalingSendFailed("test".to_string()).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "socket closed");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_retryable());
    }
}
