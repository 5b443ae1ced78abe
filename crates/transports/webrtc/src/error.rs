//! Error types for peer negotiation and signaling

/// Result type alias using the negotiation Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or maintaining peer connections
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Track replacement requested for a media kind with no sender
    #[error("No matching sender: {0}")]
    NoMatchingSender(String),

    /// Signaling relay could not deliver a message
    #[error("Signaling delivery failed: {0}")]
    SignalingDeliveryFailure(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Media engine error
    #[error(transparent)]
    Core(#[from] peermux_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl Error {
    /// Check if this error is retryable
    ///
    /// The role-exchange and stall-recovery timers retry these on their own
    /// schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingDeliveryFailure(_) | Error::OperationTimeout(_) | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        match self {
            Error::InvalidConfig(_) => true,
            Error::Core(e) => e.is_config_error(),
            _ => false,
        }
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NoMatchingSender("video".to_string());
        assert_eq!(err.to_string(), "No matching sender: video");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::SignalingDeliveryFailure("100.64.0.2".to_string()).is_retryable());
        assert!(Error::OperationTimeout("test".to_string()).is_retryable());
        assert!(!Error::NoMatchingSender("audio".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_config_error() {
        assert!(Error::InvalidConfig("test".to_string()).is_config_error());
        assert!(Error::Core(peermux_core::Error::ConfigurationUnsupported(
            "3 channels".to_string()
        ))
        .is_config_error());
        assert!(!Error::SdpError("test".to_string()).is_config_error());
    }

    #[test]
    fn test_error_is_peer_error() {
        assert!(Error::PeerNotFound("test".to_string()).is_peer_error());
        assert!(Error::IceCandidateError("test".to_string()).is_peer_error());
        assert!(!Error::InvalidConfig("test".to_string()).is_peer_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(Error::from(err), Error::SerializationError(_)));
    }
}
