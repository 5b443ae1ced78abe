//! Error types for the peermux media engine

/// Result type alias using the media engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while framing, encoding or decoding media
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Encoder or decoder rejected the requested parameters
    #[error("Configuration unsupported: {0}")]
    ConfigurationUnsupported(String),

    /// Required codec capability is missing on this runtime
    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    /// Wire data shorter than the frame header
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Codec rejected a chunk
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// Codec reported an internal fault asynchronously
    #[error("Decoder fault: {0}")]
    DecoderFault(String),

    /// Media encoding error
    #[error("Encoding error: {0}")]
    EncodingError(String),

    /// Outbound or output channel is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Errors that only affect a single frame or decoder instance
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame(_) | Error::DecodeFailure(_) | Error::DecoderFault(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_) | Error::ConfigurationUnsupported(_)
        )
    }
}
