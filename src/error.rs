//! Error types for the Snapcast client

use thiserror::Error;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Configuration-class errors that must stop the client instead of
    /// triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Pipeline(PipelineError::ChunkTooLarge { .. })
                | Error::Pipeline(PipelineError::Closed)
        )
    }
}

/// Wire codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u16),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(u32),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
}

/// Audio output errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Sink is not started")]
    NotStarted,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("No decoder registered for codec: {0}")]
    NoDecoder(String),

    #[error("Decoder not started")]
    NotStarted,
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection closed by server")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Buffered pipeline errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Chunk of {size} bytes exceeds pipeline capacity of {capacity} bytes")]
    ChunkTooLarge { size: usize, capacity: usize },

    #[error("Pipeline full")]
    Full,

    #[error("Pipeline closed")]
    Closed,
}

/// Result type alias for the client
pub type Result<T> = std::result::Result<T, Error>;
