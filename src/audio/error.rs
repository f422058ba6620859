//! Error taxonomy shared by the endpoints and their collaborators.

use thiserror::Error;

use super::pcm::PortId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HalError {
    #[error("failed to open PCM port {port:?}: {reason}")]
    PortOpenFailed { port: PortId, reason: String },

    #[error("mixer control '{0}' not found")]
    ControlNotFound(String),

    #[error("preprocessor chain is full ({0} effects)")]
    TooManyPreprocessors(usize),

    #[error("PCM underrun")]
    Underrun,

    #[error("hardware timestamp unavailable")]
    HardwareTimestampUnavailable,

    #[error("failed to create rate converter: {0}")]
    ConverterCreateFailed(String),

    #[error("failed to create echo reference: {0}")]
    EchoReferenceCreateFailed(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no PCM port open")]
    NoDevice,

    #[error("PCM I/O error: {0}")]
    Io(String),

    #[error("effect error: {0}")]
    Effect(String),
}

pub type HalResult<T> = std::result::Result<T, HalError>;
