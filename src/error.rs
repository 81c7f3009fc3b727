//! Error types for the device protocol layer

use thiserror::Error;

/// Errors raised by the transport collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device disconnected")]
    Disconnected,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Payload of {len} bytes exceeds transport limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Errors raised while encoding commands or decoding device messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("Unrecognized message shape: {0}")]
    UnknownMessage(String),

    #[error("Missing or invalid field '{0}'")]
    InvalidField(&'static str),

    #[error("Command of {len} bytes exceeds transport limit of {max}")]
    CommandTooLarge { len: usize, max: usize },

    #[error("Parameter name is {0} bytes, limit is 255")]
    NameTooLong(usize),

    #[error("Segment {0} not found")]
    SegmentNotFound(u32),

    #[error("Effect '{0}' not found")]
    EffectNotFound(String),

    #[error("A configuration push is already in progress")]
    TransferInProgress,

    #[error("Cannot push {0} segments, the count field holds at most 65535")]
    TooManySegments(usize),

    #[error("Session closed")]
    SessionClosed,
}
