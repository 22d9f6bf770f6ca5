use std::io;
use thiserror::Error;

/// Failures of the message codec. Only [CodecError::UnsupportedVersion] and
///  [CodecError::UnsupportedType] are recoverable: the frame boundary is intact, so the
///  connection can carry on with the next frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short: need {needed} bytes, have {have}")]
    TooShort { needed: usize, have: usize },

    #[error("unsupported protocol version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unsupported message type {msg_type} for protocol version {version:#04x}")]
    UnsupportedType { version: u8, msg_type: u8 },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("message too long for a single frame: {0} bytes")]
    TooLong(usize),
}

impl CodecError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::UnsupportedVersion(_) | CodecError::UnsupportedType { .. })
    }
}

/// Errors that terminate a session
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid frame length {0}")]
    InvalidLength(u16),

    #[error("undecodable frame: {0}")]
    Decode(CodecError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is congested")]
    Congested,

    #[error("session is not established")]
    NotEstablished,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("fragment for xid {xid:#010x} does not match the pending message: expected version {expected_version} type {expected_type}/subtype {expected_subtype}, got version {actual_version} {actual_type}/{actual_subtype}")]
    InvalidMerge {
        xid: u32,
        expected_version: u8,
        actual_version: u8,
        expected_type: u8,
        expected_subtype: u16,
        actual_type: u8,
        actual_subtype: u16,
    },

    #[error("message with xid {0:#010x} is not a multipart message")]
    NotMultipart(u32),

    #[error("no reassembled message for xid {0:#010x}")]
    NotFound(u32),
}
