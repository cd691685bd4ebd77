//! Error types for packet decoding.

use std::io;

use thiserror::Error;

/// Errors that can occur while decoding the first packet of a connection.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A varint ran past five bytes without clearing its continuation bit.
    #[error("varint is too big")]
    MalformedVarInt,

    /// The source ended before the value was complete.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// A length prefix decoded to a negative number.
    #[error("negative length: {0}")]
    NegativeLength(i32),

    /// A frame announced more bytes than any valid packet can carry.
    #[error("frame length {length} exceeds maximum of {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// A handshake field could not be read from the frame payload.
    #[error("decoding handshake field `{field}` failed: {source}")]
    DecodeHandshakeFailed {
        field: &'static str,
        #[source]
        source: Box<DecodeError>,
    },

    /// The legacy server list ping did not match its fixed layout.
    #[error("decoding legacy server list ping field `{field}` failed: {detail}")]
    DecodeLegacyServerListPingFailed { field: &'static str, detail: String },

    /// I/O error from the underlying source.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl DecodeError {
    /// Returns true if the failure happened while reading a legacy ping.
    pub fn is_legacy_ping(&self) -> bool {
        matches!(self, DecodeError::DecodeLegacyServerListPingFailed { .. })
    }

    /// Returns true if the source ran dry mid-value.
    pub fn is_eof(&self) -> bool {
        matches!(self, DecodeError::UnexpectedEof)
    }

    pub(crate) fn legacy(field: &'static str, detail: impl std::fmt::Display) -> Self {
        DecodeError::DecodeLegacyServerListPingFailed {
            field,
            detail: detail.to_string(),
        }
    }
}

impl From<io::Error> for DecodeError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            DecodeError::UnexpectedEof
        } else {
            DecodeError::Io(err)
        }
    }
}
