//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering the ways an inbound request can be unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer did not contain a request line at all.
    #[error("missing request line")]
    MissingRequestLine,

    /// The request line was not valid UTF-8.
    #[error("request line is not valid UTF-8")]
    InvalidEncoding,

    /// The request line did not have the `METHOD TARGET [VERSION]` shape.
    #[error("malformed request line: {0}")]
    MalformedRequestLine(String),

    /// The request target is not an origin-form path.
    #[error("unsupported request target: {0}")]
    InvalidTarget(String),

    /// The request grew past the accepted size before the headers ended.
    #[error("request too large: {size} bytes exceeds maximum of {max} bytes")]
    RequestTooLarge {
        /// Bytes received so far.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// Failed to serialize a response payload.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ProtocolError::MissingRequestLine.to_string(),
            "missing request line"
        );
        assert_eq!(
            ProtocolError::InvalidTarget("*".to_string()).to_string(),
            "unsupported request target: *"
        );
        assert_eq!(
            ProtocolError::RequestTooLarge { size: 9000, max: 8192 }.to_string(),
            "request too large: 9000 bytes exceeds maximum of 8192 bytes"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let protocol_err: ProtocolError = err.into();
        assert!(matches!(protocol_err, ProtocolError::Serialization(_)));
    }
}
