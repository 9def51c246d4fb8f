//! Core error types for CHORUS.

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Value could not be encoded
    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// Bytes are not a valid encoding
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Encoded packet does not fit the datagram budget
    #[error("Packet of {size} bytes exceeds limit of {limit} bytes")]
    PacketTooLarge {
        /// Encoded size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// A message arrived on a channel that does not carry its kind
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Kind the receiver was waiting for
        expected: &'static str,
        /// Kind that actually arrived
        actual: &'static str,
    },
}

impl From<postcard::Error> for CoreError {
    fn from(err: postcard::Error) -> Self {
        Self::InvalidEncoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::PacketTooLarge {
            size: 2000,
            limit: 1400,
        };
        assert_eq!(
            format!("{}", err),
            "Packet of 2000 bytes exceeds limit of 1400 bytes"
        );

        let err = CoreError::UnexpectedMessage {
            expected: "push-pull",
            actual: "ping",
        };
        assert!(err.to_string().contains("push-pull"));
        assert!(err.to_string().contains("ping"));
    }

    #[test]
    fn test_error_equality() {
        let err1 = CoreError::InvalidEncoding("eof".to_string());
        let err2 = CoreError::InvalidEncoding("eof".to_string());
        assert_eq!(err1, err2);
        assert_ne!(err1, CoreError::Encoding("eof".to_string()));
    }
}
