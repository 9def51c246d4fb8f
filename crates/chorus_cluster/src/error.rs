//! Errors returned by the membership handle.

use crate::config::ConfigError;
use crate::transport::TransportError;
use chorus_core::CoreError;
use std::net::SocketAddr;

/// Membership errors
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Network failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Encoding failure
    #[error("Codec error: {0}")]
    Core(#[from] CoreError),

    /// No seed answered the join exchange
    #[error("Failed to join cluster: none of {attempted} seeds responded")]
    JoinFailed {
        /// Seeds tried
        attempted: usize,
    },

    /// Another live node already uses this name
    #[error("Name {name} is already in use by {addr}")]
    DuplicateName {
        /// Conflicting name
        name: String,
        /// Address of the existing holder
        addr: SocketAddr,
    },

    /// Peer sent something the protocol does not allow here
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Exchange did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Handle was shut down
    #[error("Membership has been shut down")]
    Shutdown,
}

/// Result type for membership operations
pub type ClusterResult<T> = Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClusterError::JoinFailed { attempted: 3 };
        assert_eq!(err.to_string(), "Failed to join cluster: none of 3 seeds responded");

        let err = ClusterError::from(ConfigError::EmptyName);
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn test_transport_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: ClusterError = TransportError::from(io).into();
        assert!(matches!(err, ClusterError::Transport(TransportError::Io(_))));
    }
}
