//! Cluster error types

use std::net::SocketAddr;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster-specific error types
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Client error: {0}")]
    Client(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection to {addr} failed: {source}")]
    Connection {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Node name changed: expected {expected}, received {actual}")]
    NameMismatch { expected: String, actual: String },

    #[error("Cluster unreachable: {0}")]
    Unreachable(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cluster is not valid")]
    InvalidCluster,
}

/// Coarse classification used by the tender when deciding how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Local resource problem, e.g. socket creation
    Local,
    /// Refused, reset or timed out connection
    Connection,
    /// Malformed or unexpected server response
    Protocol,
    /// No seed could be reached
    Unreachable,
    /// Caller misuse or configuration
    Usage,
}

impl ClusterError {
    pub fn client<T: Into<String>>(msg: T) -> Self {
        Self::Client(msg.into())
    }

    pub fn connection(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Connection { addr, source }
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn unreachable<T: Into<String>>(msg: T) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn node_not_found<T: Into<String>>(name: T) -> Self {
        Self::NodeNotFound(name.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    /// Map this error onto the recovery taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Client(_) => ErrorCategory::Local,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::TimedOut => ErrorCategory::Connection,
                _ => ErrorCategory::Local,
            },
            Self::Connection { .. } | Self::Timeout(_) => ErrorCategory::Connection,
            Self::Protocol(_) | Self::NameMismatch { .. } => ErrorCategory::Protocol,
            Self::Unreachable(_) => ErrorCategory::Unreachable,
            Self::NodeNotFound(_) | Self::Configuration(_) | Self::InvalidCluster => {
                ErrorCategory::Usage
            }
        }
    }

    /// Whether a later tend cycle may succeed where this one failed
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Usage)
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::timeout(err.to_string())
    }
}

impl From<toml::de::Error> for ClusterError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(format!("Failed to parse config: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);

        assert_eq!(
            ClusterError::connection(addr, refused).category(),
            ErrorCategory::Connection
        );
        assert_eq!(
            ClusterError::protocol("bad header").category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            ClusterError::unreachable("no seeds").category(),
            ErrorCategory::Unreachable
        );
        assert_eq!(ClusterError::client("socket").category(), ErrorCategory::Local);
        assert_eq!(ClusterError::InvalidCluster.category(), ErrorCategory::Usage);
    }

    #[test]
    fn test_io_error_classification() {
        let reset = ClusterError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert_eq!(reset.category(), ErrorCategory::Connection);
        assert!(reset.is_recoverable());

        let other = ClusterError::from(std::io::Error::from(std::io::ErrorKind::OutOfMemory));
        assert_eq!(other.category(), ErrorCategory::Local);
    }

    #[test]
    fn test_usage_errors_are_not_recoverable() {
        assert!(!ClusterError::configuration("empty hosts").is_recoverable());
        assert!(ClusterError::timeout("info").is_recoverable());
    }
}
