//! Error types for primitive collaborators

use std::fmt;

/// Error returned by primitive collaborators (DH, transport)
#[derive(Debug)]
pub enum PlatformError {
    /// I/O error
    Io(std::io::Error),

    /// Cryptographic primitive failed (bad public value, unsupported group)
    Crypto(String),

    /// Transport refused or failed to deliver a packet
    Transport(String),

    /// Configuration error
    Config(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Io(e) => write!(f, "IO error: {}", e),
            PlatformError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
            PlatformError::Transport(msg) => write!(f, "Transport error: {}", msg),
            PlatformError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PlatformError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlatformError::Io(e) => Some(e),
            PlatformError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::Io(err)
    }
}

/// Result type for primitive collaborator operations
pub type PlatformResult<T> = Result<T, PlatformError>;
