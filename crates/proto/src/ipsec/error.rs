//! Error types for IKEv2 negotiation
//!
//! Every error carries a [`Disposition`] telling the caller what happens to
//! the IKE_SA that produced it:
//!
//! - [`Disposition::Ignore`] - logged, processing continues
//! - [`Disposition::Reject`] - the message or exchange attempt is dropped, the SA survives
//! - [`Disposition::Delete`] - the SA is marked for deletion
//!
//! A rollback after `INVALID_KE_PAYLOAD` is not an error and never appears here.

use std::fmt;

use vigil_platform::PlatformError;

/// Result type for IKEv2 operations
pub type Result<T> = std::result::Result<T, Error>;

/// What the owner of an IKE_SA must do after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Log and carry on
    Ignore,
    /// Abandon the message or exchange attempt, keep the SA
    Reject,
    /// Tear the SA down
    Delete,
}

/// IKEv2 negotiation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Message body could not be parsed or decrypted
    ParseFailed(String),

    /// Message of an exchange type not handled in the current state
    UnexpectedExchange(String),

    /// Request received where a response was expected, or vice versa
    UnexpectedMessage(String),

    /// Peer sent a zero SPI where a real one is required
    ZeroSpi,

    /// Notify addressed to a protocol other than IKE
    NotifyProtocolMismatch(u8),

    /// Unsupported or irrelevant payload, skipped
    IgnoredPayload(u8),

    /// Status notify at or above the private-use threshold
    StatusNotify(u16),

    /// Mandatory payload missing from a message
    MissingPayload(&'static str),

    /// No acceptable proposal found in negotiation
    NoProposalChosen,

    /// A response carried a proposal count other than one
    ProposalCount(usize),

    /// Peer reported an error notify
    ErrorNotify(u16),

    /// Peer demanded a Diffie-Hellman group we do not accept
    DhGroupRejected(u16),

    /// Diffie-Hellman computation failed
    CryptoError(String),

    /// Key derivation from the selected proposal failed
    KeyDerivation(String),

    /// Authentication failed
    AuthenticationFailed(String),

    /// Child SA could not be allocated or installed
    ChildSaFailed(String),

    /// No connection or policy matches the peer
    NoMatchingConfig(String),

    /// Replacement IKE_SA could not be set up during reauthentication
    ReauthFailed(String),

    /// Message could not be sent
    SendFailed(String),

    /// Building an outgoing message failed before it was sent
    BuildFailed(String),

    /// Request retransmitted too often without a response
    RetransmitTimeout(u32),

    /// IKE_SA_INIT restarted too often on INVALID_KE_PAYLOAD
    InitRetriesExceeded(u32),

    /// Security Association not found
    SaNotFound(String),

    /// Operation not valid in the current state
    InvalidState(String),

    /// Invalid configuration parameter
    InvalidParameter(String),

    /// Invalid IKE payload encoding
    InvalidPayload(String),

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Internal error (should not happen)
    Internal(String),
}

impl Error {
    /// How the owning IKE_SA reacts to this error
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::IgnoredPayload(_) | Error::StatusNotify(_) => Disposition::Ignore,

            Error::MissingPayload(_)
            | Error::NoProposalChosen
            | Error::ProposalCount(_)
            | Error::ErrorNotify(_)
            | Error::DhGroupRejected(_)
            | Error::CryptoError(_)
            | Error::KeyDerivation(_)
            | Error::AuthenticationFailed(_)
            | Error::ChildSaFailed(_)
            | Error::NoMatchingConfig(_)
            | Error::ReauthFailed(_)
            | Error::SendFailed(_)
            | Error::RetransmitTimeout(_)
            | Error::InitRetriesExceeded(_) => Disposition::Delete,

            Error::ParseFailed(_)
            | Error::UnexpectedExchange(_)
            | Error::UnexpectedMessage(_)
            | Error::ZeroSpi
            | Error::NotifyProtocolMismatch(_)
            | Error::BuildFailed(_)
            | Error::SaNotFound(_)
            | Error::InvalidState(_)
            | Error::InvalidParameter(_)
            | Error::InvalidPayload(_)
            | Error::BufferTooShort { .. }
            | Error::Internal(_) => Disposition::Reject,
        }
    }

    /// Whether the IKE_SA must be deleted
    pub fn is_fatal(&self) -> bool {
        self.disposition() == Disposition::Delete
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ParseFailed(msg) => write!(f, "Message parsing failed: {}", msg),
            Error::UnexpectedExchange(msg) => write!(f, "Unexpected exchange: {}", msg),
            Error::UnexpectedMessage(msg) => write!(f, "Unexpected message: {}", msg),
            Error::ZeroSpi => write!(f, "Peer sent a SPI of zero"),
            Error::NotifyProtocolMismatch(proto) => {
                write!(f, "Notify addressed to protocol {}, not IKE", proto)
            }
            Error::IgnoredPayload(t) => write!(f, "Ignoring payload type {}", t),
            Error::StatusNotify(t) => write!(f, "Unknown status notify {} ignored", t),
            Error::MissingPayload(name) => write!(f, "Missing mandatory {} payload", name),
            Error::NoProposalChosen => {
                write!(f, "No acceptable proposal found in negotiation")
            }
            Error::ProposalCount(n) => {
                write!(f, "Response contained {} proposals, expected exactly one", n)
            }
            Error::ErrorNotify(t) => write!(f, "Peer reported error notify {}", t),
            Error::DhGroupRejected(g) => write!(f, "Diffie-Hellman group {} not acceptable", g),
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::KeyDerivation(msg) => write!(f, "Key derivation failed: {}", msg),
            Error::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            Error::ChildSaFailed(msg) => write!(f, "Child SA failure: {}", msg),
            Error::NoMatchingConfig(msg) => write!(f, "No matching configuration: {}", msg),
            Error::ReauthFailed(msg) => write!(f, "Reauthentication failed: {}", msg),
            Error::SendFailed(msg) => write!(f, "Unable to send message: {}", msg),
            Error::BuildFailed(msg) => write!(f, "Unable to build message: {}", msg),
            Error::InitRetriesExceeded(n) => {
                write!(f, "Giving up on IKE_SA_INIT after {} retries", n)
            }
            Error::RetransmitTimeout(mid) => {
                write!(f, "Giving up on request {} after retransmits", mid)
            }
            Error::SaNotFound(id) => write!(f, "Security Association not found: {}", id),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::InvalidPayload(msg) => write!(f, "Invalid IKE payload: {}", msg),
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<PlatformError> for Error {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Crypto(msg) => Error::CryptoError(msg),
            PlatformError::Transport(msg) => Error::SendFailed(msg),
            PlatformError::Io(e) => Error::SendFailed(e.to_string()),
            PlatformError::Config(msg) => Error::InvalidParameter(msg),
            PlatformError::Other(e) => Error::Internal(e.to_string()),
        }
    }
}
