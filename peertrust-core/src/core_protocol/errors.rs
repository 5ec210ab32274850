//! Error types for trust handshakes

use thiserror::Error;

use super::swarm::SwarmError;
use super::wire::WireError;
use crate::core_identity::{CryptoError, DirectoryError, IdentityName, KeystoreError};
use crate::core_room::{InviteError, ModerationError, ReplicaError, RoomKind, RoomRef};

/// Result type for protocol sessions
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A signature or identity claim did not check out. Always terminal.
    #[error("Verification failed: {what} claimed by {claimed}")]
    VerificationFailed {
        claimed: IdentityName,
        what: &'static str,
    },

    #[error("Wrong PIN")]
    WrongPin,

    #[error("Wrong device code")]
    WrongDeviceCode,

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Decision prompt was dropped")]
    DecisionDropped,

    #[error("Peer closed the session")]
    Closed,

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Identity not found: {0}")]
    IdentityNotFound(IdentityName),

    #[error("Unsupported room kind: {0}")]
    UnsupportedRoomKind(RoomKind),

    #[error("Already a moderator of {0}")]
    AlreadyModerator(RoomRef),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("Moderation error: {0}")]
    Moderation(ModerationError),

    #[error("Invite error: {0}")]
    Invite(#[from] InviteError),

    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),
}

impl ProtocolError {
    /// Evidence of a masquerade attempt
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, ProtocolError::VerificationFailed { .. })
    }

    /// User-input errors the UI may re-prompt for
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::WrongPin | ProtocolError::WrongDeviceCode)
    }

    /// Bounded wait exhausted or nobody answered
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_) | ProtocolError::DecisionDropped
        )
    }
}

impl From<CryptoError> for ProtocolError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::WrongPin => ProtocolError::WrongPin,
            CryptoError::SecretNotFound(label) => ProtocolError::SecretNotFound(label),
            other => ProtocolError::Crypto(other),
        }
    }
}

impl From<DirectoryError> for ProtocolError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::IdentityNotFound(name) | DirectoryError::KeyConflict(name) => {
                ProtocolError::IdentityNotFound(name)
            }
        }
    }
}

impl From<ModerationError> for ProtocolError {
    fn from(e: ModerationError) -> Self {
        match e {
            ModerationError::NotAuthorized { .. } => ProtocolError::NotAuthorized(e.to_string()),
            other => ProtocolError::Moderation(other),
        }
    }
}
