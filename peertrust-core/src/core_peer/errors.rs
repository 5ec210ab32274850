//! Error types for peer operations

use thiserror::Error;

use crate::core_identity::{CryptoError, DirectoryError, IdentityName, KeystoreError};
use crate::core_protocol::{ProtocolError, SwarmError};
use crate::core_room::{
    IntegrityError, InviteError, MessageId, ModerationError, ReplicaError, RoomRef, Topic,
};

/// Result type for peer operations
pub type PeerResult<T> = Result<T, PeerError>;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("Moderation error: {0}")]
    Moderation(#[from] ModerationError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Invite error: {0}")]
    Invite(#[from] InviteError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),

    #[error("Not a member of {0}")]
    RoomNotJoined(RoomRef),

    #[error("Blocked in {0}")]
    Blocked(RoomRef),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("No session listens on topic {0}")]
    UnknownTopic(Topic),

    #[error("Invalid room name: {0:?}")]
    InvalidRoomName(String),

    #[error("{0} has no identity on this device")]
    NotRegistered(IdentityName),

    #[error("{0} already has an identity on this device")]
    AlreadyRegistered(IdentityName),
}

impl PeerError {
    pub fn is_not_authorized(&self) -> bool {
        matches!(
            self,
            PeerError::NotAuthorized(_)
                | PeerError::Moderation(ModerationError::NotAuthorized { .. })
                | PeerError::Protocol(ProtocolError::NotAuthorized(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_room::RoomKind;

    #[test]
    fn test_error_display() {
        let err = PeerError::RoomNotJoined(RoomRef::new(RoomKind::PrivateRoom, "hodlers"));
        assert_eq!(err.to_string(), "Not a member of privateRoom:hodlers");
    }

    #[test]
    fn test_not_authorized_classes() {
        let denied = PeerError::Moderation(ModerationError::NotAuthorized {
            actor: IdentityName::new("mallory").unwrap(),
            action: "block users",
            room: RoomRef::new(RoomKind::PublicRoom, "lobby"),
        });
        assert!(denied.is_not_authorized());
        assert!(!PeerError::InvalidRoomName(String::new()).is_not_authorized());
    }
}
