//! Room model
//!
//! - `types`: room kinds, descriptors, message ids and timestamps
//! - `topic`: rendezvous topic derivations
//! - `replica`: replica membership and write-authorization
//! - `message`: signed, append-only message logs
//! - `manifest`: per-room moderation state
//! - `invite`: invites waiting for delivery

pub mod invite;
pub mod manifest;
pub mod message;
pub mod replica;
pub mod topic;
pub mod types;

pub use invite::{InviteError, InviteKey, InviteProtocol, InviteQueue, PendingInvite};
pub use manifest::{Manifest, ModerationError, ModerationOverlay};
pub use message::{
    is_legitimate, DeleteRecord, EditRecord, EffectiveMessage, Ingest, IntegrityError, LogRecord,
    MessageLog, MessageRecord, VerifiedRecord, VisibleMessage,
};
pub use replica::{Joined, MemoryReplicas, ReplicaError, ReplicaId, ReplicaRegistry, WriterKey};
pub use topic::Topic;
pub use types::{MessageId, RoomDescriptor, RoomKind, RoomRef, Timestamp};
