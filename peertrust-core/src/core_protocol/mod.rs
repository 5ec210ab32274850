//! Trust handshakes
//!
//! - `wire`: length-prefixed JSON frames on the protocol channel
//! - `events`: session events and human decisions
//! - `session`: per-connection session record and shared steps
//! - `siep`: device sync
//! - `pcap`: private room/chat invitation
//! - `smap`: moderator invitation
//! - `swarm`: topic rendezvous

pub mod errors;
pub mod events;
pub mod pcap;
pub mod session;
pub mod siep;
pub mod smap;
pub mod swarm;
pub mod wire;

pub use errors::{ProtocolError, ProtocolResult};
pub use events::{InviteDecision, PinPurpose, Prompt, SessionEvent, SyncDecision};
pub use session::{
    ProtocolKind, ProtocolSession, Role, SessionContext, SessionId, SessionOutcome, SessionState,
};
pub use swarm::{BoxStream, Connection, MemorySwarm, PeerStream, Rendezvous, SwarmError};
pub use wire::{FramedStream, WireError, PROTOCOL_CHANNEL};
