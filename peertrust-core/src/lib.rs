//! Peer-to-peer trust layer
//!
//! Identities backed by secp256k1 keys and PIN-sealed seeds, room and chat
//! membership, signed message logs with moderation, and the three handshakes
//! that move trust between peers: device sync (SIEP), private room invites
//! (PCAP) and moderator invites (SMAP).

pub mod config;
pub mod core_identity;
pub mod core_peer;
pub mod core_protocol;
pub mod core_room;
pub mod logging;
pub mod serde_hex;

#[cfg(test)]
mod test_utils;

pub use config::{Config, ConfigError, ProtocolConfig};
pub use core_identity::{Identity, IdentityName, Keypair, Pin, PublicKey, Signature};
pub use core_peer::{Peer, PeerError, PeerResult, PeerServices, ServeHandle};
pub use core_protocol::{SessionEvent, SessionOutcome};
pub use core_room::{RoomDescriptor, RoomKind, RoomRef};
pub use logging::{init_logging, LogLevel};
