//! Peer context
//!
//! - `peer`: one device of one identity, its rooms and its sessions
//! - `errors`: errors surfaced to the application

pub mod errors;
pub mod peer;

pub use errors::{PeerError, PeerResult};
pub use peer::{Peer, PeerServices, ServeHandle};
