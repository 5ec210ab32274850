//! Test fixtures for peers and their collaborators

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::core_identity::{IdentityName, KdfParams, MemoryDirectory, MemoryKeystore, Pin};
use crate::core_peer::{Peer, PeerServices};
use crate::core_protocol::SessionEvent;
use crate::core_room::MemoryReplicas;

/// Fast KDF and short waits
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.kdf = KdfParams::insecure_fast();
    config.protocol.decision_timeout = Duration::from_secs(5);
    config.protocol.peer_timeout = Duration::from_secs(5);
    config.protocol.authorization_timeout = Duration::from_secs(1);
    config.protocol.authorization_poll_interval = Duration::from_millis(10);
    config
}

pub fn test_pin() -> Pin {
    Pin::new("2468")
}

pub fn name(value: &str) -> IdentityName {
    IdentityName::new(value).unwrap()
}

/// Fresh keystore and replicas on a shared directory
pub fn test_services(
    directory: &MemoryDirectory,
) -> (PeerServices, MemoryReplicas, mpsc::Receiver<SessionEvent>) {
    let (events, rx) = mpsc::channel(32);
    let replicas = MemoryReplicas::new();
    let services = PeerServices {
        keystore: Arc::new(MemoryKeystore::new()),
        directory: Arc::new(directory.clone()),
        replicas: Arc::new(replicas.clone()),
        events,
    };
    (services, replicas, rx)
}

pub struct TestPeer {
    pub peer: Peer,
    pub replicas: MemoryReplicas,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Register `user` with [`test_pin`]
pub async fn register_peer(directory: &MemoryDirectory, user: &str) -> TestPeer {
    let (services, replicas, events) = test_services(directory);
    let peer = Peer::register(name(user), "laptop", &test_pin(), test_config(), services)
        .await
        .unwrap();
    TestPeer {
        peer,
        replicas,
        events,
    }
}
