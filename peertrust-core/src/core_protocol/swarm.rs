//! Rendezvous
//!
//! Peers meet on 32-byte topics. The real transport (DHT discovery and an
//! encrypted stream) is external; [`MemorySwarm`] connects peers of one
//! process with in-memory duplex pipes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::core_room::Topic;

/// Full-duplex byte stream to a peer
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

pub type BoxStream = Box<dyn PeerStream>;

/// A stream opened on a topic
pub struct Connection {
    pub topic: Topic,
    pub stream: BoxStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("topic", &self.topic).finish()
    }
}

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("Topic {0} is already announced")]
    TopicTaken(Topic),

    #[error("Nobody is listening on {0}")]
    NoPeer(Topic),
}

#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Listen on `topic`. Incoming connections arrive on the receiver.
    async fn announce(&self, topic: Topic) -> Result<mpsc::Receiver<Connection>, SwarmError>;

    async fn unannounce(&self, topic: &Topic);

    async fn connect(&self, topic: &Topic) -> Result<Connection, SwarmError>;
}

const DUPLEX_BUFFER: usize = 64 * 1024;
const BACKLOG: usize = 16;

#[derive(Clone, Default)]
pub struct MemorySwarm {
    listeners: Arc<Mutex<HashMap<Topic, mpsc::Sender<Connection>>>>,
}

impl MemorySwarm {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Rendezvous for MemorySwarm {
    async fn announce(&self, topic: Topic) -> Result<mpsc::Receiver<Connection>, SwarmError> {
        let mut listeners = self.listeners.lock().await;
        if listeners.get(&topic).is_some_and(|tx| !tx.is_closed()) {
            return Err(SwarmError::TopicTaken(topic));
        }
        let (tx, rx) = mpsc::channel(BACKLOG);
        listeners.insert(topic, tx);
        debug!(%topic, "Announced topic");
        Ok(rx)
    }

    async fn unannounce(&self, topic: &Topic) {
        self.listeners.lock().await.remove(topic);
    }

    async fn connect(&self, topic: &Topic) -> Result<Connection, SwarmError> {
        let listener = self
            .listeners
            .lock()
            .await
            .get(topic)
            .cloned()
            .ok_or(SwarmError::NoPeer(*topic))?;

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        let incoming = Connection {
            topic: *topic,
            stream: Box::new(remote),
        };
        if listener.send(incoming).await.is_err() {
            self.listeners.lock().await.remove(topic);
            return Err(SwarmError::NoPeer(*topic));
        }
        debug!(%topic, "Connected on topic");
        Ok(Connection {
            topic: *topic,
            stream: Box::new(local),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_to_announcer() {
        let swarm = MemorySwarm::new();
        let topic = Topic::random();
        let mut incoming = swarm.announce(topic).await.unwrap();

        let mut outgoing = swarm.connect(&topic).await.unwrap();
        let mut accepted = incoming.recv().await.unwrap();
        assert_eq!(accepted.topic, topic);

        outgoing.stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_topic_unique_per_announcer() {
        let swarm = MemorySwarm::new();
        let topic = Topic::random();
        let _rx = swarm.announce(topic).await.unwrap();
        assert!(matches!(
            swarm.announce(topic).await,
            Err(SwarmError::TopicTaken(_))
        ));

        swarm.unannounce(&topic).await;
        assert!(swarm.announce(topic).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_without_listener() {
        let swarm = MemorySwarm::new();
        let topic = Topic::random();
        assert!(matches!(
            swarm.connect(&topic).await,
            Err(SwarmError::NoPeer(_))
        ));

        let rx = swarm.announce(topic).await.unwrap();
        drop(rx);
        assert!(matches!(
            swarm.connect(&topic).await,
            Err(SwarmError::NoPeer(_))
        ));
    }
}
