//! Shared helpers for the handshake integration tests
#![allow(dead_code)]

use peertrust_core::config::Config;
use peertrust_core::core_identity::{
    IdentityName, KdfParams, MemoryDirectory, MemoryKeystore, Pin,
};
use peertrust_core::core_peer::{Peer, PeerServices};
use peertrust_core::core_protocol::{
    InviteDecision, ProtocolKind, Role, SessionEvent, SessionOutcome, SyncDecision,
};
use peertrust_core::core_room::MemoryReplicas;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.kdf = KdfParams::insecure_fast();
    config.protocol.decision_timeout = Duration::from_secs(5);
    config.protocol.peer_timeout = Duration::from_secs(5);
    config.protocol.authorization_timeout = Duration::from_secs(1);
    config.protocol.authorization_poll_interval = Duration::from_millis(10);
    config
}

pub fn name(value: &str) -> IdentityName {
    IdentityName::new(value).unwrap()
}

/// How a scripted user answers an invite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Refuse,
    /// Leave the prompt unanswered
    Ignore,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub pin: Pin,
    /// Device codes typed in order, the last one repeated
    pub device_codes: Vec<String>,
    pub decision: Decision,
    pub approve_sync: bool,
}

impl Script {
    pub fn accepting(pin: &str) -> Self {
        Self {
            pin: Pin::new(pin),
            device_codes: Vec::new(),
            decision: Decision::Accept,
            approve_sync: true,
        }
    }

    pub fn deciding(mut self, decision: Decision) -> Self {
        self.decision = decision;
        self
    }

    pub fn typing(mut self, code: impl Into<String>) -> Self {
        self.device_codes.push(code.into());
        self
    }

    pub fn rejecting_sync(mut self) -> Self {
        self.approve_sync = false;
        self
    }
}

/// What a responder saw on the event stream
#[derive(Debug, Default)]
pub struct Observed {
    pub prompts: Vec<&'static str>,
    pub finished: Vec<(ProtocolKind, Role, Result<SessionOutcome, String>)>,
}

pub type SharedObserved = Arc<Mutex<Observed>>;

/// Answer prompts from `script` until the event channel closes
pub fn spawn_responder(
    mut events: mpsc::Receiver<SessionEvent>,
    script: Script,
) -> SharedObserved {
    let observed = SharedObserved::default();
    let seen = observed.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        let mut codes = script.device_codes.iter();
        let mut last_code = String::new();
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::SyncRequested { prompt, .. } => {
                    seen.lock().unwrap().prompts.push("sync");
                    prompt.respond(if script.approve_sync {
                        SyncDecision::Approve(script.pin.clone())
                    } else {
                        SyncDecision::Reject
                    });
                }
                SessionEvent::DeviceCodeRequired { prompt, .. } => {
                    seen.lock().unwrap().prompts.push("device-code");
                    if let Some(code) = codes.next() {
                        last_code = code.clone();
                    }
                    prompt.respond(last_code.clone());
                }
                SessionEvent::PinRequired { prompt, .. } => {
                    seen.lock().unwrap().prompts.push("pin");
                    prompt.respond(script.pin.clone());
                }
                SessionEvent::InviteReceived { prompt, .. }
                | SessionEvent::ModeratorInviteReceived { prompt, .. } => {
                    seen.lock().unwrap().prompts.push("invite");
                    match script.decision {
                        Decision::Accept => {
                            prompt.respond(InviteDecision::Accept(script.pin.clone()));
                        }
                        Decision::Refuse => {
                            prompt.respond(InviteDecision::Refuse(script.pin.clone()));
                        }
                        Decision::Ignore => held.push(prompt),
                    }
                }
                SessionEvent::StateChanged { .. } => {}
                SessionEvent::Finished {
                    protocol,
                    role,
                    result,
                    ..
                } => seen.lock().unwrap().finished.push((protocol, role, result)),
            }
        }
    });
    observed
}

pub struct TestPeer {
    pub peer: Peer,
    pub replicas: MemoryReplicas,
    pub observed: SharedObserved,
}

impl TestPeer {
    pub fn prompts(&self) -> Vec<&'static str> {
        self.observed.lock().unwrap().prompts.clone()
    }
}

pub fn services(
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

/// Register `user`, answering prompts from `script`
pub async fn register(directory: &MemoryDirectory, user: &str, script: Script) -> TestPeer {
    register_with_config(directory, user, script, test_config()).await
}

pub async fn register_with_config(
    directory: &MemoryDirectory,
    user: &str,
    script: Script,
    config: Config,
) -> TestPeer {
    let (services, replicas, events) = services(directory);
    let peer = Peer::register(name(user), "laptop", &script.pin, config, services)
        .await
        .unwrap();
    TestPeer {
        peer,
        replicas,
        observed: spawn_responder(events, script),
    }
}

/// A second, unsynced device of `user`
pub fn new_device(directory: &MemoryDirectory, user: &str, script: Script) -> TestPeer {
    let (services, replicas, events) = services(directory);
    let peer = Peer::new_device(name(user), "phone", test_config(), services);
    TestPeer {
        peer,
        replicas,
        observed: spawn_responder(events, script),
    }
}

/// A code differing from `shown` in every digit
pub fn wrong_code(shown: &str) -> String {
    shown
        .chars()
        .map(|c| if c == '9' { '0' } else { char::from(c as u8 + 1) })
        .collect()
}
