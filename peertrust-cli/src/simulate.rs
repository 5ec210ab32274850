//! In-memory handshake runs
//!
//! Two peers share a directory and a swarm. Each gets a responder task that
//! answers its prompts from a fixed script, the way a UI would.

use anyhow::Result;
use clap::ValueEnum;
use peertrust_core::config::Config;
use peertrust_core::core_identity::{IdentityName, MemoryDirectory, MemoryKeystore, Pin};
use peertrust_core::core_peer::{Peer, PeerResult, PeerServices};
use peertrust_core::core_protocol::{
    InviteDecision, MemorySwarm, Rendezvous, SessionEvent, SessionOutcome, SyncDecision,
};
use peertrust_core::core_room::{MemoryReplicas, RoomKind, Topic};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Scenario {
    /// Private room invite
    Pcap,
    /// Device sync with the right device code
    Siep,
    /// Device sync where the new device types a wrong code
    SiepWrongCode,
    /// Moderator invite
    Smap,
}

struct Script {
    pin: Pin,
    device_code: Option<String>,
    approve: bool,
}

fn spawn_responder(label: String, mut events: mpsc::Receiver<SessionEvent>, script: Script) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::SyncRequested { user, prompt, .. } => {
                    info!(peer = %label, %user, approve = script.approve, "Sync requested");
                    let decision = if script.approve {
                        SyncDecision::Approve(script.pin.clone())
                    } else {
                        SyncDecision::Reject
                    };
                    prompt.respond(decision);
                }
                SessionEvent::DeviceCodeRequired { prompt, .. } => {
                    prompt.respond(script.device_code.clone().unwrap_or_default());
                }
                SessionEvent::PinRequired { prompt, purpose, .. } => {
                    info!(peer = %label, ?purpose, "PIN requested");
                    prompt.respond(script.pin.clone());
                }
                SessionEvent::InviteReceived { room, creator, prompt, .. } => {
                    info!(peer = %label, %room, %creator, "Invite received");
                    prompt.respond(decide(&script));
                }
                SessionEvent::ModeratorInviteReceived { room, sender, prompt, .. } => {
                    info!(peer = %label, %room, %sender, "Moderator invite received");
                    prompt.respond(decide(&script));
                }
                SessionEvent::StateChanged { session, protocol, role, state } => {
                    info!(peer = %label, %session, ?protocol, ?role, ?state, "Session state");
                }
                SessionEvent::Finished { session, protocol, role, result } => {
                    info!(peer = %label, %session, ?protocol, ?role, ?result, "Session finished");
                }
            }
        }
    })
}

fn decide(script: &Script) -> InviteDecision {
    if script.approve {
        InviteDecision::Accept(script.pin.clone())
    } else {
        InviteDecision::Refuse(script.pin.clone())
    }
}

struct SimPeer {
    peer: Peer,
    replicas: MemoryReplicas,
    responder: JoinHandle<()>,
}

fn services(
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

async fn register(
    directory: &MemoryDirectory,
    config: &Config,
    name: &str,
    script: Script,
) -> Result<SimPeer> {
    let (services, replicas, events) = services(directory);
    let peer = Peer::register(
        IdentityName::new(name)?,
        "laptop",
        &script.pin,
        config.clone(),
        services,
    )
    .await?;
    Ok(SimPeer {
        peer,
        replicas,
        responder: spawn_responder(name.to_string(), events, script),
    })
}

/// Announce `on`, then run the receiver for the first connection in a task
async fn accept_one(
    peer: &Peer,
    swarm: &MemorySwarm,
    on: Topic,
) -> Result<JoinHandle<PeerResult<SessionOutcome>>> {
    let mut incoming = swarm.announce(on).await?;
    let peer = peer.clone();
    let swarm = swarm.clone();
    Ok(tokio::spawn(async move {
        let result = match incoming.recv().await {
            Some(connection) => peer.accept(&connection.topic, connection.stream).await,
            None => Ok(SessionOutcome::Refused),
        };
        swarm.unannounce(&on).await;
        result
    }))
}

fn outcome(result: &PeerResult<SessionOutcome>) -> Value {
    match result {
        Ok(outcome) => json!(format!("{:?}", outcome)),
        Err(e) => json!({ "error": e.to_string() }),
    }
}

pub async fn run(scenario: Scenario, config: Config) -> Result<Value> {
    let directory = MemoryDirectory::new();
    let swarm = MemorySwarm::new();
    let alice_pin = Pin::new("2468");
    let bob_pin = Pin::new("1357");

    let report = match scenario {
        Scenario::Pcap | Scenario::Smap => {
            let alice = register(
                &directory,
                &config,
                "alice",
                Script { pin: alice_pin.clone(), device_code: None, approve: true },
            )
            .await?;
            let bob = register(
                &directory,
                &config,
                "bob",
                Script { pin: bob_pin, device_code: None, approve: true },
            )
            .await?;

            let (kind, name) = match scenario {
                Scenario::Pcap => (RoomKind::PrivateRoom, "hodlers"),
                _ => (RoomKind::PublicRoom, "lobby"),
            };
            let room = alice.peer.create_room(kind, name, &alice_pin).await?.room();
            let (key, listen_on) = match scenario {
                Scenario::Pcap => (
                    alice.peer.invite_to_room(&room, bob.peer.name(), &alice_pin).await?,
                    bob.peer.invite_topic(),
                ),
                _ => (
                    alice.peer.invite_moderator(&room, bob.peer.name(), &alice_pin).await?,
                    bob.peer.moderator_topic(),
                ),
            };

            let receiver = accept_one(&bob.peer, &swarm, listen_on).await?;
            let delivered = alice.peer.deliver_pending(&swarm).await;
            let received = receiver.await?;

            let report = json!({
                "scenario": format!("{:?}", scenario),
                "room": room.to_string(),
                "invite": key.to_string(),
                "initiator": delivered.iter().map(|(_, r)| outcome(r)).collect::<Vec<_>>(),
                "receiver": outcome(&received),
                "receiverHoldsSeed": bob.peer.keystore().load_room_seed(&room).is_ok(),
                "receiverIsModerator": alice
                    .peer
                    .moderation()
                    .is_moderator(bob.peer.name(), &room)
                    .await,
            });
            alice.responder.abort();
            bob.responder.abort();
            report
        }
        Scenario::Siep | Scenario::SiepWrongCode => {
            let laptop = register(
                &directory,
                &config,
                "alice",
                Script { pin: alice_pin.clone(), device_code: None, approve: true },
            )
            .await?;

            let shown = laptop.peer.device_code().reveal().to_string();
            let typed = match scenario {
                Scenario::Siep => shown,
                _ => shown
                    .chars()
                    .map(|c| if c == '9' { '0' } else { char::from(c as u8 + 1) })
                    .collect(),
            };

            let (services, phone_replicas, events) = services(&directory);
            let phone = Peer::new_device(laptop.peer.name().clone(), "phone", config.clone(), services);
            // both devices replicate the identity replica
            let link = laptop
                .replicas
                .spawn_link(&phone_replicas, config.protocol.authorization_poll_interval);
            let phone_responder = spawn_responder(
                "phone".to_string(),
                events,
                Script { pin: Pin::new("9999"), device_code: Some(typed), approve: true },
            );

            let new_device = accept_one(&phone, &swarm, phone.device_topic()).await?;
            let authorized = laptop
                .peer
                .approve_device(&swarm, &phone.device().device_id)
                .await;
            let synced = new_device.await?;

            let report = json!({
                "scenario": format!("{:?}", scenario),
                "authorizedDevice": outcome(&authorized),
                "newDevice": outcome(&synced),
                "newDeviceRegistered": phone.is_registered(),
                "newDeviceHoldsSeed": phone.keystore().load_account_seed(phone.name()).is_ok(),
            });
            link.abort();
            laptop.responder.abort();
            phone_responder.abort();
            report
        }
    };

    Ok(report)
}
