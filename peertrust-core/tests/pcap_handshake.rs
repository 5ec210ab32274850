//! Private room invitations between two peers

mod common;

use common::*;
use peertrust_core::core_identity::{decrypt_seed, MemoryDirectory, Pin};
use peertrust_core::core_peer::PeerError;
use peertrust_core::core_protocol::pcap::PcapMessage;
use peertrust_core::core_protocol::{
    FramedStream, MemorySwarm, ProtocolError, ProtocolKind, Role, SessionOutcome,
};
use peertrust_core::core_room::{ReplicaId, ReplicaRegistry, RoomKind, RoomRef};
use std::sync::Arc;

const ALICE_PIN: &str = "2468";
const BOB_PIN: &str = "1357";

async fn alice_and_bob(bob_decision: Decision) -> (MemoryDirectory, TestPeer, TestPeer, RoomRef) {
    let directory = MemoryDirectory::new();
    let alice = register(&directory, "alice", Script::accepting(ALICE_PIN)).await;
    let bob = register(
        &directory,
        "bob",
        Script::accepting(BOB_PIN).deciding(bob_decision),
    )
    .await;
    let room = alice
        .peer
        .create_room(RoomKind::PrivateRoom, "hodlers", &Pin::new(ALICE_PIN))
        .await
        .unwrap()
        .room();
    (directory, alice, bob, room)
}

async fn handshake(
    alice: &TestPeer,
    bob: &TestPeer,
    room: &RoomRef,
) -> (
    Result<SessionOutcome, PeerError>,
    Result<SessionOutcome, PeerError>,
) {
    let key = alice
        .peer
        .invite_to_room(room, bob.peer.name(), &Pin::new(ALICE_PIN))
        .await
        .unwrap();
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let topic = bob.peer.invite_topic();
    tokio::join!(
        alice.peer.deliver_invite(&key, ours),
        bob.peer.accept(&topic, theirs)
    )
}

#[tokio::test]
async fn test_hodlers_invite_accepted() {
    let (_directory, alice, bob, room) = alice_and_bob(Decision::Accept).await;

    let (initiator, receiver) = handshake(&alice, &bob, &room).await;
    assert_eq!(initiator.unwrap(), SessionOutcome::Authorized);
    assert_eq!(receiver.unwrap(), SessionOutcome::Authorized);

    // bob holds the same seed, sealed under his own PIN
    let alice_seed = decrypt_seed(
        &alice.peer.keystore().load_room_seed(&room).unwrap(),
        &Pin::new(ALICE_PIN),
    )
    .unwrap();
    let bob_sealed = bob.peer.keystore().load_room_seed(&room).unwrap();
    assert_eq!(decrypt_seed(&bob_sealed, &Pin::new(BOB_PIN)).unwrap(), alice_seed);
    assert!(decrypt_seed(&bob_sealed, &Pin::new(ALICE_PIN)).is_err());

    // bob writes to the room but not to its manifest
    let replica = ReplicaId::Room(room.clone());
    let bob_key = bob.replicas.local_key(&replica).await.unwrap();
    assert!(alice.replicas.is_authorized(&replica, &bob_key).await.unwrap());
    assert_eq!(
        bob.replicas.discovery_key(&replica).await.unwrap(),
        alice.replicas.discovery_key(&replica).await.unwrap()
    );
    assert!(!bob.replicas.is_writable(&ReplicaId::Manifest(room.clone())).await);
    assert!(!alice.peer.moderation().is_moderator(bob.peer.name(), &room).await);

    assert!(alice.peer.invites().is_empty().await);
    assert_eq!(bob.prompts(), vec!["invite"]);
}

#[tokio::test]
async fn test_invited_member_can_post() {
    let (_directory, alice, bob, room) = alice_and_bob(Decision::Accept).await;
    let (initiator, receiver) = handshake(&alice, &bob, &room).await;
    assert!(initiator.is_ok() && receiver.is_ok());

    let record = bob
        .peer
        .post_message(&room, "wagmi", None, &Pin::new(BOB_PIN))
        .await
        .unwrap();
    alice
        .peer
        .ingest(
            &room,
            peertrust_core::core_room::LogRecord::Message(record.clone()),
        )
        .await
        .unwrap();

    let visible = alice.peer.visible_messages(&room).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].author, name("bob"));
}

#[tokio::test]
async fn test_signed_refusal_removes_invite() {
    let (_directory, alice, bob, room) = alice_and_bob(Decision::Refuse).await;

    let (initiator, receiver) = handshake(&alice, &bob, &room).await;
    assert_eq!(initiator.unwrap(), SessionOutcome::Refused);
    assert_eq!(receiver.unwrap(), SessionOutcome::Refused);

    assert!(alice.peer.invites().is_empty().await);
    assert!(!bob.replicas.is_joined(&ReplicaId::Room(room.clone())).await);
    assert!(bob.peer.keystore().load_room_seed(&room).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_undecided_invite_is_refused_and_rolled_back() {
    let (_directory, alice, bob, room) = alice_and_bob(Decision::Ignore).await;

    let (initiator, receiver) = handshake(&alice, &bob, &room).await;
    assert_eq!(receiver.unwrap(), SessionOutcome::Refused);
    assert_eq!(initiator.unwrap(), SessionOutcome::Refused);

    // the speculative join is undone
    assert!(!bob.replicas.is_joined(&ReplicaId::Room(room.clone())).await);
    assert!(bob.peer.keystore().load_room_seed(&room).is_err());

    // an unsigned refusal does not cancel the invite
    assert_eq!(alice.peer.invites().len().await, 1);
}

#[tokio::test]
async fn test_forged_invite_leaves_state_untouched() {
    let directory = MemoryDirectory::new();
    let _alice = register(&directory, "alice", Script::accepting(ALICE_PIN)).await;
    let mallory = register(&directory, "mallory", Script::accepting("9999")).await;
    let bob = register(&directory, "bob", Script::accepting(BOB_PIN)).await;

    // mallory signs an invite that claims to come from alice
    let mallory_keys = mallory
        .peer
        .identity()
        .unwrap()
        .keypair(&Pin::new("9999"))
        .unwrap();
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let mut framed = FramedStream::new(ours, 64 * 1024);
    framed
        .send(&PcapMessage::Invite {
            kind: RoomKind::PrivateRoom,
            name: "hodlers".into(),
            creator: name("alice"),
            discovery_key: peertrust_core::core_room::Topic::random(),
            signature: mallory_keys.sign(b"hodlers"),
        })
        .await
        .unwrap();

    let result = bob.peer.accept(&bob.peer.invite_topic(), theirs).await;
    assert!(matches!(
        result,
        Err(PeerError::Protocol(ProtocolError::VerificationFailed { .. }))
    ));

    let room = RoomRef::new(RoomKind::PrivateRoom, "hodlers");
    assert!(!bob.replicas.is_joined(&ReplicaId::Room(room.clone())).await);
    assert!(bob.peer.keystore().load_room_seed(&room).is_err());
    assert!(bob.prompts().is_empty());
    // no close frame is sent to a masquerading peer
    assert!(framed.recv::<PcapMessage>().await.unwrap().is_none());
}

#[tokio::test]
async fn test_invite_for_someone_else_is_not_accepted() {
    let directory = MemoryDirectory::new();
    let alice = register(&directory, "alice", Script::accepting(ALICE_PIN)).await;
    let bob = register(&directory, "bob", Script::accepting(BOB_PIN)).await;
    let carol = register(&directory, "carol", Script::accepting("1111")).await;
    let room = alice
        .peer
        .create_room(RoomKind::PrivateRoom, "hodlers", &Pin::new(ALICE_PIN))
        .await
        .unwrap()
        .room();
    let key = alice
        .peer
        .invite_to_room(&room, bob.peer.name(), &Pin::new(ALICE_PIN))
        .await
        .unwrap();

    // carol answers a connection meant for bob
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let topic = carol.peer.invite_topic();
    let (initiator, _receiver) = tokio::join!(
        alice.peer.deliver_invite(&key, ours),
        carol.peer.accept(&topic, theirs)
    );
    assert!(initiator.is_err());
    assert!(alice.peer.invites().get(&key).await.is_some());
    assert!(carol.peer.keystore().load_room_seed(&room).is_err());
}

#[tokio::test]
async fn test_deliver_pending_over_swarm() {
    let (_directory, alice, bob, room) = alice_and_bob(Decision::Accept).await;
    let swarm = Arc::new(MemorySwarm::new());
    let serving = bob.peer.serve(swarm.clone()).await.unwrap();

    alice
        .peer
        .invite_to_room(&room, bob.peer.name(), &Pin::new(ALICE_PIN))
        .await
        .unwrap();
    let results = alice.peer.deliver_pending(swarm.as_ref()).await;
    assert_eq!(results.len(), 1);
    assert_eq!(
        *results[0].1.as_ref().unwrap(),
        SessionOutcome::Authorized
    );

    // bob's side finishes in its own task
    let bob_finished = || {
        bob.observed.lock().unwrap().finished.iter().any(|(p, r, res)| {
            *p == ProtocolKind::Pcap
                && *r == Role::Receiver
                && res.as_ref().ok() == Some(&SessionOutcome::Authorized)
        })
    };
    for _ in 0..200 {
        if bob_finished() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(bob_finished());
    assert!(bob.peer.keystore().load_room_seed(&room).is_ok());
    serving.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_invites_are_independent() {
    let directory = MemoryDirectory::new();
    let alice = register(&directory, "alice", Script::accepting(ALICE_PIN)).await;
    let bob = register(&directory, "bob", Script::accepting(BOB_PIN)).await;
    let carol = register(
        &directory,
        "carol",
        Script::accepting("1111").deciding(Decision::Refuse),
    )
    .await;
    let room = alice
        .peer
        .create_room(RoomKind::PrivateRoom, "hodlers", &Pin::new(ALICE_PIN))
        .await
        .unwrap()
        .room();

    let mut sessions = Vec::new();
    for invitee in [&bob, &carol] {
        let key = alice
            .peer
            .invite_to_room(&room, invitee.peer.name(), &Pin::new(ALICE_PIN))
            .await
            .unwrap();
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let inviter = alice.peer.clone();
        let receiver = invitee.peer.clone();
        let topic = receiver.invite_topic();
        sessions.push(tokio::spawn(async move {
            tokio::join!(
                inviter.deliver_invite(&key, ours),
                receiver.accept(&topic, theirs)
            )
        }));
    }

    let outcomes: Vec<_> = futures::future::join_all(sessions)
        .await
        .into_iter()
        .map(|joined| {
            let (initiator, receiver) = joined.unwrap();
            (initiator.unwrap(), receiver.unwrap())
        })
        .collect();
    assert_eq!(
        outcomes,
        vec![
            (SessionOutcome::Authorized, SessionOutcome::Authorized),
            (SessionOutcome::Refused, SessionOutcome::Refused),
        ]
    );
    assert!(bob.peer.keystore().load_room_seed(&room).is_ok());
    assert!(carol.peer.keystore().load_room_seed(&room).is_err());
    assert!(alice.peer.invites().is_empty().await);
}
