//! Private room/chat invitation handshake (PCAP)
//!
//! The inviter (initiator) delivers a queued invite signed over the room
//! name. The invitee (receiver) checks the signature against the inviter's
//! published key before touching anything, joins the room replica
//! speculatively, and asks its user. On a verified accept the inviter
//! authorizes the invitee's writer key and hands over the room seed,
//! encrypted to the invitee's identity key.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::errors::ProtocolError;
use super::events::{ask, InviteDecision, SessionEvent};
use super::session::{
    close_after, consume_invite, recv_within, rollback_join, settle_refusal, verify_signed_by,
    ProtocolKind, ProtocolSession, Role, SessionContext, SessionOutcome, SessionState,
};
use super::wire::FramedStream;
use crate::core_identity::{
    decrypt_from, decrypt_seed, encrypt_for, encrypt_seed, IdentityName, KeystoreError, Pin,
    PublicKey, SealedMessage, Seed, Signature,
};
use crate::core_room::{
    InviteError, InviteKey, Joined, ReplicaId, RoomKind, RoomRef, Topic, WriterKey,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PcapMessage {
    Invite {
        #[serde(rename = "type")]
        kind: RoomKind,
        name: String,
        creator: IdentityName,
        #[serde(rename = "discoveryKey")]
        discovery_key: Topic,
        signature: Signature,
    },
    Accept {
        #[serde(rename = "localPublicKey")]
        local_public_key: WriterKey,
        responder: IdentityName,
        signature: Signature,
    },
    /// Unsigned when the receiver timed out
    Refuse {
        responder: IdentityName,
        #[serde(default)]
        signature: Option<Signature>,
    },
    Authorized {
        #[serde(rename = "type")]
        kind: RoomKind,
        seed: SealedMessage,
        name: String,
    },
    Close {},
}

/// Evaluate an incoming invite
pub async fn run_receiver<S>(
    ctx: &SessionContext,
    framed: &mut FramedStream<S>,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = ProtocolSession::new(ProtocolKind::Pcap, Role::Receiver, ctx.events.clone());
    let result = receive(ctx, framed, &mut session).await;
    close_after(framed, &result, PcapMessage::Close {}).await;
    session.finish(&result);
    result
}

async fn receive<S>(
    ctx: &SessionContext,
    framed: &mut FramedStream<S>,
    session: &mut ProtocolSession,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (kind, name, creator, discovery_key, signature) = loop {
        match recv_within(framed, ctx.config.peer_timeout).await? {
            PcapMessage::Invite {
                kind,
                name,
                creator,
                discovery_key,
                signature,
            } => break (kind, name, creator, discovery_key, signature),
            PcapMessage::Close {} => return Err(ProtocolError::Closed),
            other => warn!(session = %session.id, ?other, "Ignoring message before invite"),
        }
    };
    session.transition(SessionState::EvaluatingInvite);
    session.claim(creator.clone());

    if !kind.is_private() {
        return Err(ProtocolError::UnsupportedRoomKind(kind));
    }
    let creator_key =
        verify_signed_by(ctx, &creator, name.as_bytes(), &signature, "invite signature").await?;

    let room = RoomRef::new(kind, name);
    let replica = ReplicaId::Room(room.clone());
    let joined = ctx.replicas.join(replica.clone(), discovery_key).await?;
    debug!(session = %session.id, %room, "Joined room replica pending decision");

    let result = decide(ctx, framed, session, &room, &creator, &creator_key, &joined).await;
    if !matches!(result, Ok(SessionOutcome::Authorized)) {
        rollback_join(ctx, &replica, &joined).await;
    }
    result
}

async fn decide<S>(
    ctx: &SessionContext,
    framed: &mut FramedStream<S>,
    session: &mut ProtocolSession,
    room: &RoomRef,
    creator: &IdentityName,
    creator_key: &PublicKey,
    joined: &Joined,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    session.transition(SessionState::AwaitingLocalDecision);
    let id = session.id;
    let decision = ask(&ctx.events, ctx.config.decision_timeout, |prompt| {
        SessionEvent::InviteReceived {
            session: id,
            room: room.clone(),
            creator: creator.clone(),
            prompt,
        }
    })
    .await;

    let (keypair, pin) = match decision {
        Ok(InviteDecision::Accept(pin)) => {
            ctx.unlock(session, Some(pin), |identity, pin| identity.keypair(pin))
                .await?
        }
        Ok(InviteDecision::Refuse(pin)) => {
            let signature = signed_refusal(ctx, &room.name, &pin);
            session.transition(SessionState::Refused);
            framed
                .send(&PcapMessage::Refuse {
                    responder: ctx.identity.clone(),
                    signature,
                })
                .await?;
            return Ok(SessionOutcome::Refused);
        }
        Err(e) if e.is_timeout() => {
            info!(session = %session.id, %room, "No decision on invite, refusing");
            session.transition(SessionState::Refused);
            framed
                .send(&PcapMessage::Refuse {
                    responder: ctx.identity.clone(),
                    signature: None,
                })
                .await?;
            return Ok(SessionOutcome::Refused);
        }
        Err(e) => return Err(e),
    };

    framed
        .send(&PcapMessage::Accept {
            local_public_key: joined.local_key,
            responder: ctx.identity.clone(),
            signature: keypair.sign(room.name.as_bytes()),
        })
        .await?;
    session.transition(SessionState::Accepted);
    session.transition(SessionState::AwaitingSeed);

    // the inviter may prompt its own user before answering
    let wait = ctx.config.decision_timeout + ctx.config.peer_timeout;
    loop {
        match recv_within(framed, wait).await? {
            PcapMessage::Authorized { kind, seed, name } if kind == room.kind && name == room.name => {
                let raw = decrypt_from(&keypair, creator_key, &seed)?;
                let seed = Seed::from_slice(&raw)?;
                let sealed = encrypt_seed(&seed, &pin, &ctx.kdf)?;
                ctx.keystore.save_room_seed(room, &sealed)?;
                info!(session = %session.id, %room, "Joined room");
                return Ok(SessionOutcome::Authorized);
            }
            PcapMessage::Close {} => return Err(ProtocolError::Closed),
            other => warn!(session = %session.id, ?other, "Ignoring message while awaiting seed"),
        }
    }
}

/// Sign a refusal, or refuse unsigned if the PIN does not unlock
pub(crate) fn signed_refusal(ctx: &SessionContext, name: &str, pin: &Pin) -> Option<Signature> {
    let identity = ctx.load_identity().ok()?;
    match identity.sign(name.as_bytes(), pin) {
        Ok(signature) => Some(signature),
        Err(e) => {
            debug!(error = %e, "Refusing unsigned");
            None
        }
    }
}

/// Deliver the queued invite `key`
pub async fn run_initiator<S>(
    ctx: &SessionContext,
    key: &InviteKey,
    framed: &mut FramedStream<S>,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = ProtocolSession::new(ProtocolKind::Pcap, Role::Initiator, ctx.events.clone());
    let result = initiate(ctx, key, framed, &mut session).await;
    close_after(framed, &result, PcapMessage::Close {}).await;
    session.finish(&result);
    result
}

async fn initiate<S>(
    ctx: &SessionContext,
    key: &InviteKey,
    framed: &mut FramedStream<S>,
    session: &mut ProtocolSession,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let invite = ctx
        .invites
        .get(key)
        .await
        .ok_or_else(|| InviteError::InviteNotFound(key.clone()))?;
    if !invite.kind.is_private() {
        return Err(ProtocolError::UnsupportedRoomKind(invite.kind));
    }
    let room = invite.room();
    session.claim(invite.intended_receiver.clone());

    framed
        .send(&PcapMessage::Invite {
            kind: invite.kind,
            name: invite.name.clone(),
            creator: invite.creator.clone(),
            discovery_key: invite.discovery_key,
            signature: invite.signature.clone(),
        })
        .await?;
    session.transition(SessionState::AwaitingResponse);

    let wait = ctx.config.decision_timeout + ctx.config.peer_timeout;
    loop {
        match recv_within(framed, wait).await? {
            PcapMessage::Accept {
                local_public_key,
                responder,
                signature,
            } => {
                if responder != invite.intended_receiver {
                    return Err(ProtocolError::VerificationFailed {
                        claimed: responder,
                        what: "acceptance of an invite addressed to someone else",
                    });
                }
                let receiver_key = verify_signed_by(
                    ctx,
                    &responder,
                    invite.name.as_bytes(),
                    &signature,
                    "accept signature",
                )
                .await?;
                session.transition(SessionState::Accepted);

                let (keypair, pin) = ctx
                    .unlock(session, None, |identity, pin| identity.keypair(pin))
                    .await?;
                let seed = room_seed(ctx, &room, &pin)?;

                ctx.replicas
                    .authorize(&ReplicaId::Room(room.clone()), local_public_key)
                    .await?;
                let wrapped = encrypt_for(&keypair, &receiver_key, seed.as_bytes())?;
                framed
                    .send(&PcapMessage::Authorized {
                        kind: invite.kind,
                        seed: wrapped,
                        name: invite.name.clone(),
                    })
                    .await?;

                consume_invite(ctx, key).await;
                info!(session = %session.id, %room, %responder, "Invitee authorized");
                return Ok(SessionOutcome::Authorized);
            }
            PcapMessage::Refuse {
                responder,
                signature,
            } => return settle_refusal(ctx, &invite, &responder, signature.as_ref()).await,
            PcapMessage::Close {} => return Err(ProtocolError::Closed),
            other => warn!(session = %session.id, ?other, "Ignoring out-of-order message"),
        }
    }
}

/// The room's seed, created and stored under `pin` on first use
fn room_seed(ctx: &SessionContext, room: &RoomRef, pin: &Pin) -> Result<Seed, ProtocolError> {
    match ctx.keystore.load_room_seed(room) {
        Ok(sealed) => Ok(decrypt_seed(&sealed, pin)?),
        Err(KeystoreError::NotFound(_)) => {
            let seed = Seed::generate();
            ctx.keystore
                .save_room_seed(room, &encrypt_seed(&seed, pin, &ctx.kdf)?)?;
            debug!(%room, "Generated room seed");
            Ok(seed)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::Keypair;

    #[test]
    fn test_message_shapes() {
        let keypair = Keypair::generate();
        let invite = serde_json::to_value(PcapMessage::Invite {
            kind: RoomKind::PrivateRoom,
            name: "hodlers".into(),
            creator: IdentityName::new("alice").unwrap(),
            discovery_key: Topic::random(),
            signature: keypair.sign(b"hodlers"),
        })
        .unwrap();
        assert_eq!(invite["event"], "invite");
        assert_eq!(invite["type"], "privateRoom");
        assert!(invite["discoveryKey"].is_string());

        let refuse: PcapMessage =
            serde_json::from_str(r#"{"event":"refuse","responder":"bob"}"#).unwrap();
        assert!(matches!(
            refuse,
            PcapMessage::Refuse {
                signature: None,
                ..
            }
        ));
    }
}
