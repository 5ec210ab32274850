//! Moderator invitation handshake (SMAP)
//!
//! Same shape as PCAP, scoped to the room's manifest replica. Manifest write
//! access is never granted without a signature over the room name that
//! verifies against the claimed sender's published key.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::errors::ProtocolError;
use super::events::{ask, InviteDecision, SessionEvent};
use super::pcap::signed_refusal;
use super::session::{
    close_after, consume_invite, recv_within, rollback_join, settle_refusal, verify_signed_by,
    ProtocolKind, ProtocolSession, Role, SessionContext, SessionOutcome, SessionState,
};
use super::wire::FramedStream;
use crate::core_identity::{IdentityName, Signature};
use crate::core_room::{
    topic, InviteError, InviteKey, Joined, ReplicaError, ReplicaId, RoomKind, RoomRef, WriterKey,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SmapMessage {
    Invite {
        #[serde(rename = "type")]
        kind: RoomKind,
        #[serde(rename = "roomName")]
        room_name: String,
        sender: IdentityName,
        signature: Signature,
        #[serde(rename = "intendedReceiver")]
        intended_receiver: IdentityName,
    },
    Accept {
        #[serde(rename = "roomName")]
        room_name: String,
        #[serde(rename = "localPublicKey")]
        local_public_key: WriterKey,
        responder: IdentityName,
        signature: Signature,
    },
    Refuse {
        responder: IdentityName,
        #[serde(default)]
        signature: Option<Signature>,
    },
    Authorized {
        #[serde(rename = "roomName")]
        room_name: String,
    },
    Close {},
}

/// Evaluate an incoming moderator invite
pub async fn run_receiver<S>(
    ctx: &SessionContext,
    framed: &mut FramedStream<S>,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = ProtocolSession::new(ProtocolKind::Smap, Role::Receiver, ctx.events.clone());
    let result = receive(ctx, framed, &mut session).await;
    close_after(framed, &result, SmapMessage::Close {}).await;
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
    let (kind, room_name, sender, signature, intended_receiver) = loop {
        match recv_within(framed, ctx.config.peer_timeout).await? {
            SmapMessage::Invite {
                kind,
                room_name,
                sender,
                signature,
                intended_receiver,
            } => break (kind, room_name, sender, signature, intended_receiver),
            SmapMessage::Close {} => return Err(ProtocolError::Closed),
            other => warn!(session = %session.id, ?other, "Ignoring message before invite"),
        }
    };
    session.transition(SessionState::EvaluatingInvite);
    session.claim(sender.clone());

    if intended_receiver != ctx.identity {
        return Err(ProtocolError::VerificationFailed {
            claimed: sender,
            what: "invite addressed to someone else",
        });
    }
    let room = RoomRef::new(kind, room_name);
    let manifest_key =
        topic::manifest_for(&room).ok_or(ProtocolError::UnsupportedRoomKind(kind))?;
    verify_signed_by(ctx, &sender, room.name.as_bytes(), &signature, "invite signature").await?;

    let replica = ReplicaId::Manifest(room.clone());
    let joined = ctx.replicas.join(replica.clone(), manifest_key).await?;
    debug!(session = %session.id, %room, "Joined manifest replica pending decision");

    let result = decide(ctx, framed, session, &room, &sender, &joined).await;
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
    sender: &IdentityName,
    joined: &Joined,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    session.transition(SessionState::AwaitingLocalDecision);
    let id = session.id;
    let decision = ask(&ctx.events, ctx.config.decision_timeout, |prompt| {
        SessionEvent::ModeratorInviteReceived {
            session: id,
            room: room.clone(),
            sender: sender.clone(),
            prompt,
        }
    })
    .await;

    let signature = match decision {
        Ok(InviteDecision::Accept(pin)) => {
            let (keypair, _) = ctx
                .unlock(session, Some(pin), |identity, pin| identity.keypair(pin))
                .await?;
            keypair.sign(room.name.as_bytes())
        }
        Ok(InviteDecision::Refuse(pin)) => {
            session.transition(SessionState::Refused);
            framed
                .send(&SmapMessage::Refuse {
                    responder: ctx.identity.clone(),
                    signature: signed_refusal(ctx, &room.name, &pin),
                })
                .await?;
            return Ok(SessionOutcome::Refused);
        }
        Err(e) if e.is_timeout() => {
            info!(session = %session.id, %room, "No decision on moderator invite, refusing");
            session.transition(SessionState::Refused);
            framed
                .send(&SmapMessage::Refuse {
                    responder: ctx.identity.clone(),
                    signature: None,
                })
                .await?;
            return Ok(SessionOutcome::Refused);
        }
        Err(e) => return Err(e),
    };

    framed
        .send(&SmapMessage::Accept {
            room_name: room.name.clone(),
            local_public_key: joined.local_key,
            responder: ctx.identity.clone(),
            signature,
        })
        .await?;
    session.transition(SessionState::Accepted);
    session.transition(SessionState::AwaitingAuthorization);

    let wait = ctx.config.decision_timeout + ctx.config.peer_timeout;
    loop {
        match recv_within(framed, wait).await? {
            SmapMessage::Authorized { room_name } if room_name == room.name => {
                if ctx.moderation.is_moderator(&ctx.identity, room).await {
                    debug!(session = %session.id, %room, "Already a moderator");
                    return Err(ProtocolError::AlreadyModerator(room.clone()));
                }
                info!(session = %session.id, %room, "Granted moderator access");
                return Ok(SessionOutcome::Authorized);
            }
            SmapMessage::Close {} => return Err(ProtocolError::Closed),
            other => warn!(session = %session.id, ?other, "Ignoring message while awaiting authorization"),
        }
    }
}

/// Deliver the queued moderator invite `key`
pub async fn run_initiator<S>(
    ctx: &SessionContext,
    key: &InviteKey,
    framed: &mut FramedStream<S>,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = ProtocolSession::new(ProtocolKind::Smap, Role::Initiator, ctx.events.clone());
    let result = initiate(ctx, key, framed, &mut session).await;
    close_after(framed, &result, SmapMessage::Close {}).await;
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
    let room = invite.room();
    if !room.kind.has_manifest() {
        return Err(ProtocolError::UnsupportedRoomKind(room.kind));
    }
    if !ctx.moderation.is_moderator(&ctx.identity, &room).await {
        return Err(ProtocolError::NotAuthorized(format!(
            "{} is not a moderator of {}",
            ctx.identity, room
        )));
    }
    session.claim(invite.intended_receiver.clone());

    framed
        .send(&SmapMessage::Invite {
            kind: invite.kind,
            room_name: invite.name.clone(),
            sender: invite.creator.clone(),
            signature: invite.signature.clone(),
            intended_receiver: invite.intended_receiver.clone(),
        })
        .await?;
    session.transition(SessionState::AwaitingResponse);

    let wait = ctx.config.decision_timeout + ctx.config.peer_timeout;
    loop {
        match recv_within(framed, wait).await? {
            SmapMessage::Accept {
                room_name,
                local_public_key,
                responder,
                signature,
            } if room_name == invite.name => {
                if responder != invite.intended_receiver {
                    return Err(ProtocolError::VerificationFailed {
                        claimed: responder,
                        what: "acceptance of an invite addressed to someone else",
                    });
                }
                verify_signed_by(
                    ctx,
                    &responder,
                    invite.name.as_bytes(),
                    &signature,
                    "accept signature",
                )
                .await?;
                session.transition(SessionState::Accepted);

                ctx.replicas
                    .authorize(&ReplicaId::Manifest(room.clone()), local_public_key)
                    .await
                    .map_err(|e| match e {
                        ReplicaError::NotWriter(id) => {
                            ProtocolError::NotAuthorized(format!("no write access to {}", id))
                        }
                        other => other.into(),
                    })?;
                ctx.moderation
                    .add_moderator(&ctx.identity, &room, &responder)
                    .await?;

                framed
                    .send(&SmapMessage::Authorized {
                        room_name: invite.name.clone(),
                    })
                    .await?;
                consume_invite(ctx, key).await;
                info!(session = %session.id, %room, %responder, "Moderator authorized");
                return Ok(SessionOutcome::Authorized);
            }
            SmapMessage::Refuse {
                responder,
                signature,
            } => return settle_refusal(ctx, &invite, &responder, signature.as_ref()).await,
            SmapMessage::Close {} => return Err(ProtocolError::Closed),
            other => warn!(session = %session.id, ?other, "Ignoring out-of-order message"),
        }
    }
}
