//! Device sync handshake (SIEP)
//!
//! An unauthorized device (initiator) asks an authorized device of the same
//! identity (receiver) for the account seed. The receiver's user approves,
//! the initiator proves it can read the device code shown on the receiver's
//! screen, the seed is released, and the receiver authorizes the new
//! device's writer key on the identity replica.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use super::errors::ProtocolError;
use super::events::{ask, PinPurpose, SessionEvent, SyncDecision};
use super::session::{
    close_after, recv_within, rollback_join, ProtocolKind, ProtocolSession, Role, SessionContext,
    SessionOutcome, SessionState,
};
use super::wire::FramedStream;
use crate::core_identity::{encrypt_seed, DeviceCode, DeviceRecord, Identity, SealedSeed, Seed};
use crate::core_room::{topic, Joined, ReplicaId, WriterKey};

/// Replica identifier carried by `providekey`
pub const IDENTITY_REPLICA: &str = "identity";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SiepMessage {
    Open {
        user: crate::core_identity::IdentityName,
    },
    Verify {},
    Proof {
        secret: String,
    },
    #[serde(rename = "releaseseed")]
    ReleaseSeed {
        seed: String,
    },
    #[serde(rename = "providekey")]
    ProvideKey {
        identifier: String,
        #[serde(rename = "diffKey")]
        diff_key: WriterKey,
    },
    Close {},
}

/// Serve a sync request on an authorized device
pub async fn run_receiver<S>(
    ctx: &SessionContext,
    device_code: &DeviceCode,
    framed: &mut FramedStream<S>,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = ProtocolSession::new(ProtocolKind::Siep, Role::Receiver, ctx.events.clone());
    let result = receive(ctx, device_code, framed, &mut session).await;
    close_after(framed, &result, SiepMessage::Close {}).await;
    session.finish(&result);
    result
}

async fn receive<S>(
    ctx: &SessionContext,
    device_code: &DeviceCode,
    framed: &mut FramedStream<S>,
    session: &mut ProtocolSession,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let wait = ctx.config.peer_timeout;

    let user = loop {
        match recv_within(framed, wait).await? {
            SiepMessage::Open { user } => break user,
            SiepMessage::Close {} => return Err(ProtocolError::Closed),
            other => warn!(session = %session.id, ?other, "Ignoring message before open"),
        }
    };
    session.claim(user.clone());
    if user != ctx.identity {
        return Err(ProtocolError::VerificationFailed {
            claimed: user,
            what: "ownership of this identity",
        });
    }

    session.transition(SessionState::AwaitingUserApproval);
    let id = session.id;
    let code = device_code.clone();
    let decision = ask(&ctx.events, ctx.config.decision_timeout, |prompt| {
        SessionEvent::SyncRequested {
            session: id,
            user: user.clone(),
            device_code: code,
            prompt,
        }
    })
    .await;

    let pin = match decision {
        Ok(SyncDecision::Approve(pin)) => pin,
        Ok(SyncDecision::Reject) => {
            info!(session = %session.id, "Device sync rejected by user");
            framed.send(&SiepMessage::Close {}).await?;
            return Ok(SessionOutcome::Refused);
        }
        Err(e) if e.is_timeout() => {
            info!(session = %session.id, "No decision on device sync, rejecting");
            framed.send(&SiepMessage::Close {}).await?;
            return Ok(SessionOutcome::Refused);
        }
        Err(e) => return Err(e),
    };

    let (seed, _) = ctx
        .unlock(session, Some(pin), |identity: &Identity, pin| {
            identity.decrypt_seed(pin)
        })
        .await?;

    framed.send(&SiepMessage::Verify {}).await?;
    session.transition(SessionState::AwaitingProof);

    let mut attempts = 0;
    loop {
        match recv_within(framed, wait).await? {
            SiepMessage::Proof { secret } => {
                if device_code.matches(&secret) {
                    break;
                }
                attempts += 1;
                warn!(session = %session.id, attempts, "Wrong device code");
                if attempts >= ctx.config.max_device_code_attempts {
                    return Err(ProtocolError::WrongDeviceCode);
                }
                framed.send(&SiepMessage::Verify {}).await?;
            }
            SiepMessage::Close {} => return Err(ProtocolError::Closed),
            other => warn!(session = %session.id, ?other, "Ignoring message while awaiting proof"),
        }
    }

    session.transition(SessionState::SeedReleased);
    let mut release = SiepMessage::ReleaseSeed {
        seed: hex::encode(seed.as_bytes()),
    };
    drop(seed);
    let sent = framed.send(&release).await;
    if let SiepMessage::ReleaseSeed { seed } = &mut release {
        seed.zeroize();
    }
    sent?;

    session.transition(SessionState::AwaitingKey);
    let diff_key = loop {
        match recv_within(framed, wait).await? {
            SiepMessage::ProvideKey {
                identifier,
                diff_key,
            } if identifier == IDENTITY_REPLICA => break diff_key,
            SiepMessage::Close {} => return Err(ProtocolError::Closed),
            other => warn!(session = %session.id, ?other, "Ignoring message while awaiting key"),
        }
    };

    let replica = ReplicaId::Identity(ctx.identity.clone());
    ctx.replicas.authorize(&replica, diff_key).await?;
    await_authorization(ctx, &replica, &diff_key).await?;
    info!(session = %session.id, %diff_key, "Authorized new device");

    framed.send(&SiepMessage::Close {}).await?;
    Ok(SessionOutcome::Authorized)
}

/// Poll until the grant is visible in the registry
async fn await_authorization(
    ctx: &SessionContext,
    replica: &ReplicaId,
    key: &WriterKey,
) -> Result<(), ProtocolError> {
    let poll = async {
        loop {
            if ctx.replicas.is_authorized(replica, key).await? {
                return Ok::<_, ProtocolError>(());
            }
            tokio::time::sleep(ctx.config.authorization_poll_interval).await;
        }
    };
    tokio::time::timeout(ctx.config.authorization_timeout, poll)
        .await
        .map_err(|_| ProtocolError::Timeout("writer authorization"))?
}

/// Ask an authorized device for the seed, from a new device.
///
/// The released seed must derive the published identity key. It is sealed
/// under a newly chosen PIN and stored, and the session succeeds only once
/// this device's writer key shows up as authorized on the identity replica.
/// Then `device` is added to the identity document. A failure after the
/// seed was stored removes it again.
pub async fn run_initiator<S>(
    ctx: &SessionContext,
    device: &DeviceRecord,
    framed: &mut FramedStream<S>,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = ProtocolSession::new(ProtocolKind::Siep, Role::Initiator, ctx.events.clone());
    let mut pending = None;
    let result = initiate(ctx, device, framed, &mut session, &mut pending).await;
    if result.is_err() {
        if let Some(pending) = pending {
            discard_synced_seed(ctx, &pending.joined).await;
        }
    }
    close_after(framed, &result, SiepMessage::Close {}).await;
    session.finish(&result);
    result
}

/// Seed stored and writer key offered, grant not yet seen
struct PendingSync {
    sealed_seed: SealedSeed,
    joined: Joined,
}

async fn initiate<S>(
    ctx: &SessionContext,
    device: &DeviceRecord,
    framed: &mut FramedStream<S>,
    session: &mut ProtocolSession,
    pending: &mut Option<PendingSync>,
) -> Result<SessionOutcome, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // the remote user decides before anything else happens
    let wait = ctx.config.decision_timeout + ctx.config.peer_timeout;
    let replica = ReplicaId::Identity(ctx.identity.clone());

    framed
        .send(&SiepMessage::Open {
            user: ctx.identity.clone(),
        })
        .await?;
    session.claim(ctx.identity.clone());
    session.transition(SessionState::AwaitingUserApproval);

    loop {
        let message = match recv_within(framed, wait).await {
            Ok(message) => message,
            Err(ProtocolError::Closed) if pending.is_some() => SiepMessage::Close {},
            Err(e) => return Err(e),
        };

        match message {
            SiepMessage::Verify {} if pending.is_none() => {
                let id = session.id;
                let secret = ask(&ctx.events, ctx.config.decision_timeout, |prompt| {
                    SessionEvent::DeviceCodeRequired {
                        session: id,
                        prompt,
                    }
                })
                .await?;
                framed.send(&SiepMessage::Proof { secret }).await?;
                session.transition(SessionState::AwaitingProof);
            }
            SiepMessage::ReleaseSeed { mut seed } if pending.is_none() => {
                let raw = Zeroizing::new(hex::decode(&seed).unwrap_or_default());
                seed.zeroize();
                let seed = Seed::from_slice(&raw)?;

                let document = ctx.directory.lookup(&ctx.identity).await?;
                if let Err(e) = document.keypair_from_seed(&seed) {
                    debug!(session = %session.id, error = %e, "Released seed rejected");
                    return Err(ProtocolError::VerificationFailed {
                        claimed: ctx.identity.clone(),
                        what: "seed matching the published identity key",
                    });
                }
                session.transition(SessionState::SeedReleased);

                let pin = ctx
                    .ask_pin(session, PinPurpose::SealSyncedSeed, 1)
                    .await?;
                let sealed_seed = encrypt_seed(&seed, &pin, &ctx.kdf)?;
                drop(seed);

                let joined = ctx
                    .replicas
                    .join(replica.clone(), topic::identity_document(&ctx.identity))
                    .await?;
                if let Err(e) = ctx.keystore.save_account_seed(&ctx.identity, &sealed_seed) {
                    rollback_join(ctx, &replica, &joined).await;
                    return Err(e.into());
                }
                debug!(session = %session.id, "Stored synced seed");
                *pending = Some(PendingSync {
                    sealed_seed,
                    joined,
                });

                framed
                    .send(&SiepMessage::ProvideKey {
                        identifier: IDENTITY_REPLICA.to_string(),
                        diff_key: joined.local_key,
                    })
                    .await?;
                session.transition(SessionState::AwaitingKey);
            }
            SiepMessage::Close {} => {
                let Some(sync) = pending.as_ref() else {
                    return Err(ProtocolError::Closed);
                };
                // the receiver closes on failure too, so only the grant counts
                session.transition(SessionState::AwaitingAuthorization);
                await_authorization(ctx, &replica, &sync.joined.local_key).await?;
                adopt_identity(ctx, device, sync.sealed_seed.clone()).await?;
                return Ok(SessionOutcome::Authorized);
            }
            other => warn!(session = %session.id, ?other, "Ignoring out-of-order message"),
        }
    }
}

/// Undo a sync that stored a seed but never got write access
async fn discard_synced_seed(ctx: &SessionContext, joined: &Joined) {
    match ctx.keystore.remove_account_seed(&ctx.identity) {
        Ok(_) => debug!(identity = %ctx.identity, "Discarded synced seed"),
        Err(e) => warn!(identity = %ctx.identity, error = %e, "Could not discard synced seed"),
    }
    rollback_join(ctx, &ReplicaId::Identity(ctx.identity.clone()), joined).await;
}

/// Assemble the local identity from the published document and record this
/// device in it
async fn adopt_identity(
    ctx: &SessionContext,
    device: &DeviceRecord,
    sealed_seed: SealedSeed,
) -> Result<(), ProtocolError> {
    let document = ctx.directory.lookup(&ctx.identity).await?;
    let mut identity = Identity::from_parts(document, sealed_seed);
    if identity.add_device(device.clone()) {
        ctx.directory.publish(identity.document()).await?;
    }
    ctx.keystore.save_identity(&identity)?;
    info!(identity = %ctx.identity, device = %device.device_id, "Device synced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_shapes() {
        let open = serde_json::to_value(SiepMessage::Open {
            user: crate::core_identity::IdentityName::new("alice").unwrap(),
        })
        .unwrap();
        assert_eq!(open["event"], "open");
        assert_eq!(open["user"], "alice");

        let key = serde_json::to_value(SiepMessage::ProvideKey {
            identifier: IDENTITY_REPLICA.into(),
            diff_key: WriterKey::generate(),
        })
        .unwrap();
        assert_eq!(key["event"], "providekey");
        assert!(key["diffKey"].is_string());

        let verify: SiepMessage = serde_json::from_str(r#"{"event":"verify"}"#).unwrap();
        assert!(matches!(verify, SiepMessage::Verify {}));
    }
}
