//! Protocol sessions
//!
//! A session is the in-memory record of one handshake over one stream. It is
//! owned by the task driving the handshake and never persisted. State
//! changes are logged and published as [`SessionEvent::StateChanged`].

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::ProtocolError;
use super::events::{ask, PinPurpose, SessionEvent};
use super::wire::{FramedStream, PROTOCOL_CHANNEL};
use crate::config::ProtocolConfig;
use crate::core_identity::{
    CryptoError, Identity, IdentityDirectory, IdentityName, KdfParams, Keystore, Pin, PublicKey,
    Signature,
};
use crate::core_room::{
    InviteKey, InviteQueue, Joined, ModerationOverlay, PendingInvite, ReplicaId, ReplicaRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Siep,
    Pcap,
    Smap,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Siep => f.write_str("siep"),
            ProtocolKind::Pcap => f.write_str("pcap"),
            ProtocolKind::Smap => f.write_str("smap"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Idle,
    AwaitingUserApproval,
    AwaitingProof,
    SeedReleased,
    AwaitingKey,
    EvaluatingInvite,
    AwaitingLocalDecision,
    /// Initiator waiting for the receiver's accept or refuse
    AwaitingResponse,
    Accepted,
    Refused,
    AwaitingSeed,
    AwaitingAuthorization,
    Authorized,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Authorized | SessionState::Refused | SessionState::Aborted
        )
    }
}

/// How a session that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Authorized,
    Refused,
}

/// Everything a session needs from the local peer
#[derive(Clone)]
pub struct SessionContext {
    pub identity: IdentityName,
    pub keystore: Arc<dyn Keystore>,
    pub directory: Arc<dyn IdentityDirectory>,
    pub replicas: Arc<dyn ReplicaRegistry>,
    pub moderation: ModerationOverlay,
    pub invites: InviteQueue,
    pub config: ProtocolConfig,
    pub kdf: KdfParams,
    pub events: mpsc::Sender<SessionEvent>,
}

impl SessionContext {
    pub fn load_identity(&self) -> Result<Identity, ProtocolError> {
        Ok(self.keystore.load_identity(&self.identity)?)
    }

    /// Run `unlock` with `first`, re-prompting on a wrong PIN up to
    /// `max_pin_attempts` attempts in total
    pub(crate) async fn unlock<T>(
        &self,
        session: &ProtocolSession,
        first: Option<Pin>,
        unlock: impl Fn(&Identity, &Pin) -> Result<T, CryptoError>,
    ) -> Result<(T, Pin), ProtocolError> {
        let identity = self.load_identity()?;
        let mut attempt = 1;
        let mut pin = match first {
            Some(pin) => pin,
            None => self.ask_pin(session, PinPurpose::Unlock, attempt).await?,
        };

        loop {
            match unlock(&identity, &pin) {
                Ok(value) => return Ok((value, pin)),
                Err(CryptoError::WrongPin) if attempt < self.config.max_pin_attempts => {
                    attempt += 1;
                    debug!(session = %session.id, attempt, "Wrong PIN, asking again");
                    pin = self.ask_pin(session, PinPurpose::Unlock, attempt).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) async fn ask_pin(
        &self,
        session: &ProtocolSession,
        purpose: PinPurpose,
        attempt: u32,
    ) -> Result<Pin, ProtocolError> {
        let id = session.id;
        ask(&self.events, self.config.decision_timeout, |prompt| {
            SessionEvent::PinRequired {
                session: id,
                purpose,
                attempt,
                prompt,
            }
        })
        .await
    }
}

pub struct ProtocolSession {
    pub id: SessionId,
    pub protocol: ProtocolKind,
    pub role: Role,
    pub state: SessionState,
    pub channel_id: u32,
    /// Identity the remote side claims to be, once known
    pub peer_claim: Option<IdentityName>,
    events: mpsc::Sender<SessionEvent>,
}

impl ProtocolSession {
    pub fn new(protocol: ProtocolKind, role: Role, events: mpsc::Sender<SessionEvent>) -> Self {
        let id = SessionId::new();
        debug!(session = %id, %protocol, ?role, "Session opened");
        Self {
            id,
            protocol,
            role,
            state: SessionState::Idle,
            channel_id: PROTOCOL_CHANNEL,
            peer_claim: None,
            events,
        }
    }

    pub fn transition(&mut self, state: SessionState) {
        debug!(
            session = %self.id,
            protocol = %self.protocol,
            from = ?self.state,
            to = ?state,
            "Session state changed"
        );
        self.state = state;
        // observers that lag behind miss intermediate states
        let _ = self.events.try_send(SessionEvent::StateChanged {
            session: self.id,
            protocol: self.protocol,
            role: self.role,
            state,
        });
    }

    pub fn claim(&mut self, peer: IdentityName) {
        self.peer_claim = Some(peer);
    }

    /// Record the end of the session and publish it
    pub fn finish(mut self, result: &Result<SessionOutcome, ProtocolError>) {
        match result {
            Ok(outcome) => {
                let state = match outcome {
                    SessionOutcome::Authorized => SessionState::Authorized,
                    SessionOutcome::Refused => SessionState::Refused,
                };
                if self.state != state {
                    self.transition(state);
                }
                info!(
                    session = %self.id,
                    protocol = %self.protocol,
                    peer = ?self.peer_claim,
                    ?outcome,
                    "Session finished"
                );
            }
            Err(e) => {
                self.transition(SessionState::Aborted);
                if e.is_verification_failure() {
                    warn!(session = %self.id, protocol = %self.protocol, error = %e, "Session destroyed");
                } else {
                    info!(session = %self.id, protocol = %self.protocol, error = %e, "Session aborted");
                }
            }
        }
        let _ = self.events.try_send(SessionEvent::Finished {
            session: self.id,
            protocol: self.protocol,
            role: self.role,
            result: result.as_ref().copied().map_err(|e| e.to_string()),
        });
    }
}

/// Check that `claimed` signed `payload`, against the key the directory
/// publishes for `claimed`. Never trusts a key supplied by the peer.
pub(crate) async fn verify_signed_by(
    ctx: &SessionContext,
    claimed: &IdentityName,
    payload: &[u8],
    signature: &Signature,
    what: &'static str,
) -> Result<PublicKey, ProtocolError> {
    let key = ctx.directory.public_key(claimed).await?;
    if !key.verify(payload, signature) {
        return Err(ProtocolError::VerificationFailed {
            claimed: claimed.clone(),
            what,
        });
    }
    Ok(key)
}

/// Handle a receiver's refusal on the inviting side. A verified refusal
/// consumes the invite; an unsigned one leaves it queued.
pub(crate) async fn settle_refusal(
    ctx: &SessionContext,
    invite: &PendingInvite,
    responder: &IdentityName,
    signature: Option<&Signature>,
) -> Result<SessionOutcome, ProtocolError> {
    if responder != &invite.intended_receiver {
        return Err(ProtocolError::VerificationFailed {
            claimed: responder.clone(),
            what: "refusal of an invite addressed to someone else",
        });
    }
    match signature {
        Some(signature) => {
            verify_signed_by(ctx, responder, invite.name.as_bytes(), signature, "refusal signature")
                .await?;
            ctx.invites.remove(&invite.key()).await;
            info!(room = %invite.room(), %responder, "Invite refused");
        }
        None => info!(room = %invite.room(), %responder, "Unsigned refusal, invite kept"),
    }
    Ok(SessionOutcome::Refused)
}

/// Consume a delivered invite. Racing sessions may have taken it already.
pub(crate) async fn consume_invite(ctx: &SessionContext, key: &InviteKey) {
    if ctx.invites.take(key).await.is_err() {
        debug!(invite = %key, "Invite already consumed");
    }
}

/// Undo a speculative join
pub(crate) async fn rollback_join(ctx: &SessionContext, replica: &ReplicaId, joined: &Joined) {
    if !joined.newly_joined {
        return;
    }
    match ctx.replicas.leave(replica).await {
        Ok(()) => debug!(%replica, "Rolled back speculative join"),
        Err(e) => warn!(%replica, error = %e, "Rollback failed"),
    }
}

/// Next message from the peer within `wait`. A closed stream is
/// [`ProtocolError::Closed`].
pub(crate) async fn recv_within<S, M>(
    framed: &mut FramedStream<S>,
    wait: Duration,
) -> Result<M, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    M: serde::de::DeserializeOwned,
{
    match tokio::time::timeout(wait, framed.recv::<M>()).await {
        Ok(Ok(Some(message))) => Ok(message),
        Ok(Ok(None)) => Err(ProtocolError::Closed),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ProtocolError::Timeout("peer")),
    }
}

/// Tell the peer we are leaving, unless the session ended on a failed
/// verification. Best-effort.
pub(crate) async fn close_after<S, M>(
    framed: &mut FramedStream<S>,
    result: &Result<SessionOutcome, ProtocolError>,
    close: M,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    M: Serialize,
{
    match result {
        Err(e) if e.is_verification_failure() => {}
        Err(ProtocolError::Closed) | Err(ProtocolError::Wire(_)) => {}
        Err(_) => {
            if let Err(e) = framed.send(&close).await {
                debug!(error = %e, "Could not send close");
            }
        }
        Ok(_) => {}
    }
}
