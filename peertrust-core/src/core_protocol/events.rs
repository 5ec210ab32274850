//! Session events and human decisions
//!
//! Sessions never call into the UI. They emit [`SessionEvent`]s on a channel,
//! and events that need an answer carry a [`Prompt`] the UI (or a test
//! harness) resolves. Every wait is bounded by a timeout.

use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::errors::ProtocolError;
use super::session::{ProtocolKind, Role, SessionId, SessionOutcome, SessionState};
use crate::core_identity::{DeviceCode, IdentityName, Pin};
use crate::core_room::RoomRef;

/// One-shot answer slot
pub struct Prompt<T> {
    reply: oneshot::Sender<T>,
}

impl<T> Prompt<T> {
    /// Answer the prompt. Returns false if the session stopped waiting.
    pub fn respond(self, value: T) -> bool {
        self.reply.send(value).is_ok()
    }
}

impl<T> fmt::Debug for Prompt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Prompt")
    }
}

/// Answer to a device sync request
#[derive(Debug)]
pub enum SyncDecision {
    /// Release the seed, unlocked with this PIN
    Approve(Pin),
    Reject,
}

/// Answer to a room or moderator invite. The PIN signs the reply.
#[derive(Debug)]
pub enum InviteDecision {
    Accept(Pin),
    Refuse(Pin),
}

/// Why a PIN is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPurpose {
    /// Unlock the local identity
    Unlock,
    /// Choose the PIN sealing a seed received from another device
    SealSyncedSeed,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Another device of this identity asks for the seed. Show `device_code`.
    SyncRequested {
        session: SessionId,
        user: IdentityName,
        device_code: DeviceCode,
        prompt: Prompt<SyncDecision>,
    },

    /// Enter the code shown on the authorized device
    DeviceCodeRequired {
        session: SessionId,
        prompt: Prompt<String>,
    },

    PinRequired {
        session: SessionId,
        purpose: PinPurpose,
        attempt: u32,
        prompt: Prompt<Pin>,
    },

    InviteReceived {
        session: SessionId,
        room: RoomRef,
        creator: IdentityName,
        prompt: Prompt<InviteDecision>,
    },

    ModeratorInviteReceived {
        session: SessionId,
        room: RoomRef,
        sender: IdentityName,
        prompt: Prompt<InviteDecision>,
    },

    StateChanged {
        session: SessionId,
        protocol: ProtocolKind,
        role: Role,
        state: SessionState,
    },

    /// Terminal. Errors are reduced to their display string.
    Finished {
        session: SessionId,
        protocol: ProtocolKind,
        role: Role,
        result: Result<SessionOutcome, String>,
    },
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::SyncRequested { session, .. }
            | SessionEvent::DeviceCodeRequired { session, .. }
            | SessionEvent::PinRequired { session, .. }
            | SessionEvent::InviteReceived { session, .. }
            | SessionEvent::ModeratorInviteReceived { session, .. }
            | SessionEvent::StateChanged { session, .. }
            | SessionEvent::Finished { session, .. } => *session,
        }
    }
}

/// Emit a prompting event and wait for its answer
pub(crate) async fn ask<T>(
    events: &mpsc::Sender<SessionEvent>,
    wait: Duration,
    make: impl FnOnce(Prompt<T>) -> SessionEvent,
) -> Result<T, ProtocolError> {
    let (reply, answer) = oneshot::channel();
    events
        .send(make(Prompt { reply }))
        .await
        .map_err(|_| ProtocolError::DecisionDropped)?;

    match tokio::time::timeout(wait, answer).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(ProtocolError::DecisionDropped),
        Err(_) => Err(ProtocolError::Timeout("decision")),
    }
}
