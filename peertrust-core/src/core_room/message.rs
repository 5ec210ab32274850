//! Message integrity
//!
//! Room logs are append-only. Edits and deletes are new records referencing
//! a `message_id`. A record is only honored once its signature verifies
//! against the published key of its author; [`VerifiedRecord`] is the only
//! way into a [`MessageLog`].

use hashlink::LinkedHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

use super::manifest::Manifest;
use super::types::{MessageId, Timestamp};
use crate::core_identity::{DirectoryError, IdentityDirectory, IdentityName, Keypair, Signature};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Identity not found: {0}")]
    IdentityNotFound(IdentityName),

    #[error("Signature of {author} on message {message_id} does not verify")]
    VerificationFailed {
        message_id: MessageId,
        author: IdentityName,
    },
}

impl From<DirectoryError> for IntegrityError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::IdentityNotFound(name) | DirectoryError::KeyConflict(name) => {
                IntegrityError::IdentityNotFound(name)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub author: IdentityName,
    pub body: String,
    pub signature: Signature,
    pub timestamp: Timestamp,
    pub is_reply: bool,
    pub is_reply_to: Option<MessageId>,
}

impl MessageRecord {
    pub fn create(
        keypair: &Keypair,
        author: IdentityName,
        body: impl Into<String>,
        reply_to: Option<MessageId>,
    ) -> Self {
        let body = body.into();
        Self {
            message_id: MessageId::generate(),
            author,
            signature: keypair.sign(body.as_bytes()),
            body,
            timestamp: Timestamp::now(),
            is_reply: reply_to.is_some(),
            is_reply_to: reply_to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub message_id: MessageId,
    pub author: IdentityName,
    pub body: String,
    pub signature: Signature,
    /// Timestamp of the edited message
    pub timestamp: Timestamp,
    pub edited_timestamp: Timestamp,
}

impl EditRecord {
    pub fn create(
        keypair: &Keypair,
        author: IdentityName,
        original: &MessageRecord,
        body: impl Into<String>,
    ) -> Self {
        let body = body.into();
        Self {
            message_id: original.message_id,
            author,
            signature: keypair.sign(&edit_payload(&original.message_id, &body)),
            body,
            timestamp: original.timestamp,
            edited_timestamp: Timestamp::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRecord {
    pub message_id: MessageId,
    pub author: IdentityName,
    pub signature: Signature,
    pub timestamp: Timestamp,
}

impl DeleteRecord {
    pub fn create(keypair: &Keypair, author: IdentityName, message_id: MessageId) -> Self {
        Self {
            message_id,
            author,
            signature: keypair.sign(message_id.as_bytes()),
            timestamp: Timestamp::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LogRecord {
    Message(MessageRecord),
    EditedMessage(EditRecord),
    DeletedMessage(DeleteRecord),
}

impl LogRecord {
    pub fn message_id(&self) -> MessageId {
        match self {
            LogRecord::Message(r) => r.message_id,
            LogRecord::EditedMessage(r) => r.message_id,
            LogRecord::DeletedMessage(r) => r.message_id,
        }
    }

    pub fn author(&self) -> &IdentityName {
        match self {
            LogRecord::Message(r) => &r.author,
            LogRecord::EditedMessage(r) => &r.author,
            LogRecord::DeletedMessage(r) => &r.author,
        }
    }

    pub fn signature(&self) -> &Signature {
        match self {
            LogRecord::Message(r) => &r.signature,
            LogRecord::EditedMessage(r) => &r.signature,
            LogRecord::DeletedMessage(r) => &r.signature,
        }
    }

    /// Bytes covered by the record's signature
    pub fn signed_payload(&self) -> Vec<u8> {
        match self {
            LogRecord::Message(r) => r.body.as_bytes().to_vec(),
            LogRecord::EditedMessage(r) => edit_payload(&r.message_id, &r.body),
            LogRecord::DeletedMessage(r) => r.message_id.as_bytes().to_vec(),
        }
    }
}

/// An edit binds the new body to the message it replaces
pub fn edit_payload(message_id: &MessageId, body: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + body.len());
    payload.extend_from_slice(message_id.as_bytes());
    payload.extend_from_slice(body.as_bytes());
    payload
}

/// Check the record's signature against its author's published key
pub async fn is_legitimate(
    record: &LogRecord,
    directory: &dyn IdentityDirectory,
) -> Result<bool, IntegrityError> {
    let key = directory.public_key(record.author()).await?;
    Ok(key.verify(&record.signed_payload(), record.signature()))
}

/// A record whose signature has been checked
#[derive(Debug, Clone)]
pub struct VerifiedRecord(LogRecord);

impl VerifiedRecord {
    pub async fn check(
        record: LogRecord,
        directory: &dyn IdentityDirectory,
    ) -> Result<Self, IntegrityError> {
        if is_legitimate(&record, directory).await? {
            Ok(VerifiedRecord(record))
        } else {
            Err(IntegrityError::VerificationFailed {
                message_id: record.message_id(),
                author: record.author().clone(),
            })
        }
    }

    pub fn record(&self) -> &LogRecord {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Applied,
    Duplicate,
    Rejected,
}

/// What readers see for a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleMessage {
    pub message_id: MessageId,
    pub author: IdentityName,
    pub body: String,
    pub timestamp: Timestamp,
    pub edited_at: Option<Timestamp>,
    pub is_reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectiveMessage {
    Visible(VisibleMessage),
    Deleted(MessageId),
}

/// Append-only log of one room. Overlays may arrive before their base record.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: LinkedHashMap<MessageId, MessageRecord>,
    edits: HashMap<MessageId, Vec<EditRecord>>,
    deletes: HashMap<MessageId, Vec<DeleteRecord>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify then apply. Records that fail verification are dropped.
    pub async fn ingest(
        &mut self,
        record: LogRecord,
        directory: &dyn IdentityDirectory,
    ) -> Result<Ingest, IntegrityError> {
        match VerifiedRecord::check(record, directory).await {
            Ok(verified) => Ok(self.apply(verified)),
            Err(IntegrityError::VerificationFailed { message_id, author }) => {
                warn!(%message_id, %author, "Dropping record with invalid signature");
                Ok(Ingest::Rejected)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a verified record. `message_id` plus signature is the
    /// idempotency key.
    pub fn apply(&mut self, verified: VerifiedRecord) -> Ingest {
        match verified.0 {
            LogRecord::Message(record) => {
                if self.messages.contains_key(&record.message_id) {
                    return Ingest::Duplicate;
                }
                self.messages.insert(record.message_id, record);
                Ingest::Applied
            }
            LogRecord::EditedMessage(record) => {
                let edits = self.edits.entry(record.message_id).or_default();
                if edits.iter().any(|e| e.signature == record.signature) {
                    return Ingest::Duplicate;
                }
                edits.push(record);
                Ingest::Applied
            }
            LogRecord::DeletedMessage(record) => {
                let deletes = self.deletes.entry(record.message_id).or_default();
                if deletes.iter().any(|d| d.signature == record.signature) {
                    return Ingest::Duplicate;
                }
                deletes.push(record);
                Ingest::Applied
            }
        }
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&MessageRecord> {
        self.messages.get(message_id)
    }

    /// Effective state of a message, `None` until its base record arrives.
    /// Only overlays by the base author count.
    pub fn effective(&self, message_id: &MessageId) -> Option<EffectiveMessage> {
        let base = self.messages.get(message_id)?;

        let deleted = self
            .deletes
            .get(message_id)
            .is_some_and(|ds| ds.iter().any(|d| d.author == base.author));
        if deleted {
            return Some(EffectiveMessage::Deleted(*message_id));
        }

        let latest_edit = self.edits.get(message_id).and_then(|es| {
            es.iter()
                .filter(|e| e.author == base.author)
                .max_by(|a, b| {
                    a.edited_timestamp
                        .cmp(&b.edited_timestamp)
                        .then_with(|| a.signature.cmp(&b.signature))
                })
        });

        let (body, edited_at) = match latest_edit {
            Some(edit) => (edit.body.clone(), Some(edit.edited_timestamp)),
            None => (base.body.clone(), None),
        };

        Some(EffectiveMessage::Visible(VisibleMessage {
            message_id: base.message_id,
            author: base.author.clone(),
            body,
            timestamp: base.timestamp,
            edited_at,
            is_reply_to: base.is_reply_to,
        }))
    }

    /// Visible messages in arrival order, minus author and moderator deletes.
    /// Everything by a blocked user is hidden, including what they wrote
    /// before the block.
    pub fn visible(&self, manifest: Option<&Manifest>) -> Vec<VisibleMessage> {
        self.messages
            .keys()
            .filter(|id| !manifest.is_some_and(|m| m.deleted.contains(*id)))
            .filter_map(|id| match self.effective(id) {
                Some(EffectiveMessage::Visible(message)) => Some(message),
                _ => None,
            })
            .filter(|message| !manifest.is_some_and(|m| m.blocked.contains(&message.author)))
            .collect()
    }

    /// Number of base messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_identity::{Identity, KdfParams, MemoryDirectory, Pin};
    use crate::core_room::{RoomKind, RoomRef};

    struct Author {
        name: IdentityName,
        keypair: Keypair,
    }

    async fn author(directory: &MemoryDirectory, name: &str) -> Author {
        let pin = Pin::new("1234");
        let identity = Identity::register(
            IdentityName::new(name).unwrap(),
            "laptop",
            &pin,
            &KdfParams::insecure_fast(),
        )
        .unwrap();
        directory.publish(identity.document()).await.unwrap();
        Author {
            name: identity.name().clone(),
            keypair: identity.keypair(&pin).unwrap(),
        }
    }

    fn message(a: &Author, body: &str) -> MessageRecord {
        MessageRecord::create(&a.keypair, a.name.clone(), body, None)
    }

    fn edit_at(a: &Author, original: &MessageRecord, body: &str, at: u64) -> LogRecord {
        let mut edit = EditRecord::create(&a.keypair, a.name.clone(), original, body);
        edit.edited_timestamp = Timestamp::from_millis(at);
        LogRecord::EditedMessage(edit)
    }

    #[tokio::test]
    async fn test_legitimate_records() {
        let directory = MemoryDirectory::new();
        let alice = author(&directory, "alice").await;
        let msg = message(&alice, "gm");

        let records = [
            LogRecord::Message(msg.clone()),
            edit_at(&alice, &msg, "gm all", 5),
            LogRecord::DeletedMessage(DeleteRecord::create(
                &alice.keypair,
                alice.name.clone(),
                msg.message_id,
            )),
        ];
        for record in &records {
            assert!(is_legitimate(record, &directory).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_forged_author_rejected() {
        let directory = MemoryDirectory::new();
        let alice = author(&directory, "alice").await;
        let mallory = author(&directory, "mallory").await;

        let mut forged = message(&mallory, "send coins to mallory");
        forged.author = alice.name.clone();

        let mut log = MessageLog::new();
        let outcome = log
            .ingest(LogRecord::Message(forged.clone()), &directory)
            .await
            .unwrap();
        assert_eq!(outcome, Ingest::Rejected);
        assert!(log.is_empty());
        assert!(log.effective(&forged.message_id).is_none());
    }

    #[tokio::test]
    async fn test_unknown_author() {
        let directory = MemoryDirectory::new();
        let ghost = Author {
            name: IdentityName::new("ghost").unwrap(),
            keypair: Keypair::generate(),
        };
        let mut log = MessageLog::new();
        let result = log
            .ingest(LogRecord::Message(message(&ghost, "boo")), &directory)
            .await;
        assert!(matches!(result, Err(IntegrityError::IdentityNotFound(_))));
    }

    #[tokio::test]
    async fn test_tampered_body_rejected() {
        let directory = MemoryDirectory::new();
        let alice = author(&directory, "alice").await;
        let mut msg = message(&alice, "hello");
        msg.body = "goodbye".to_string();
        assert!(!is_legitimate(&LogRecord::Message(msg), &directory)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let directory = MemoryDirectory::new();
        let alice = author(&directory, "alice").await;
        let record = LogRecord::Message(message(&alice, "gm"));

        let mut log = MessageLog::new();
        assert_eq!(
            log.ingest(record.clone(), &directory).await.unwrap(),
            Ingest::Applied
        );
        let once = log.visible(None);
        assert_eq!(
            log.ingest(record, &directory).await.unwrap(),
            Ingest::Duplicate
        );
        assert_eq!(log.visible(None), once);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_latest_edit_wins() {
        let directory = MemoryDirectory::new();
        let alice = author(&directory, "alice").await;
        let msg = message(&alice, "v1");

        let mut log = MessageLog::new();
        for record in [
            edit_at(&alice, &msg, "v3", 30),
            LogRecord::Message(msg.clone()),
            edit_at(&alice, &msg, "v2", 20),
        ] {
            log.ingest(record, &directory).await.unwrap();
        }

        match log.effective(&msg.message_id).unwrap() {
            EffectiveMessage::Visible(v) => {
                assert_eq!(v.body, "v3");
                assert_eq!(v.edited_at, Some(Timestamp::from_millis(30)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_wins_in_any_order() {
        let directory = MemoryDirectory::new();
        let alice = author(&directory, "alice").await;
        let msg = message(&alice, "oops");
        let delete = LogRecord::DeletedMessage(DeleteRecord::create(
            &alice.keypair,
            alice.name.clone(),
            msg.message_id,
        ));
        let records = vec![
            LogRecord::Message(msg.clone()),
            edit_at(&alice, &msg, "fixed", 10),
            delete,
            edit_at(&alice, &msg, "fixed again", 20),
        ];

        // every rotation of the arrival order
        for shift in 0..records.len() {
            let mut log = MessageLog::new();
            let mut order = records.clone();
            order.rotate_left(shift);
            for record in order {
                log.ingest(record, &directory).await.unwrap();
            }
            assert_eq!(
                log.effective(&msg.message_id),
                Some(EffectiveMessage::Deleted(msg.message_id))
            );
            assert!(log.visible(None).is_empty());
        }
    }

    #[tokio::test]
    async fn test_overlay_by_other_author_ignored() {
        let directory = MemoryDirectory::new();
        let alice = author(&directory, "alice").await;
        let bob = author(&directory, "bob").await;
        let msg = message(&alice, "mine");

        let mut log = MessageLog::new();
        log.ingest(LogRecord::Message(msg.clone()), &directory)
            .await
            .unwrap();
        log.ingest(edit_at(&bob, &msg, "hijacked", 99), &directory)
            .await
            .unwrap();
        log.ingest(
            LogRecord::DeletedMessage(DeleteRecord::create(
                &bob.keypair,
                bob.name.clone(),
                msg.message_id,
            )),
            &directory,
        )
        .await
        .unwrap();

        let visible = log.visible(None);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].body, "mine");
    }

    #[tokio::test]
    async fn test_manifest_deletes_hidden() {
        let directory = MemoryDirectory::new();
        let alice = author(&directory, "alice").await;
        let keep = message(&alice, "keep");
        let hide = message(&alice, "spam");

        let mut log = MessageLog::new();
        for m in [&keep, &hide] {
            log.ingest(LogRecord::Message(m.clone()), &directory)
                .await
                .unwrap();
        }

        let mut manifest = Manifest::new(
            RoomRef::new(RoomKind::PublicRoom, "lobby"),
            alice.name.clone(),
        );
        manifest.deleted.insert(hide.message_id);

        let visible = log.visible(Some(&manifest));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].message_id, keep.message_id);
    }

    #[tokio::test]
    async fn test_blocked_authors_hidden() {
        let directory = MemoryDirectory::new();
        let alice = author(&directory, "alice").await;
        let bob = author(&directory, "bob").await;
        let early = message(&bob, "spam");
        let keep = message(&alice, "gm");

        let mut log = MessageLog::new();
        for m in [&early, &keep] {
            log.ingest(LogRecord::Message(m.clone()), &directory)
                .await
                .unwrap();
        }

        let mut manifest = Manifest::new(
            RoomRef::new(RoomKind::PublicRoom, "lobby"),
            alice.name.clone(),
        );
        assert_eq!(log.visible(Some(&manifest)).len(), 2);

        manifest.blocked.insert(bob.name.clone());
        let late = message(&bob, "more spam");
        log.ingest(LogRecord::Message(late), &directory)
            .await
            .unwrap();

        let visible = log.visible(Some(&manifest));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].author, alice.name);
        // the records stay in the log
        assert_eq!(log.len(), 3);

        manifest.blocked.remove(&bob.name);
        assert_eq!(log.visible(Some(&manifest)).len(), 3);
    }

    #[test]
    fn test_record_wire_tags() {
        let keypair = Keypair::generate();
        let name = IdentityName::new("alice").unwrap();
        let msg = MessageRecord::create(&keypair, name.clone(), "hi", None);
        let json = serde_json::to_value(LogRecord::Message(msg.clone())).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["isReply"], false);

        let delete = DeleteRecord::create(&keypair, name, msg.message_id);
        let json = serde_json::to_value(LogRecord::DeletedMessage(delete)).unwrap();
        assert_eq!(json["type"], "deleted-message");
    }
}
