//! Peer context
//!
//! One device of one identity. Holds every handle the trust layer needs and
//! passes them explicitly to each session; there are no globals.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::errors::{PeerError, PeerResult};
use crate::config::Config;
use crate::core_identity::{
    encrypt_seed, DeviceCode, DeviceId, DeviceRecord, Identity, IdentityDirectory, IdentityName,
    Keypair, Keystore, KeystoreError, Pin, Seed,
};
use crate::core_protocol::{
    pcap, siep, smap, FramedStream, Rendezvous, SessionContext, SessionEvent,
    SessionOutcome,
};
use crate::core_room::{
    topic, DeleteRecord, EditRecord, Ingest, InviteKey, InviteProtocol, InviteQueue, LogRecord,
    MessageId, MessageLog, MessageRecord, ModerationOverlay, PendingInvite, ReplicaId,
    ReplicaRegistry, RoomDescriptor, RoomKind, RoomRef, Topic, VerifiedRecord, VisibleMessage,
};

/// External collaborators of a peer
#[derive(Clone)]
pub struct PeerServices {
    pub keystore: Arc<dyn Keystore>,
    pub directory: Arc<dyn IdentityDirectory>,
    pub replicas: Arc<dyn ReplicaRegistry>,
    /// Session events and prompts for the UI
    pub events: mpsc::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct Peer {
    device: DeviceRecord,
    device_code: DeviceCode,
    config: Arc<Config>,
    ctx: SessionContext,
    logs: Arc<Mutex<HashMap<RoomRef, MessageLog>>>,
}

impl Peer {
    fn assemble(name: IdentityName, device: DeviceRecord, config: Config, services: PeerServices) -> Self {
        let ctx = SessionContext {
            identity: name,
            keystore: services.keystore,
            directory: services.directory,
            moderation: ModerationOverlay::new(services.replicas.clone()),
            replicas: services.replicas,
            invites: InviteQueue::new(),
            config: config.protocol.clone(),
            kdf: config.kdf.clone(),
            events: services.events,
        };
        Self {
            device,
            device_code: DeviceCode::generate(),
            config: Arc::new(config),
            ctx,
            logs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a new identity on this device and publish it
    ///
    /// # Arguments
    ///
    /// * `name` - Identity name to publish under
    /// * `device_label` - Human label of this device, which becomes the master device
    /// * `pin` - PIN sealing the account seed
    pub async fn register(
        name: IdentityName,
        device_label: &str,
        pin: &Pin,
        config: Config,
        services: PeerServices,
    ) -> PeerResult<Self> {
        let identity = Identity::register(name.clone(), device_label, pin, &config.kdf)?;
        let device = identity
            .master_device()
            .cloned()
            .unwrap_or_else(|| DeviceRecord::new(device_label, name.clone()));

        services.directory.publish(identity.document()).await?;
        services.keystore.save_identity(&identity)?;
        services
            .replicas
            .create(ReplicaId::Identity(name.clone()), topic::identity_document(&name))
            .await?;

        info!(identity = %name, device = %device.device_id, "Registered identity");
        Ok(Self::assemble(name, device, config, services))
    }

    /// A device that belongs to `name` but holds no seed yet. It becomes
    /// usable after a device sync.
    pub fn new_device(
        name: IdentityName,
        device_label: &str,
        config: Config,
        services: PeerServices,
    ) -> Self {
        let device = DeviceRecord::new(device_label, name.clone());
        info!(identity = %name, device = %device.device_id, "Created unauthorized device");
        Self::assemble(name, device, config, services)
    }

    pub fn name(&self) -> &IdentityName {
        &self.ctx.identity
    }

    pub fn device(&self) -> &DeviceRecord {
        &self.device
    }

    /// Code to show when another device asks for the seed
    pub fn device_code(&self) -> &DeviceCode {
        &self.device_code
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn moderation(&self) -> &ModerationOverlay {
        &self.ctx.moderation
    }

    pub fn invites(&self) -> &InviteQueue {
        &self.ctx.invites
    }

    pub fn replicas(&self) -> &Arc<dyn ReplicaRegistry> {
        &self.ctx.replicas
    }

    pub fn keystore(&self) -> &Arc<dyn Keystore> {
        &self.ctx.keystore
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn identity(&self) -> PeerResult<Identity> {
        match self.ctx.keystore.load_identity(self.name()) {
            Ok(identity) => Ok(identity),
            Err(KeystoreError::NotFound(_)) => Err(PeerError::NotRegistered(self.name().clone())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.identity().is_ok()
    }

    fn keypair(&self, pin: &Pin) -> PeerResult<Keypair> {
        Ok(self.identity()?.keypair(pin)?)
    }

    // Rooms

    /// Create a room or chat with this identity as creator. Rooms get a
    /// manifest with the creator as moderator; private kinds get a seed.
    pub async fn create_room(&self, kind: RoomKind, name: &str, pin: &Pin) -> PeerResult<RoomDescriptor> {
        if name.trim().is_empty() {
            return Err(PeerError::InvalidRoomName(name.to_string()));
        }
        // fail on a wrong PIN before creating anything
        self.keypair(pin)?;

        let descriptor = RoomDescriptor::new(kind, name, self.name().clone());
        let room = descriptor.room();
        self.ctx
            .replicas
            .create(ReplicaId::Room(room.clone()), descriptor.discovery_key)
            .await?;
        if kind.has_manifest() {
            self.ctx.moderation.create_manifest(&room, self.name()).await?;
        }
        if kind.is_private() {
            let sealed = encrypt_seed(&Seed::generate(), pin, &self.ctx.kdf)?;
            self.ctx.keystore.save_room_seed(&room, &sealed)?;
        }
        self.logs.lock().await.entry(room.clone()).or_default();

        info!(%room, discovery_key = %descriptor.discovery_key, "Created room");
        Ok(descriptor)
    }

    /// Join a public room and its manifest. Blocked users are turned away.
    pub async fn join_public_room(&self, name: &str) -> PeerResult<RoomRef> {
        let room = RoomRef::new(RoomKind::PublicRoom, name);
        if self.ctx.moderation.is_blocked(self.name(), &room).await {
            return Err(PeerError::Blocked(room));
        }
        self.ctx
            .replicas
            .join(ReplicaId::Room(room.clone()), topic::public_room(name))
            .await?;
        self.ctx
            .replicas
            .join(ReplicaId::Manifest(room.clone()), topic::public_manifest(name))
            .await?;
        self.logs.lock().await.entry(room.clone()).or_default();
        info!(%room, "Joined public room");
        Ok(room)
    }

    /// Stop replicating a room locally. Remote copies persist.
    pub async fn leave_room(&self, room: &RoomRef) -> PeerResult<()> {
        self.ctx.replicas.leave(&ReplicaId::Room(room.clone())).await?;
        let manifest = ReplicaId::Manifest(room.clone());
        if self.ctx.replicas.is_joined(&manifest).await {
            self.ctx.replicas.leave(&manifest).await?;
        }
        self.ctx.moderation.drop_manifest(room).await;
        self.ctx.keystore.remove_room_seed(room)?;
        self.logs.lock().await.remove(room);
        info!(%room, "Left room");
        Ok(())
    }

    async fn ensure_joined(&self, room: &RoomRef) -> PeerResult<()> {
        if self.ctx.replicas.is_joined(&ReplicaId::Room(room.clone())).await {
            Ok(())
        } else {
            Err(PeerError::RoomNotJoined(room.clone()))
        }
    }

    // Invites

    /// Queue a room/chat invite for `target`, delivered over PCAP
    pub async fn invite_to_room(&self, room: &RoomRef, target: &IdentityName, pin: &Pin) -> PeerResult<InviteKey> {
        let replica = ReplicaId::Room(room.clone());
        if !self.ctx.replicas.is_writable(&replica).await {
            return Err(PeerError::NotAuthorized(format!("cannot invite to {}", room)));
        }
        let discovery_key = self.ctx.replicas.discovery_key(&replica).await?;
        let invite = PendingInvite::new_pcap(
            &self.keypair(pin)?,
            self.name().clone(),
            room,
            discovery_key,
            target.clone(),
        )?;
        Ok(self.queue(invite).await)
    }

    /// Queue a moderator invite for `target`, delivered over SMAP
    pub async fn invite_moderator(&self, room: &RoomRef, target: &IdentityName, pin: &Pin) -> PeerResult<InviteKey> {
        if !self.ctx.moderation.is_moderator(self.name(), room).await {
            return Err(PeerError::NotAuthorized(format!(
                "{} is not a moderator of {}",
                self.name(),
                room
            )));
        }
        let invite =
            PendingInvite::new_smap(&self.keypair(pin)?, self.name().clone(), room, target.clone())?;
        Ok(self.queue(invite).await)
    }

    async fn queue(&self, invite: PendingInvite) -> InviteKey {
        let key = invite.key();
        if self.ctx.invites.enqueue(invite).await.is_some() {
            debug!(invite = %key, "Replaced queued invite");
        }
        info!(invite = %key, "Queued invite");
        key
    }

    // Messages

    pub async fn post_message(
        &self,
        room: &RoomRef,
        body: &str,
        reply_to: Option<MessageId>,
        pin: &Pin,
    ) -> PeerResult<MessageRecord> {
        self.ensure_joined(room).await?;
        if self.ctx.moderation.is_blocked(self.name(), room).await {
            return Err(PeerError::Blocked(room.clone()));
        }
        let record = MessageRecord::create(&self.keypair(pin)?, self.name().clone(), body, reply_to);
        self.ingest(room, LogRecord::Message(record.clone())).await?;
        Ok(record)
    }

    /// Edit one of this identity's messages
    pub async fn edit_message(
        &self,
        room: &RoomRef,
        message_id: &MessageId,
        body: &str,
        pin: &Pin,
    ) -> PeerResult<EditRecord> {
        let original = self.original(room, message_id).await?;
        if &original.author != self.name() {
            return Err(PeerError::NotAuthorized(format!(
                "cannot edit a message by {}",
                original.author
            )));
        }
        let record = EditRecord::create(&self.keypair(pin)?, self.name().clone(), &original, body);
        self.ingest(room, LogRecord::EditedMessage(record.clone())).await?;
        Ok(record)
    }

    /// Delete one of this identity's messages. No moderator rights needed.
    pub async fn delete_message(&self, room: &RoomRef, message_id: &MessageId, pin: &Pin) -> PeerResult<DeleteRecord> {
        let original = self.original(room, message_id).await?;
        ModerationOverlay::author_delete(self.name(), room, &original.author)?;
        let record = DeleteRecord::create(&self.keypair(pin)?, self.name().clone(), *message_id);
        self.ingest(room, LogRecord::DeletedMessage(record.clone())).await?;
        Ok(record)
    }

    /// Hide a message for everyone through the room manifest
    pub async fn moderator_delete(&self, room: &RoomRef, message_id: &MessageId) -> PeerResult<bool> {
        Ok(self
            .ctx
            .moderation
            .moderator_delete(self.name(), room, message_id)
            .await?)
    }

    pub async fn block_user(&self, room: &RoomRef, target: &IdentityName) -> PeerResult<bool> {
        Ok(self.ctx.moderation.block_user(self.name(), room, target).await?)
    }

    async fn original(&self, room: &RoomRef, message_id: &MessageId) -> PeerResult<MessageRecord> {
        self.logs
            .lock()
            .await
            .get(room)
            .and_then(|log| log.get(message_id).cloned())
            .ok_or(PeerError::MessageNotFound(*message_id))
    }

    /// Apply a record from the room log. Records whose signature does not
    /// verify are dropped.
    pub async fn ingest(&self, room: &RoomRef, record: LogRecord) -> PeerResult<Ingest> {
        self.ensure_joined(room).await?;
        let verified = match VerifiedRecord::check(record, self.ctx.directory.as_ref()).await {
            Ok(verified) => verified,
            Err(crate::core_room::IntegrityError::VerificationFailed { message_id, author }) => {
                warn!(%room, %message_id, %author, "Dropping record with invalid signature");
                return Ok(Ingest::Rejected);
            }
            Err(e) => return Err(e.into()),
        };
        let outcome = self
            .logs
            .lock()
            .await
            .entry(room.clone())
            .or_default()
            .apply(verified);
        Ok(outcome)
    }

    pub async fn visible_messages(&self, room: &RoomRef) -> PeerResult<Vec<VisibleMessage>> {
        let manifest = self.ctx.moderation.manifest(room).await;
        let logs = self.logs.lock().await;
        let log = logs
            .get(room)
            .ok_or_else(|| PeerError::RoomNotJoined(room.clone()))?;
        Ok(log.visible(manifest.as_ref()))
    }

    // Topics

    pub fn device_topic(&self) -> Topic {
        topic::device_sync(&self.device.device_id)
    }

    pub fn invite_topic(&self) -> Topic {
        topic::room_invite(self.name())
    }

    pub fn moderator_topic(&self) -> Topic {
        topic::moderator_invite(self.name())
    }

    // Sessions

    fn framed<S>(&self, stream: S) -> FramedStream<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        FramedStream::new(stream, self.ctx.config.max_frame_size)
    }

    /// Route a connection accepted on one of this peer's topics
    pub async fn accept<S>(&self, on: &Topic, stream: S) -> PeerResult<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if *on == self.device_topic() {
            self.sync_from(stream).await
        } else if *on == self.invite_topic() {
            let mut framed = self.framed(stream);
            Ok(pcap::run_receiver(&self.ctx, &mut framed).await?)
        } else if *on == self.moderator_topic() {
            let mut framed = self.framed(stream);
            Ok(smap::run_receiver(&self.ctx, &mut framed).await?)
        } else {
            Err(PeerError::UnknownTopic(*on))
        }
    }

    /// Obtain the seed from an authorized device of this identity
    pub async fn sync_from<S>(&self, stream: S) -> PeerResult<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.is_registered() {
            return Err(PeerError::AlreadyRegistered(self.name().clone()));
        }
        let mut framed = self.framed(stream);
        Ok(siep::run_initiator(&self.ctx, &self.device, &mut framed).await?)
    }

    /// Hand the seed to a new device of this identity
    pub async fn authorize_device<S>(&self, stream: S) -> PeerResult<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !self.is_registered() {
            return Err(PeerError::NotRegistered(self.name().clone()));
        }
        let mut framed = self.framed(stream);
        Ok(siep::run_receiver(&self.ctx, &self.device_code, &mut framed).await?)
    }

    /// Connect to the new device `device_id` and authorize it
    pub async fn approve_device(&self, swarm: &dyn Rendezvous, device_id: &DeviceId) -> PeerResult<SessionOutcome> {
        let connection = swarm.connect(&topic::device_sync(device_id)).await?;
        self.authorize_device(connection.stream).await
    }

    /// Run the handshake delivering the queued invite `key`
    pub async fn deliver_invite<S>(&self, key: &InviteKey, stream: S) -> PeerResult<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = self.framed(stream);
        let outcome = match key.protocol {
            InviteProtocol::Pcap => pcap::run_initiator(&self.ctx, key, &mut framed).await?,
            InviteProtocol::Smap => smap::run_initiator(&self.ctx, key, &mut framed).await?,
        };
        Ok(outcome)
    }

    /// Try every queued invite whose receiver is reachable
    pub async fn deliver_pending(
        &self,
        swarm: &dyn Rendezvous,
    ) -> Vec<(InviteKey, PeerResult<SessionOutcome>)> {
        let mut results = Vec::new();
        for invite in self.ctx.invites.list(None).await {
            let key = invite.key();
            let on = match key.protocol {
                InviteProtocol::Pcap => topic::room_invite(&key.intended_receiver),
                InviteProtocol::Smap => topic::moderator_invite(&key.intended_receiver),
            };
            let result = match swarm.connect(&on).await {
                Ok(connection) => self.deliver_invite(&key, connection.stream).await,
                Err(e) => Err(e.into()),
            };
            results.push((key, result));
        }
        results
    }

    /// Listen on this peer's topics and run a session per connection.
    ///
    /// Registered peers listen for room and moderator invites; a device
    /// without a seed listens for device sync.
    pub async fn serve(&self, swarm: Arc<dyn Rendezvous>) -> PeerResult<ServeHandle> {
        let topics = if self.is_registered() {
            vec![self.invite_topic(), self.moderator_topic()]
        } else {
            vec![self.device_topic()]
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::with_capacity(topics.len());
        for on in topics.iter().copied() {
            let mut incoming = swarm.announce(on).await?;
            let mut shutdown = shutdown_tx.subscribe();
            let peer = self.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        connection = incoming.recv() => {
                            let Some(connection) = connection else { break };
                            let peer = peer.clone();
                            tokio::spawn(async move {
                                if let Err(e) = peer.accept(&connection.topic, connection.stream).await {
                                    debug!(topic = %connection.topic, error = %e, "Session ended with error");
                                }
                            });
                        }
                    }
                }
            }));
        }

        Ok(ServeHandle {
            swarm,
            topics,
            shutdown_tx,
            tasks,
        })
    }
}

/// Listener tasks started by [`Peer::serve`]
pub struct ServeHandle {
    swarm: Arc<dyn Rendezvous>,
    topics: Vec<Topic>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServeHandle {
    /// Stop listening. Sessions already running finish on their own.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Listener task failed");
            }
        }
        for on in &self.topics {
            self.swarm.unannounce(on).await;
        }
    }
}

impl Drop for ServeHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
