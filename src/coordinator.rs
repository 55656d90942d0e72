//! RoomCoordinator (§4.7): the public surface the UI collaborator calls —
//! create/join/leave rooms, send/delete/list messages, manage writers,
//! upload/download files, issue invites.
//!
//! Grounded on the reference core's `lib.rs` public surface (the set of
//! functions a host app calls to create/open rooms, send messages, manage
//! membership), narrowed to this crate's Room/Writer/Message/Invite/BlobRef
//! model and rebuilt around an explicit `CoreContext` (§9)
//! instead of the reference's `OnceLock` singletons. The reference's FFI
//! scaffolding (UniFFI dictionaries, `_ffi` wrapper functions) is dropped —
//! the UI is an external collaborator reached through this plain Rust API,
//! not through a mobile bridge.

use std::collections::HashMap;
use std::sync::Arc;

use iroh_blobs::store::Store as BlobsStore;
use lru::LruCache;
use p2panda_core::PrivateKey;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::blobstore::{BlobStore, GetOptions, GetResult, PutOptions};
use crate::config::{CoreContext, RoomKeyEntry};
use crate::error::CoreError;
use crate::logcore::LogCore;
use crate::multiwriter::{MultiWriterLog, Update as MultiWriterUpdate};
use crate::pairing;
use crate::store::open_view_pool;
use crate::transport::{Discovery, Frame, FrameKind, ReplicationTransport, TransportEvent};
use crate::view::{run_migrations, BlobRef, FindMessagesOptions, Message, RichContent, View};

const DEDUP_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Events the coordinator emits, fanned out per room (§4.7).
#[derive(Debug, Clone)]
pub enum RoomEvent {
    NewMessage(Message),
    WritersChanged,
    Update,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct WriterInfo {
    pub public_key: [u8; 32],
    pub is_local: bool,
    pub active: bool,
    pub faulty: bool,
}

/// One open room: its `MultiWriterLog`, a handle onto the process-wide flat
/// blob store (§9), a local write-through cache directory for downloaded
/// blobs (§6 `remote-blobs/`), and the per-room task group and dedup cache.
pub struct Room<S: BlobsStore> {
    room_id: String,
    mwl: Arc<MultiWriterLog>,
    local_key: PrivateKey,
    blob_store: Arc<BlobStore<S>>,
    remote_blobs_dir: std::path::PathBuf,
    events: broadcast::Sender<RoomEvent>,
    seen: Mutex<LruCache<String, ()>>,
    cancel: CancellationToken,
    write_lock: Mutex<()>,
    transport: Arc<ReplicationTransport>,
    topic: [u8; 32],
    // Kept alive for the room's lifetime: dropping it cancels the gossip
    // listener `open_room` spawned for this room's topic.
    discovery: Arc<Discovery>,
}

impl<S: BlobsStore> Room<S> {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub async fn send_message(
        &self,
        content: String,
        system: bool,
        attachments: Vec<BlobRef>,
    ) -> Result<String, CoordinatorError> {
        let _guard = self.write_lock.lock().await;
        let id = generate_id();
        let timestamp = now_micros();
        let has_attachments = !attachments.is_empty();
        let body = if has_attachments {
            serde_json::to_string(&RichContent { text: content, attachments })
                .map_err(|e| CoreError::Fatal(e.to_string()))?
        } else {
            content
        };
        self.mwl
            .append(&crate::commands::Command::SendMessage(crate::commands::SendMessage {
                id: id.clone(),
                content: body,
                sender: hex::encode(*self.local_key.public_key().as_bytes()),
                public_key: Some(*self.local_key.public_key().as_bytes()),
                timestamp,
                flags: crate::commands::MessageFlags { system, received: false, has_attachments },
            }))
            .await
            .map_err(CoreError::from)?;

        // §4.7: sendMessage appends the message, then a counter bump to
        // set-metadata, as two distinct commands — a remote peer
        // linearizing this log sees the same two-command contract, rather
        // than inferring the count as a side effect of folding the first.
        if let Some(mut meta) = self.mwl.view().get_metadata(&self.room_id).await.map_err(CoreError::from)? {
            meta.message_count += 1;
            self.mwl
                .append(&crate::commands::Command::SetMetadata(crate::commands::SetMetadata {
                    room_id: meta.room_id,
                    name: meta.name,
                    created_at: meta.created_at,
                    message_count: meta.message_count,
                    blob_store_key: meta.blob_store_key,
                }))
                .await
                .map_err(CoreError::from)?;
        }

        if let Some(message) = self.mwl.view().get_message(&id).await.map_err(CoreError::from)? {
            self.notify_new_message(message).await;
        }
        Ok(id)
    }

    /// `uploadFile(roomId, bytes, name) → BlobRef` (§4.7). Stores the bytes
    /// in the shared flat blob store; the caller still has to reference the
    /// returned `BlobRef` from a message for other members to learn of it.
    pub async fn upload_file(&self, bytes: Vec<u8>, name: String) -> Result<BlobRef, CoordinatorError> {
        Ok(self
            .blob_store
            .put(bytes, PutOptions { name: Some(name), ..Default::default() })
            .await
            .map_err(|e| CoreError::Fatal(e.to_string()))?)
    }

    /// `downloadFile(roomId, blobId, opts) → bytes | null` (§4.7). A blob
    /// that isn't locally present yields `Ok(None)` rather than an error —
    /// callers distinguish "not present yet" from a real failure. Successful
    /// fetches are written through to `remote-blobs/<blobId>` so repeated
    /// downloads of the same id are served from disk.
    pub async fn download_file(
        &self,
        blob_id: &str,
        opts: GetOptions,
    ) -> Result<Option<GetResult>, CoordinatorError> {
        if !self.blob_store.has(blob_id).await {
            return Ok(None);
        }
        let result = self
            .blob_store
            .get(blob_id, opts)
            .await
            .map_err(|e| CoreError::Fatal(e.to_string()))?;

        if !result.truncated {
            let _ = tokio::fs::create_dir_all(&self.remote_blobs_dir).await;
            let _ = tokio::fs::write(self.remote_blobs_dir.join(blob_id), &result.bytes).await;
        }
        Ok(Some(result))
    }

    /// `listFiles(roomId, opts) → [BlobRef]` (§4.7). There is no dedicated
    /// files collection (§9) — the list is derived by scanning the room's
    /// messages for attachments and deduplicating by blob id, newest first.
    pub async fn list_files(&self, limit: Option<i64>) -> Result<Vec<BlobRef>, CoordinatorError> {
        let messages = self
            .mwl
            .view()
            .find_messages(
                &self.room_id,
                &FindMessagesOptions { reverse: true, ..Default::default() },
            )
            .await
            .map_err(CoreError::from)?;

        let mut seen = std::collections::HashSet::new();
        let mut files = Vec::new();
        for message in messages {
            for attachment in message.attachments() {
                if seen.insert(attachment.blob_id.clone()) {
                    files.push(attachment);
                    if let Some(limit) = limit {
                        if files.len() as i64 >= limit {
                            return Ok(files);
                        }
                    }
                }
            }
        }
        Ok(files)
    }

    /// `deleteFile(roomId, blobId)` (§4.7). There is no blob-deletion command
    /// in the wire format and no GC (§9 Open Question) — this only evicts
    /// the local `remote-blobs/` cache copy made by `download_file`. The
    /// content stays in the shared blob store for other members.
    pub async fn delete_file(&self, blob_id: &str) -> Result<(), CoordinatorError> {
        let path = self.remote_blobs_dir.join(blob_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoordinatorError::Core(CoreError::NotFound(blob_id.to_string())))
            }
            Err(e) => Err(CoordinatorError::Core(CoreError::from(e))),
        }
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<(), CoordinatorError> {
        let _guard = self.write_lock.lock().await;
        self.mwl
            .append(&crate::commands::Command::DeleteMessage(crate::commands::DeleteMessage {
                id: message_id.to_string(),
            }))
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    pub async fn get_messages(&self, opts: FindMessagesOptions) -> Result<Vec<Message>, CoordinatorError> {
        Ok(self.mwl.view().find_messages(&self.room_id, &opts).await.map_err(CoreError::from)?)
    }

    pub async fn get_message_count(&self) -> Result<i64, CoordinatorError> {
        Ok(self.mwl.view().message_count(&self.room_id).await.map_err(CoreError::from)?)
    }

    /// Local writer is always listed first (§4.7).
    pub async fn get_writers(&self) -> Result<Vec<WriterInfo>, CoordinatorError> {
        let local_bytes = *self.local_key.public_key().as_bytes();
        let mut writers: Vec<WriterInfo> = self
            .mwl
            .view()
            .list_writers(&self.room_id)
            .await
            .map_err(CoreError::from)?
            .into_iter()
            .map(|(key, active, faulty)| WriterInfo {
                public_key: key,
                is_local: key == local_bytes,
                active,
                faulty,
            })
            .collect();
        writers.sort_by_key(|w| !w.is_local);
        Ok(writers)
    }

    pub async fn create_invite(&self, room_key: &[u8; 32], expires_at: i64) -> Result<String, CoordinatorError> {
        Ok(pairing::create_invite(&self.mwl, &self.local_key, room_key, expires_at)
            .await
            .map_err(|e| CoreError::Conflict(e.to_string()))?)
    }

    async fn notify_new_message(&self, message: Message) {
        let key = (self.room_id.clone(), message.id.clone());
        let dedup_key = format!("{}:{}", key.0, key.1);
        let mut seen = self.seen.lock().await;
        if seen.contains(&dedup_key) {
            return;
        }
        seen.put(dedup_key, ());
        drop(seen);
        let _ = self.events.send(RoomEvent::NewMessage(message));
    }

    /// §4.7 `leaveRoom`: stops the background fold-forwarding task and tells
    /// the transport to stop announcing this room's topic. Idempotent —
    /// `ReplicationTransport::leave` no-ops if the topic was already gone.
    async fn close(&self) {
        self.cancel.cancel();
        self.transport.leave(self.topic).await;
    }
}

impl<S: BlobsStore> Drop for Room<S> {
    fn drop(&mut self) {
        // Best-effort: `close()` (awaited from `leave_room`) is the primary
        // teardown path. Dropping `discovery` here (its last `Arc` reference)
        // also cancels the gossip listener on its own, per `Discovery`'s Drop.
        self.cancel.cancel();
    }
}

/// Binds `CoreContext` into the set of currently open rooms and exposes the
/// §4.7 operations. Cheaply `Clone`: internally `Arc`-backed, so the host
/// application may share one coordinator across tasks.
///
/// `S` mirrors `CoreContext<S>`'s blob-store backend parameter and defaults
/// the same way, so `RoomCoordinator::new(ctx)` infers it from `ctx`.
pub struct RoomCoordinator<S: BlobsStore = iroh_blobs::store::fs::Store> {
    ctx: Arc<CoreContext<S>>,
    rooms: Arc<RwLock<HashMap<String, Arc<Room<S>>>>>,
    // One issuer-side pairing listener per room with an active invite,
    // keyed by room id. `spawn_pairing_listener` is idempotent against this.
    pairing_listeners: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

// Every field is `Arc`-backed, so cloning never requires `S: Clone` — a
// manual impl avoids `derive(Clone)`'s blanket bound on the type parameter.
impl<S: BlobsStore> Clone for RoomCoordinator<S> {
    fn clone(&self) -> Self {
        RoomCoordinator {
            ctx: self.ctx.clone(),
            rooms: self.rooms.clone(),
            pairing_listeners: self.pairing_listeners.clone(),
        }
    }
}

impl<S: BlobsStore> RoomCoordinator<S> {
    pub fn new(ctx: CoreContext<S>) -> Self {
        RoomCoordinator {
            ctx: Arc::new(ctx),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            pairing_listeners: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &CoreContext<S> {
        &self.ctx
    }

    /// `createRoom(name) → roomId`: generates room keys, opens the LogCore
    /// and view, writes the initial `set-metadata`, and registers the room.
    pub async fn create_room(&self, name: String) -> Result<String, CoordinatorError> {
        let room_id = generate_id();
        let mut room_key = [0u8; 32];
        let mut encryption_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut room_key);
        rand::rngs::OsRng.fill_bytes(&mut encryption_key);

        let room = self.open_room(&room_id, true).await?;
        let created_at = now_micros();
        room.mwl
            .append(&crate::commands::Command::SetMetadata(crate::commands::SetMetadata {
                room_id: room_id.clone(),
                name: name.clone(),
                created_at,
                message_count: 0,
                blob_store_key: None,
            }))
            .await
            .map_err(CoreError::from)?;

        let mut entries = self.ctx.read_room_keys().map_err(|e| CoreError::Fatal(e.to_string()))?;
        entries.push(RoomKeyEntry {
            id: room_id.clone(),
            name,
            key: hex::encode(room_key),
            encryption_key: hex::encode(encryption_key),
            blob_store_key: None,
        });
        self.ctx.write_room_keys(&entries).map_err(|e| CoreError::Fatal(e.to_string()))?;

        self.rooms.write().await.insert(room_id.clone(), room);
        info!(room_id = %room_id, "room created");
        Ok(room_id)
    }

    /// `joinRoom(invite) → roomId`. Joins the pairing rendezvous topic
    /// derived from the invite, announces the local public key, and waits
    /// for the issuer's sealed key-transfer reply — `pairing::join_room`
    /// drives the state machine (§4.6); this builds the announce/key-xfer
    /// callbacks it needs against the shared `ReplicationTransport`.
    pub async fn join_room(&self, invite: &str) -> Result<String, CoordinatorError> {
        let credential = pairing::invite_credential(invite)
            .ok_or_else(|| CoreError::Unauthorized("malformed invite".into()))?;
        let topic = pairing::pairing_topic(&credential);
        let discovery = self
            .ctx
            .transport
            .join(topic, self.ctx.bootstrap_node_ids.clone())
            .await
            .map_err(|e| CoreError::Fatal(e.to_string()))?;

        let announce_discovery = discovery.clone();
        let announce = move |cred: [u8; 32], candidate: p2panda_core::PublicKey| {
            Box::pin(async move {
                let frame = Frame {
                    kind: FrameKind::PairingAnnounce,
                    scope: cred,
                    payload: candidate.as_bytes().to_vec(),
                };
                announce_discovery
                    .send_frame(&frame)
                    .await
                    .map_err(|e| pairing::PairingError::Transport(e.to_string()))?;
                Ok(true)
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool, pairing::PairingError>> + Send>>
        };

        let key_xfer_discovery = discovery.clone();
        let key_xfer_wait = move || {
            Box::pin(async move {
                let mut events = key_xfer_discovery.subscribe();
                loop {
                    match events.recv().await {
                        Ok(TransportEvent::FrameReceived(_peer, frame)) => {
                            if frame.kind == FrameKind::PairingKeyXfer && frame.scope == topic {
                                return Ok(frame.payload);
                            }
                        }
                        Ok(_) => continue,
                        Err(_) => {
                            return Err(pairing::PairingError::Transport("pairing channel closed".into()))
                        }
                    }
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<u8>, pairing::PairingError>> + Send>>
        };

        let outcome = pairing::join_room(
            invite,
            &self.ctx.identity.private_key().clone(),
            announce,
            key_xfer_wait,
            std::time::Duration::from_secs(30),
        )
        .await
        .map_err(|e| CoreError::Unauthorized(e.to_string()))?;
        self.ctx.transport.leave(topic).await;

        let keys = outcome
            .room_keys
            .ok_or_else(|| CoreError::Unauthorized("pairing did not complete".into()))?;

        let room_id = generate_id();
        let room = self.open_room(&room_id, true).await?;

        let mut entries = self.ctx.read_room_keys().map_err(|e| CoreError::Fatal(e.to_string()))?;
        entries.push(RoomKeyEntry {
            id: room_id.clone(),
            name: room_id.clone(),
            key: hex::encode(keys.room_key),
            encryption_key: hex::encode(keys.encryption_key),
            blob_store_key: None,
        });
        self.ctx.write_room_keys(&entries).map_err(|e| CoreError::Fatal(e.to_string()))?;

        self.rooms.write().await.insert(room_id.clone(), room);
        Ok(room_id)
    }

    /// `leaveRoom(roomId)`: closes the local task group and drops the
    /// registry entry. The LogCore's sqlite-backed data survives on disk —
    /// only the in-process handle and its transport subscriptions close.
    pub async fn leave_room(&self, room_id: &str) -> Result<(), CoordinatorError> {
        let room = self.rooms.write().await.remove(room_id);
        match room {
            Some(room) => {
                room.close().await;
                if let Some(cancel) = self.pairing_listeners.write().await.remove(room_id) {
                    cancel.cancel();
                }
                Ok(())
            }
            None => Err(CoordinatorError::RoomNotFound(room_id.to_string())),
        }
    }

    pub async fn room(&self, room_id: &str) -> Result<Arc<Room<S>>, CoordinatorError> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))
    }

    pub async fn send_message(
        &self,
        room_id: &str,
        content: String,
        system: bool,
        attachments: Vec<BlobRef>,
    ) -> Result<String, CoordinatorError> {
        self.room(room_id).await?.send_message(content, system, attachments).await
    }

    pub async fn delete_message(&self, room_id: &str, message_id: &str) -> Result<(), CoordinatorError> {
        self.room(room_id).await?.delete_message(message_id).await
    }

    pub async fn upload_file(
        &self,
        room_id: &str,
        bytes: Vec<u8>,
        name: String,
    ) -> Result<BlobRef, CoordinatorError> {
        self.room(room_id).await?.upload_file(bytes, name).await
    }

    pub async fn download_file(
        &self,
        room_id: &str,
        blob_id: &str,
        opts: GetOptions,
    ) -> Result<Option<GetResult>, CoordinatorError> {
        self.room(room_id).await?.download_file(blob_id, opts).await
    }

    pub async fn list_files(&self, room_id: &str, limit: Option<i64>) -> Result<Vec<BlobRef>, CoordinatorError> {
        self.room(room_id).await?.list_files(limit).await
    }

    pub async fn delete_file(&self, room_id: &str, blob_id: &str) -> Result<(), CoordinatorError> {
        self.room(room_id).await?.delete_file(blob_id).await
    }

    pub async fn get_messages(
        &self,
        room_id: &str,
        opts: FindMessagesOptions,
    ) -> Result<Vec<Message>, CoordinatorError> {
        self.room(room_id).await?.get_messages(opts).await
    }

    pub async fn get_message_count(&self, room_id: &str) -> Result<i64, CoordinatorError> {
        self.room(room_id).await?.get_message_count().await
    }

    pub async fn get_writers(&self, room_id: &str) -> Result<Vec<WriterInfo>, CoordinatorError> {
        self.room(room_id).await?.get_writers().await
    }

    /// `createInvite(roomId, expiresAt) → invite`. Also ensures an
    /// issuer-side pairing listener is running for this room so an incoming
    /// `PairingAnnounce` against this invite gets redeemed and answered —
    /// see `spawn_pairing_listener`.
    pub async fn create_invite(&self, room_id: &str, expires_at: i64) -> Result<String, CoordinatorError> {
        let entries = self.ctx.read_room_keys().map_err(|e| CoreError::Fatal(e.to_string()))?;
        let entry = entries
            .iter()
            .find(|e| e.id == room_id)
            .ok_or_else(|| CoordinatorError::RoomNotFound(room_id.to_string()))?
            .clone();
        let room_key_bytes = hex::decode(&entry.key).map_err(|e| CoreError::Fatal(e.to_string()))?;
        let room_key: [u8; 32] = room_key_bytes
            .try_into()
            .map_err(|_| CoreError::Fatal("malformed room key".into()))?;
        let encryption_key_bytes =
            hex::decode(&entry.encryption_key).map_err(|e| CoreError::Fatal(e.to_string()))?;
        let encryption_key: [u8; 32] = encryption_key_bytes
            .try_into()
            .map_err(|_| CoreError::Fatal("malformed encryption key".into()))?;

        let room = self.room(room_id).await?;
        let invite = room.create_invite(&room_key, expires_at).await?;
        self.spawn_pairing_listener(&room, &invite, room_key, encryption_key).await;
        Ok(invite)
    }

    /// Issuer side of pairing (§4.6): joins the invite's pairing topic once
    /// per room and, on every `PairingAnnounce` matching its credential,
    /// redeems it (`pairing::redeem_invite`) and seals the room keys back to
    /// the candidate over a `PairingKeyXfer` frame. A no-op if a listener for
    /// this room is already running.
    async fn spawn_pairing_listener(
        &self,
        room: &Arc<Room<S>>,
        invite: &str,
        room_key: [u8; 32],
        encryption_key: [u8; 32],
    ) {
        let room_id = room.room_id().to_string();
        if self.pairing_listeners.read().await.contains_key(&room_id) {
            return;
        }

        let credential = match pairing::invite_credential(invite) {
            Some(c) => c,
            None => return,
        };
        let topic = pairing::pairing_topic(&credential);
        let discovery = match self.ctx.transport.join(topic, Vec::new()).await {
            Ok(d) => d,
            Err(_) => return,
        };

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let mwl = room.mwl.clone();
        let local_key = self.ctx.identity.private_key().clone();
        let issuer_public_key = *local_key.public_key().as_bytes();
        let mut events = discovery.subscribe();
        let discovery_task = discovery.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    event = events.recv() => {
                        let frame = match event {
                            Ok(TransportEvent::FrameReceived(_peer, frame)) => frame,
                            Ok(_) => continue,
                            Err(_) => break,
                        };
                        if frame.kind != FrameKind::PairingAnnounce || frame.scope != credential {
                            continue;
                        }
                        let candidate_bytes: [u8; 32] = match frame.payload.as_slice().try_into() {
                            Ok(b) => b,
                            Err(_) => continue,
                        };
                        let candidate = match p2panda_core::PublicKey::from_bytes(&candidate_bytes) {
                            Ok(k) => k,
                            Err(_) => continue,
                        };
                        if pairing::redeem_invite(&mwl, &local_key, &credential, candidate, now_micros())
                            .await
                            .is_err()
                        {
                            continue;
                        }
                        let keys = pairing::RoomKeys { room_key, encryption_key };
                        let envelope = match pairing::seal_room_keys(&keys, &issuer_public_key, &candidate_bytes) {
                            Ok(envelope) => envelope,
                            Err(_) => continue,
                        };
                        let reply = Frame {
                            kind: FrameKind::PairingKeyXfer,
                            scope: credential,
                            payload: envelope,
                        };
                        let _ = discovery_task.send_frame(&reply).await;
                    }
                }
            }
        });

        self.pairing_listeners.write().await.insert(room_id, cancel);
    }

    /// Opens (creating if absent) the LogCore/view pair backing `room_id`,
    /// and wires the local identity in as the room's first writer when
    /// `admit_local` is set (true for `createRoom`/`joinRoom`, false when
    /// merely reopening a room at process start).
    async fn open_room(&self, room_id: &str, admit_local: bool) -> Result<Arc<Room<S>>, CoordinatorError> {
        let room_dir = self.ctx.room_dir(room_id);
        std::fs::create_dir_all(&room_dir).map_err(|e| CoreError::from(e))?;

        let log = Arc::new(LogCore::new(self.ctx.op_store.clone(), format!("room:{room_id}")));
        let pool = open_view_pool(&room_dir.to_string_lossy())
            .await
            .map_err(|e| CoreError::Fatal(e.to_string()))?;
        run_migrations(&pool).await.map_err(CoreError::from)?;
        let view = View::new(pool);

        let local_key = self.ctx.identity.private_key().clone();
        let mwl = Arc::new(MultiWriterLog::new(log, format!("room:{room_id}"), local_key.clone(), view));
        if admit_local {
            mwl.admit_writer(*local_key.public_key().as_bytes())
                .await
                .map_err(|e| CoreError::Fatal(e.to_string()))?;
        }

        let (events_tx, _rx) = broadcast::channel(256);
        let cancel = CancellationToken::new();

        let topic = *log.discovery_key().as_bytes();
        let discovery = self
            .ctx
            .transport
            .join(topic, self.ctx.bootstrap_node_ids.clone())
            .await
            .map_err(|e| CoreError::Fatal(e.to_string()))?;

        let room = Arc::new(Room {
            room_id: room_id.to_string(),
            mwl: mwl.clone(),
            local_key,
            blob_store: self.ctx.blob_store.clone(),
            remote_blobs_dir: self.ctx.remote_blobs_dir(),
            events: events_tx.clone(),
            seen: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(DEDUP_CAPACITY).unwrap())),
            cancel: cancel.clone(),
            write_lock: Mutex::new(()),
            transport: self.ctx.transport.clone(),
            topic,
            discovery,
        });

        // Forward MultiWriterLog notifications (new commands folded,
        // writer-set changes) into the room's public event stream.
        let mut updates = mwl.subscribe();
        let forward_events = events_tx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    update = updates.recv() => match update {
                        Ok(MultiWriterUpdate::Applied { .. }) => {
                            let _ = forward_events.send(RoomEvent::Update);
                        }
                        Ok(MultiWriterUpdate::WritersChanged) => {
                            let _ = forward_events.send(RoomEvent::WritersChanged);
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        Ok(room)
    }
}

fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn now_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_coordinator() -> RoomCoordinator<iroh_blobs::store::mem::Store> {
        let ctx = CoreContext::open_in_memory("alice").await.unwrap();
        RoomCoordinator::new(ctx)
    }

    #[tokio::test]
    async fn create_room_then_send_and_read_messages() {
        let coordinator = test_coordinator().await;
        let room_id = coordinator.create_room("general".into()).await.unwrap();

        let message_id = coordinator
            .send_message(&room_id, "hello".into(), false, vec![])
            .await
            .unwrap();
        assert!(!message_id.is_empty());

        let messages = coordinator
            .get_messages(&room_id, FindMessagesOptions::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(coordinator.get_message_count(&room_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn local_writer_is_listed_first_and_active() {
        let coordinator = test_coordinator().await;
        let room_id = coordinator.create_room("general".into()).await.unwrap();
        let writers = coordinator.get_writers(&room_id).await.unwrap();
        assert_eq!(writers.len(), 1);
        assert!(writers[0].is_local);
        assert!(writers[0].active);
    }

    #[tokio::test]
    async fn delete_message_hides_it_from_subsequent_reads() {
        let coordinator = test_coordinator().await;
        let room_id = coordinator.create_room("general".into()).await.unwrap();
        let message_id = coordinator
            .send_message(&room_id, "temp".into(), false, vec![])
            .await
            .unwrap();
        coordinator.delete_message(&room_id, &message_id).await.unwrap();

        let messages = coordinator
            .get_messages(&room_id, FindMessagesOptions::default())
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn leave_room_then_operations_fail_with_not_found() {
        let coordinator = test_coordinator().await;
        let room_id = coordinator.create_room("general".into()).await.unwrap();
        coordinator.leave_room(&room_id).await.unwrap();

        let result = coordinator.send_message(&room_id, "x".into(), false, vec![]).await;
        assert!(matches!(result, Err(CoordinatorError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn create_invite_is_stable_across_calls() {
        let coordinator = test_coordinator().await;
        let room_id = coordinator.create_room("general".into()).await.unwrap();
        let invite_a = coordinator.create_invite(&room_id, i64::MAX).await.unwrap();
        let invite_b = coordinator.create_invite(&room_id, i64::MAX).await.unwrap();
        assert_eq!(invite_a, invite_b);
    }

    #[tokio::test]
    async fn uploaded_file_is_attached_to_a_message_and_downloadable() {
        let coordinator = test_coordinator().await;
        let room_id = coordinator.create_room("general".into()).await.unwrap();

        let blob_ref = coordinator
            .upload_file(&room_id, b"attachment bytes".to_vec(), "note.txt".into())
            .await
            .unwrap();
        assert_eq!(blob_ref.name, "note.txt");

        coordinator
            .send_message(&room_id, "see attached".into(), false, vec![blob_ref.clone()])
            .await
            .unwrap();

        let messages = coordinator
            .get_messages(&room_id, FindMessagesOptions::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "see attached");
        assert_eq!(messages[0].attachments().len(), 1);
        assert_eq!(messages[0].attachments()[0].blob_id, blob_ref.blob_id);

        let downloaded = coordinator
            .download_file(&room_id, &blob_ref.blob_id, crate::blobstore::GetOptions::default())
            .await
            .unwrap()
            .expect("blob present");
        assert_eq!(downloaded.bytes, b"attachment bytes");

        let files = coordinator.list_files(&room_id, None).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].blob_id, blob_ref.blob_id);
    }

    #[tokio::test]
    async fn download_file_missing_blob_returns_none() {
        let coordinator = test_coordinator().await;
        let room_id = coordinator.create_room("general".into()).await.unwrap();
        let result = coordinator
            .download_file(&room_id, &hex::encode([0u8; 32]), crate::blobstore::GetOptions::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn delete_file_evicts_cache_copy_but_not_shared_blob() {
        let coordinator = test_coordinator().await;
        let room_id = coordinator.create_room("general".into()).await.unwrap();
        let blob_ref = coordinator
            .upload_file(&room_id, b"cached".to_vec(), "f.bin".into())
            .await
            .unwrap();
        coordinator
            .download_file(&room_id, &blob_ref.blob_id, crate::blobstore::GetOptions::default())
            .await
            .unwrap();

        coordinator.delete_file(&room_id, &blob_ref.blob_id).await.unwrap();
        let result = coordinator.delete_file(&room_id, &blob_ref.blob_id).await;
        assert!(matches!(result, Err(CoordinatorError::Core(CoreError::NotFound(_)))));
    }
}
