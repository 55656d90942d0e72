//! MultiWriterLog (§3, §4.2): linearizes N per-writer `LogCore`s into one
//! deterministic command stream and folds it into a `View`.
//!
//! Grounded on the reference core's `sync.rs`/`projector.rs` pairing — a
//! polling cursor per `(log_id, writer)` that dispatches newly-available
//! entries into the read model — narrowed to a single deterministic
//! linearization rule instead of arrival-order dispatch, since Testable
//! Property 1 (deterministic `apply`) requires every replica to fold entries
//! in the same order regardless of arrival timing.
//!
//! # Linearization
//!
//! Commands carry no cross-writer vector clock on the wire (§6): each
//! writer's own log is already totally ordered by `seq_num`, so the only
//! remaining freedom is the *interleaving* of independent writers' logs.
//! This implementation resolves that by round-robin draining writers in
//! ascending raw public-key byte order, repeating passes until a full pass
//! makes no progress (a writer is "ready" once its next sequential entry,
//! `seq_num = cursor`, is locally available). This is deterministic, depends
//! only on each writer's locally-replicated prefix (not on network arrival
//! order), and gives every replica that has received the same set of entries
//! the same fold order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use p2panda_core::{PrivateKey, PublicKey};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::commands::{Command, CommandError};
use crate::logcore::{LogCore, LogCoreError};
use crate::view::{
    DriveMetadata, InviteRecord, Message, MessageFlags, Metadata, View, ViewError,
};

#[derive(Debug, Error)]
pub enum MultiWriterError {
    #[error("log error: {0}")]
    Log(#[from] LogCoreError),
    #[error("command decode error: {0}")]
    Command(#[from] CommandError),
    #[error("view error: {0}")]
    View(#[from] ViewError),
    #[error("local writer is not (yet) a member of this log")]
    NotWritable,
}

/// Notification sent on every successful `apply` pass that made progress,
/// and whenever the writer set changes.
#[derive(Debug, Clone)]
pub enum Update {
    Applied { advanced: usize },
    WritersChanged,
}

/// One writer's replication cursor: next `seq_num` not yet folded into the view.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    next: u64,
}

pub struct MultiWriterLog {
    log: Arc<LogCore>,
    room_id: String,
    local_key: PrivateKey,
    view: View,
    writers: Mutex<BTreeMap<[u8; 32], Cursor>>,
    faulty: Mutex<Vec<[u8; 32]>>,
    updates: broadcast::Sender<Update>,
}

impl MultiWriterLog {
    pub fn new(log: Arc<LogCore>, room_id: impl Into<String>, local_key: PrivateKey, view: View) -> Self {
        let (tx, _rx) = broadcast::channel(64);
        MultiWriterLog {
            log,
            room_id: room_id.into(),
            local_key,
            view,
            writers: Mutex::new(BTreeMap::new()),
            faulty: Mutex::new(Vec::new()),
            updates: tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.updates.subscribe()
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Register a writer (including the local one) so the linearizer will
    /// track its log. Idempotent.
    pub async fn admit_writer(&self, key: [u8; 32]) -> Result<(), MultiWriterError> {
        let mut writers = self.writers.lock().await;
        writers.entry(key).or_insert(Cursor::default());
        drop(writers);
        self.view.set_writer_active(&self.room_id, &key, true).await?;
        let _ = self.updates.send(Update::WritersChanged);
        Ok(())
    }

    pub async fn remove_writer(&self, key: [u8; 32]) -> Result<(), MultiWriterError> {
        // Non-retroactive: history already folded from this writer is kept;
        // only future entries stop being accepted (§9 open-question decision).
        self.writers.lock().await.remove(&key);
        self.view.set_writer_active(&self.room_id, &key, false).await?;
        let _ = self.updates.send(Update::WritersChanged);
        Ok(())
    }

    pub async fn is_writable(&self) -> bool {
        let key_bytes = *self.local_key.public_key().as_bytes();
        self.writers.lock().await.contains_key(&key_bytes)
    }

    pub async fn active_writers(&self) -> Vec<[u8; 32]> {
        self.writers.lock().await.keys().copied().collect()
    }

    /// Append `command` to the local writer's log, then fold whatever
    /// becomes linearizable as a result. Fails with `NotWritable` if the
    /// local writer hasn't been admitted yet.
    pub async fn append(&self, command: &Command) -> Result<(u64, p2panda_core::Hash), MultiWriterError> {
        if !self.is_writable().await {
            return Err(MultiWriterError::NotWritable);
        }
        let result = self.log.append(&self.local_key, command.encode()).await?;
        self.apply_ready().await?;
        Ok(result)
    }

    /// Insert a remotely-received entry for `writer` and fold whatever
    /// becomes linearizable. A fork on `writer` marks it faulty and rejects
    /// further entries from it, without unwinding history already folded.
    pub async fn insert_remote(
        &self,
        writer: &PublicKey,
        header_bytes: &[u8],
        body_bytes: &[u8],
    ) -> Result<(), MultiWriterError> {
        let key_bytes = *writer.as_bytes();
        if self.faulty.lock().await.contains(&key_bytes) {
            return Ok(());
        }
        match self.log.insert_remote(header_bytes, body_bytes).await {
            Ok(()) => {}
            Err(LogCoreError::Fork { .. }) => {
                self.faulty.lock().await.push(key_bytes);
                self.view.mark_writer_faulty(&self.room_id, &key_bytes).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        self.apply_ready().await?;
        Ok(())
    }

    /// Drain every writer's locally-available prefix in round-robin,
    /// ascending-pubkey order, folding each decoded command into the view.
    /// Returns once a full pass makes no progress.
    pub async fn apply_ready(&self) -> Result<usize, MultiWriterError> {
        let mut advanced = 0usize;
        loop {
            let mut progressed = false;
            let keys: Vec<[u8; 32]> = {
                let writers = self.writers.lock().await;
                writers.keys().copied().collect()
            };
            for key in keys {
                if self.faulty.lock().await.contains(&key) {
                    continue;
                }
                let next = {
                    let writers = self.writers.lock().await;
                    writers.get(&key).copied().unwrap_or_default().next
                };
                let public_key =
                    PublicKey::from_bytes(&key).expect("32-byte array is a valid PublicKey");
                match self.log.get(&public_key, next, Duration::from_millis(1)).await {
                    Ok(payload) => {
                        let command = Command::decode(&payload)?;
                        self.fold(&command).await?;
                        let mut writers = self.writers.lock().await;
                        writers.entry(key).or_insert(Cursor::default()).next = next + 1;
                        progressed = true;
                        advanced += 1;
                    }
                    Err(LogCoreError::NotAvailable) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            if !progressed {
                break;
            }
        }
        if advanced > 0 {
            let _ = self.updates.send(Update::Applied { advanced });
        }
        Ok(advanced)
    }

    async fn fold(&self, command: &Command) -> Result<(), MultiWriterError> {
        match command {
            Command::AddWriter(c) => {
                self.admit_writer(c.key).await?;
            }
            Command::RemoveWriter(c) => {
                self.remove_writer(c.key).await?;
            }
            Command::AddInvite(c) => {
                self.view
                    .set_invite(&InviteRecord {
                        room_id: self.room_id.clone(),
                        id: c.id,
                        invite: c.invite,
                        issuer_public_key: c.public_key,
                        expires_at: c.expires,
                        redeemed: false,
                    })
                    .await?;
            }
            Command::SendMessage(c) => {
                self.view
                    .insert_message(&Message {
                        id: c.id.clone(),
                        room_id: self.room_id.clone(),
                        content: c.content.clone(),
                        sender: c.sender.clone(),
                        public_key: c.public_key,
                        timestamp: c.timestamp,
                        flags: MessageFlags {
                            system: c.flags.system,
                            received: c.flags.received,
                            has_attachments: c.flags.has_attachments,
                        },
                        deleted: false,
                    })
                    .await?;
            }
            Command::DeleteMessage(c) => {
                self.view.tombstone_message(&c.id).await?;
            }
            Command::SetMetadata(c) => {
                self.view
                    .upsert_metadata(&Metadata {
                        room_id: c.room_id.clone(),
                        name: c.name.clone(),
                        created_at: c.created_at,
                        message_count: c.message_count,
                        blob_store_key: c.blob_store_key,
                    })
                    .await?;
            }
            Command::SetDriveKey(c) => {
                self.view
                    .upsert_drive_metadata(&DriveMetadata {
                        room_id: c.room_id.clone(),
                        blob_store_key: c.blob_store_key,
                        created_at: c.created_at,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Key exported for the `_` wildcard conflict/fork fields in `error.rs`
    /// conversions — used by tests and by `coordinator.rs`'s diagnostics.
    pub fn is_faulty(&self, key: &[u8; 32]) -> bool {
        self.faulty.try_lock().map(|f| f.contains(key)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{AddWriter, SendMessage};
    use crate::store::open_op_store;
    use crate::view::{run_migrations, FindMessagesOptions};
    use sqlx::SqlitePool;
    use std::sync::Arc as StdArc;
    use tokio::sync::Mutex as TokioMutex;

    async fn test_mwl() -> (MultiWriterLog, PrivateKey, StdArc<TokioMutex<crate::store::RoomOpStore>>) {
        let store = StdArc::new(TokioMutex::new(open_op_store(":memory:").await.unwrap()));
        let log = Arc::new(LogCore::new(store.clone(), "room:test"));
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let view = View::new(pool);
        let local_key = PrivateKey::new();
        let mwl = MultiWriterLog::new(log, "room:test", local_key.clone(), view);
        mwl.admit_writer(*local_key.public_key().as_bytes()).await.unwrap();
        (mwl, local_key, store)
    }

    #[tokio::test]
    async fn single_writer_messages_fold_in_order() {
        let (mwl, _key, _store) = test_mwl().await;
        for i in 0..3 {
            mwl.append(&Command::SendMessage(SendMessage {
                id: format!("m{i}"),
                content: format!("hello {i}"),
                sender: "me".into(),
                public_key: None,
                timestamp: 1000 + i,
                flags: Default::default(),
            }))
            .await
            .unwrap();
        }
        let found = mwl
            .view()
            .find_messages("room:test", &FindMessagesOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].content, "hello 0");
        assert_eq!(found[2].content, "hello 2");
    }

    #[tokio::test]
    async fn two_writers_linearize_deterministically() {
        let (mwl, _local_key, store) = test_mwl().await;
        let other_key = PrivateKey::new();

        // Admit the other writer through a command, as a real AddWriter would.
        mwl.append(&Command::AddWriter(AddWriter {
            key: *other_key.public_key().as_bytes(),
        }))
        .await
        .unwrap();

        // `other_log` wraps the same underlying store as `mwl`'s log, so
        // appending through it and feeding the bytes to `insert_remote`
        // mirrors a peer that replicated into the shared store out of band.
        let other_log = LogCore::new(store, "room:test");
        let (_seq, op_hash) = other_log
            .append(
                &other_key,
                Command::SendMessage(SendMessage {
                    id: "remote-m0".into(),
                    content: "from the other writer".into(),
                    sender: "them".into(),
                    public_key: None,
                    timestamp: 1,
                    flags: Default::default(),
                })
                .encode(),
            )
            .await
            .unwrap();
        let _ = op_hash;

        // `apply_ready` discovers the newly-available entry directly from
        // the shared store without needing a separate `insert_remote` call,
        // since both logs address the same underlying rows.
        mwl.apply_ready().await.unwrap();

        let found = mwl
            .view()
            .find_messages("room:test", &FindMessagesOptions::default())
            .await
            .unwrap();
        assert!(found.iter().any(|m| m.id == "remote-m0"));
    }

    #[tokio::test]
    async fn remove_writer_is_non_retroactive() {
        let (mwl, _key, _store) = test_mwl().await;
        mwl.append(&Command::SendMessage(SendMessage {
            id: "m0".into(),
            content: "before removal".into(),
            sender: "me".into(),
            public_key: None,
            timestamp: 1,
            flags: Default::default(),
        }))
        .await
        .unwrap();

        let local_key_bytes = mwl.active_writers().await[0];
        mwl.remove_writer(local_key_bytes).await.unwrap();

        let found = mwl
            .view()
            .find_messages("room:test", &FindMessagesOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1, "history survives writer removal");
        assert!(!mwl.is_writable().await);
    }
}
