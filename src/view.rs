//! View (§3, §4.4): the deterministic key/value materialization of the
//! linearized command stream, with four collections — `metadata`, `invite`,
//! `messages`, `drive-metadata`.
//!
//! Grounded on the reference core's `db.rs` sqlite read-model (schema +
//! upsert helpers), narrowed from its broad multi-entity schema (orgs,
//! profiles, reactions, DM threads) down to the collections a room actually
//! needs. Each room gets its own pool (rather than one shared
//! pool keyed by room id) so that `leaveRoom` can simply drop the pool.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Run once against a freshly opened pool; safe to call repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), ViewError> {
    sqlx::query(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS metadata (
            room_id         TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            message_count   INTEGER NOT NULL DEFAULT 0,
            blob_store_key  TEXT
        );

        CREATE TABLE IF NOT EXISTS invite (
            room_id             TEXT PRIMARY KEY,
            id                  TEXT NOT NULL,
            invite              TEXT NOT NULL,
            issuer_public_key   TEXT NOT NULL,
            expires_at          INTEGER NOT NULL,
            redeemed            INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS messages (
            id                TEXT PRIMARY KEY,
            room_id           TEXT NOT NULL,
            content           TEXT NOT NULL,
            sender            TEXT NOT NULL,
            public_key        TEXT,
            timestamp         INTEGER NOT NULL,
            flag_system       INTEGER NOT NULL DEFAULT 0,
            flag_received     INTEGER NOT NULL DEFAULT 0,
            flag_attachments  INTEGER NOT NULL DEFAULT 0,
            deleted           INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_messages_room_ts ON messages (room_id, timestamp);

        CREATE TABLE IF NOT EXISTS drive_metadata (
            room_id         TEXT PRIMARY KEY,
            blob_store_key  TEXT NOT NULL,
            created_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS writers (
            room_id     TEXT NOT NULL,
            public_key  TEXT NOT NULL,
            active      INTEGER NOT NULL DEFAULT 1,
            faulty      INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (room_id, public_key)
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub room_id: String,
    pub name: String,
    pub created_at: i64,
    pub message_count: i64,
    pub blob_store_key: Option<[u8; 32]>,
}

#[derive(Debug, Clone)]
pub struct InviteRecord {
    pub room_id: String,
    pub id: [u8; 32],
    pub invite: [u8; 32],
    pub issuer_public_key: [u8; 32],
    pub expires_at: i64,
    pub redeemed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageFlags {
    pub system: bool,
    pub received: bool,
    pub has_attachments: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRef {
    pub name: String,
    pub size: i64,
    pub blob_id: String,
    pub mime_hint: Option<String>,
}

/// Content shape used on the wire when `flags.has_attachments` is set: the
/// command's `content` field carries this structure JSON-encoded so that
/// attachments travel with the message without a separate command kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RichContent {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<BlobRef>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub content: String,
    pub sender: String,
    pub public_key: Option<[u8; 32]>,
    pub timestamp: i64,
    pub flags: MessageFlags,
    pub deleted: bool,
}

impl Message {
    /// Decode `content` as `RichContent` when `has_attachments` is set,
    /// falling back to plain text otherwise.
    pub fn attachments(&self) -> Vec<BlobRef> {
        if !self.flags.has_attachments {
            return Vec::new();
        }
        serde_json::from_str::<RichContent>(&self.content)
            .map(|rc| rc.attachments)
            .unwrap_or_default()
    }

    pub fn text(&self) -> String {
        if self.flags.has_attachments {
            serde_json::from_str::<RichContent>(&self.content)
                .map(|rc| rc.text)
                .unwrap_or_else(|_| self.content.clone())
        } else {
            self.content.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriveMetadata {
    pub room_id: String,
    pub blob_store_key: [u8; 32],
    pub created_at: i64,
}

/// Range predicate on `messages.timestamp`, as named in §4.4/§4.7.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampRange {
    pub lt: Option<i64>,
    pub lte: Option<i64>,
    pub gt: Option<i64>,
    pub gte: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct FindMessagesOptions {
    pub limit: Option<i64>,
    pub reverse: bool,
    pub range: TimestampRange,
    pub include_deleted: bool,
}

fn key_hex(k: &[u8; 32]) -> String {
    hex::encode(k)
}

fn key_from_hex(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// View — read-only query surface plus the upsert/insert helpers `apply`
/// (in `multiwriter.rs`) calls while processing a linearized batch.
#[derive(Clone)]
pub struct View {
    pool: SqlitePool,
}

impl View {
    pub fn new(pool: SqlitePool) -> Self {
        View { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ─── metadata ────────────────────────────────────────────────────────

    /// Delete-then-insert upsert, run inside a single transaction so readers
    /// never observe a mixed state (§4.4).
    pub async fn upsert_metadata(&self, m: &Metadata) -> Result<(), ViewError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM metadata WHERE room_id = ?")
            .bind(&m.room_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO metadata (room_id, name, created_at, message_count, blob_store_key) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&m.room_id)
        .bind(&m.name)
        .bind(m.created_at)
        .bind(m.message_count)
        .bind(m.blob_store_key.as_ref().map(key_hex))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_metadata(&self, room_id: &str) -> Result<Option<Metadata>, ViewError> {
        let row = sqlx::query(
            "SELECT room_id, name, created_at, message_count, blob_store_key FROM metadata WHERE room_id = ?",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Metadata {
            room_id: r.get("room_id"),
            name: r.get("name"),
            created_at: r.get("created_at"),
            message_count: r.get("message_count"),
            blob_store_key: r
                .get::<Option<String>, _>("blob_store_key")
                .and_then(|s| key_from_hex(&s)),
        }))
    }

    pub async fn message_count(&self, room_id: &str) -> Result<i64, ViewError> {
        Ok(self
            .get_metadata(room_id)
            .await?
            .map(|m| m.message_count)
            .unwrap_or(0))
    }

    // ─── invite ──────────────────────────────────────────────────────────

    pub async fn set_invite(&self, inv: &InviteRecord) -> Result<(), ViewError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM invite WHERE room_id = ?")
            .bind(&inv.room_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO invite (room_id, id, invite, issuer_public_key, expires_at, redeemed) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&inv.room_id)
        .bind(key_hex(&inv.id))
        .bind(key_hex(&inv.invite))
        .bind(key_hex(&inv.issuer_public_key))
        .bind(inv.expires_at)
        .bind(inv.redeemed as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_invite(&self, room_id: &str) -> Result<Option<InviteRecord>, ViewError> {
        let row = sqlx::query(
            "SELECT room_id, id, invite, issuer_public_key, expires_at, redeemed FROM invite WHERE room_id = ?",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_invite))
    }

    /// Atomically mark the invite redeemed; returns `true` iff this call
    /// was the one that performed the transition (Testable Property 5).
    pub async fn try_claim_invite(&self, room_id: &str) -> Result<bool, ViewError> {
        let result = sqlx::query(
            "UPDATE invite SET redeemed = 1 WHERE room_id = ? AND redeemed = 0",
        )
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ─── messages ────────────────────────────────────────────────────────

    pub async fn insert_message(&self, m: &Message) -> Result<(), ViewError> {
        sqlx::query(
            "INSERT OR IGNORE INTO messages \
             (id, room_id, content, sender, public_key, timestamp, flag_system, flag_received, flag_attachments, deleted) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&m.id)
        .bind(&m.room_id)
        .bind(&m.content)
        .bind(&m.sender)
        .bind(m.public_key.as_ref().map(key_hex))
        .bind(m.timestamp)
        .bind(m.flags.system as i64)
        .bind(m.flags.received as i64)
        .bind(m.flags.has_attachments as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn tombstone_message(&self, id: &str) -> Result<(), ViewError> {
        sqlx::query("UPDATE messages SET deleted = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, ViewError> {
        let row = sqlx::query(
            "SELECT id, room_id, content, sender, public_key, timestamp, \
             flag_system, flag_received, flag_attachments, deleted FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_message))
    }

    /// `find('messages', predicate, {limit, reverse})` (§4.4): native order
    /// is `timestamp` ascending, `reverse=true` gives newest first.
    pub async fn find_messages(
        &self,
        room_id: &str,
        opts: &FindMessagesOptions,
    ) -> Result<Vec<Message>, ViewError> {
        let mut sql = String::from(
            "SELECT id, room_id, content, sender, public_key, timestamp, \
             flag_system, flag_received, flag_attachments, deleted FROM messages WHERE room_id = ?",
        );
        if !opts.include_deleted {
            sql.push_str(" AND deleted = 0");
        }
        if opts.range.lt.is_some() {
            sql.push_str(" AND timestamp < ?");
        }
        if opts.range.lte.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        if opts.range.gt.is_some() {
            sql.push_str(" AND timestamp > ?");
        }
        if opts.range.gte.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        sql.push_str(if opts.reverse {
            " ORDER BY timestamp DESC"
        } else {
            " ORDER BY timestamp ASC"
        });
        if opts.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(room_id);
        if let Some(v) = opts.range.lt {
            query = query.bind(v);
        }
        if let Some(v) = opts.range.lte {
            query = query.bind(v);
        }
        if let Some(v) = opts.range.gt {
            query = query.bind(v);
        }
        if let Some(v) = opts.range.gte {
            query = query.bind(v);
        }
        if let Some(v) = opts.limit {
            query = query.bind(v);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    // ─── drive-metadata ──────────────────────────────────────────────────

    pub async fn upsert_drive_metadata(&self, d: &DriveMetadata) -> Result<(), ViewError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM drive_metadata WHERE room_id = ?")
            .bind(&d.room_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO drive_metadata (room_id, blob_store_key, created_at) VALUES (?, ?, ?)",
        )
        .bind(&d.room_id)
        .bind(key_hex(&d.blob_store_key))
        .bind(d.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_drive_metadata(&self, room_id: &str) -> Result<Option<DriveMetadata>, ViewError> {
        let row = sqlx::query(
            "SELECT room_id, blob_store_key, created_at FROM drive_metadata WHERE room_id = ?",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| DriveMetadata {
            room_id: r.get("room_id"),
            blob_store_key: key_from_hex(&r.get::<String, _>("blob_store_key")).unwrap_or([0u8; 32]),
            created_at: r.get("created_at"),
        }))
    }

    // ─── writers ─────────────────────────────────────────────────────────

    pub async fn set_writer_active(&self, room_id: &str, key: &[u8; 32], active: bool) -> Result<(), ViewError> {
        sqlx::query(
            "INSERT INTO writers (room_id, public_key, active, faulty) VALUES (?, ?, ?, 0) \
             ON CONFLICT (room_id, public_key) DO UPDATE SET active = excluded.active",
        )
        .bind(room_id)
        .bind(key_hex(key))
        .bind(active as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_writer_faulty(&self, room_id: &str, key: &[u8; 32]) -> Result<(), ViewError> {
        sqlx::query(
            "INSERT INTO writers (room_id, public_key, active, faulty) VALUES (?, ?, 0, 1) \
             ON CONFLICT (room_id, public_key) DO UPDATE SET faulty = 1, active = 0",
        )
        .bind(room_id)
        .bind(key_hex(key))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_writers(&self, room_id: &str) -> Result<Vec<([u8; 32], bool, bool)>, ViewError> {
        let rows = sqlx::query("SELECT public_key, active, faulty FROM writers WHERE room_id = ?")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let key = key_from_hex(&r.get::<String, _>("public_key"))?;
                Some((key, r.get::<i64, _>("active") != 0, r.get::<i64, _>("faulty") != 0))
            })
            .collect())
    }
}

fn row_to_message(r: sqlx::sqlite::SqliteRow) -> Message {
    Message {
        id: r.get("id"),
        room_id: r.get("room_id"),
        content: r.get("content"),
        sender: r.get("sender"),
        public_key: r
            .get::<Option<String>, _>("public_key")
            .and_then(|s| key_from_hex(&s)),
        timestamp: r.get("timestamp"),
        flags: MessageFlags {
            system: r.get::<i64, _>("flag_system") != 0,
            received: r.get::<i64, _>("flag_received") != 0,
            has_attachments: r.get::<i64, _>("flag_attachments") != 0,
        },
        deleted: r.get::<i64, _>("deleted") != 0,
    }
}

fn row_to_invite(r: sqlx::sqlite::SqliteRow) -> InviteRecord {
    InviteRecord {
        room_id: r.get("room_id"),
        id: key_from_hex(&r.get::<String, _>("id")).unwrap_or([0u8; 32]),
        invite: key_from_hex(&r.get::<String, _>("invite")).unwrap_or([0u8; 32]),
        issuer_public_key: key_from_hex(&r.get::<String, _>("issuer_public_key")).unwrap_or([0u8; 32]),
        expires_at: r.get("expires_at"),
        redeemed: r.get::<i64, _>("redeemed") != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_view() -> View {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        View::new(pool)
    }

    fn msg(id: &str, room: &str, content: &str, ts: i64) -> Message {
        Message {
            id: id.into(),
            room_id: room.into(),
            content: content.into(),
            sender: "A".into(),
            public_key: None,
            timestamp: ts,
            flags: MessageFlags { system: false, received: false, has_attachments: false },
            deleted: false,
        }
    }

    #[tokio::test]
    async fn s1_two_messages_read_back_in_order() {
        let view = test_view().await;
        view.upsert_metadata(&Metadata {
            room_id: "R".into(),
            name: "alpha".into(),
            created_at: 0,
            message_count: 0,
            blob_store_key: None,
        })
        .await
        .unwrap();
        view.insert_message(&msg("m1", "R", "hi", 1000)).await.unwrap();
        view.insert_message(&msg("m2", "R", "yo", 1005)).await.unwrap();
        view.upsert_metadata(&Metadata {
            room_id: "R".into(),
            name: "alpha".into(),
            created_at: 0,
            message_count: 2,
            blob_store_key: None,
        })
        .await
        .unwrap();

        let found = view
            .find_messages("R", &FindMessagesOptions { limit: Some(10), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].content, "hi");
        assert_eq!(found[1].content, "yo");
        assert_eq!(view.message_count("R").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn s3_pagination_with_lt_reverse() {
        let view = test_view().await;
        for (i, ts) in (100..=500).step_by(100).enumerate() {
            view.insert_message(&msg(&format!("m{i}"), "R", "x", ts)).await.unwrap();
        }
        let found = view
            .find_messages(
                "R",
                &FindMessagesOptions {
                    limit: Some(2),
                    reverse: true,
                    range: TimestampRange { lt: Some(400), ..Default::default() },
                    include_deleted: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(found.iter().map(|m| m.timestamp).collect::<Vec<_>>(), vec![300, 200]);
    }

    #[tokio::test]
    async fn tombstone_hides_message_within_one_apply_cycle() {
        let view = test_view().await;
        view.insert_message(&msg("m1", "R", "hi", 1)).await.unwrap();
        view.tombstone_message("m1").await.unwrap();
        let found = view
            .find_messages("R", &FindMessagesOptions::default())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn invite_single_use_claim() {
        let view = test_view().await;
        view.set_invite(&InviteRecord {
            room_id: "R".into(),
            id: [1u8; 32],
            invite: [2u8; 32],
            issuer_public_key: [3u8; 32],
            expires_at: i64::MAX,
            redeemed: false,
        })
        .await
        .unwrap();

        let first = view.try_claim_invite("R").await.unwrap();
        let second = view.try_claim_invite("R").await.unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn rich_content_attachments_roundtrip() {
        let m = Message {
            id: "m1".into(),
            room_id: "R".into(),
            content: serde_json::to_string(&RichContent {
                text: "look".into(),
                attachments: vec![BlobRef {
                    name: "a.bin".into(),
                    size: 4,
                    blob_id: "deadbeef".into(),
                    mime_hint: None,
                }],
            })
            .unwrap(),
            sender: "A".into(),
            public_key: None,
            timestamp: 0,
            flags: MessageFlags { system: false, received: false, has_attachments: true },
            deleted: false,
        };
        assert_eq!(m.text(), "look");
        assert_eq!(m.attachments().len(), 1);
        assert_eq!(m.attachments()[0].blob_id, "deadbeef");
    }
}
