//! LogCore (§4.1): a single-owner, append-only, hash-chained sequence of
//! opaque byte entries.
//!
//! Grounded on the reference core's `ops.rs::sign_and_store_op` (build, sign,
//! and store a `p2panda_core::Header`/`Body` pair with seq_num/backlink
//! chaining) and `p2panda_store`'s per-`(public_key, log_id)` append log.
//! Unlike the reference core, which opens one log per feature type, each
//! `LogCore` here is pinned to exactly one room's command log; the room's
//! blob-core (§4.5) is a second, independently addressed `LogCore` over the
//! same underlying store.

use std::sync::Arc;
use std::time::Duration;

use p2panda_core::{Body, Hash, Header, PrivateKey, PublicKey};
use p2panda_store::{LogStore, OperationStore};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::store::RoomOpStore;

#[derive(Debug, Error)]
pub enum LogCoreError {
    #[error("writer {writer} forked at index {index}")]
    Fork { writer: String, index: u64 },
    #[error("signature or hash-chain verification failed: {0}")]
    VerificationFailed(String),
    #[error("local writer not yet admitted")]
    Unauthorized(String),
    #[error("entry not available within timeout")]
    NotAvailable,
    #[error("store error: {0}")]
    Store(String),
}

/// A single append-only log identified by `(public_key, log_id)` within the
/// shared operation store.
pub struct LogCore {
    store: Arc<Mutex<RoomOpStore>>,
    log_id: String,
}

impl LogCore {
    pub fn new(store: Arc<Mutex<RoomOpStore>>, log_id: impl Into<String>) -> Self {
        LogCore {
            store,
            log_id: log_id.into(),
        }
    }

    /// The public rendezvous identifier for this log — a hash of the log id
    /// rather than any writer's raw public key.
    pub fn discovery_key(&self) -> Hash {
        Hash::new(self.log_id.as_bytes())
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    /// Append a new entry signed by `private_key`. Only the owning identity
    /// may call this; appends are durable (written to the sqlite-backed
    /// store) before the future resolves.
    pub async fn append(
        &self,
        private_key: &PrivateKey,
        payload: Vec<u8>,
    ) -> Result<(u64, Hash), LogCoreError> {
        let public_key = private_key.public_key();
        let mut store = self.store.lock().await;

        let latest = store
            .latest_operation(&public_key, &self.log_id)
            .await
            .map_err(|e| LogCoreError::Store(e.to_string()))?;

        let (seq_num, backlink) = match latest {
            Some((prev_header, _)) => (prev_header.seq_num + 1, Some(prev_header.hash())),
            None => (0, None),
        };

        let body = Body::new(&payload);
        let timestamp = now_micros();

        let mut header: Header<()> = Header {
            version: 1,
            public_key,
            signature: None,
            payload_size: body.size(),
            payload_hash: Some(body.hash()),
            timestamp,
            seq_num,
            backlink,
            previous: vec![],
            extensions: (),
        };
        header.sign(private_key);

        let op_hash = header.hash();
        let header_bytes = header.to_bytes();

        store
            .insert_operation(op_hash, &header, Some(&body), &header_bytes, &self.log_id)
            .await
            .map_err(|e| LogCoreError::Store(e.to_string()))?;

        Ok((seq_num, op_hash))
    }

    /// Verify and insert an entry received from a peer. Returns
    /// `LogCoreError::Fork` if the writer already has a *different* entry at
    /// this seq_num — the writer is then the caller's responsibility to mark
    /// faulty (done by `MultiWriterLog`, which owns the writer set).
    pub async fn insert_remote(
        &self,
        header_bytes: &[u8],
        body_bytes: &[u8],
    ) -> Result<(), LogCoreError> {
        let header: Header<()> = Header::from_bytes(header_bytes)
            .map_err(|e| LogCoreError::VerificationFailed(e.to_string()))?;
        header
            .verify()
            .map_err(|e| LogCoreError::VerificationFailed(e.to_string()))?;

        let body = Body::new(body_bytes);
        if header.payload_hash != Some(body.hash()) {
            return Err(LogCoreError::VerificationFailed(
                "payload hash mismatch".into(),
            ));
        }

        let mut store = self.store.lock().await;
        if let Some((existing, _)) = store
            .get_log(&header.public_key, &self.log_id, Some(header.seq_num))
            .await
            .map_err(|e| LogCoreError::Store(e.to_string()))?
            .and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) })
        {
            if existing.hash() != header.hash() {
                warn!(
                    writer = %header.public_key.to_hex(),
                    index = header.seq_num,
                    "fork detected: rejecting conflicting entry"
                );
                return Err(LogCoreError::Fork {
                    writer: header.public_key.to_hex(),
                    index: header.seq_num,
                });
            }
            // Identical entry already stored: idempotent no-op.
            return Ok(());
        }

        store
            .insert_operation(
                header.hash(),
                &header,
                Some(&body),
                header_bytes,
                &self.log_id,
            )
            .await
            .map_err(|e| LogCoreError::Store(e.to_string()))?;
        Ok(())
    }

    /// Fetch the entry at `index` for `writer`, waiting up to `timeout` for
    /// replication to deliver it if not yet local.
    pub async fn get(
        &self,
        writer: &PublicKey,
        index: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, LogCoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let store = self.store.lock().await;
                if let Some(mut entries) = store
                    .get_log(writer, &self.log_id, Some(index))
                    .await
                    .map_err(|e| LogCoreError::Store(e.to_string()))?
                {
                    if let Some((_, Some(body))) = entries.drain(..).next() {
                        return Ok(body.to_bytes());
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LogCoreError::NotAvailable);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Current length (next free index) of `writer`'s portion of this log.
    pub async fn length(&self, writer: &PublicKey) -> Result<u64, LogCoreError> {
        let store = self.store.lock().await;
        let latest = store
            .latest_operation(writer, &self.log_id)
            .await
            .map_err(|e| LogCoreError::Store(e.to_string()))?;
        Ok(latest.map(|(h, _)| h.seq_num + 1).unwrap_or(0))
    }

    /// All writers with at least one entry in this log, and their tip
    /// seq_num — used by `MultiWriterLog` to discover active writers.
    pub async fn heights(&self) -> Result<Vec<(PublicKey, u64)>, LogCoreError> {
        let store = self.store.lock().await;
        store
            .get_log_heights(&self.log_id)
            .await
            .map_err(|e| LogCoreError::Store(e.to_string()))
    }
}

fn now_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_op_store;

    async fn test_store() -> Arc<Mutex<RoomOpStore>> {
        Arc::new(Mutex::new(open_op_store(":memory:").await.unwrap()))
    }

    #[tokio::test]
    async fn append_then_get_round_trips() {
        let store = test_store().await;
        let log = LogCore::new(store, "room:test");
        let key = PrivateKey::new();

        let (idx, _hash) = log.append(&key, b"hello".to_vec()).await.unwrap();
        assert_eq!(idx, 0);

        let got = log
            .get(&key.public_key(), 0, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn length_increments_with_appends() {
        let store = test_store().await;
        let log = LogCore::new(store, "room:test");
        let key = PrivateKey::new();

        log.append(&key, b"a".to_vec()).await.unwrap();
        log.append(&key, b"b".to_vec()).await.unwrap();

        assert_eq!(log.length(&key.public_key()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn conflicting_remote_entry_at_same_index_is_rejected() {
        let store = test_store().await;
        let log = LogCore::new(store, "room:test");
        let key = PrivateKey::new();
        let public_key = key.public_key();

        // First entry at seq 0.
        let body_a = Body::new(b"a");
        let mut header_a: Header<()> = Header {
            version: 1,
            public_key,
            signature: None,
            payload_size: body_a.size(),
            payload_hash: Some(body_a.hash()),
            timestamp: now_micros(),
            seq_num: 0,
            backlink: None,
            previous: vec![],
            extensions: (),
        };
        header_a.sign(&key);
        log.insert_remote(&header_a.to_bytes(), b"a").await.unwrap();

        // A different entry, also at seq 0, same writer: a fork.
        let body_b = Body::new(b"b");
        let mut header_b: Header<()> = Header {
            version: 1,
            public_key,
            signature: None,
            payload_size: body_b.size(),
            payload_hash: Some(body_b.hash()),
            timestamp: now_micros() + 1,
            seq_num: 0,
            backlink: None,
            previous: vec![],
            extensions: (),
        };
        header_b.sign(&key);

        let result = log.insert_remote(&header_b.to_bytes(), b"b").await;
        assert!(matches!(result, Err(LogCoreError::Fork { .. })));
    }
}
