//! BlobStore (§4.5): content-addressed key/value layer backed by its own
//! LogCore (the blob-core) for metadata replication and `iroh-blobs` for
//! local storage and ranged/peer-discovering content transfer.
//!
//! Grounded on the reference core's `blobs.rs` (content-hash addressing via
//! `p2panda_core::Hash`, a metadata side-table, room-keyed storage) enriched
//! with `iroh-blobs`' content-addressed store for the capabilities the
//! reference's flat file-per-hash store doesn't provide on its own (`has`,
//! ranged reads, peer discovery). Unlike the reference, the key space here
//! is flat (§9 pinned decision) — any room-scoping lives in the metadata
//! record's `room_id` field, not in the storage key, so two rooms uploading
//! identical bytes share one copy on disk.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use iroh_blobs::store::{ExportMode, Store as BlobsStore};
use iroh_blobs::{BlobFormat, Hash as BlobHash};
use p2panda_core::{Hash, PrivateKey};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::logcore::{LogCore, LogCoreError};
use crate::transport::{Frame, FrameKind, ReplicationTransport, TransportEvent};
use crate::view::BlobRef;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("iroh-blobs store error: {0}")]
    Store(String),
    #[error("metadata log error: {0}")]
    Log(#[from] LogCoreError),
    #[error("metadata decode error: {0}")]
    Metadata(String),
}

/// A metadata record announced on the blob-core log whenever `put` is
/// called. Not the room command wire format (§6) — this is local,
/// non-normative bookkeeping, so it uses `ciborium` rather than the
/// hand-rolled command codec.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct BlobAnnounce {
    blob_id: String,
    name: String,
    size: u64,
    mime_hint: Option<String>,
    executable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub name: Option<String>,
    pub mime_hint: Option<String>,
    pub executable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub max_bytes: Option<usize>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct GetResult {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub timeout: Option<Duration>,
}

/// Handle returned by `find_peers`; resolves once peers carrying the blob
/// have been located and fetched, or the search gives up. Borrows the store
/// for its lifetime rather than a detached task, so `get` can bound it with
/// its own timeout budget.
pub type FindPeersHandle<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>>;

pub struct BlobStore<S: BlobsStore> {
    store: S,
    blob_core: LogCore,
    local_key: PrivateKey,
    entries: Mutex<()>,
    transport: Arc<ReplicationTransport>,
}

impl<S: BlobsStore> BlobStore<S> {
    pub fn new(store: S, blob_core: LogCore, local_key: PrivateKey, transport: Arc<ReplicationTransport>) -> Self {
        BlobStore {
            store,
            blob_core,
            local_key,
            entries: Mutex::new(()),
            transport,
        }
    }

    pub fn discovery_key(&self) -> Hash {
        self.blob_core.discovery_key()
    }

    /// The gossip topic `find_peers`/`spawn_responder` rendezvous on: every
    /// process sharing this blob-core's discovery key joins the same one.
    pub fn topic(&self) -> [u8; 32] {
        *self.discovery_key().as_bytes()
    }

    /// Write `bytes`, returning an opaque blob id plus its recorded
    /// metadata. Idempotent under identical content — re-uploading the same
    /// bytes yields the same `blob_id` and does not duplicate storage.
    pub async fn put(&self, bytes: Vec<u8>, opts: PutOptions) -> Result<BlobRef, BlobError> {
        let _guard = self.entries.lock().await;
        let tag = self
            .store
            .import_bytes(bytes.clone().into(), BlobFormat::Raw)
            .await
            .map_err(|e| BlobError::Store(e.to_string()))?;
        let blob_id = tag.hash().to_hex().to_string();

        let announce = BlobAnnounce {
            blob_id: blob_id.clone(),
            name: opts.name.clone().unwrap_or_else(|| blob_id.clone()),
            size: bytes.len() as u64,
            mime_hint: opts.mime_hint.clone(),
            executable: opts.executable,
        };
        let mut payload = Vec::new();
        ciborium::into_writer(&announce, &mut payload)
            .map_err(|e| BlobError::Metadata(e.to_string()))?;
        self.blob_core.append(&self.local_key, payload).await?;

        Ok(BlobRef {
            name: announce.name,
            size: announce.size as i64,
            blob_id,
            mime_hint: announce.mime_hint,
        })
    }

    /// `true` iff `blob_id` is locally present and passes content-hash
    /// verification (verification is implicit: `iroh-blobs` only ever
    /// returns an entry for a hash whose bytes actually match it).
    pub async fn has(&self, blob_id: &str) -> bool {
        match parse_blob_hash(blob_id) {
            Some(hash) => self.store.has(&hash).await.unwrap_or(false),
            None => false,
        }
    }

    /// Blocking fetch with a byte-length cap. A local cache miss does not
    /// fail immediately: `find_peers` is given the remainder of `timeout` to
    /// locate a peer holding the blob and pull it in before giving up.
    /// Returns the prefix (and sets `truncated`) when the object exceeds
    /// `max_bytes`.
    pub async fn get(&self, blob_id: &str, opts: GetOptions) -> Result<GetResult, BlobError> {
        let hash = parse_blob_hash(blob_id).ok_or(BlobError::NotFound)?;
        let timeout = opts.timeout.unwrap_or(Duration::from_secs(30));
        let deadline = tokio::time::Instant::now() + timeout;

        if !self.store.has(&hash).await.unwrap_or(false) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let found = tokio::time::timeout(remaining, self.find_peers(blob_id))
                .await
                .unwrap_or(false);
            if !found {
                return Err(BlobError::NotFound);
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let fetch = async {
            let mut reader = self
                .store
                .reader(&hash)
                .await
                .map_err(|e| BlobError::Store(e.to_string()))?
                .ok_or(BlobError::NotFound)?;

            match opts.max_bytes {
                Some(cap) => {
                    let mut buf = vec![0u8; cap + 1];
                    let mut filled = 0usize;
                    loop {
                        let n = reader.read(&mut buf[filled..]).await?;
                        if n == 0 {
                            break;
                        }
                        filled += n;
                        if filled > cap {
                            break;
                        }
                    }
                    let truncated = filled > cap;
                    buf.truncate(filled.min(cap));
                    Ok(GetResult { bytes: buf, truncated })
                }
                None => {
                    let mut buf = Vec::new();
                    reader.read_to_end(&mut buf).await?;
                    Ok(GetResult { bytes: buf, truncated: false })
                }
            }
        };

        tokio::time::timeout(remaining, fetch)
            .await
            .map_err(|_| BlobError::NotFound)?
    }

    /// Ranged read over `[start, end)`. The reference's flat file store has
    /// no native range support; this reads the full local entry and slices,
    /// which is correct but not bandwidth-optimal for remote-only content —
    /// true partial network fetch is left to `iroh-blobs`' own ranged
    /// collection download path once a full entry isn't locally present.
    pub async fn create_read_stream(
        &self,
        blob_id: &str,
        opts: RangeOptions,
    ) -> Result<Vec<u8>, BlobError> {
        let full = self
            .get(
                blob_id,
                GetOptions {
                    max_bytes: None,
                    timeout: opts.timeout,
                },
            )
            .await?;
        let start = opts.start.unwrap_or(0) as usize;
        let end = opts.end.map(|e| e as usize).unwrap_or(full.bytes.len());
        let end = end.min(full.bytes.len());
        let start = start.min(end);
        Ok(full.bytes[start..end].to_vec())
    }

    /// Export the underlying bytes to a local path, for callers that want
    /// the on-disk file directly rather than an in-memory buffer.
    pub async fn export_to(&self, blob_id: &str, dest: PathBuf) -> Result<(), BlobError> {
        let hash = parse_blob_hash(blob_id).ok_or(BlobError::NotFound)?;
        self.store
            .export(hash, dest, ExportMode::Copy, Box::new(|_| Ok(())))
            .await
            .map_err(|e| BlobError::Store(e.to_string()))
    }

    /// Locate peers that may hold `blob_id` and pull its bytes in, resolving
    /// `true` once a copy is stored locally or `false` on give-up. Joins the
    /// blob-core's topic, broadcasts `BlobWant`, and waits for a `BlobData`
    /// reply carrying the matching hash — the other half of this exchange is
    /// `spawn_responder`, which answers `BlobWant` for blobs it already has.
    pub fn find_peers<'a>(&'a self, blob_id: &str) -> FindPeersHandle<'a> {
        let blob_id = blob_id.to_string();
        Box::pin(async move {
            let hash = match parse_blob_hash(&blob_id) {
                Some(h) => h,
                None => return false,
            };
            let topic = self.topic();
            let discovery = match self.transport.join(topic, Vec::new()).await {
                Ok(d) => d,
                Err(_) => return false,
            };
            let mut events = discovery.subscribe();
            let want = Frame {
                kind: FrameKind::BlobWant,
                scope: topic,
                payload: hash.as_bytes().to_vec(),
            };
            if discovery.send_frame(&want).await.is_err() {
                return false;
            }
            loop {
                match events.recv().await {
                    Ok(TransportEvent::FrameReceived(_peer, frame)) => {
                        if frame.kind != FrameKind::BlobData || frame.scope != topic {
                            continue;
                        }
                        match self.import_remote_bytes(&frame.payload, hash).await {
                            Ok(()) => return true,
                            Err(_) => continue,
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
    }

    async fn import_remote_bytes(&self, bytes: &[u8], expected: BlobHash) -> Result<(), BlobError> {
        let tag = self
            .store
            .import_bytes(bytes.to_vec().into(), BlobFormat::Raw)
            .await
            .map_err(|e| BlobError::Store(e.to_string()))?;
        if tag.hash() != expected {
            return Err(BlobError::Store("peer sent mismatched blob content".into()));
        }
        Ok(())
    }
}

impl<S: BlobsStore + 'static> BlobStore<S> {
    /// Answer `BlobWant` requests on the blob-core's topic with a `BlobData`
    /// reply whenever the requested hash is locally present. Spawned once by
    /// `CoreContext::open`/`open_in_memory`; runs for as long as `self` (an
    /// `Arc<BlobStore<S>>`) has a live reference.
    pub fn spawn_responder(self: Arc<Self>) {
        tokio::spawn(async move {
            let topic = self.topic();
            let discovery = match self.transport.join(topic, Vec::new()).await {
                Ok(d) => d,
                Err(_) => return,
            };
            let mut events = discovery.subscribe();
            loop {
                match events.recv().await {
                    Ok(TransportEvent::FrameReceived(_peer, frame)) => {
                        if frame.kind != FrameKind::BlobWant || frame.scope != topic {
                            continue;
                        }
                        let requested: [u8; 32] = match frame.payload.as_slice().try_into() {
                            Ok(b) => b,
                            Err(_) => continue,
                        };
                        let hash = BlobHash::from_bytes(requested);
                        if !self.store.has(&hash).await.unwrap_or(false) {
                            continue;
                        }
                        let blob_id = hash.to_hex().to_string();
                        if let Ok(result) = self.get(&blob_id, GetOptions::default()).await {
                            let data = Frame {
                                kind: FrameKind::BlobData,
                                scope: topic,
                                payload: result.bytes,
                            };
                            let _ = discovery.send_frame(&data).await;
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        });
    }
}

fn parse_blob_hash(blob_id: &str) -> Option<BlobHash> {
    let bytes = hex::decode(blob_id).ok()?;
    let array: [u8; 32] = bytes.try_into().ok()?;
    Some(BlobHash::from_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_op_store;
    use iroh_blobs::store::mem::Store as MemStore;
    use std::sync::Arc;
    use tokio::sync::Mutex as TokioMutex;

    async fn test_blobstore() -> BlobStore<MemStore> {
        let op_store = Arc::new(TokioMutex::new(open_op_store(":memory:").await.unwrap()));
        let blob_core = LogCore::new(op_store, "room:test:blob-core");
        let key = PrivateKey::new();
        let transport = Arc::new(ReplicationTransport::bind(Vec::new()).await.unwrap());
        BlobStore::new(MemStore::new(), blob_core, key, transport)
    }


    #[tokio::test]
    async fn put_then_get_round_trips_exact_bytes() {
        let store = test_blobstore().await;
        let data = b"the quick brown fox".to_vec();
        let blob_ref = store
            .put(data.clone(), PutOptions { name: Some("fox.txt".into()), ..Default::default() })
            .await
            .unwrap();

        assert!(store.has(&blob_ref.blob_id).await);
        let got = store.get(&blob_ref.blob_id, GetOptions::default()).await.unwrap();
        assert_eq!(got.bytes, data);
        assert!(!got.truncated);
    }

    #[tokio::test]
    async fn get_respects_max_bytes_cap() {
        let store = test_blobstore().await;
        let data = vec![1u8; 1000];
        let blob_ref = store.put(data, PutOptions::default()).await.unwrap();

        let got = store
            .get(&blob_ref.blob_id, GetOptions { max_bytes: Some(100), timeout: None })
            .await
            .unwrap();
        assert_eq!(got.bytes.len(), 100);
        assert!(got.truncated);
    }

    #[tokio::test]
    async fn identical_content_reuses_one_blob_id() {
        let store = test_blobstore().await;
        let data = b"dup".to_vec();
        let a = store.put(data.clone(), PutOptions::default()).await.unwrap();
        let b = store.put(data, PutOptions::default()).await.unwrap();
        assert_eq!(a.blob_id, b.blob_id);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let store = test_blobstore().await;
        assert!(!store.has(&hex::encode([0u8; 32])).await);
        let result = store
            .get(
                &hex::encode([0u8; 32]),
                GetOptions { max_bytes: None, timeout: Some(Duration::from_millis(200)) },
            )
            .await;
        assert!(matches!(result, Err(BlobError::NotFound)));
    }
}
