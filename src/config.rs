//! `CoreContext` — the explicit, constructor-passed bundle of
//! identity/storage/transport handles that replaces the reference core's
//! process-wide `OnceLock` statics (§9 redesign note).
//!
//! Owns the persisted state layout under the user's config directory (§6):
//!
//! ```text
//! <config_dir>/identity.json
//! <config_dir>/room-keys.json
//! <config_dir>/rooms/<roomId>/      (per-room LogCore data)
//! <config_dir>/blobs/               (shared blob-core data)
//! <config_dir>/remote-blobs/        (downloaded blob payload cache)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use iroh_blobs::store::Store as BlobsStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::blobstore::BlobStore;
use crate::identity::{Identity, IdentityError, IdentityFile};
use crate::logcore::LogCore;
use crate::store::{self, RoomOpStore, StoreError};
use crate::transport::{ReplicationTransport, TransportError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("blob store init error: {0}")]
    Blob(String),
    #[error("bad bootstrap node: {0}")]
    BootstrapNode(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// On-disk shape of one entry in `room-keys.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomKeyEntry {
    pub id: String,
    pub name: String,
    pub key: String,
    pub encryption_key: String,
    pub blob_store_key: Option<String>,
}

/// A `NodeAddr`-shaped bootstrap hint for the transport (§6 `CoreContext::open`).
#[derive(Debug, Clone)]
pub struct BootstrapNode {
    pub node_id_hex: String,
    pub relay_url: Option<String>,
}

/// Constructor-passed bundle of every handle `RoomCoordinator` needs.
///
/// There is exactly one `CoreContext` per running process; unlike the
/// reference core's `OnceLock<DeltaCore>`, it is an ordinary value the host
/// application owns and can drop (e.g. in tests, to build several isolated
/// contexts in one process).
///
/// `S` is the `iroh-blobs` store backend: the default `fs::Store` persists
/// under `<config_dir>/blobs` (§6); tests use `open_in_memory`, which swaps
/// in `iroh_blobs::store::mem::Store` instead. The blob store is shared
/// across every room opened from this context — its key space is flat
/// (§9) — rather than one instance per room.
pub struct CoreContext<S: BlobsStore = iroh_blobs::store::fs::Store> {
    pub identity: Identity,
    pub config_dir: PathBuf,
    pub op_store: Arc<Mutex<RoomOpStore>>,
    pub bootstrap_nodes: Vec<BootstrapNode>,
    pub blob_store: Arc<BlobStore<S>>,
    pub transport: Arc<ReplicationTransport>,
    pub bootstrap_node_ids: Vec<iroh::NodeId>,
}

/// Resolve a `BootstrapNode`'s hex-encoded node id (and optional relay url)
/// into the `iroh::NodeAddr` `ReplicationTransport::bind` dials at startup.
fn bootstrap_node_addr(bn: &BootstrapNode) -> Result<iroh::NodeAddr, ConfigError> {
    let bytes = hex::decode(&bn.node_id_hex)
        .map_err(|e| ConfigError::BootstrapNode(format!("bad node id '{}': {e}", bn.node_id_hex)))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ConfigError::BootstrapNode("node id must be 32 bytes".into()))?;
    let node_id = iroh::NodeId::from_bytes(&array)
        .map_err(|e| ConfigError::BootstrapNode(format!("bad node id '{}': {e}", bn.node_id_hex)))?;

    let mut addr = iroh::NodeAddr::new(node_id);
    if let Some(relay_url) = &bn.relay_url {
        let relay: iroh::RelayUrl = relay_url
            .parse()
            .map_err(|e| ConfigError::BootstrapNode(format!("bad relay url '{relay_url}': {e}")))?;
        addr = addr.with_relay_url(relay);
    }
    Ok(addr)
}

impl CoreContext<iroh_blobs::store::fs::Store> {
    /// Load or initialize `identity.json`/`room-keys.json` under
    /// `config_dir`, open the shared operation store and blob store, and
    /// return a ready `CoreContext`. Idempotent across restarts: an
    /// existing identity is reloaded rather than regenerated.
    pub async fn open(
        config_dir: PathBuf,
        bootstrap_nodes: Vec<BootstrapNode>,
    ) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(&config_dir)?;
        std::fs::create_dir_all(config_dir.join("rooms"))?;
        std::fs::create_dir_all(config_dir.join("blobs"))?;
        std::fs::create_dir_all(config_dir.join("remote-blobs"))?;

        let identity = load_or_create_identity(&config_dir)?;

        let db_dir = config_dir.to_string_lossy().to_string();
        let op_store = Arc::new(Mutex::new(store::open_op_store(&db_dir).await?));

        let mut bootstrap_addrs = Vec::with_capacity(bootstrap_nodes.len());
        for bn in &bootstrap_nodes {
            bootstrap_addrs.push(bootstrap_node_addr(bn)?);
        }
        let bootstrap_node_ids = bootstrap_addrs.iter().map(|a| a.node_id).collect();
        let transport = Arc::new(ReplicationTransport::bind(bootstrap_addrs).await?);

        let blobs_fs = iroh_blobs::store::fs::Store::load(config_dir.join("blobs"))
            .await
            .map_err(|e| ConfigError::Blob(e.to_string()))?;
        let blob_core = LogCore::new(op_store.clone(), "blob-core".to_string());
        let blob_store = Arc::new(BlobStore::new(
            blobs_fs,
            blob_core,
            identity.private_key().clone(),
            transport.clone(),
        ));
        blob_store.clone().spawn_responder();

        Ok(CoreContext {
            identity,
            config_dir,
            op_store,
            bootstrap_nodes,
            blob_store,
            transport,
            bootstrap_node_ids,
        })
    }
}

impl CoreContext<iroh_blobs::store::mem::Store> {
    /// Open an in-memory `CoreContext`, used by tests that don't need data
    /// to survive the process.
    pub async fn open_in_memory(display_name: &str) -> Result<Self, ConfigError> {
        let (identity, _mnemonic) = Identity::generate(display_name.to_string(), now_micros());
        let op_store = Arc::new(Mutex::new(store::open_op_store(":memory:").await?));
        let transport = Arc::new(ReplicationTransport::bind(Vec::new()).await?);
        let blob_core = LogCore::new(op_store.clone(), "blob-core".to_string());
        let blob_store = Arc::new(BlobStore::new(
            iroh_blobs::store::mem::Store::new(),
            blob_core,
            identity.private_key().clone(),
            transport.clone(),
        ));
        blob_store.clone().spawn_responder();
        Ok(CoreContext {
            identity,
            config_dir: PathBuf::from(":memory:"),
            op_store,
            bootstrap_nodes: Vec::new(),
            blob_store,
            transport,
            bootstrap_node_ids: Vec::new(),
        })
    }
}

impl<S: BlobsStore> CoreContext<S> {
    pub fn room_dir(&self, room_id: &str) -> PathBuf {
        self.config_dir.join("rooms").join(room_id)
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.config_dir.join("blobs")
    }

    pub fn remote_blobs_dir(&self) -> PathBuf {
        self.config_dir.join("remote-blobs")
    }

    pub fn room_keys_path(&self) -> PathBuf {
        self.config_dir.join("room-keys.json")
    }

    pub fn read_room_keys(&self) -> Result<Vec<RoomKeyEntry>, ConfigError> {
        read_room_keys(&self.config_dir)
    }

    pub fn write_room_keys(&self, entries: &[RoomKeyEntry]) -> Result<(), ConfigError> {
        write_room_keys(&self.config_dir, entries)
    }
}

fn load_or_create_identity(config_dir: &Path) -> Result<Identity, ConfigError> {
    let path = config_dir.join("identity.json");
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let file: IdentityFile = serde_json::from_str(&raw)?;
        Ok(Identity::from_file(file)?)
    } else {
        let (identity, _mnemonic) = Identity::generate("anonymous".to_string(), now_micros());
        let raw = serde_json::to_string_pretty(&identity.to_file())?;
        write_owner_only(&path, &raw)?;
        Ok(identity)
    }
}

fn read_room_keys(config_dir: &Path) -> Result<Vec<RoomKeyEntry>, ConfigError> {
    let path = config_dir.join("room-keys.json");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_room_keys(config_dir: &Path, entries: &[RoomKeyEntry]) -> Result<(), ConfigError> {
    let path = config_dir.join("room-keys.json");
    let raw = serde_json::to_string_pretty(entries)?;
    std::fs::write(path, raw)?;
    Ok(())
}

#[cfg(unix)]
fn write_owner_only(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
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

    #[tokio::test]
    async fn open_creates_layout_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CoreContext::open(dir.path().to_path_buf(), vec![])
            .await
            .unwrap();
        assert!(dir.path().join("identity.json").exists());
        assert!(dir.path().join("rooms").is_dir());
        assert!(dir.path().join("blobs").is_dir());
        assert!(dir.path().join("remote-blobs").is_dir());
        let _ = ctx.identity.public_key();
    }

    #[tokio::test]
    async fn reopen_reloads_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ctx1 = CoreContext::open(dir.path().to_path_buf(), vec![])
            .await
            .unwrap();
        let pk1 = ctx1.identity.public_key();
        drop(ctx1);

        let ctx2 = CoreContext::open(dir.path().to_path_buf(), vec![])
            .await
            .unwrap();
        assert_eq!(pk1, ctx2.identity.public_key());
    }

    #[tokio::test]
    async fn room_keys_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CoreContext::open(dir.path().to_path_buf(), vec![])
            .await
            .unwrap();
        let entries = vec![RoomKeyEntry {
            id: "r1".into(),
            name: "alpha".into(),
            key: "aa".repeat(32),
            encryption_key: "bb".repeat(32),
            blob_store_key: None,
        }];
        ctx.write_room_keys(&entries).unwrap();
        let reloaded = ctx.read_room_keys().unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].id, "r1");
    }
}
