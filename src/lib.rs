//! A local-first, peer-to-peer group communication substrate: every member
//! of a room holds a full hash-chained, signed log of everything that has
//! happened in it, and messages, membership changes, and invites replicate
//! directly between peers rather than through a server.
//!
//! The crate is organized around the path a command takes from a local call
//! to a materialized, queryable view:
//!
//! - [`identity`] / [`crypto`] — durable per-device keypair, and the
//!   ECDH/AEAD primitives built on it.
//! - [`codec`] / [`commands`] — the wire format and the seven command kinds
//!   a room's log can carry.
//! - [`logcore`] — the hash-chained, signed per-author log and its
//!   append-only sqlite store.
//! - [`multiwriter`] — deterministic linearization of every admitted
//!   writer's log into one ordered command stream.
//! - [`view`] — the sqlite read model the linearized stream folds into.
//! - [`transport`] — gossip-based replication between peers over `iroh`.
//! - [`blobstore`] — content-addressed file storage shared by every room.
//! - [`seal`] — the sealed-envelope format used to hand room keys to a
//!   new member during pairing.
//! - [`pairing`] — the invite/announce/key-transfer state machine.
//! - [`coordinator`] — the public surface: [`coordinator::RoomCoordinator`]
//!   and [`coordinator::Room`].
//! - [`config`] — [`config::CoreContext`], the constructor-passed bundle of
//!   identity, storage, and blob-store handles everything else runs on.
//! - [`error`] — the six-kind [`error::CoreError`] every module's local
//!   error type converts into at its boundary.

pub mod blobstore;
pub mod codec;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod logcore;
pub mod multiwriter;
pub mod pairing;
pub mod seal;
pub mod store;
pub mod transport;
pub mod view;

pub use blobstore::{BlobError, BlobStore, GetOptions, GetResult, PutOptions, RangeOptions};
pub use commands::{Command, MessageFlags};
pub use config::{BootstrapNode, ConfigError, CoreContext, RoomKeyEntry};
pub use coordinator::{CoordinatorError, Room, RoomCoordinator, RoomEvent, WriterInfo};
pub use error::CoreError;
pub use identity::{Identity, IdentityError};
pub use logcore::{LogCore, LogCoreError};
pub use multiwriter::MultiWriterLog;
pub use pairing::{PairingError, PairingState};
pub use transport::{ReplicationTransport, TransportError};
pub use view::{
    BlobRef, DriveMetadata, FindMessagesOptions, InviteRecord, Message, Metadata, RichContent,
    TimestampRange, View, ViewError,
};
