//! PairingService (§4.6): out-of-band bootstrap for new writers via
//! single-use, base32-encoded invites.
//!
//! Grounded on the reference core's `auth.rs` (signed capability tokens,
//! Ed25519 signing/verification idiom), generalized from a reusable
//! signature-checked token into a genuinely single-use credential: where the
//! reference's `InviteToken::verify` can be checked any number of times
//! without consuming anything, redemption here is guarded by an atomic
//! "claim" (`View::try_claim_invite`, an `UPDATE ... WHERE redeemed = 0`
//! following the same `INSERT ... ON CONFLICT` idiom the reference uses for
//! its upserts) so exactly one of two concurrent redeemers observes success
//! (Testable Property 5). Key transfer reuses `seal.rs`'s ECDH + HKDF + AEAD
//! envelope, the mechanism the reference's sealed-sender module already
//! implements for a different purpose (§9).

use std::time::Duration;

use p2panda_core::{PrivateKey, PublicKey};
use thiserror::Error;

use crate::commands::{AddInvite, AddWriter, Command};
use crate::multiwriter::MultiWriterLog;
use crate::seal::{self, SealedSenderError};
use crate::view::{InviteRecord, ViewError};

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("invite already redeemed")]
    AlreadyRedeemed,
    #[error("invite expired")]
    Expired,
    #[error("issuer key does not match the invite record")]
    IssuerMismatch,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("view error: {0}")]
    View(#[from] ViewError),
    #[error("multiwriter error: {0}")]
    MultiWriter(#[from] crate::multiwriter::MultiWriterError),
    #[error("sealed envelope error: {0}")]
    Seal(#[from] SealedSenderError),
    #[error("malformed invite string")]
    MalformedInvite,
}

/// Candidate-side progress, mirroring the state machine in §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Init,
    Announce,
    Matched,
    KeyXfer,
    Added,
    Writable,
    Rejected,
    Failed,
}

/// The material a successful `joinRoom` hands back to the coordinator so it
/// can open a `MultiWriterLog` for the new room.
#[derive(Debug, Clone)]
pub struct RoomKeys {
    pub room_key: [u8; 32],
    pub encryption_key: [u8; 32],
}

fn invite_to_z32(invite: &[u8; 32]) -> String {
    z32::encode(invite)
}

fn invite_from_z32(s: &str) -> Option<[u8; 32]> {
    let bytes = z32::decode(s.as_bytes()).ok()?;
    bytes.try_into().ok()
}

/// Decodes an invite string into its raw credential, for callers outside
/// this module that need the credential without running the full
/// `join_room` state machine (e.g. to derive the pairing rendezvous topic).
pub(crate) fn invite_credential(invite: &str) -> Option<[u8; 32]> {
    invite_from_z32(invite)
}

/// Rendezvous topic both sides join to exchange `PairingAnnounce`/
/// `PairingKeyXfer` frames for a given invite credential. Domain-separated
/// from `derive_invite_credential`'s hash so the topic id and the credential
/// itself can never collide.
pub(crate) fn pairing_topic(credential: &[u8; 32]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"room-core:pairing-topic:v1");
    hasher.update(credential);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Issuer side: create (or return the existing) single active invite for a
/// room. `room_key` seeds the credential so redemption can be verified
/// without a network round trip to the issuer for the announce step.
pub fn derive_invite_credential(room_key: &[u8; 32], issuer_public_key: &PublicKey) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"room-core:invite:v1");
    hasher.update(room_key);
    hasher.update(*issuer_public_key.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// `createInvite()`: ensures exactly one active invite exists for `room_id`,
/// appending `add-invite` to the log if none does yet, and returns its
/// z-base-32 string form.
pub async fn create_invite(
    mwl: &MultiWriterLog,
    local_key: &PrivateKey,
    room_key: &[u8; 32],
    expires_at: i64,
) -> Result<String, PairingError> {
    if let Some(existing) = mwl.view().get_invite(mwl.room_id()).await? {
        if !existing.redeemed {
            return Ok(invite_to_z32(&existing.invite));
        }
    }

    let issuer_public_key = local_key.public_key();
    let credential = derive_invite_credential(room_key, &issuer_public_key);
    let id = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"room-core:invite-id:v1");
        hasher.update(&credential);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    };

    mwl.append(&Command::AddInvite(AddInvite {
        id,
        invite: credential,
        public_key: *issuer_public_key.as_bytes(),
        expires: expires_at,
    }))
    .await?;

    Ok(invite_to_z32(&credential))
}

/// Candidate side: `joinRoom(invite)`. Runs the announce/match/key-transfer
/// sequence against the issuer, driving `state` through the machine
/// documented in §4.6, and returns the room keys plus the candidate's local
/// writer key once the issuer has admitted it.
///
/// The actual network rendezvous (announce over `ReplicationTransport`,
/// issuer reply carrying the sealed `RoomKeys`) is represented here by the
/// `announce` and `key_xfer` callbacks so this function stays transport-
/// agnostic and directly testable; `coordinator.rs` supplies the real
/// transport-backed closures.
pub struct JoinRoomOutcome {
    pub state: PairingState,
    pub room_keys: Option<RoomKeys>,
}

pub async fn join_room<AnnounceFut, KeyXferFut>(
    invite: &str,
    local_key: &PrivateKey,
    announce: impl FnOnce([u8; 32], PublicKey) -> AnnounceFut,
    key_xfer_wait: impl FnOnce() -> KeyXferFut,
    timeout: Duration,
) -> Result<JoinRoomOutcome, PairingError>
where
    AnnounceFut: std::future::Future<Output = Result<bool, PairingError>>,
    KeyXferFut: std::future::Future<Output = Result<Vec<u8>, PairingError>>,
{
    let credential = invite_from_z32(invite).ok_or(PairingError::MalformedInvite)?;
    let mut state = PairingState::Init;

    state = PairingState::Announce;
    let matched = announce(credential, local_key.public_key())
        .await
        .unwrap_or(false);
    if !matched {
        return Ok(JoinRoomOutcome { state: PairingState::Rejected, room_keys: None });
    }
    state = PairingState::Matched;

    state = PairingState::KeyXfer;
    let envelope = tokio::time::timeout(timeout, key_xfer_wait())
        .await
        .map_err(|_| PairingError::Transport("key transfer timed out".into()))??;

    let seed_bytes = *local_key.as_bytes();
    let (sender_pk, payload) = seal::open(&envelope, &seed_bytes)?;
    let _ = sender_pk; // caller is responsible for checking this against the expected issuer

    if payload.len() != 64 {
        return Err(PairingError::Transport("malformed key-transfer payload".into()));
    }
    let mut room_key = [0u8; 32];
    let mut encryption_key = [0u8; 32];
    room_key.copy_from_slice(&payload[..32]);
    encryption_key.copy_from_slice(&payload[32..]);

    state = PairingState::Added;
    Ok(JoinRoomOutcome {
        state,
        room_keys: Some(RoomKeys { room_key, encryption_key }),
    })
}

/// Issuer side: validate and redeem a presented invite credential. Returns
/// `Ok(())` and appends `add-writer(candidate_key)` exactly once across any
/// number of concurrent callers; all others observe `AlreadyRedeemed`.
pub async fn redeem_invite(
    mwl: &MultiWriterLog,
    local_key: &PrivateKey,
    presented_credential: &[u8; 32],
    candidate_key: PublicKey,
    now: i64,
) -> Result<(), PairingError> {
    let record = mwl
        .view()
        .get_invite(mwl.room_id())
        .await?
        .ok_or(PairingError::IssuerMismatch)?;

    if record.invite != *presented_credential {
        return Err(PairingError::IssuerMismatch);
    }
    if now > record.expires_at {
        return Err(PairingError::Expired);
    }

    let claimed = mwl.view().try_claim_invite(mwl.room_id()).await?;
    if !claimed {
        return Err(PairingError::AlreadyRedeemed);
    }

    mwl.append(&Command::AddWriter(AddWriter {
        key: *candidate_key.as_bytes(),
    }))
    .await?;
    let _ = local_key;
    Ok(())
}

/// Seal `{roomKey, encryptionKey}` for the candidate's public key, the
/// KEY_XFER payload `redeem_invite`'s caller sends back over the transport.
pub fn seal_room_keys(
    keys: &RoomKeys,
    issuer_public_key: &[u8; 32],
    candidate_public_key: &[u8; 32],
) -> Result<Vec<u8>, PairingError> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(&keys.room_key);
    payload.extend_from_slice(&keys.encryption_key);
    Ok(seal::seal(&payload, issuer_public_key, candidate_public_key)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logcore::LogCore;
    use crate::store::open_op_store;
    use crate::view::{run_migrations, View};
    use sqlx::SqlitePool;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    async fn test_mwl_with_invite() -> (MultiWriterLog, PrivateKey, [u8; 32]) {
        let store = Arc::new(Mutex::new(open_op_store(":memory:").await.unwrap()));
        let log = Arc::new(LogCore::new(store, "room:test"));
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let view = View::new(pool);
        let issuer_key = PrivateKey::new();
        let mwl = MultiWriterLog::new(log, "room:test", issuer_key.clone(), view);
        mwl.admit_writer(*issuer_key.public_key().as_bytes()).await.unwrap();

        let room_key = [9u8; 32];
        let invite_str = create_invite(&mwl, &issuer_key, &room_key, i64::MAX).await.unwrap();
        let credential = invite_from_z32(&invite_str).unwrap();
        (mwl, issuer_key, credential)
    }

    #[tokio::test]
    async fn create_invite_is_stable_until_redeemed() {
        let (mwl, issuer_key, _credential) = test_mwl_with_invite().await;
        let room_key = [9u8; 32];
        let again = create_invite(&mwl, &issuer_key, &room_key, i64::MAX).await.unwrap();
        let record = mwl.view().get_invite("room:test").await.unwrap().unwrap();
        assert_eq!(invite_to_z32(&record.invite), again);
    }

    #[tokio::test]
    async fn single_use_redemption_under_concurrency() {
        let (mwl, issuer_key, credential) = test_mwl_with_invite().await;
        let candidate_a = PrivateKey::new().public_key();
        let candidate_b = PrivateKey::new().public_key();

        let a = redeem_invite(&mwl, &issuer_key, &credential, candidate_a, 0).await;
        let b = redeem_invite(&mwl, &issuer_key, &credential, candidate_b, 0).await;

        assert!(a.is_ok());
        assert!(matches!(b, Err(PairingError::AlreadyRedeemed)));
    }

    #[tokio::test]
    async fn wrong_credential_is_rejected() {
        let (mwl, issuer_key, _credential) = test_mwl_with_invite().await;
        let candidate = PrivateKey::new().public_key();
        let result = redeem_invite(&mwl, &issuer_key, &[0u8; 32], candidate, 0).await;
        assert!(matches!(result, Err(PairingError::IssuerMismatch)));
    }

    #[tokio::test]
    async fn expired_invite_is_rejected() {
        let (mwl, issuer_key, credential) = test_mwl_with_invite().await;
        // Re-issue with an already-past expiry by hand-crafting the record,
        // since `create_invite` refuses to replace a still-active one.
        mwl.view()
            .set_invite(&InviteRecord {
                room_id: "room:test".into(),
                id: [1u8; 32],
                invite: credential,
                issuer_public_key: *issuer_key.public_key().as_bytes(),
                expires_at: -1,
                redeemed: false,
            })
            .await
            .unwrap();
        let candidate = PrivateKey::new().public_key();
        let result = redeem_invite(&mwl, &issuer_key, &credential, candidate, 0).await;
        assert!(matches!(result, Err(PairingError::Expired)));
    }

    #[test]
    fn seal_room_keys_roundtrips_through_open() {
        let issuer_seed = [3u8; 32];
        let issuer_signing = ed25519_dalek::SigningKey::from_bytes(&issuer_seed);
        let issuer_pk = *issuer_signing.verifying_key().as_bytes();

        let candidate_seed = [4u8; 32];
        let candidate_signing = ed25519_dalek::SigningKey::from_bytes(&candidate_seed);
        let candidate_pk = *candidate_signing.verifying_key().as_bytes();

        let keys = RoomKeys { room_key: [1u8; 32], encryption_key: [2u8; 32] };
        let envelope = seal_room_keys(&keys, &issuer_pk, &candidate_pk).unwrap();
        let (sender, payload) = seal::open(&envelope, &candidate_seed).unwrap();
        assert_eq!(sender, issuer_pk);
        assert_eq!(&payload[..32], &keys.room_key);
        assert_eq!(&payload[32..], &keys.encryption_key);
    }
}
