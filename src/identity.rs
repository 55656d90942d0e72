//! Durable local identity: `{publicKey, privateKey, displayName, createdAt}` (§3).

use bip39::Mnemonic;
use p2panda_core::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("invalid private key bytes")]
    InvalidPrivateKey,
}

/// The durable keypair owned by the running process.
///
/// `private_key` never leaves the process except when written, encrypted at
/// rest by the host's storage, into `identity.json` (§6).
#[derive(Clone)]
pub struct Identity {
    private_key: PrivateKey,
    pub display_name: String,
    pub created_at: i64,
}

/// On-disk shape of `identity.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityFile {
    pub public_key: String,
    pub private_key: String,
    pub display_name: String,
    pub created_at: i64,
}

impl Identity {
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Generate a brand-new identity backed by a 24-word BIP-39 mnemonic.
    ///
    /// Returns the identity and the mnemonic, which the caller (the UI
    /// collaborator) is responsible for surfacing to the user exactly once.
    pub fn generate(display_name: String, now: i64) -> (Self, String) {
        let mnemonic = Mnemonic::generate(24).expect("24-word mnemonic generation is infallible");
        let private_key = private_key_from_mnemonic(&mnemonic);
        let words: Vec<&str> = mnemonic.words().collect();
        (
            Identity {
                private_key,
                display_name,
                created_at: now,
            },
            words.join(" "),
        )
    }

    /// Recreate an identity from an existing 24-word mnemonic.
    pub fn from_mnemonic(
        words: Vec<String>,
        display_name: String,
        now: i64,
    ) -> Result<Self, IdentityError> {
        let phrase = words.join(" ");
        let mnemonic = phrase
            .parse::<Mnemonic>()
            .map_err(|e| IdentityError::InvalidMnemonic(e.to_string()))?;
        Ok(Identity {
            private_key: private_key_from_mnemonic(&mnemonic),
            display_name,
            created_at: now,
        })
    }

    pub fn to_file(&self) -> IdentityFile {
        IdentityFile {
            public_key: self.public_key().to_hex(),
            private_key: self.private_key.to_hex(),
            display_name: self.display_name.clone(),
            created_at: self.created_at,
        }
    }

    pub fn from_file(file: IdentityFile) -> Result<Self, IdentityError> {
        let bytes = hex::decode(&file.private_key).map_err(|_| IdentityError::InvalidPrivateKey)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| IdentityError::InvalidPrivateKey)?;
        Ok(Identity {
            private_key: PrivateKey::from_bytes(&bytes),
            display_name: file.display_name,
            created_at: file.created_at,
        })
    }
}

fn private_key_from_mnemonic(mnemonic: &Mnemonic) -> PrivateKey {
    // 64-byte PBKDF2 seed (BIP-39 standard, no passphrase); first 32 bytes
    // become the Ed25519 seed.
    let seed = mnemonic.to_seed("");
    let seed_bytes: [u8; 32] = seed[..32].try_into().expect("seed is always 64 bytes");
    PrivateKey::from_bytes(&seed_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_reimport_roundtrip() {
        let (id1, mnemonic) = Identity::generate("alice".into(), 1_000);
        assert_eq!(mnemonic.split_whitespace().count(), 24);

        let words: Vec<String> = mnemonic.split_whitespace().map(String::from).collect();
        let id2 = Identity::from_mnemonic(words, "alice".into(), 1_000).expect("valid mnemonic");

        assert_eq!(id1.public_key(), id2.public_key());
    }

    #[test]
    fn bad_mnemonic_returns_error() {
        let bad: Vec<String> = vec!["not".into(), "valid".into()];
        assert!(Identity::from_mnemonic(bad, "bob".into(), 0).is_err());
    }

    #[test]
    fn file_roundtrip_preserves_key() {
        let (id, _) = Identity::generate("carol".into(), 42);
        let file = id.to_file();
        let restored = Identity::from_file(file).unwrap();
        assert_eq!(id.public_key(), restored.public_key());
        assert_eq!(restored.display_name, "carol");
    }
}
