//! Ed25519 signing key storage.
//!
//! The key pair identifies this publisher for the lifetime of its base
//! directory: the public key is embedded in every announcement, and the
//! name handle is bound to the same identity on the network side. Both
//! halves are persisted as hex text — the private file holds the 64-byte
//! keypair bytes (seed followed by public key), the public file the 32
//! public bytes.

use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey};
use rand::RngCore;

pub const PRIVATE_KEY_FILE: &str = "private.key";
pub const PUBLIC_KEY_FILE: &str = "public.key";

/// Length of the persisted private key material (seed ‖ public key).
const KEYPAIR_LEN: usize = 64;
const PUBLIC_LEN: usize = 32;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum KeyError {
    /// Key files exist but do not decode to a valid key pair. Startup
    /// aborts rather than silently regenerating the identity.
    #[error("corrupt key material in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Loaded (or freshly generated) signing key pair.
#[derive(Debug)]
pub struct KeyStore {
    keys_dir: PathBuf,
    signing: SigningKey,
}

impl KeyStore {
    /// Loads the key pair from `keys_dir`, generating and persisting a new
    /// one when none exists yet.
    pub fn init(keys_dir: impl Into<PathBuf>) -> Result<Self, KeyError> {
        let keys_dir = keys_dir.into();
        std::fs::create_dir_all(&keys_dir)?;
        set_mode(&keys_dir, 0o700)?;

        let private_path = keys_dir.join(PRIVATE_KEY_FILE);
        if private_path.exists() {
            tracing::info!("loading existing signing key pair");
            let signing = Self::load(&keys_dir)?;
            return Ok(KeyStore { keys_dir, signing });
        }

        tracing::info!("generating new Ed25519 signing key pair");
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);

        let store = KeyStore { keys_dir, signing };
        store.save()?;
        Ok(store)
    }

    fn load(keys_dir: &Path) -> Result<SigningKey, KeyError> {
        let private_path = keys_dir.join(PRIVATE_KEY_FILE);
        let keypair = decode_hex_file(&private_path, KEYPAIR_LEN)?;
        let keypair: [u8; KEYPAIR_LEN] = keypair.try_into().expect("length checked");
        let signing = SigningKey::from_keypair_bytes(&keypair).map_err(|_| KeyError::Corrupt {
            path: private_path.clone(),
            reason: "public half does not match the private seed".to_string(),
        })?;

        // The public file is advisory (the private file is authoritative),
        // but a mismatch means someone edited the key material by hand.
        let public_path = keys_dir.join(PUBLIC_KEY_FILE);
        if public_path.exists() {
            let public = decode_hex_file(&public_path, PUBLIC_LEN)?;
            if public != signing.verifying_key().as_bytes() {
                return Err(KeyError::Corrupt {
                    path: public_path,
                    reason: "public key file does not match the private key".to_string(),
                });
            }
        }

        Ok(signing)
    }

    fn save(&self) -> Result<(), KeyError> {
        let private_path = self.keys_dir.join(PRIVATE_KEY_FILE);
        let public_path = self.keys_dir.join(PUBLIC_KEY_FILE);

        std::fs::write(&private_path, hex::encode(self.signing.to_keypair_bytes()))?;
        set_mode(&private_path, 0o600)?;

        std::fs::write(&public_path, hex::encode(self.signing.verifying_key().as_bytes()))?;
        set_mode(&public_path, 0o644)?;

        Ok(())
    }

    /// Signs `message` with the private key. Ed25519 signing is
    /// deterministic and cannot fail once the key is loaded.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Raw public key bytes — the identity advertised in announcements.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_LEN] {
        *self.signing.verifying_key().as_bytes()
    }

    /// The signing key itself, for message types that sign internally.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

fn decode_hex_file(path: &Path, expected_len: usize) -> Result<Vec<u8>, KeyError> {
    let text = std::fs::read_to_string(path)?;
    let bytes = hex::decode(text.trim()).map_err(|e| KeyError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("invalid hex: {e}"),
    })?;
    if bytes.len() != expected_len {
        return Err(KeyError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("expected {expected_len} key bytes, got {}", bytes.len()),
        });
    }
    Ok(bytes)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Verifier, VerifyingKey};

    #[test]
    fn init_generates_and_reloads_the_same_key() {
        let dir = tempfile::tempdir().unwrap();

        let first = KeyStore::init(dir.path()).unwrap();
        let second = KeyStore::init(dir.path()).unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());

        let sig = first.sign(b"payload");
        let key = VerifyingKey::from_bytes(&second.public_key_bytes()).unwrap();
        key.verify(b"payload", &sig).unwrap();
    }

    #[test]
    fn wrong_length_key_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), hex::encode([7u8; 32])).unwrap();

        let err = KeyStore::init(dir.path()).unwrap_err();
        assert!(matches!(err, KeyError::Corrupt { .. }));
    }

    #[test]
    fn non_hex_key_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), "not hex at all").unwrap();

        let err = KeyStore::init(dir.path()).unwrap_err();
        assert!(matches!(err, KeyError::Corrupt { .. }));
    }

    #[test]
    fn mismatched_public_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        KeyStore::init(dir.path()).unwrap();
        std::fs::write(dir.path().join(PUBLIC_KEY_FILE), hex::encode([9u8; 32])).unwrap();

        let err = KeyStore::init(dir.path()).unwrap_err();
        assert!(matches!(err, KeyError::Corrupt { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        KeyStore::init(dir.path()).unwrap();

        let mode = std::fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
