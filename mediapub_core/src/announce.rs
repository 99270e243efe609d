//! The signed collection announcement published to the pub-sub topic.
//!
//! Every participant on the topic parses the same JSON object, so the
//! field set, field names and casing are wire-stable. The signature covers
//! the serialization of the object *minus* the `signature` field; because
//! `serde_json` emits struct fields in declaration order, signer and
//! verifier reconstruct byte-identical pre-images without a canonicalization
//! step. Reordering the fields of [`Announcement`] is therefore a protocol
//! break, not a refactor.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Maximum tolerated clock drift into the future, in seconds.
pub const MAX_FUTURE_DRIFT_SECS: i64 = 3600;

/// A collection announcement as published on the wire.
///
/// `version` counts completed republishes of the collection; `timestamp`
/// is the Unix time of the most recent republish that actually changed the
/// collection. Periodic heartbeats re-sign and re-send the message but
/// advance neither field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub version: u64,
    /// The mutable name handle the collection index is reachable under.
    pub ipns: String,
    /// Base64 (standard, padded) of the raw Ed25519 public key bytes.
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "collectionSize")]
    pub collection_size: u64,
    /// Unix seconds of the last real collection change.
    pub timestamp: i64,
    /// Base64 (standard, padded) of the 64-byte Ed25519 signature.
    pub signature: String,
}

/// The signing pre-image: the same object without its `signature` field.
///
/// Field order must match [`Announcement`] exactly.
#[derive(Serialize)]
struct UnsignedAnnouncement<'a> {
    version: u64,
    ipns: &'a str,
    #[serde(rename = "publicKey")]
    public_key: &'a str,
    #[serde(rename = "collectionSize")]
    collection_size: u64,
    timestamp: i64,
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum AnnounceError {
    #[error("invalid version: must be >= 1")]
    InvalidVersion,

    #[error("name handle is required")]
    MissingName,

    #[error("invalid public key length: expected {expected}, got {actual}")]
    InvalidPublicKeyLength { expected: usize, actual: usize },

    #[error("invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength { expected: usize, actual: usize },

    #[error("invalid collection size")]
    InvalidCollectionSize,

    #[error("invalid timestamp: must be > 0")]
    InvalidTimestamp,

    #[error("timestamp is too far in the future")]
    TimestampInFuture,

    #[error("invalid base64 encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("malformed public key")]
    MalformedPublicKey,

    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Announcement {
    /// Creates an unsigned announcement. `public_key` and `signature` are
    /// filled in by [`Announcement::sign`].
    pub fn new(version: u64, ipns: impl Into<String>, collection_size: u64, timestamp: i64) -> Self {
        Announcement {
            version,
            ipns: ipns.into(),
            public_key: String::new(),
            collection_size,
            timestamp,
            signature: String::new(),
        }
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, AnnounceError> {
        let unsigned = UnsignedAnnouncement {
            version: self.version,
            ipns: &self.ipns,
            public_key: &self.public_key,
            collection_size: self.collection_size,
            timestamp: self.timestamp,
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Embeds the signer's public key and signs the message in place.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), AnnounceError> {
        self.public_key = BASE64.encode(key.verifying_key().as_bytes());
        let signature = key.sign(&self.signing_bytes()?);
        self.signature = BASE64.encode(signature.to_bytes());
        Ok(())
    }

    /// Verifies the embedded signature against the embedded public key.
    pub fn verify(&self) -> Result<(), AnnounceError> {
        let key_bytes = BASE64.decode(&self.public_key)?;
        let key_bytes: [u8; PUBLIC_KEY_SIZE] =
            key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| AnnounceError::InvalidPublicKeyLength {
                    expected: PUBLIC_KEY_SIZE,
                    actual: key_bytes.len(),
                })?;
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| AnnounceError::MalformedPublicKey)?;

        let sig_bytes = BASE64.decode(&self.signature)?;
        let sig_bytes: [u8; SIGNATURE_SIZE] =
            sig_bytes
                .as_slice()
                .try_into()
                .map_err(|_| AnnounceError::InvalidSignatureLength {
                    expected: SIGNATURE_SIZE,
                    actual: sig_bytes.len(),
                })?;
        let signature = Signature::from_bytes(&sig_bytes);

        key.verify(&self.signing_bytes()?, &signature)
            .map_err(|_| AnnounceError::SignatureMismatch)
    }

    /// Receive-side structural validation, relative to the receiver's
    /// clock. Does not check the signature; call [`Announcement::verify`]
    /// after this passes.
    pub fn validate(&self, now_unix: i64) -> Result<(), AnnounceError> {
        if self.version < 1 {
            return Err(AnnounceError::InvalidVersion);
        }
        if self.ipns.is_empty() {
            return Err(AnnounceError::MissingName);
        }
        let key_len = BASE64.decode(&self.public_key)?.len();
        if key_len != PUBLIC_KEY_SIZE {
            return Err(AnnounceError::InvalidPublicKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: key_len,
            });
        }
        if self.timestamp <= 0 {
            return Err(AnnounceError::InvalidTimestamp);
        }
        if self.timestamp > now_unix + MAX_FUTURE_DRIFT_SECS {
            return Err(AnnounceError::TimestampInFuture);
        }
        let sig_len = BASE64.decode(&self.signature)?.len();
        if sig_len != SIGNATURE_SIZE {
            return Err(AnnounceError::InvalidSignatureLength {
                expected: SIGNATURE_SIZE,
                actual: sig_len,
            });
        }
        Ok(())
    }

    /// Serializes the full message for publishing.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AnnounceError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a message received from the topic.
    pub fn from_bytes(data: &[u8]) -> Result<Self, AnnounceError> {
        Ok(serde_json::from_slice(data)?)
    }
}
