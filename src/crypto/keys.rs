// Ed25519 identities and their Base58Check string forms.
//
// Private keys are carried as the 64-byte keypair form (seed ‖ public) and
// encoded with version byte 11; public keys are the raw 32 bytes with
// version byte 88. Wherever an identity appears in ledger state it is the
// Base64 of SHA-256 over the public-key bytes.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::crypto::hash::BlockHash;

pub const PRIVATE_KEY_VERSION: u8 = 11;
pub const PUBLIC_KEY_VERSION: u8 = 88;

pub const PUBLIC_KEY_BYTES: usize = 32;
pub const PRIVATE_KEY_BYTES: usize = 64;
pub const SIGNATURE_BYTES: usize = 64;

pub type Signature = ed25519_dalek::Signature;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid key encoding")]
    InvalidEncoding,
    #[error("invalid key material")]
    InvalidKey,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PublicKey {
    pub fn from_bytes(data: &[u8]) -> Result<PublicKey, KeyError> {
        if data.len() != PUBLIC_KEY_BYTES {
            return Err(KeyError::InvalidLength {
                expected: PUBLIC_KEY_BYTES,
                got: data.len(),
            });
        }
        let mut raw = [0u8; PUBLIC_KEY_BYTES];
        raw.copy_from_slice(data);
        let key = VerifyingKey::from_bytes(&raw).map_err(|_| KeyError::InvalidKey)?;
        Ok(PublicKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        self.0.as_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify(message, signature).is_ok()
    }

    /// Identity hash: SHA-256 over the raw public-key bytes.
    pub fn hash(&self) -> BlockHash {
        BlockHash::of(self.as_bytes())
    }

    /// The form identities take in ledger state.
    pub fn hash_string(&self) -> String {
        self.hash().to_base64()
    }

    pub fn to_string_checked(&self) -> String {
        encode_versioned(PUBLIC_KEY_VERSION, self.as_bytes())
    }

    pub fn from_string_checked(s: &str) -> Result<PublicKey, KeyError> {
        let raw = decode_versioned(PUBLIC_KEY_VERSION, s)?;
        PublicKey::from_bytes(&raw)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_string_checked())
    }
}

impl PrivateKey {
    pub fn from_bytes(data: &[u8]) -> Result<PrivateKey, KeyError> {
        if data.len() != PRIVATE_KEY_BYTES {
            return Err(KeyError::InvalidLength {
                expected: PRIVATE_KEY_BYTES,
                got: data.len(),
            });
        }
        let mut raw = [0u8; PRIVATE_KEY_BYTES];
        raw.copy_from_slice(data);
        let key = SigningKey::from_keypair_bytes(&raw).map_err(|_| KeyError::InvalidKey)?;
        Ok(PrivateKey(key))
    }

    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_BYTES] {
        self.0.to_keypair_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.0.sign(message)
    }

    pub fn to_string_checked(&self) -> String {
        encode_versioned(PRIVATE_KEY_VERSION, &self.to_bytes())
    }

    pub fn from_string_checked(s: &str) -> Result<PrivateKey, KeyError> {
        let raw = decode_versioned(PRIVATE_KEY_VERSION, s)?;
        PrivateKey::from_bytes(&raw)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print private key material.
        f.write_str("PrivateKey(..)")
    }
}

/// A full signing identity: keypair plus cached public half.
#[derive(Debug, Clone)]
pub struct Identity {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl Identity {
    pub fn generate() -> Identity {
        let signing = SigningKey::generate(&mut OsRng);
        Identity {
            public: PublicKey(signing.verifying_key()),
            private: PrivateKey(signing),
        }
    }

    pub fn from_private(private: PrivateKey) -> Identity {
        Identity {
            public: private.public_key(),
            private,
        }
    }
}

fn encode_versioned(version: u8, payload: &[u8]) -> String {
    bs58::encode(payload)
        .with_check_version(version)
        .into_string()
}

fn decode_versioned(version: u8, s: &str) -> Result<Vec<u8>, KeyError> {
    let decoded = bs58::decode(s)
        .with_check(Some(version))
        .into_vec()
        .map_err(|_| KeyError::InvalidEncoding)?;
    // with_check keeps the version byte at the front
    Ok(decoded[1..].to_vec())
}
