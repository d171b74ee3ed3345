// SHA-256 block hashing. Difficulty is the number of leading zero bits.

use sha2::{Digest, Sha256};

pub const HASH_BYTES: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HashError {
    #[error("invalid hash length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("invalid hash encoding")]
    InvalidEncoding,
}

/// A 32-byte SHA-256 digest. The all-zero hash is the `previous` sentinel of
/// the genesis block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; HASH_BYTES]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; HASH_BYTES]);

    pub fn of(data: &[u8]) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(data);
        BlockHash(hasher.finalize().into())
    }

    /// Count of leading zero bits, stopping at the first non-zero byte.
    pub fn difficulty(&self) -> usize {
        let mut bits = 0usize;
        for b in self.0 {
            if b == 0 {
                bits += 8;
            } else {
                bits += b.leading_zeros() as usize;
                break;
            }
        }
        bits
    }

    pub fn from_slice(data: &[u8]) -> Result<BlockHash, HashError> {
        if data.len() != HASH_BYTES {
            return Err(HashError::InvalidLength(data.len()));
        }
        let mut h = [0u8; HASH_BYTES];
        h.copy_from_slice(data);
        Ok(BlockHash(h))
    }

    pub fn from_hex(s: &str) -> Result<BlockHash, HashError> {
        let bytes = hex::decode(s).map_err(|_| HashError::InvalidEncoding)?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<BlockHash, HashError> {
        let bytes = data_encoding::BASE64
            .decode(s.as_bytes())
            .map_err(|_| HashError::InvalidEncoding)?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        data_encoding::BASE64.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_BYTES] {
        &self.0
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl std::str::FromStr for BlockHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlockHash::from_hex(s)
    }
}
