// Blocks: immutable header + payload, signed by SHA-256 over the canonical
// byte layout below. Mutable only while mining; frozen once sealed.
//
// Signing layout (all integers little-endian):
//   version(8) ‖ index(8) ‖ nonce(8) ‖ previous(32) ‖ miner(32)
//   ‖ timestamp(8, omitted for genesis) ‖ SHA256(payload signing bytes)

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{BLOCK_VERSION, Limits};
use crate::crypto::hash::BlockHash;
use crate::primitives::payload::Payload;
use crate::primitives::transaction::Transaction;

#[derive(Debug, Clone, PartialEq)]
pub struct Block<P: Payload> {
    pub version: u64,
    pub index: u64,
    pub nonce: u64,
    pub previous: BlockHash,
    /// Identity hash of the miner that sealed this block.
    pub miner: BlockHash,
    /// Unix seconds. Not part of the signed bytes for genesis.
    pub timestamp: u64,
    pub payload: P,
    pub signature: Option<BlockHash>,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl<P: Payload> Block<P> {
    /// The chain's deterministic first block: mined from nonce 0 so every
    /// node derives the same chain identity from the same seed.
    pub fn genesis(seed: &[u8], difficulty: usize) -> Block<P> {
        let mut block = Block {
            version: BLOCK_VERSION,
            index: 0,
            nonce: 0,
            previous: BlockHash::ZERO,
            miner: BlockHash::ZERO,
            timestamp: 0,
            payload: P::genesis(seed),
            signature: None,
        };
        block.mine(difficulty);
        block
    }

    /// A placeholder block for the miner to fill; previous and index are
    /// overwritten against the live chain head before each mining round.
    pub fn template(miner: &BlockHash) -> Block<P> {
        Block {
            version: BLOCK_VERSION,
            index: 1,
            nonce: 0,
            previous: BlockHash::of(&[]),
            miner: *miner,
            timestamp: unix_now(),
            payload: P::empty(),
            signature: None,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous == BlockHash::ZERO
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        self.signing_bytes_with_payload_digest(&self.payload_digest())
    }

    /// Digest of the payload's signing form; constant across a nonce search.
    pub fn payload_digest(&self) -> BlockHash {
        BlockHash::of(&self.payload.signing_bytes())
    }

    pub fn signing_bytes_with_payload_digest(&self, payload_digest: &BlockHash) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(8 * 4 + 32 * 3);
        buffer.extend_from_slice(&self.version.to_le_bytes());
        buffer.extend_from_slice(&self.index.to_le_bytes());
        buffer.extend_from_slice(&self.nonce.to_le_bytes());
        buffer.extend_from_slice(self.previous.as_bytes());
        buffer.extend_from_slice(self.miner.as_bytes());
        if !self.is_genesis() {
            buffer.extend_from_slice(&self.timestamp.to_le_bytes());
        }
        buffer.extend_from_slice(payload_digest.as_bytes());
        buffer
    }

    pub fn computed_signature(&self) -> BlockHash {
        BlockHash::of(&self.signing_bytes())
    }

    pub fn is_signature_valid(&self) -> bool {
        match self.signature {
            Some(sig) => sig == self.computed_signature(),
            None => false,
        }
    }

    /// Leading zero bits of the signature; 0 when unsealed.
    pub fn work(&self) -> usize {
        self.signature.map(|s| s.difficulty()).unwrap_or(0)
    }

    /// Freeze the block at its current contents.
    pub fn seal(&mut self) {
        self.signature = Some(self.computed_signature());
    }

    /// Search nonces upward from the current one until the signature meets
    /// the difficulty, then seal. Synchronous; the miner's interruptible
    /// loop batches this per `Limits::mine_batch` instead.
    pub fn mine(&mut self, difficulty: usize) {
        loop {
            let candidate = self.computed_signature();
            if candidate.difficulty() >= difficulty {
                self.signature = Some(candidate);
                return;
            }
            self.nonce = self.nonce.wrapping_add(1);
        }
    }

    pub fn has_room_for(&self, tx: &Transaction, limits: &Limits) -> bool {
        self.signature.is_none() && self.payload.has_room_for(tx, limits)
    }

    /// Delegates to the payload, which may refuse (room exhausted or
    /// duplicate). Only unsealed blocks accept transactions.
    pub fn append(&mut self, tx: &Transaction, limits: &Limits) -> bool {
        if self.signature.is_some() {
            return false;
        }
        let appended = self.payload.append(tx, limits);
        if appended {
            // Contents changed; any previous nonce search is void.
            self.signature = None;
        }
        appended
    }
}
