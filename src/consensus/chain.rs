// Blockchain contract and the in-memory implementation.
//
// A chain presents a consistent linear view from genesis to head; all
// mutation happens under the ledger's lock. Difficulty for a follow-on
// block is a pure function of its predecessor.

use std::collections::HashMap;

use crate::crypto::hash::BlockHash;
use crate::primitives::block::Block;
use crate::primitives::payload::Payload;

/// Timestamps of this many trailing non-genesis blocks feed the median rule.
pub const MEDIAN_WINDOW: usize = 11;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("genesis block is malformed or unsigned")]
    InvalidGenesis,
    #[error("block {0} is not on this chain")]
    UnknownBlock(BlockHash),
}

pub trait Blockchain: Send + 'static {
    type Payload: Payload;

    fn genesis(&self) -> &Block<Self::Payload>;
    fn highest(&self) -> &Block<Self::Payload>;
    fn get(&self, hash: &BlockHash) -> Option<&Block<Self::Payload>>;

    /// Append after revalidating against the current head; false when the
    /// block does not extend it.
    fn append(&mut self, block: Block<Self::Payload>) -> bool;

    /// Drop blocks above `to` so it becomes the head again.
    fn unwind(&mut self, to: &BlockHash) -> Result<(), ChainError>;

    /// Required difficulty for the block following `after`.
    fn difficulty_for(&self, after: &Block<Self::Payload>) -> usize;

    fn can_append(&self, block: &Block<Self::Payload>, to: &Block<Self::Payload>) -> bool {
        can_append_with(block, to, self.difficulty_for(to), &|h| {
            self.get(h).cloned()
        })
    }
}

/// The append rule, parameterized over ancestry lookup so the ledger can
/// validate a projected sidechain the same way the chain validates its own
/// head extension.
pub fn can_append_with<P: Payload>(
    block: &Block<P>,
    to: &Block<P>,
    required_difficulty: usize,
    lookup: &dyn Fn(&BlockHash) -> Option<Block<P>>,
) -> bool {
    if !block.is_signature_valid() || !block.payload.is_valid() {
        return false;
    }
    if to.signature != Some(block.previous) || block.index != to.index + 1 {
        return false;
    }
    if block.work() < required_difficulty {
        return false;
    }
    match median_timestamp(to, lookup) {
        Some(median) => block.timestamp > median,
        None => true,
    }
}

/// Median of the timestamps of up to [`MEDIAN_WINDOW`] most recent
/// non-genesis blocks ending at `to`; the mean of the two middles for even
/// counts. None when `to` is genesis.
pub fn median_timestamp<P: Payload>(
    to: &Block<P>,
    lookup: &dyn Fn(&BlockHash) -> Option<Block<P>>,
) -> Option<u64> {
    let mut stamps = Vec::with_capacity(MEDIAN_WINDOW);
    let mut current = to.clone();
    while stamps.len() < MEDIAN_WINDOW && !current.is_genesis() {
        stamps.push(current.timestamp);
        match lookup(&current.previous) {
            Some(prev) => current = prev,
            None => break,
        }
    }
    if stamps.is_empty() {
        return None;
    }
    stamps.sort_unstable();
    let n = stamps.len();
    if n % 2 == 1 {
        Some(stamps[n / 2])
    } else {
        Some((stamps[n / 2 - 1] + stamps[n / 2]) / 2)
    }
}

/// In-memory chain with a constant difficulty policy. Deployments that
/// persist through the application or retarget difficulty implement
/// [`Blockchain`] themselves; the append rule is shared.
pub struct MemoryChain<P: Payload> {
    blocks: Vec<Block<P>>,
    index: HashMap<BlockHash, usize>,
    difficulty: usize,
}

impl<P: Payload> MemoryChain<P> {
    /// Difficulty defaults to the work the genesis block was mined at.
    pub fn new(genesis: Block<P>) -> Result<MemoryChain<P>, ChainError> {
        let difficulty = genesis.work();
        Self::with_difficulty(genesis, difficulty)
    }

    pub fn with_difficulty(
        genesis: Block<P>,
        difficulty: usize,
    ) -> Result<MemoryChain<P>, ChainError> {
        if !genesis.is_genesis() || !genesis.is_signature_valid() {
            return Err(ChainError::InvalidGenesis);
        }
        let Some(signature) = genesis.signature else {
            return Err(ChainError::InvalidGenesis);
        };
        let mut index = HashMap::new();
        index.insert(signature, 0);
        Ok(MemoryChain {
            blocks: vec![genesis],
            index,
            difficulty,
        })
    }

    pub fn height(&self) -> u64 {
        self.highest().index
    }
}

impl<P: Payload> Blockchain for MemoryChain<P> {
    type Payload = P;

    fn genesis(&self) -> &Block<P> {
        &self.blocks[0]
    }

    fn highest(&self) -> &Block<P> {
        self.blocks.last().unwrap()
    }

    fn get(&self, hash: &BlockHash) -> Option<&Block<P>> {
        self.index.get(hash).map(|&i| &self.blocks[i])
    }

    fn append(&mut self, block: Block<P>) -> bool {
        if !self.can_append(&block, self.highest()) {
            return false;
        }
        let Some(signature) = block.signature else {
            return false;
        };
        self.index.insert(signature, self.blocks.len());
        self.blocks.push(block);
        true
    }

    fn unwind(&mut self, to: &BlockHash) -> Result<(), ChainError> {
        let position = *self.index.get(to).ok_or(ChainError::UnknownBlock(*to))?;
        for dropped in self.blocks.drain(position + 1..) {
            if let Some(sig) = dropped.signature {
                self.index.remove(&sig);
            }
        }
        Ok(())
    }

    fn difficulty_for(&self, _after: &Block<P>) -> usize {
        self.difficulty
    }
}
