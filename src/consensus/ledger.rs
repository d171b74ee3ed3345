// The ledger owns the longest chain and the orphan pool.
//
// `receive` is the single entry point for new blocks from any source (gossip,
// fetch, local miner). It fast-forwards, splices a longer sidechain in, or
// parks the block as an orphan for the fetcher to resolve. A splice is
// all-or-nothing: the sidechain is verified in full before the chain is
// touched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Limits;
use crate::consensus::app::{Acceptance, Application};
use crate::consensus::chain::{Blockchain, can_append_with};
use crate::crypto::hash::BlockHash;
use crate::primitives::block::{Block, unix_now};
use crate::primitives::transaction::Transaction;

/// Orphans older than this are dropped whenever the pool is touched.
const ORPHAN_MAX_AGE: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("block is not signed")]
    Unsigned,
    #[error("block signature does not match its contents")]
    InvalidSignature,
    #[error("block timestamp is too far in the future")]
    TooFarInFuture,
}

enum HeadEvent<P: crate::primitives::payload::Payload> {
    Advanced(Block<P>),
    Unwound(Block<P>),
}

pub struct Ledger<A: Application> {
    inner: Mutex<LedgerInner<A>>,
    app: Arc<A>,
    limits: Limits,
}

struct LedgerInner<A: Application> {
    chain: A::Chain,
    orphans: Orphans<A::Payload>,
}

impl<A: Application> Ledger<A> {
    pub fn new(chain: A::Chain, app: Arc<A>, limits: Limits) -> Ledger<A> {
        Ledger {
            inner: Mutex::new(LedgerInner {
                chain,
                orphans: Orphans::new(),
            }),
            app,
            limits,
        }
    }

    pub fn app(&self) -> &Arc<A> {
        &self.app
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner<A>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns whether the chain head changed. Idempotent: redelivery of a
    /// known block returns false.
    pub fn receive(&self, block: Block<A::Payload>) -> Result<bool, LedgerError> {
        let Some(signature) = block.signature else {
            return Err(LedgerError::Unsigned);
        };
        if !block.is_signature_valid() {
            return Err(LedgerError::InvalidSignature);
        }
        if !block.is_genesis()
            && block.timestamp > unix_now() + self.limits.future_threshold.as_secs()
        {
            return Err(LedgerError::TooFarInFuture);
        }

        let mut events = Vec::new();
        let changed = {
            let mut inner = self.lock();
            inner.orphans.prune(ORPHAN_MAX_AGE);
            inner.receive_locked(block, signature, &mut events)
        };
        // Hooks fire outside the ledger lock so the application may read the
        // ledger back.
        for event in events {
            match event {
                HeadEvent::Advanced(b) => self.app.head_advanced(&b),
                HeadEvent::Unwound(b) => self.app.head_unwound(&b),
            }
        }
        Ok(changed)
    }

    /// True when the block is neither on-chain nor parked as an orphan.
    pub fn is_new(&self, block: &Block<A::Payload>) -> bool {
        let signature = block
            .signature
            .unwrap_or_else(|| block.computed_signature());
        let inner = self.lock();
        inner.chain.get(&signature).is_none() && !inner.orphans.contains(&signature)
    }

    /// Walk the orphan pool's previous links from `from` to the earliest
    /// unknown ancestor: the (index, hash) the fetcher should request next.
    pub fn earliest_root(&self, from: &Block<A::Payload>) -> (u64, BlockHash) {
        let inner = self.lock();
        let mut current = from.clone();
        loop {
            match inner.orphans.get(&current.previous) {
                Some(parent) => current = parent,
                None => return (current.index.saturating_sub(1), current.previous),
            }
        }
    }

    pub fn highest(&self) -> Block<A::Payload> {
        self.lock().chain.highest().clone()
    }

    pub fn genesis(&self) -> Block<A::Payload> {
        self.lock().chain.genesis().clone()
    }

    pub fn get(&self, hash: &BlockHash) -> Option<Block<A::Payload>> {
        self.lock().chain.get(hash).cloned()
    }

    pub fn difficulty_for_next(&self) -> usize {
        let inner = self.lock();
        let head = inner.chain.highest();
        inner.chain.difficulty_for(head)
    }

    /// Memory-pool admission is the application's verdict.
    pub fn can_accept(&self, tx: &Transaction, pool: &[Transaction]) -> Acceptance {
        self.app.can_accept(tx, pool)
    }

    pub fn orphan_count(&self) -> usize {
        self.lock().orphans.len()
    }

    pub fn has_orphan(&self, hash: &BlockHash) -> bool {
        self.lock().orphans.contains(hash)
    }
}

impl<A: Application> LedgerInner<A> {
    fn receive_locked(
        &mut self,
        block: Block<A::Payload>,
        signature: BlockHash,
        events: &mut Vec<HeadEvent<A::Payload>>,
    ) -> bool {
        if self.chain.get(&signature).is_some() || self.orphans.contains(&signature) {
            return false;
        }

        let head = self.chain.highest().clone();
        if head.signature == Some(block.previous) && self.chain.can_append(&block, &head) {
            self.chain.append(block.clone());
            debug!(index = block.index, hash = %signature, "chain extended");
            events.push(HeadEvent::Advanced(block));
            self.drain_orphans(events);
            return true;
        }

        if block.index > head.index {
            return self.try_splice(block, head, events);
        }

        debug!(index = block.index, hash = %signature, "parked alternate block as orphan");
        self.orphans.insert(block);
        false
    }

    /// Attempt to replace the chain suffix with a longer sidechain ending at
    /// `block`. Either the whole sidechain applies or nothing changes.
    fn try_splice(
        &mut self,
        block: Block<A::Payload>,
        head: Block<A::Payload>,
        events: &mut Vec<HeadEvent<A::Payload>>,
    ) -> bool {
        // Walk previous pointers through the orphan pool until a block whose
        // parent is on-chain. Any hole means we cannot splice yet.
        let mut side = vec![block.clone()];
        loop {
            let previous = side.last().unwrap().previous;
            if self.chain.get(&previous).is_some() {
                break;
            }
            match self.orphans.get(&previous) {
                Some(parent) => side.push(parent),
                None => {
                    debug!(
                        index = block.index,
                        "sidechain has a gap; parking block for the fetcher"
                    );
                    self.orphans.insert(block);
                    return false;
                }
            }
        }
        side.reverse();

        let root_parent = self.chain.get(&side[0].previous).unwrap().clone();
        let side_by_sig: HashMap<BlockHash, Block<A::Payload>> = side
            .iter()
            .filter_map(|b| b.signature.map(|s| (s, b.clone())))
            .collect();

        // Verify every link against its projected predecessor before any
        // mutation; the lookup sees sidechain ancestry first.
        let mut predecessor = root_parent.clone();
        for candidate in &side {
            let required = self.chain.difficulty_for(&predecessor);
            let lookup = |h: &BlockHash| {
                side_by_sig
                    .get(h)
                    .cloned()
                    .or_else(|| self.chain.get(h).cloned())
            };
            if !can_append_with(candidate, &predecessor, required, &lookup) {
                debug!(index = candidate.index, "sidechain link failed validation");
                return false;
            }
            predecessor = candidate.clone();
        }

        let root_signature = root_parent.signature.unwrap();
        if root_parent.signature != head.signature {
            if self.chain.unwind(&root_signature).is_err() {
                warn!(root = %root_signature, "splice root vanished mid-receive");
                return false;
            }
            events.push(HeadEvent::Unwound(root_parent));
        }
        for accepted in side {
            let signature = accepted.signature.unwrap();
            if !self.chain.append(accepted.clone()) {
                // Fully verified above; a refusal here cannot roll back what
                // already applied, so surface it loudly.
                warn!(index = accepted.index, "verified sidechain block refused on append");
                break;
            }
            self.orphans.remove(&signature);
            events.push(HeadEvent::Advanced(accepted));
        }
        self.drain_orphans(events);
        true
    }

    /// Append any orphan chain that now extends the head.
    fn drain_orphans(&mut self, events: &mut Vec<HeadEvent<A::Payload>>) {
        loop {
            let head = self.chain.highest().clone();
            let Some(head_signature) = head.signature else {
                break;
            };
            let Some(next) = self.orphans.successor_of(&head_signature) else {
                break;
            };
            if !self.chain.can_append(&next, &head) || !self.chain.append(next.clone()) {
                break;
            }
            self.orphans.remove(&next.signature.unwrap());
            debug!(index = next.index, "drained orphan onto head");
            events.push(HeadEvent::Advanced(next));
        }
    }
}

/// The orphan pool: blocks whose ancestry is unknown or off-chain, indexed
/// both by their own signature and by the parent they wait for.
struct Orphans<P: crate::primitives::payload::Payload> {
    by_hash: HashMap<BlockHash, (Block<P>, Instant)>,
    by_previous: HashMap<BlockHash, BlockHash>,
}

impl<P: crate::primitives::payload::Payload> Orphans<P> {
    fn new() -> Self {
        Orphans {
            by_hash: HashMap::new(),
            by_previous: HashMap::new(),
        }
    }

    fn insert(&mut self, block: Block<P>) {
        let Some(signature) = block.signature else {
            return;
        };
        self.by_previous.insert(block.previous, signature);
        self.by_hash.insert(signature, (block, Instant::now()));
    }

    fn get(&self, hash: &BlockHash) -> Option<Block<P>> {
        self.by_hash.get(hash).map(|(b, _)| b.clone())
    }

    fn contains(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    fn successor_of(&self, previous: &BlockHash) -> Option<Block<P>> {
        let sig = self.by_previous.get(previous)?;
        self.get(sig)
    }

    fn remove(&mut self, hash: &BlockHash) {
        if let Some((block, _)) = self.by_hash.remove(hash)
            && self.by_previous.get(&block.previous) == Some(hash)
        {
            self.by_previous.remove(&block.previous);
        }
    }

    fn prune(&mut self, max_age: Duration) {
        let stale: Vec<BlockHash> = self
            .by_hash
            .iter()
            .filter(|(_, (_, at))| at.elapsed() > max_age)
            .map(|(h, _)| *h)
            .collect();
        for hash in stale {
            self.remove(&hash);
        }
    }

    fn len(&self) -> usize {
        self.by_hash.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BLOCK_VERSION;
    use crate::consensus::app::CounterApplication;
    use crate::consensus::chain::MemoryChain;
    use crate::primitives::payload::{Payload, TransactionPayload};

    type TestBlock = Block<TransactionPayload>;
    type TestLedger = Ledger<CounterApplication>;

    const DIFFICULTY: usize = 4;

    fn mock_ledger() -> (TestLedger, TestBlock) {
        let genesis = TestBlock::genesis(b"ledger test", DIFFICULTY);
        let chain = MemoryChain::with_difficulty(genesis.clone(), DIFFICULTY).unwrap();
        let ledger = Ledger::new(
            chain,
            Arc::new(CounterApplication::new()),
            Limits::default(),
        );
        (ledger, genesis)
    }

    fn mock_next(prev: &TestBlock, timestamp: u64) -> TestBlock {
        let mut b = TestBlock {
            version: BLOCK_VERSION,
            index: prev.index + 1,
            nonce: 0,
            previous: prev.signature.unwrap(),
            miner: BlockHash::of(b"m"),
            timestamp,
            payload: TransactionPayload::empty(),
            signature: None,
        };
        b.mine(DIFFICULTY);
        b
    }

    fn base_ts() -> u64 {
        unix_now() - 600
    }

    #[test]
    fn test_fast_forward_and_idempotency() {
        let (ledger, genesis) = mock_ledger();
        let b1 = mock_next(&genesis, base_ts());

        assert!(ledger.is_new(&b1));
        assert!(ledger.receive(b1.clone()).unwrap());
        assert!(!ledger.is_new(&b1));
        // Redelivery does not change the head.
        assert!(!ledger.receive(b1.clone()).unwrap());
        assert_eq!(ledger.highest().signature, b1.signature);
    }

    #[test]
    fn test_rejects_invalid_signature() {
        let (ledger, genesis) = mock_ledger();
        let mut b1 = mock_next(&genesis, base_ts());
        b1.timestamp += 1; // contents no longer match the seal
        assert_eq!(ledger.receive(b1), Err(LedgerError::InvalidSignature));
    }

    #[test]
    fn test_rejects_unsigned() {
        let (ledger, genesis) = mock_ledger();
        let mut b1 = mock_next(&genesis, base_ts());
        b1.signature = None;
        assert_eq!(ledger.receive(b1), Err(LedgerError::Unsigned));
    }

    #[test]
    fn test_far_future_block_not_orphaned() {
        let (ledger, genesis) = mock_ledger();
        let mut b1 = mock_next(&genesis, unix_now() + 3 * 3600);
        b1.mine(DIFFICULTY);
        assert_eq!(ledger.receive(b1), Err(LedgerError::TooFarInFuture));
        assert_eq!(ledger.orphan_count(), 0);
    }

    #[test]
    fn test_orphan_then_fill() {
        let (ledger, genesis) = mock_ledger();
        let t = base_ts();
        let b1 = mock_next(&genesis, t);
        let b2 = mock_next(&b1, t + 10);

        // Deliver the child first: parked, head unchanged.
        assert!(!ledger.receive(b2.clone()).unwrap());
        assert!(ledger.has_orphan(&b2.signature.unwrap()));
        let (missing_index, missing_hash) = ledger.earliest_root(&b2);
        assert_eq!(missing_index, 1);
        assert_eq!(missing_hash, b1.signature.unwrap());

        // Filling the gap drains the orphan onto the head.
        assert!(ledger.receive(b1).unwrap());
        assert_eq!(ledger.highest().signature, b2.signature);
        assert_eq!(ledger.orphan_count(), 0);
    }

    #[test]
    fn test_splice_replaces_suffix() {
        let (ledger, genesis) = mock_ledger();
        let t = base_ts();
        let b = mock_next(&genesis, t);
        let c = mock_next(&b, t + 10);
        assert!(ledger.receive(b.clone()).unwrap());
        assert!(ledger.receive(c.clone()).unwrap());

        // Competing sidechain from genesis, one block longer.
        let b2 = mock_next(&genesis, t + 1);
        let c2 = mock_next(&b2, t + 11);
        let d2 = mock_next(&c2, t + 21);

        assert!(!ledger.receive(b2.clone()).unwrap());
        assert!(!ledger.receive(c2.clone()).unwrap());
        // The third sidechain block outruns the head and triggers the splice.
        assert!(ledger.receive(d2.clone()).unwrap());

        assert_eq!(ledger.highest().signature, d2.signature);
        assert!(ledger.get(&b.signature.unwrap()).is_none());
        assert!(ledger.get(&c.signature.unwrap()).is_none());
        assert!(ledger.get(&b2.signature.unwrap()).is_some());
    }

    #[test]
    fn test_splice_is_atomic_on_bad_link() {
        let (ledger, genesis) = mock_ledger();
        let t = base_ts();
        let b = mock_next(&genesis, t);
        assert!(ledger.receive(b.clone()).unwrap());

        // Sidechain whose middle link carries a stale timestamp relative to
        // its own ancestry median once it grows long enough.
        let b2 = mock_next(&genesis, t + 100);
        let c2 = mock_next(&b2, t + 100); // not strictly greater than the median
        let d2 = mock_next(&c2, t + 200);

        assert!(!ledger.receive(b2).unwrap());
        assert!(!ledger.receive(c2).unwrap());
        assert!(!ledger.receive(d2).unwrap());
        // Chain untouched.
        assert_eq!(ledger.highest().signature, b.signature);
    }

    #[test]
    fn test_equal_height_alternate_is_parked() {
        let (ledger, genesis) = mock_ledger();
        let t = base_ts();
        let b = mock_next(&genesis, t);
        assert!(ledger.receive(b.clone()).unwrap());

        let rival = mock_next(&genesis, t + 5);
        assert!(!ledger.receive(rival.clone()).unwrap());
        assert!(ledger.has_orphan(&rival.signature.unwrap()));
        assert_eq!(ledger.highest().signature, b.signature);
    }
}
