// Mining loop: keep a template filled from the pool, search nonces in
// batches, and re-read the chain head between batches so a stale template is
// rebuilt instead of mined to waste.
//
// Transactions the application classifies `Future` wait in the bounded
// `aside` buffer; every head change re-evaluates them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::consensus::app::{Acceptance, Application};
use crate::consensus::ledger::Ledger;
use crate::crypto::hash::BlockHash;
use crate::primitives::block::{Block, unix_now};
use crate::primitives::payload::Payload;
use crate::primitives::transaction::Transaction;
use crate::util::OrderedSet;

/// How long the worker naps while waiting for its own mined block to land.
const HEAD_WAIT: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MinerError {
    #[error("unsigned transaction cannot be mined")]
    UnsignedTransaction,
}

pub struct Miner<A: Application> {
    ledger: Arc<Ledger<A>>,
    inner: Mutex<MinerInner<A::Payload>>,
    enabled: AtomicBool,
    running: AtomicBool,
    miner_id: BlockHash,
    nonce_seed: u64,
    mined: mpsc::UnboundedSender<Block<A::Payload>>,
}

struct MinerInner<P: Payload> {
    template: Block<P>,
    aside: OrderedSet<BlockHash, Transaction>,
    /// Head signature the template was last built against.
    base: Option<BlockHash>,
}

impl<A: Application> Miner<A> {
    pub fn new(
        ledger: Arc<Ledger<A>>,
        miner_id: BlockHash,
        mined: mpsc::UnboundedSender<Block<A::Payload>>,
    ) -> Arc<Miner<A>> {
        let aside_capacity = ledger.limits().max_aside_transactions;
        Arc::new(Miner {
            ledger,
            inner: Mutex::new(MinerInner {
                template: Block::template(&miner_id),
                aside: OrderedSet::with_capacity(aside_capacity),
                base: None,
            }),
            enabled: AtomicBool::new(true),
            running: AtomicBool::new(false),
            miner_id,
            nonce_seed: rand::random(),
            mined,
        })
    }

    fn lock(&self) -> MutexGuard<'_, MinerInner<A::Payload>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if enabled {
            self.start();
        }
    }

    /// True when the transaction already sits in the template or aside.
    pub fn knows(&self, tx: &Transaction) -> bool {
        let hash = tx.hash();
        let inner = self.lock();
        inner.aside.contains(&hash)
            || inner
                .template
                .payload
                .transactions()
                .iter()
                .any(|t| t.hash() == hash)
    }

    /// Admit a transaction. Ok(true) when it entered the template, Ok(false)
    /// when it was set aside or discarded.
    pub fn append(self: &Arc<Self>, tx: Transaction) -> Result<bool, MinerError> {
        if !tx.is_signature_valid() {
            return Err(MinerError::UnsignedTransaction);
        }
        let limits = self.ledger.limits().clone();
        let added = {
            let mut inner = self.lock();
            if inner.aside.contains(&tx.hash()) {
                return Ok(false);
            }
            match self
                .ledger
                .can_accept(&tx, inner.template.payload.transactions())
            {
                Acceptance::Never => {
                    debug!(tx = %tx.hash(), "transaction refused outright");
                    return Ok(false);
                }
                Acceptance::Future => {
                    debug!(tx = %tx.hash(), "transaction set aside");
                    inner.aside.insert(tx.hash(), tx);
                    return Ok(false);
                }
                Acceptance::Now => {
                    if inner.template.append(&tx, &limits) {
                        true
                    } else {
                        // Template full (or duplicate): defer instead.
                        inner.aside.insert(tx.hash(), tx);
                        false
                    }
                }
            }
        };
        if added {
            self.start();
        }
        Ok(added)
    }

    /// Called whenever the ledger head moved, from any source: promote
    /// `aside` entries that became minable and drop the dead ones.
    pub fn head_changed(self: &Arc<Self>) {
        let head = self.ledger.highest();
        let Some(head_signature) = head.signature else {
            return;
        };
        let has_work = {
            let mut inner = self.lock();
            self.rebuild_locked(&mut inner, head_signature);
            !inner.template.payload.transactions().is_empty()
        };
        if has_work {
            self.start();
        }
    }

    /// Spawn the worker thread unless one is already running.
    pub fn start(self: &Arc<Self>) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let miner = self.clone();
        std::thread::spawn(move || miner.mine_loop());
    }

    fn mine_loop(&self) {
        let limits = self.ledger.limits().clone();
        let mut nonce = self.nonce_seed;

        loop {
            if !self.enabled.load(Ordering::Relaxed) {
                break;
            }
            let head = self.ledger.highest();
            let Some(head_signature) = head.signature else {
                break;
            };

            // Copy the template under the lock; mine outside it.
            let mut candidate = {
                let mut inner = self.lock();
                if inner.base != Some(head_signature) {
                    self.rebuild_locked(&mut inner, head_signature);
                }
                if inner.template.payload.transactions().is_empty()
                    || !inner.template.payload.is_valid()
                {
                    // Nothing worth mining; stop until new work arrives.
                    self.running.store(false, Ordering::SeqCst);
                    return;
                }
                inner.template.clone()
            };
            candidate.previous = head_signature;
            candidate.index = head.index + 1;
            candidate.timestamp = unix_now();
            candidate.nonce = nonce;
            candidate.signature = None;

            let required = self.ledger.difficulty_for_next();
            let payload_digest = candidate.payload_digest();
            let mut sealed = None;
            for _ in 0..limits.mine_batch {
                let attempt = BlockHash::of(
                    &candidate.signing_bytes_with_payload_digest(&payload_digest),
                );
                if attempt.difficulty() >= required {
                    candidate.signature = Some(attempt);
                    sealed = Some(candidate.clone());
                    break;
                }
                candidate.nonce = candidate.nonce.wrapping_add(1);
            }
            nonce = candidate.nonce;

            if let Some(block) = sealed {
                info!(
                    index = block.index,
                    hash = %block.signature.unwrap(),
                    work = block.work(),
                    "mined block"
                );
                if self.mined.send(block).is_err() {
                    break;
                }
                // Wait for the node to apply it (or for a rival head) before
                // building the next template.
                while self.enabled.load(Ordering::Relaxed)
                    && self.ledger.highest().signature == Some(head_signature)
                {
                    std::thread::sleep(HEAD_WAIT);
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Rebuild the template against `head_signature`, carrying over every
    /// transaction from the old template and `aside` that is still `Now`;
    /// `Future` entries stay aside, `Never` entries are dropped for good.
    fn rebuild_locked(&self, inner: &mut MinerInner<A::Payload>, head_signature: BlockHash) {
        let limits = self.ledger.limits().clone();
        let mut carried: Vec<Transaction> = inner.template.payload.transactions().to_vec();
        carried.extend(inner.aside.drain());

        let mut template: Block<A::Payload> = Block::template(&self.miner_id);
        let capacity = limits.max_aside_transactions;
        let mut aside = OrderedSet::with_capacity(capacity);
        for tx in carried {
            match self.ledger.can_accept(&tx, template.payload.transactions()) {
                Acceptance::Now => {
                    if !template.append(&tx, &limits) {
                        aside.insert(tx.hash(), tx);
                    }
                }
                Acceptance::Future => {
                    aside.insert(tx.hash(), tx);
                }
                Acceptance::Never => {
                    debug!(tx = %tx.hash(), "dropped dead transaction on rebuild");
                }
            }
        }
        inner.template = template;
        inner.aside = aside;
        inner.base = Some(head_signature);
    }

    pub fn aside_len(&self) -> usize {
        self.lock().aside.len()
    }

    pub fn template_transactions(&self) -> Vec<Transaction> {
        self.lock().template.payload.transactions().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::consensus::app::CounterApplication;
    use crate::consensus::chain::MemoryChain;
    use crate::crypto::keys::Identity;
    use crate::primitives::payload::TransactionPayload;

    const DIFFICULTY: usize = 4;

    fn mock_setup() -> (
        Arc<Ledger<CounterApplication>>,
        Arc<Miner<CounterApplication>>,
        mpsc::UnboundedReceiver<Block<TransactionPayload>>,
    ) {
        let genesis = Block::<TransactionPayload>::genesis(b"miner test", DIFFICULTY);
        let chain = MemoryChain::with_difficulty(genesis, DIFFICULTY).unwrap();
        let ledger = Arc::new(Ledger::new(
            chain,
            Arc::new(CounterApplication::new()),
            Limits::default(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let miner = Miner::new(ledger.clone(), BlockHash::of(b"miner id"), tx);
        (ledger, miner, rx)
    }

    #[test]
    fn test_unsigned_transaction_refused() {
        let (_ledger, miner, _rx) = mock_setup();
        let id = Identity::generate();
        let mut tx = Transaction::new(&id, 0, "SELECT 1;");
        tx.counter = 7; // breaks the signature
        assert_eq!(
            miner.append(tx),
            Err(MinerError::UnsignedTransaction)
        );
    }

    #[test]
    fn test_future_transaction_goes_aside() {
        let (_ledger, miner, _rx) = mock_setup();
        miner.set_enabled(false);
        let id = Identity::generate();
        // Counter 1 while 0 is still unseen: eligible later, not now.
        let early = Transaction::new(&id, 1, "SELECT 1;");
        assert_eq!(miner.append(early.clone()), Ok(false));
        assert_eq!(miner.aside_len(), 1);
        assert!(miner.knows(&early));
        assert!(miner.template_transactions().is_empty());
    }

    #[test]
    fn test_aside_promotion_on_head_change() {
        let (ledger, miner, _rx) = mock_setup();
        miner.set_enabled(false);
        let id = Identity::generate();
        let first = Transaction::new(&id, 0, "SELECT 0;");
        let second = Transaction::new(&id, 1, "SELECT 1;");

        assert_eq!(miner.append(second.clone()), Ok(false));
        assert_eq!(miner.aside_len(), 1);

        // A block carrying counter 0 lands; counter 1 becomes minable.
        let genesis = ledger.genesis();
        let limits = Limits::default();
        let mut b1 = Block::<TransactionPayload>::template(&BlockHash::of(b"other miner"));
        b1.previous = genesis.signature.unwrap();
        b1.index = 1;
        b1.timestamp = unix_now() - 60;
        assert!(b1.append(&first, &limits));
        b1.mine(DIFFICULTY);
        assert!(ledger.receive(b1).unwrap());

        miner.head_changed();
        assert_eq!(miner.aside_len(), 0);
        let pending = miner.template_transactions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hash(), second.hash());
    }

    #[test]
    fn test_never_transaction_never_promoted() {
        let (ledger, miner, _rx) = mock_setup();
        miner.set_enabled(false);
        let id = Identity::generate();
        let first = Transaction::new(&id, 0, "SELECT 0;");

        // Land counter 0 on-chain first.
        let genesis = ledger.genesis();
        let limits = Limits::default();
        let mut b1 = Block::<TransactionPayload>::template(&BlockHash::of(b"other miner"));
        b1.previous = genesis.signature.unwrap();
        b1.index = 1;
        b1.timestamp = unix_now() - 60;
        assert!(b1.append(&first, &limits));
        b1.mine(DIFFICULTY);
        assert!(ledger.receive(b1).unwrap());

        // The same counter again is dead on arrival and stays dead.
        assert_eq!(miner.append(first.clone()), Ok(false));
        assert_eq!(miner.aside_len(), 0);
        miner.head_changed();
        assert!(miner.template_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_mines_pending_transaction() {
        let (ledger, miner, mut rx) = mock_setup();
        let id = Identity::generate();
        let tx = Transaction::new(&id, 0, "INSERT INTO t VALUES (1);");
        assert_eq!(miner.append(tx.clone()), Ok(true));

        let block = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("mining timed out")
            .expect("miner channel closed");
        assert_eq!(block.index, 1);
        assert!(block.is_signature_valid());
        assert!(block.work() >= DIFFICULTY);
        assert_eq!(block.payload.transactions()[0].hash(), tx.hash());

        // The payload commits to exactly the transactions mined.
        assert_eq!(block.payload.signing_bytes(), tx.signing_bytes());

        miner.set_enabled(false);
        assert!(ledger.receive(block).unwrap());
    }
}
