// Application seam.
//
// The core decides chain shape; the application decides meaning. It supplies
// the payload type, classifies incoming transactions for the miner, and is
// told whenever the ledger head advances or rewinds so it can replay or
// roll back execution state.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::consensus::chain::{Blockchain, MemoryChain};
use crate::crypto::hash::BlockHash;
use crate::primitives::block::Block;
use crate::primitives::payload::{Payload, TransactionPayload};
use crate::primitives::transaction::Transaction;

/// Tri-state pool admission verdict. `Future` transactions wait in the
/// miner's aside buffer for more ledger state to accrue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Now,
    Future,
    Never,
}

pub trait Application: Send + Sync + 'static {
    type Payload: Payload;
    type Chain: Blockchain<Payload = Self::Payload>;

    /// Classify a transaction against current state plus the given pending
    /// pool (transactions already queued for the next block).
    fn can_accept(&self, tx: &Transaction, pool: &[Transaction]) -> Acceptance;

    /// The ledger appended `block`; called once per block in chain order.
    fn head_advanced(&self, block: &Block<Self::Payload>);

    /// The ledger unwound back to `to` (exclusive of anything above it).
    fn head_unwound(&self, to: &Block<Self::Payload>);
}

/// Reference application over `TransactionPayload`: tracks each invoker's
/// next expected counter, the way the SQL layer's metadata table does.
pub struct CounterApplication {
    state: Mutex<CounterState>,
}

#[derive(Default)]
struct CounterState {
    next: HashMap<[u8; 32], u64>,
    /// Per-block undo entries: (block signature, displaced counter values).
    undo: Vec<(BlockHash, Vec<([u8; 32], Option<u64>)>)>,
}

impl CounterApplication {
    pub fn new() -> CounterApplication {
        CounterApplication {
            state: Mutex::new(CounterState::default()),
        }
    }

    pub fn next_counter(&self, invoker: &[u8; 32]) -> u64 {
        let state = self.lock();
        state.next.get(invoker).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CounterApplication {
    fn default() -> Self {
        Self::new()
    }
}

impl Application for CounterApplication {
    type Payload = TransactionPayload;
    type Chain = MemoryChain<TransactionPayload>;

    fn can_accept(&self, tx: &Transaction, pool: &[Transaction]) -> Acceptance {
        let expected = self.next_counter(tx.invoker.as_bytes());
        if tx.counter < expected {
            return Acceptance::Never;
        }
        // Pool entries from the same invoker fill the gap below this one.
        let ahead = pool
            .iter()
            .filter(|p| {
                p.invoker == tx.invoker && p.counter >= expected && p.counter < tx.counter
            })
            .count() as u64;
        if tx.counter == expected + ahead {
            Acceptance::Now
        } else {
            Acceptance::Future
        }
    }

    fn head_advanced(&self, block: &Block<TransactionPayload>) {
        let Some(signature) = block.signature else {
            return;
        };
        let mut state = self.lock();
        let mut displaced = Vec::new();
        for tx in block.payload.transactions() {
            let key = *tx.invoker.as_bytes();
            let old = state.next.insert(key, tx.counter + 1);
            displaced.push((key, old));
        }
        state.undo.push((signature, displaced));
    }

    fn head_unwound(&self, to: &Block<TransactionPayload>) {
        let target = to.signature;
        let mut state = self.lock();
        while state
            .undo
            .last()
            .is_some_and(|(sig, _)| Some(*sig) != target)
        {
            let Some((_, displaced)) = state.undo.pop() else {
                break;
            };
            // Revert in reverse application order.
            for (key, old) in displaced.into_iter().rev() {
                match old {
                    Some(v) => {
                        state.next.insert(key, v);
                    }
                    None => {
                        state.next.remove(&key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BLOCK_VERSION, Limits};
    use crate::crypto::keys::Identity;

    fn mock_block(txs: &[Transaction], index: u64) -> Block<TransactionPayload> {
        let limits = Limits::default();
        let mut payload = TransactionPayload::empty();
        for tx in txs {
            assert!(payload.append(tx, &limits));
        }
        let mut b = Block {
            version: BLOCK_VERSION,
            index,
            nonce: 0,
            previous: BlockHash::of(b"prev"),
            miner: BlockHash::ZERO,
            timestamp: 1_700_000_000,
            payload,
            signature: None,
        };
        b.seal();
        b
    }

    #[test]
    fn test_accepts_in_counter_order() {
        let app = CounterApplication::new();
        let id = Identity::generate();
        let t0 = Transaction::new(&id, 0, "SELECT 0;");
        let t1 = Transaction::new(&id, 1, "SELECT 1;");

        assert_eq!(app.can_accept(&t0, &[]), Acceptance::Now);
        assert_eq!(app.can_accept(&t1, &[]), Acceptance::Future);
        // With t0 pooled, t1 becomes immediately minable.
        assert_eq!(app.can_accept(&t1, std::slice::from_ref(&t0)), Acceptance::Now);
    }

    #[test]
    fn test_replayed_counter_is_never() {
        let app = CounterApplication::new();
        let id = Identity::generate();
        let t0 = Transaction::new(&id, 0, "SELECT 0;");

        app.head_advanced(&mock_block(std::slice::from_ref(&t0), 1));
        assert_eq!(app.can_accept(&t0, &[]), Acceptance::Never);
    }

    #[test]
    fn test_unwind_restores_counters() {
        let app = CounterApplication::new();
        let id = Identity::generate();
        let t0 = Transaction::new(&id, 0, "SELECT 0;");
        let t1 = Transaction::new(&id, 1, "SELECT 1;");

        let base = mock_block(&[], 1);
        app.head_advanced(&base);
        let b1 = mock_block(std::slice::from_ref(&t0), 2);
        app.head_advanced(&b1);
        let b2 = mock_block(std::slice::from_ref(&t1), 3);
        app.head_advanced(&b2);
        assert_eq!(app.next_counter(id.public.as_bytes()), 2);

        app.head_unwound(&base);
        assert_eq!(app.next_counter(id.public.as_bytes()), 0);
        assert_eq!(app.can_accept(&t0, &[]), Acceptance::Now);
    }
}
