// Consensus vectors: deterministic genesis, chain invariants, reorgs, and
// orphan resolution against the in-memory chain.

use std::sync::Arc;

use catena::config::{BLOCK_VERSION, Limits};
use catena::consensus::app::CounterApplication;
use catena::consensus::chain::MemoryChain;
use catena::consensus::ledger::Ledger;
use catena::crypto::hash::BlockHash;
use catena::primitives::block::{Block, unix_now};
use catena::primitives::payload::{Payload, TransactionPayload};

type TestBlock = Block<TransactionPayload>;
type TestLedger = Ledger<CounterApplication>;

const DIFFICULTY: usize = 4;

fn make_ledger(seed: &[u8]) -> TestLedger {
    let genesis = TestBlock::genesis(seed, DIFFICULTY);
    let chain = MemoryChain::with_difficulty(genesis, DIFFICULTY).unwrap();
    Ledger::new(
        chain,
        Arc::new(CounterApplication::new()),
        Limits::default(),
    )
}

fn next_block(prev: &TestBlock, timestamp: u64) -> TestBlock {
    let mut b = TestBlock {
        version: BLOCK_VERSION,
        index: prev.index + 1,
        nonce: 0,
        previous: prev.signature.unwrap(),
        miner: BlockHash::of(b"vector miner"),
        timestamp,
        payload: TransactionPayload::empty(),
        signature: None,
    };
    b.mine(DIFFICULTY);
    b
}

#[test]
fn sanity_hash_vector() {
    assert_eq!(
        BlockHash::of(b"Catena").to_hex(),
        "13ab80a5ba95216129ea9d996937b4ed57faf7473e81288d99689da4d5f1d483"
    );
}

#[test]
fn deterministic_genesis_from_empty_seed() {
    // Seed "", difficulty 10, search from nonce 0: every implementation
    // must land on the same smallest nonce.
    let a = TestBlock::genesis(b"", 10);
    let b = TestBlock::genesis(b"", 10);

    assert_eq!(a, b);
    assert!(a.work() >= 10);
    assert_eq!(a.version, 1);
    assert_eq!(a.index, 0);
    assert_eq!(a.previous, BlockHash::ZERO);
    assert_eq!(a.miner, BlockHash::ZERO);
    assert_eq!(a.payload.signing_bytes(), b"");

    // Minimality: no smaller nonce meets the target.
    let mut probe = a.clone();
    probe.signature = None;
    for nonce in 0..a.nonce {
        probe.nonce = nonce;
        assert!(probe.computed_signature().difficulty() < 10);
    }
}

#[test]
fn chain_invariants_hold_along_the_chain() {
    let ledger = make_ledger(b"invariants");
    let base = unix_now() - 1000;
    let mut prev = ledger.genesis();
    for i in 0..5u64 {
        let b = next_block(&prev, base + i * 10);
        assert!(ledger.receive(b.clone()).unwrap());
        prev = b;
    }

    // Walk the chain head-to-genesis checking linkage, signatures, work.
    let mut current = ledger.highest();
    assert_eq!(current.index, 5);
    while current.index > 0 {
        assert!(current.is_signature_valid());
        assert_eq!(
            current.signature.unwrap(),
            BlockHash::of(&current.signing_bytes())
        );
        assert!(current.work() >= DIFFICULTY);
        let parent = ledger.get(&current.previous).expect("parent reachable");
        assert_eq!(parent.index + 1, current.index);
        assert_eq!(parent.signature.unwrap(), current.previous);
        current = parent;
    }
    assert!(current.is_genesis());
}

#[test]
fn splice_replaces_shorter_suffix() {
    // Chain A(genesis) -> B -> C, then a longer rival B' -> C' -> D'.
    let ledger = make_ledger(b"splice vector");
    let a = ledger.genesis();
    let t = unix_now() - 1000;

    let b = next_block(&a, t);
    let c = next_block(&b, t + 10);
    assert!(ledger.receive(b.clone()).unwrap());
    assert!(ledger.receive(c.clone()).unwrap());

    let b2 = next_block(&a, t + 1);
    let c2 = next_block(&b2, t + 11);
    let d2 = next_block(&c2, t + 21);
    assert!(!ledger.receive(b2.clone()).unwrap());
    assert!(!ledger.receive(c2.clone()).unwrap());
    assert!(ledger.receive(d2.clone()).unwrap());

    assert_eq!(ledger.highest().signature, d2.signature);
    assert!(ledger.highest().index >= c.index);
    assert!(ledger.get(&b.signature.unwrap()).is_none());
    assert!(ledger.get(&c.signature.unwrap()).is_none());
}

#[test]
fn orphan_at_five_names_the_missing_fourth() {
    // Head at 3; a block at 5 arrives early.
    let ledger = make_ledger(b"orphan vector");
    let t = unix_now() - 1000;
    let mut prev = ledger.genesis();
    for i in 0..3u64 {
        let b = next_block(&prev, t + i * 10);
        assert!(ledger.receive(b.clone()).unwrap());
        prev = b;
    }
    let b4 = next_block(&prev, t + 40);
    let b5 = next_block(&b4, t + 50);

    assert!(!ledger.receive(b5.clone()).unwrap());
    assert_eq!(ledger.highest().index, 3);
    let (missing_index, missing_hash) = ledger.earliest_root(&b5);
    assert_eq!(missing_index, 4);
    assert_eq!(missing_hash, b4.signature.unwrap());

    // Delivering the gap extends straight to 5.
    assert!(ledger.receive(b4).unwrap());
    assert_eq!(ledger.highest().index, 5);
    assert_eq!(ledger.highest().signature, b5.signature);
}

#[test]
fn receive_is_idempotent() {
    let ledger = make_ledger(b"idempotent");
    let b1 = next_block(&ledger.genesis(), unix_now() - 100);
    assert!(ledger.receive(b1.clone()).unwrap());
    assert!(!ledger.receive(b1.clone()).unwrap());
    assert_eq!(ledger.highest().signature, b1.signature);
}

#[test]
fn gossiped_genesis_decodes_as_genesis_payload() {
    use catena::net::protocol::BlockBody;

    let genesis = TestBlock::genesis(b"wire genesis", DIFFICULTY);
    let body = BlockBody::from_block(&genesis).unwrap();
    let decoded: TestBlock = body.to_block().unwrap();
    assert_eq!(decoded, genesis);
    assert!(decoded.is_signature_valid());
    assert_eq!(decoded.payload.signing_bytes(), b"wire genesis");
}
