// The fetcher serializes block downloads: one outstanding `fetch` at a
// time, candidates deduplicated by (hash, peer). Orphan-gap resolution
// re-enqueues the next missing ancestor against the same peer, bounded by
// the extra-blocks budget.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::crypto::hash::BlockHash;

/// A head (or gap ancestor) some peer claims to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub hash: BlockHash,
    pub height: u64,
    pub peer: Uuid,
}

pub struct Fetcher {
    queue: mpsc::UnboundedSender<(Candidate, u32)>,
    seen: Mutex<HashSet<(BlockHash, Uuid)>>,
}

impl Fetcher {
    pub fn new() -> (Fetcher, mpsc::UnboundedReceiver<(Candidate, u32)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Fetcher {
                queue: tx,
                seen: Mutex::new(HashSet::new()),
            },
            rx,
        )
    }

    /// Queue a candidate; duplicates are dropped. `hops` counts how many
    /// ancestors this gap walk has already pulled.
    pub fn add(&self, candidate: Candidate, hops: u32) -> bool {
        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert((candidate.hash, candidate.peer)) {
                return false;
            }
        }
        self.queue.send((candidate, hops)).is_ok()
    }

    /// Allow a hash to be fetched again (after a failed or mismatched
    /// answer from the peer that advertised it).
    pub fn forget(&self, candidate: &Candidate) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.remove(&(candidate.hash, candidate.peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_by_hash_and_peer() {
        let (fetcher, mut rx) = Fetcher::new();
        let peer = Uuid::new_v4();
        let candidate = Candidate {
            hash: BlockHash::of(b"head"),
            height: 9,
            peer,
        };

        assert!(fetcher.add(candidate, 0));
        assert!(!fetcher.add(candidate, 0));
        // Same hash from a different peer is a distinct candidate.
        let other = Candidate {
            peer: Uuid::new_v4(),
            ..candidate
        };
        assert!(fetcher.add(other, 0));

        assert_eq!(rx.try_recv().unwrap().0, candidate);
        assert_eq!(rx.try_recv().unwrap().0, other);
        assert!(rx.try_recv().is_err());

        // Forgetting re-opens the slot.
        fetcher.forget(&candidate);
        assert!(fetcher.add(candidate, 1));
    }
}
