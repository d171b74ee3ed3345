// Small shared containers with no opinions about consensus.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash as StdHash;
use std::time::{Duration, Instant};

/// Insertion-ordered, capacity-bounded set. Inserting past capacity evicts
/// the oldest entry; duplicates are refused.
pub struct OrderedSet<K: Eq + StdHash + Clone, V> {
    order: VecDeque<(K, V)>,
    keys: HashSet<K>,
    capacity: usize,
}

impl<K: Eq + StdHash + Clone, V> OrderedSet<K, V> {
    pub fn with_capacity(capacity: usize) -> Self {
        OrderedSet {
            order: VecDeque::new(),
            keys: HashSet::new(),
            capacity,
        }
    }

    /// False when the key is already present.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        while self.order.len() >= self.capacity
            && let Some((evicted, _)) = self.order.pop_front()
        {
            self.keys.remove(&evicted);
        }
        self.keys.insert(key.clone());
        self.order.push_back((key, value));
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    /// Empty the set, yielding values oldest-first.
    pub fn drain(&mut self) -> Vec<V> {
        self.keys.clear();
        self.order.drain(..).map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.order.iter().map(|(_, v)| v)
    }
}

/// Admission control for one connection: requests are served with a minimum
/// spacing, a bounded number may wait for their slot, and the rest are
/// dropped silently.
pub struct Throttle {
    interval: Duration,
    backlog: u32,
    next_free: Instant,
}

impl Throttle {
    pub fn new(interval: Duration, backlog: u32) -> Self {
        Throttle {
            interval,
            backlog,
            next_free: Instant::now(),
        }
    }

    /// Some(delay) reserves the next service slot; None drops the request.
    pub fn admit(&mut self, now: Instant) -> Option<Duration> {
        if self.next_free <= now {
            self.next_free = now + self.interval;
            return Some(Duration::ZERO);
        }
        let waiting = (self.next_free - now).as_nanos() / self.interval.as_nanos().max(1);
        if waiting > self.backlog as u128 {
            return None;
        }
        let delay = self.next_free - now;
        self.next_free += self.interval;
        Some(delay)
    }
}
