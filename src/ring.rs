//! Fixed-capacity containers for the append-only histories.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Append-only ring. Once full, each push evicts the oldest entry.
/// `total()` keeps counting past evictions.
#[derive(Debug, Clone)]
pub struct RingLog<T> {
    buf: VecDeque<T>,
    cap: usize,
    total: u64,
}

impl<T> RingLog<T> {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { buf: VecDeque::with_capacity(cap), cap, total: 0 }
    }

    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.buf.len() == self.cap { self.buf.pop_front() } else { None };
        self.buf.push_back(value);
        self.total += 1;
        evicted
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    /// Last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<&T> {
        let skip = self.buf.len().saturating_sub(n);
        self.buf.iter().skip(skip).collect()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.total = 0;
    }
}

/// Bounded membership set for recently seen keys (bar timestamps,
/// idempotency keys).
///
/// Insertion order is kept in a ring; when the set grows past `cap` the
/// oldest half is evicted in one step.
#[derive(Debug, Clone)]
pub struct RecentSet<T> {
    order: VecDeque<T>,
    members: HashSet<T>,
    cap: usize,
}

impl<T: Hash + Eq + Clone> RecentSet<T> {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(2);
        Self { order: VecDeque::with_capacity(cap + 1), members: HashSet::with_capacity(cap + 1), cap }
    }

    pub fn contains(&self, key: &T) -> bool {
        self.members.contains(key)
    }

    pub fn insert(&mut self, key: T) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.cap {
            // For bar timestamps ingestion enforces increasing order, so the
            // front half is also the numerically oldest half.
            let evict = self.cap / 2;
            for old in self.order.drain(..evict) {
                self.members.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_log_evicts_oldest() {
        let mut log = RingLog::new(3);
        assert_eq!(log.push(1), None);
        log.push(2);
        log.push(3);
        assert_eq!(log.push(4), Some(1));
        assert_eq!(log.len(), 3);
        assert_eq!(log.total(), 4);
        assert_eq!(log.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_ring_log_tail() {
        let mut log = RingLog::new(10);
        for i in 0..5 {
            log.push(i);
        }
        assert_eq!(log.tail(2), vec![&3, &4]);
        assert_eq!(log.tail(50).len(), 5);
    }

    #[test]
    fn test_recent_set_trims_half_past_cap() {
        let mut set = RecentSet::new(10);
        for ts in 0..10 {
            assert!(set.insert(ts));
        }
        assert_eq!(set.len(), 10);
        set.insert(10);
        // 11 entries > cap 10 -> evict 5 oldest
        assert_eq!(set.len(), 6);
        assert!(!set.contains(&0));
        assert!(!set.contains(&4));
        assert!(set.contains(&5));
        assert!(set.contains(&10));
    }

    #[test]
    fn test_recent_set_rejects_repeat() {
        let mut set = RecentSet::new(10);
        assert!(set.insert("sig-7".to_string()));
        assert!(!set.insert("sig-7".to_string()));
        assert_eq!(set.len(), 1);
    }
}
