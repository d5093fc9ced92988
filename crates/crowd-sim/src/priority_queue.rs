//! Max-priority queue ordered by a key extracted from each item

use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry<T, K> {
    key: K,
    seq: usize,
    item: T,
}

impl<T, K: PartialOrd> PartialEq for Entry<T, K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, K: PartialOrd> Eq for Entry<T, K> {}

impl<T, K: PartialOrd> PartialOrd for Entry<T, K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, K: PartialOrd> Ord for Entry<T, K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Larger key first, then insertion order
        self.key
            .partial_cmp(&other.key)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pops items with the largest key first. Items with equal keys come out in
/// insertion order, so draining is deterministic.
///
/// The crowd uses it to serve the agents that have waited longest first, both
/// when admitting path requests and when picking corridors to re-optimize.
pub struct KeyedPriorityQueue<T, K, F>
where
    F: Fn(&T) -> K,
    K: PartialOrd,
{
    heap: BinaryHeap<Entry<T, K>>,
    key: F,
    seq: usize,
}

impl<T, K, F> KeyedPriorityQueue<T, K, F>
where
    F: Fn(&T) -> K,
    K: PartialOrd,
{
    pub fn new(key: F) -> Self {
        Self {
            heap: BinaryHeap::new(),
            key,
            seq: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        let key = (self.key)(&item);
        self.heap.push(Entry {
            key,
            seq: self.seq,
            item,
        });
        self.seq += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|e| e.item)
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|e| &e.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

impl<T, K, F> Iterator for KeyedPriorityQueue<T, K, F>
where
    F: Fn(&T) -> K,
    K: PartialOrd,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.pop()
    }
}
