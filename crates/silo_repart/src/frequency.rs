//! Approximate top-K counting of communication edges.
//!
//! Filtered Space-Saving: a fixed-capacity set of tracked counters kept in a
//! min-heap so the cheapest eviction victim is always at the root, plus a
//! power-of-two table of approximate counts for currently untracked keys.
//! The table lets a hot key that was evicted (or never admitted) accumulate
//! weight until it can displace the minimum, and caps the over-admission a
//! cold key can achieve.
//!
//! For any tracked key, `count - error <= true occurrences <= count`.

use std::collections::HashMap;

use crate::ids::{hash64, Edge};

/// Sketch table size multiplier; bounds collision-induced over-admission.
const SKETCH_CAPACITY_MULTIPLIER: usize = 6;

const HASH_SEED: u64 = 0x7c1e_60d9_a4f2_33b5;

const ARITY: usize = 4;
const NO_SLOT: u32 = u32::MAX;

#[derive(Debug)]
struct CounterSlot {
    edge: Edge,
    count: u64,
    error: u64,
    heap_index: u32,
}

/// Space-Saving edge counter with an auxiliary rejection sketch.
#[derive(Debug)]
pub struct FrequentEdgeCounter {
    capacity: usize,
    slots: Vec<CounterSlot>,
    /// Min-heap of slot ids ordered by count.
    heap: Vec<u32>,
    index: HashMap<Edge, u32>,
    sketch: Vec<u64>,
    bucket_mask: u64,
}

impl FrequentEdgeCounter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let buckets = (capacity * SKETCH_CAPACITY_MULTIPLIER).next_power_of_two();
        Self {
            capacity,
            slots: Vec::with_capacity(capacity),
            heap: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            sketch: vec![0; buckets],
            bucket_mask: (buckets - 1) as u64,
        }
    }

    /// Number of tracked edges.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Tracked edges with their count estimate and error bound.
    pub fn elements(&self) -> impl Iterator<Item = (&Edge, u64, u64)> {
        self.slots.iter().map(|slot| (&slot.edge, slot.count, slot.error))
    }

    /// Records one observation of `edge`.
    pub fn add(&mut self, edge: Edge) {
        if let Some(&slot) = self.index.get(&edge) {
            self.slots[slot as usize].count += 1;
            let heap_index = self.slots[slot as usize].heap_index;
            self.sift_down(heap_index as usize);
            return;
        }

        if self.slots.len() < self.capacity {
            let slot = self.slots.len() as u32;
            self.slots.push(CounterSlot {
                edge,
                count: 1,
                error: 0,
                heap_index: self.heap.len() as u32,
            });
            self.heap.push(slot);
            self.index.insert(edge, slot);
            self.sift_up(self.heap.len() - 1);
            return;
        }

        let bucket = self.bucket(&edge);
        let estimate = self.sketch[bucket];
        let min_slot = self.heap[0];
        if estimate + 1 < self.slots[min_slot as usize].count {
            // Not yet heavy enough to displace the minimum.
            self.sketch[bucket] = estimate + 1;
            return;
        }

        // Displace the minimum, seeding its bucket so it can be fast-tracked
        // back in if it recurs.
        let victim = &mut self.slots[min_slot as usize];
        let evicted_edge = victim.edge;
        let evicted_count = victim.count;
        victim.edge = edge;
        victim.count = estimate + 1;
        victim.error = estimate;
        debug_assert_eq!(victim.heap_index, 0);
        self.index.remove(&evicted_edge);
        self.index.insert(edge, min_slot);
        let evicted_bucket = self.bucket(&evicted_edge);
        self.sketch[evicted_bucket] = evicted_count;
        self.sift_down(0);
    }

    /// Stops tracking `edge` and clears its sketch bucket. Used to purge
    /// stale weights after a migration touching either endpoint.
    pub fn remove(&mut self, edge: &Edge) {
        let Some(slot) = self.index.remove(edge) else {
            return;
        };
        let bucket = self.bucket(edge);
        self.sketch[bucket] = 0;
        self.detach_from_heap(slot);
        self.release_slot(slot);
    }

    /// Drops all tracked counters and sketch contents.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.heap.clear();
        self.index.clear();
        self.sketch.fill(0);
    }

    fn bucket(&self, edge: &Edge) -> usize {
        (hash64(edge, HASH_SEED) & self.bucket_mask) as usize
    }

    fn detach_from_heap(&mut self, slot: u32) {
        let heap_index = self.slots[slot as usize].heap_index as usize;
        let last = self.heap.len() - 1;
        self.heap.swap(heap_index, last);
        self.heap.pop();
        self.slots[slot as usize].heap_index = NO_SLOT;
        if heap_index < self.heap.len() {
            let moved = self.heap[heap_index];
            self.slots[moved as usize].heap_index = heap_index as u32;
            self.sift_down(heap_index);
            self.sift_up(self.slots[moved as usize].heap_index as usize);
        }
    }

    /// Swap-removes `slot` from the arena, fixing up references to the slot
    /// that takes its place.
    fn release_slot(&mut self, slot: u32) {
        let last = (self.slots.len() - 1) as u32;
        if slot != last {
            self.slots.swap(slot as usize, last as usize);
            let moved = &self.slots[slot as usize];
            self.index.insert(moved.edge, slot);
            self.heap[moved.heap_index as usize] = slot;
        }
        self.slots.pop();
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / ARITY;
            if self.count_at(index) >= self.count_at(parent) {
                break;
            }
            self.swap_heap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let first_child = index * ARITY + 1;
            if first_child >= self.heap.len() {
                break;
            }
            let last_child = (first_child + ARITY).min(self.heap.len());
            let mut best = first_child;
            for child in first_child + 1..last_child {
                if self.count_at(child) < self.count_at(best) {
                    best = child;
                }
            }
            if self.count_at(best) >= self.count_at(index) {
                break;
            }
            self.swap_heap(index, best);
            index = best;
        }
    }

    fn count_at(&self, heap_index: usize) -> u64 {
        self.slots[self.heap[heap_index] as usize].count
    }

    fn swap_heap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.slots[self.heap[a] as usize].heap_index = a as u32;
        self.slots[self.heap[b] as usize].heap_index = b as u32;
    }
}
