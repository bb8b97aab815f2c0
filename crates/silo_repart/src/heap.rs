//! Quaternary max-heap over externally owned elements.
//!
//! The heap stores dense element ids; the elements themselves live in an
//! arena owned by the caller, exposed through [`HeapStore`]. Each element
//! records its own position so membership checks are O(1) and an element
//! whose priority was mutated in place can be restored to heap order in
//! O(log n) without searching for it.

/// Sentinel recorded for elements not currently resident in a heap.
pub const NO_HEAP_INDEX: u32 = u32::MAX;

const ARITY: usize = 4;

/// Backing storage for heap elements.
///
/// `set_heap_index` must persist the given index so a later `heap_index`
/// call returns it; the heap writes [`NO_HEAP_INDEX`] when an element is
/// removed.
pub trait HeapStore {
    fn score(&self, id: u32) -> i64;
    fn heap_index(&self, id: u32) -> u32;
    fn set_heap_index(&mut self, id: u32, index: u32);
}

/// Array-backed 4-ary max-heap keyed by [`HeapStore::score`].
#[derive(Debug, Default)]
pub struct MaxHeap {
    slots: Vec<u32>,
}

impl MaxHeap {
    /// Builds a heap from an unordered id list via bottom-up heapify, O(n).
    pub fn heapify<S: HeapStore>(ids: Vec<u32>, store: &mut S) -> Self {
        let mut heap = Self { slots: ids };
        for (index, &id) in heap.slots.iter().enumerate() {
            store.set_heap_index(id, index as u32);
        }
        if heap.slots.len() > 1 {
            let last_parent = (heap.slots.len() - 2) / ARITY;
            for index in (0..=last_parent).rev() {
                heap.sift_down(index, store);
            }
        }
        heap
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The id of the maximum element, without removing it.
    pub fn peek(&self) -> Option<u32> {
        self.slots.first().copied()
    }

    /// Removes and returns the maximum element's id.
    pub fn try_pop<S: HeapStore>(&mut self, store: &mut S) -> Option<u32> {
        let top = *self.slots.first()?;
        store.set_heap_index(top, NO_HEAP_INDEX);
        let last = self.slots.pop().expect("heap is non-empty");
        if !self.slots.is_empty() {
            self.slots[0] = last;
            store.set_heap_index(last, 0);
            self.sift_down(0, store);
        }
        Some(top)
    }

    /// Restores heap order after `id`'s score increased in place. No-op when
    /// the element is not resident.
    pub fn on_increase_priority<S: HeapStore>(&mut self, id: u32, store: &mut S) {
        let index = store.heap_index(id);
        if index == NO_HEAP_INDEX {
            return;
        }
        self.sift_up(index as usize, store);
    }

    /// Restores heap order after `id`'s score decreased in place. No-op when
    /// the element is not resident.
    pub fn on_decrease_priority<S: HeapStore>(&mut self, id: u32, store: &mut S) {
        let index = store.heap_index(id);
        if index == NO_HEAP_INDEX {
            return;
        }
        self.sift_down(index as usize, store);
    }

    fn sift_up<S: HeapStore>(&mut self, mut index: usize, store: &mut S) {
        while index > 0 {
            let parent = (index - 1) / ARITY;
            if store.score(self.slots[index]) <= store.score(self.slots[parent]) {
                break;
            }
            self.swap(index, parent, store);
            index = parent;
        }
    }

    fn sift_down<S: HeapStore>(&mut self, mut index: usize, store: &mut S) {
        loop {
            let first_child = index * ARITY + 1;
            if first_child >= self.slots.len() {
                break;
            }
            let last_child = (first_child + ARITY).min(self.slots.len());
            let mut best = first_child;
            for child in first_child + 1..last_child {
                if store.score(self.slots[child]) > store.score(self.slots[best]) {
                    best = child;
                }
            }
            if store.score(self.slots[best]) <= store.score(self.slots[index]) {
                break;
            }
            self.swap(index, best, store);
            index = best;
        }
    }

    fn swap<S: HeapStore>(&mut self, a: usize, b: usize, store: &mut S) {
        self.slots.swap(a, b);
        store.set_heap_index(self.slots[a], a as u32);
        store.set_heap_index(self.slots[b], b as u32);
    }
}
