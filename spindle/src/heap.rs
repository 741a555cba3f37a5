// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! A binary heap whose entries can be removed from any position.
//!
//! Every entry lives in a slot arena and remembers where it currently sits
//! in the heap array, so removing an entry that is not at the top (a
//! cancelled timer, for instance) costs `O(log n)` instead of a linear scan.

use crate::free_list::{FreeList, Idx};
use std::{fmt, mem};

/// The ordering predicate of a [`Heap`].
///
/// `order(a, b)` must return `true` when `a` should come before `b`, or when
/// both are equivalent. A `<=` comparison gives a min-heap, `>=` a max-heap.
pub type HeapOrder<T> = fn(&T, &T) -> bool;

/// Identifies an entry stored in a [`Heap`].
///
/// Keys stay valid until their entry is removed. A key whose entry is gone
/// never resolves again, even if its storage gets reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapKey(Idx);

#[derive(Debug)]
struct HeapNode<T> {
    value: T,
    position: usize,
}

/// Priority queue with arbitrary-position removal.
///
/// # Examples
///
/// ```
/// use spindle::heap::Heap;
///
/// let mut heap: Heap<i32> = Heap::new(|a, b| a <= b);
/// heap.add(7);
/// let middle = heap.add(3);
/// heap.add(5);
///
/// assert_eq!(heap.remove(middle), Some(3));
/// assert_eq!(heap.remove_top().map(|(_, v)| v), Some(5));
/// assert_eq!(heap.remove_top().map(|(_, v)| v), Some(7));
/// assert!(heap.top().is_none());
/// ```
pub struct Heap<T> {
    nodes: FreeList<HeapNode<T>>,
    slots: Vec<Idx>,
    order: HeapOrder<T>,
}

impl<T: fmt::Debug> fmt::Debug for Heap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("len", &self.slots.len())
            .field("top", &self.top().map(|(_, v)| v))
            .finish()
    }
}

impl<T> Heap<T> {
    /// Creates an empty heap ordered by `order`.
    pub fn new(order: HeapOrder<T>) -> Heap<T> {
        Heap {
            nodes: FreeList::default(),
            slots: Vec::new(),
            order,
        }
    }

    /// Number of entries in the heap.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the heap holds no entry.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Inserts `value` and returns the key that can later remove it.
    pub fn add(&mut self, value: T) -> HeapKey {
        let position = self.slots.len();
        let idx = self.nodes.alloc(HeapNode { value, position });
        self.slots.push(idx);
        self.sift_up(position);
        HeapKey(idx)
    }

    /// Removes the entry behind `key`, wherever it sits.
    ///
    /// Returns `None` if the entry was already removed.
    pub fn remove(&mut self, key: HeapKey) -> Option<T> {
        let position = self.nodes.get(key.0)?.position;
        Some(self.remove_at(position))
    }

    /// Peeks at the entry that orders first.
    pub fn top(&self) -> Option<(HeapKey, &T)> {
        let idx = *self.slots.first()?;
        self.nodes.get(idx).map(|node| (HeapKey(idx), &node.value))
    }

    /// Removes the entry that orders first.
    pub fn remove_top(&mut self) -> Option<(HeapKey, T)> {
        let idx = *self.slots.first()?;
        Some((HeapKey(idx), self.remove_at(0)))
    }

    /// Looks up the entry behind `key`.
    pub fn get(&self, key: HeapKey) -> Option<&T> {
        self.nodes.get(key.0).map(|node| &node.value)
    }

    /// Whether `key` still refers to an entry of this heap.
    pub fn contains(&self, key: HeapKey) -> bool {
        self.nodes.contains(key.0)
    }

    /// Moves every entry and the ordering predicate into a new heap, leaving
    /// this one empty and usable with the same predicate.
    ///
    /// Keys issued before the transfer resolve in the returned heap.
    pub fn take(&mut self) -> Heap<T> {
        let empty = Heap::new(self.order);
        mem::replace(self, empty)
    }

    fn remove_at(&mut self, position: usize) -> T {
        let last = self.slots.len() - 1;
        self.swap(position, last);
        let idx = self.slots.pop().unwrap_or_else(|| unreachable!());
        if position < last {
            if position > 0 && self.precedes(position, (position - 1) / 2) {
                self.sift_up(position);
            } else {
                self.sift_down(position);
            }
        }
        match self.nodes.dealloc(idx) {
            Some(node) => node.value,
            None => unreachable!("heap slot points at a freed node"),
        }
    }

    fn sift_up(&mut self, mut position: usize) {
        while position > 0 {
            let parent = (position - 1) / 2;
            if !self.precedes(position, parent) {
                break;
            }
            self.swap(position, parent);
            position = parent;
        }
    }

    fn sift_down(&mut self, mut position: usize) {
        let len = self.slots.len();
        loop {
            let left = 2 * position + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.precedes(right, left) {
                right
            } else {
                left
            };
            if !self.precedes(child, position) {
                break;
            }
            self.swap(position, child);
            position = child;
        }
    }

    /// Whether the entry at `a` must move above the entry at `b`.
    fn precedes(&self, a: usize, b: usize) -> bool {
        let a = &self.node(a).value;
        let b = &self.node(b).value;
        !(self.order)(b, a)
    }

    fn node(&self, position: usize) -> &HeapNode<T> {
        match self.nodes.get(self.slots[position]) {
            Some(node) => node,
            None => unreachable!("heap slot points at a freed node"),
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.slots.swap(a, b);
        for position in [a, b] {
            if let Some(node) = self.nodes.get_mut(self.slots[position]) {
                node.position = position;
            }
        }
    }
}
