// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::mem;

/// A handle into a [`FreeList`].
///
/// Slots are recycled, so every handle also carries the generation of the
/// slot it was issued for. A handle whose slot has since been freed (and
/// maybe reused) no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Idx {
    raw: usize,
    generation: u64,
}

impl Idx {
    #[cfg(test)]
    pub(crate) fn to_raw(self) -> usize {
        self.raw
    }
}

#[derive(Debug)]
pub(crate) struct FreeList<T> {
    first_free: Option<usize>,
    slots: Vec<Slot<T>>,
    len: usize,
}

impl<T> Default for FreeList<T> {
    fn default() -> Self {
        FreeList {
            first_free: None,
            slots: Vec::new(),
            len: 0,
        }
    }
}

impl<T> FreeList<T> {
    pub(crate) fn alloc(&mut self, item: T) -> Idx {
        self.len += 1;
        match self.first_free {
            Some(raw) => {
                let slot = &mut self.slots[raw];
                let generation = slot.generation.wrapping_add(1);
                self.first_free = match mem::replace(&mut slot.entry, Entry::Full(item)) {
                    Entry::Free { next_free } => next_free,
                    Entry::Full(_) => unreachable!("free list head points at a full slot"),
                };
                slot.generation = generation;
                Idx { raw, generation }
            }
            None => {
                let raw = self.slots.len();
                self.slots.push(Slot {
                    generation: 0,
                    entry: Entry::Full(item),
                });
                Idx { raw, generation: 0 }
            }
        }
    }

    /// Releases the slot behind `idx`, returning its item. Stale handles are
    /// ignored.
    pub(crate) fn dealloc(&mut self, idx: Idx) -> Option<T> {
        let slot = self.slots.get_mut(idx.raw)?;
        if slot.generation != idx.generation || !slot.is_full() {
            return None;
        }
        let freed = Entry::Free {
            next_free: self.first_free.replace(idx.raw),
        };
        self.len -= 1;
        match mem::replace(&mut slot.entry, freed) {
            Entry::Full(item) => Some(item),
            Entry::Free { .. } => unreachable!(),
        }
    }

    pub(crate) fn get(&self, idx: Idx) -> Option<&T> {
        match self.slots.get(idx.raw) {
            Some(Slot {
                generation,
                entry: Entry::Full(item),
            }) if *generation == idx.generation => Some(item),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, idx: Idx) -> Option<&mut T> {
        match self.slots.get_mut(idx.raw) {
            Some(Slot {
                generation,
                entry: Entry::Full(item),
            }) if *generation == idx.generation => Some(item),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, idx: Idx) -> bool {
        self.get(idx).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    entry: Entry<T>,
}

impl<T> Slot<T> {
    fn is_full(&self) -> bool {
        matches!(self.entry, Entry::Full(_))
    }
}

#[derive(Debug)]
enum Entry<T> {
    Free { next_free: Option<usize> },
    Full(T),
}

#[test]
fn free_list_smoke_test() {
    let mut free_list: FreeList<&str> = FreeList::default();

    let hello = free_list.alloc("hello");
    assert_eq!(hello.to_raw(), 0);

    let world = free_list.alloc("world");
    assert_eq!(world.to_raw(), 1);

    assert_eq!(free_list.get(hello), Some(&"hello"));
    assert_eq!(free_list.get(world), Some(&"world"));
    assert_eq!(free_list.len(), 2);

    assert_eq!(free_list.dealloc(hello), Some("hello"));
    assert_eq!(free_list.dealloc(hello), None);

    let goodbye = free_list.alloc("goodbye");
    assert_eq!(goodbye.to_raw(), 0);
    assert_ne!(goodbye, hello);

    free_list.dealloc(goodbye);
    free_list.dealloc(world);
    assert_eq!(free_list.len(), 0);

    let a = free_list.alloc("a");
    let b = free_list.alloc("b");
    let c = free_list.alloc("c");
    assert_eq!(a.to_raw(), 1);
    assert_eq!(b.to_raw(), 0);
    assert_eq!(c.to_raw(), 2);
}

#[test]
fn stale_handles_do_not_resolve() {
    let mut free_list = FreeList::default();
    let first = free_list.alloc(1);
    free_list.dealloc(first);
    let second = free_list.alloc(2);

    assert_eq!(first.to_raw(), second.to_raw());
    assert!(!free_list.contains(first));
    assert!(free_list.get_mut(first).is_none());
    assert_eq!(free_list.get(second), Some(&2));
}
