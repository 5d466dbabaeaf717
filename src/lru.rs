//! Per-device replica arena and the two intrusive LRU rings.
//!
//! Replicas are arena slots addressed by index; the rings link slots through
//! prev/next indices instead of pointers, which keeps the datum ↔ replica
//! relationship acyclic. No locking here: every operation happens under the
//! device lease.

use {
    crate::data::{Data, DataCopy, NO_SLOT},
    std::sync::{atomic::Ordering, Arc},
};

pub(crate) const NIL: u32 = u32::MAX;

/// Which ring an arena slot currently sits in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ListId {
    /// Pinned by a task, in neither ring.
    None,

    /// Evictable replicas, oldest first.
    Free,

    /// Dirty replicas awaiting write-back, oldest first.
    Owned,
}

/// A live replica and the datum it mirrors.
pub(crate) struct ArenaEntry {
    pub data: Arc<Data>,
    pub copy: Arc<DataCopy>,
}

struct Slot {
    entry: Option<ArenaEntry>,
    prev: u32,
    next: u32,
    list: ListId,
}

/// Arena of live replicas on one device.
pub(crate) struct ReplicaArena {
    slots: Vec<Slot>,
    free_head: u32,
    len: usize,
}

impl ReplicaArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Stores `entry`, records the slot index on the replica, and returns it.
    pub fn insert(&mut self, entry: ArenaEntry) -> u32 {
        let slot = if self.free_head != NIL {
            let slot = self.free_head;
            self.free_head = self.slots[slot as usize].next;
            self.slots[slot as usize] = Slot {
                entry: Some(entry),
                prev: NIL,
                next: NIL,
                list: ListId::None,
            };

            slot
        } else {
            self.slots.push(Slot {
                entry: Some(entry),
                prev: NIL,
                next: NIL,
                list: ListId::None,
            });

            (self.slots.len() - 1) as u32
        };
        self.len += 1;
        if let Some(entry) = &self.slots[slot as usize].entry {
            entry.copy.arena_slot.store(slot, Ordering::Release);
        }

        slot
    }

    /// Removes a slot that is in no ring.
    pub fn remove(&mut self, slot: u32) -> Option<ArenaEntry> {
        debug_assert_eq!(self.slots[slot as usize].list, ListId::None);

        let entry = self.slots[slot as usize].entry.take()?;
        entry.copy.arena_slot.store(NO_SLOT, Ordering::Release);
        self.slots[slot as usize].next = self.free_head;
        self.free_head = slot;
        self.len -= 1;

        Some(entry)
    }

    pub fn get(&self, slot: u32) -> Option<&ArenaEntry> {
        self.slots.get(slot as usize).and_then(|slot| slot.entry.as_ref())
    }
}

/// One intrusive doubly-linked ring, FIFO ordered by access time.
pub(crate) struct LruList {
    id: ListId,
    head: u32,
    tail: u32,
    len: usize,
}

impl LruList {
    pub fn new(id: ListId) -> Self {
        debug_assert_ne!(id, ListId::None);

        Self {
            id,
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Oldest slot, if any.
    pub fn first(&self) -> Option<u32> {
        (self.head != NIL).then_some(self.head)
    }

    /// Slot after `slot` in ring order.
    pub fn next(&self, arena: &ReplicaArena, slot: u32) -> Option<u32> {
        let next = arena.slots[slot as usize].next;

        (next != NIL).then_some(next)
    }

    /// Appends at the tail (newest position).
    pub fn push_fifo(&mut self, arena: &mut ReplicaArena, slot: u32) {
        debug_assert_eq!(arena.slots[slot as usize].list, ListId::None);

        let s = &mut arena.slots[slot as usize];
        s.list = self.id;
        s.prev = self.tail;
        s.next = NIL;
        if self.tail != NIL {
            arena.slots[self.tail as usize].next = slot;
        } else {
            self.head = slot;
        }

        self.tail = slot;
        self.len += 1;
    }

    /// Prepends at the head (oldest position).
    pub fn push_lifo(&mut self, arena: &mut ReplicaArena, slot: u32) {
        debug_assert_eq!(arena.slots[slot as usize].list, ListId::None);

        let s = &mut arena.slots[slot as usize];
        s.list = self.id;
        s.prev = NIL;
        s.next = self.head;
        if self.head != NIL {
            arena.slots[self.head as usize].prev = slot;
        } else {
            self.tail = slot;
        }

        self.head = slot;
        self.len += 1;
    }

    /// Removes and returns the head (oldest).
    pub fn pop_fifo(&mut self, arena: &mut ReplicaArena) -> Option<u32> {
        let slot = self.first()?;
        self.chop(arena, slot);

        Some(slot)
    }

    pub fn contains(&self, arena: &ReplicaArena, slot: u32) -> bool {
        arena.slots[slot as usize].list == self.id
    }

    /// Unlinks `slot` from this ring; true when it was a member.
    pub fn chop(&mut self, arena: &mut ReplicaArena, slot: u32) -> bool {
        if arena.slots[slot as usize].list != self.id {
            return false;
        }

        let (prev, next) = {
            let s = &mut arena.slots[slot as usize];
            let links = (s.prev, s.next);
            s.prev = NIL;
            s.next = NIL;
            s.list = ListId::None;

            links
        };
        if prev != NIL {
            arena.slots[prev as usize].next = next;
        } else {
            self.head = next;
        }

        if next != NIL {
            arena.slots[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }

        self.len -= 1;

        true
    }
}
