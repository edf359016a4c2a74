//! An intrusive, slab-backed doubly linked list ordering cache entries by
//! last-access time, oldest at the head. Kept as its own module because
//! [`super::TtlCache`] needs to unlink the head (eviction) and move an
//! arbitrary node to the tail (touch-on-access) in O(1), the same
//! motivation the crate's `asynclock` queue has for its own slab-backed
//! list (see `crate::asynclock::mod::QueueInner`).

use slab::Slab;

struct Node<K> {
    key: K,
    last_access: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

pub(super) struct Lru<K> {
    slab: Slab<Node<K>>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K> Lru<K> {
    pub(super) fn new() -> Self {
        Lru {
            slab: Slab::new(),
            head: None,
            tail: None,
        }
    }

    /// Inserts `key` as the most-recently-used entry, returning its stable
    /// slot index (unaffected by later `touch` calls).
    pub(super) fn push_tail(&mut self, key: K, last_access: u64) -> usize {
        let idx = self.slab.insert(Node {
            key,
            last_access,
            prev: self.tail,
            next: None,
        });
        self.link_as_tail(idx);
        idx
    }

    fn link_as_tail(&mut self, idx: usize) {
        match self.tail {
            Some(t) => self.slab[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = &self.slab[idx];
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.slab[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slab[n].prev = prev,
            None => self.tail = prev,
        }
    }

    /// Moves `idx` to the tail and refreshes its last-access stamp.
    pub(super) fn touch(&mut self, idx: usize, last_access: u64) {
        self.unlink(idx);
        self.slab[idx].prev = self.tail;
        self.slab[idx].next = None;
        self.link_as_tail(idx);
        self.slab[idx].last_access = last_access;
    }

    /// Removes `idx` entirely, returning its key.
    pub(super) fn remove(&mut self, idx: usize) -> K {
        self.unlink(idx);
        self.slab.remove(idx).key
    }

    /// The oldest entry's index and last-access stamp, if any.
    pub(super) fn peek_head(&self) -> Option<(usize, u64)> {
        let idx = self.head?;
        Some((idx, self.slab[idx].last_access))
    }

    pub(super) fn len(&self) -> usize {
        self.slab.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_remove_in_order() {
        let mut lru: Lru<&'static str> = Lru::new();
        let a = lru.push_tail("a", 1);
        let _b = lru.push_tail("b", 2);
        let _c = lru.push_tail("c", 3);
        assert_eq!(lru.peek_head(), Some((a, 1)));
        assert_eq!(lru.len(), 3);
        assert_eq!(lru.remove(a), "a");
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn touch_moves_to_tail() {
        let mut lru: Lru<&'static str> = Lru::new();
        let a = lru.push_tail("a", 1);
        let b = lru.push_tail("b", 2);
        lru.touch(a, 3);
        // "b" is now the oldest.
        assert_eq!(lru.peek_head(), Some((b, 2)));
        lru.touch(b, 4);
        assert_eq!(lru.peek_head(), Some((a, 3)));
    }
}
