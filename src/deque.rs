//! Intrusive access-ordered lists over the node table.
//!
//! Link fields live in a per-slot array owned by the policy rather than in
//! separately allocated list nodes, so linking, unlinking and reordering are
//! all O(1). Every list shares the same link array; an entry is linked into
//! at most one list at a time. Nothing here is synchronized: all mutation
//! happens under the maintenance lock.

const NIL: u32 = u32::MAX;

/// Previous/next pointers of one entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Links {
    prev: u32,
    next: u32,
}

impl Default for Links {
    fn default() -> Self {
        Self {
            prev: NIL,
            next: NIL,
        }
    }
}

impl Links {
    #[inline]
    fn is_linked(&self) -> bool {
        self.prev != NIL || self.next != NIL
    }
}

/// Doubly-linked list ordered from least (front) to most (back) recently used.
///
/// Operations other than [`contains`](Self::contains) require that the entry
/// belongs to this list (or, for `offer_last`, to no list). Violating that is
/// a logic error that corrupts the lists.
#[derive(Debug)]
pub(crate) struct AccessOrderDeque {
    head: u32,
    tail: u32,
    len: usize,
}

impl Default for AccessOrderDeque {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessOrderDeque {
    pub fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    #[inline]
    pub fn peek_first(&self) -> Option<u32> {
        (self.head != NIL).then_some(self.head)
    }

    /// The entry after `e` in access order.
    #[inline]
    pub fn next(links: &[Links], e: u32) -> Option<u32> {
        let next = links[e as usize].next;
        (next != NIL).then_some(next)
    }

    /// O(1) membership check: `e` has links or is this list's head.
    ///
    /// A linked entry of a different list also has links, so callers consult
    /// the entry's queue tag first.
    #[inline]
    pub fn contains(&self, links: &[Links], e: u32) -> bool {
        links[e as usize].is_linked() || self.head == e
    }

    /// Append `e` as the most recently used entry.
    pub fn offer_last(&mut self, links: &mut [Links], e: u32) {
        debug_assert!(!links[e as usize].is_linked(), "entry {e} is already linked");
        links[e as usize] = Links {
            prev: self.tail,
            next: NIL,
        };
        if self.tail == NIL {
            self.head = e;
        } else {
            links[self.tail as usize].next = e;
        }
        self.tail = e;
        self.len += 1;
    }

    /// Remove and return the least recently used entry.
    pub fn poll(&mut self, links: &mut [Links]) -> Option<u32> {
        let first = self.peek_first()?;
        self.remove(links, first);
        Some(first)
    }

    /// Unlink `e` from this list.
    pub fn remove(&mut self, links: &mut [Links], e: u32) {
        let Links { prev, next } = links[e as usize];

        if prev == NIL {
            self.head = next;
        } else {
            links[prev as usize].next = next;
        }

        if next == NIL {
            self.tail = prev;
        } else {
            links[next as usize].prev = prev;
        }

        links[e as usize] = Links::default();
        self.len -= 1;
    }

    /// Reorder `e` to the most recently used position.
    pub fn move_to_back(&mut self, links: &mut [Links], e: u32) {
        if self.tail != e {
            self.remove(links, e);
            self.offer_last(links, e);
        }
    }

    #[cfg(test)]
    /// Entries from least to most recently used.
    pub fn iter<'a>(&self, links: &'a [Links]) -> impl Iterator<Item = u32> + 'a {
        std::iter::successors(self.peek_first(), move |&e| Self::next(links, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(links: &mut [Links], entries: &[u32]) -> AccessOrderDeque {
        let mut deque = AccessOrderDeque::new();
        for &e in entries {
            deque.offer_last(links, e);
        }
        deque
    }

    #[test]
    fn offer_and_poll_in_fifo_order() {
        let mut links = vec![Links::default(); 4];
        let mut deque = list_of(&mut links, &[2, 0, 3]);
        assert_eq!(deque.len(), 3);
        assert_eq!(deque.iter(&links).collect::<Vec<_>>(), vec![2, 0, 3]);

        assert_eq!(deque.poll(&mut links), Some(2));
        assert_eq!(deque.poll(&mut links), Some(0));
        assert_eq!(deque.poll(&mut links), Some(3));
        assert_eq!(deque.poll(&mut links), None);
        assert!(deque.is_empty());
    }

    #[test]
    fn remove_from_the_middle() {
        let mut links = vec![Links::default(); 3];
        let mut deque = list_of(&mut links, &[0, 1, 2]);
        deque.remove(&mut links, 1);
        assert_eq!(deque.iter(&links).collect::<Vec<_>>(), vec![0, 2]);
        assert!(!deque.contains(&links, 1));
        assert_eq!(AccessOrderDeque::next(&links, 0), Some(2));
    }

    #[test]
    fn move_to_back_reorders() {
        let mut links = vec![Links::default(); 3];
        let mut deque = list_of(&mut links, &[0, 1, 2]);
        deque.move_to_back(&mut links, 0);
        assert_eq!(deque.iter(&links).collect::<Vec<_>>(), vec![1, 2, 0]);
        deque.move_to_back(&mut links, 0);
        assert_eq!(deque.iter(&links).collect::<Vec<_>>(), vec![1, 2, 0]);
    }

    #[test]
    fn single_entry_is_contained_without_links() {
        let mut links = vec![Links::default(); 2];
        let mut deque = list_of(&mut links, &[1]);
        assert!(deque.contains(&links, 1));
        assert!(!deque.contains(&links, 0));
        deque.remove(&mut links, 1);
        assert!(!deque.contains(&links, 1));
        assert!(deque.is_empty());
    }
}
