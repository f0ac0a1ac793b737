use crate::sync::*;

/// Handle to a cached page: the slot holding it and the slot version the
/// page was published with.
///
/// A `PageRef` stays valid for optimistic reads until the slot's version
/// moves past `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef {
    pub slot: u32,
    pub version: u64,
}

/// Lifecycle of an entry. Transitions are one-way: Alive → Retired → Dead.
///
/// A node whose slot is free is Dead; a load revives it when it claims the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Liveness {
    Alive = 0,
    /// Removed from the index, policy bookkeeping still pending
    Retired = 1,
    /// Removed from both, slot reclaimed
    Dead = 2,
}

impl From<u8> for Liveness {
    fn from(value: u8) -> Self {
        match value {
            0 => Liveness::Alive,
            1 => Liveness::Retired,
            _ => Liveness::Dead,
        }
    }
}

/// Policy queue an entry is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum QueueType {
    Window = 0,
    Probation = 1,
    Protected = 2,
}

impl From<u8> for QueueType {
    fn from(value: u8) -> Self {
        match value {
            0 => QueueType::Window,
            1 => QueueType::Probation,
            _ => QueueType::Protected,
        }
    }
}

/// Policy-tracked entry, one per page slot.
///
/// The key and version are written only while the node is Dead and owned by a
/// load; they are stable for as long as the node is Alive. The queue tag is
/// written by the maintenance thread and may be read from anywhere.
pub(crate) struct Node {
    key: AtomicI64,
    version: AtomicU64,
    state: AtomicU8,
    queue: AtomicU8,
}

impl Node {
    fn new() -> Self {
        Self {
            key: AtomicI64::new(-1),
            version: AtomicU64::new(0),
            state: AtomicU8::new(Liveness::Dead as u8),
            queue: AtomicU8::new(QueueType::Window as u8),
        }
    }

    #[inline]
    pub fn key(&self) -> i64 {
        self.key.load(Ordering::Acquire)
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn liveness(&self) -> Liveness {
        Liveness::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.liveness() == Liveness::Alive
    }

    /// True if this node is alive and still represents `entry`.
    #[inline]
    pub fn is_current(&self, entry: PageRef) -> bool {
        self.is_alive() && self.version() == entry.version
    }

    /// Bring a Dead node back for a freshly loaded page.
    ///
    /// # Panics
    /// Panics if the node is not Dead: a slot was handed out while still owned.
    pub fn revive(&self, key: i64, version: u64) {
        assert!(key >= 0, "page ids are non-negative, got {key}");
        self.key.store(key, Ordering::Relaxed);
        self.version.store(version, Ordering::Relaxed);
        self.queue.store(QueueType::Window as u8, Ordering::Relaxed);
        if let Err(actual) = self.state.compare_exchange(
            Liveness::Dead as u8,
            Liveness::Alive as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "slot handed out while its entry is {:?}",
                Liveness::from(actual)
            );
        }
    }

    /// Alive → Retired. Returns `false` if the node was not alive.
    pub fn retire(&self) -> bool {
        self.state
            .compare_exchange(
                Liveness::Alive as u8,
                Liveness::Retired as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Retired → Dead. Returns `false` if the node was not retired, so only
    /// one caller ever reclaims the slot.
    pub fn die(&self) -> bool {
        self.state
            .compare_exchange(
                Liveness::Retired as u8,
                Liveness::Dead as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    pub fn queue(&self) -> QueueType {
        QueueType::from(self.queue.load(Ordering::Relaxed))
    }

    pub fn make_window(&self) {
        self.queue.store(QueueType::Window as u8, Ordering::Relaxed);
    }

    pub fn make_main_probation(&self) {
        self.queue.store(QueueType::Probation as u8, Ordering::Relaxed);
    }

    pub fn make_main_protected(&self) {
        self.queue.store(QueueType::Protected as u8, Ordering::Relaxed);
    }
}

/// Node table indexed by page slot.
pub(crate) struct Nodes {
    nodes: Box<[Node]>,
}

impl Nodes {
    pub fn new(count: usize) -> Self {
        Self {
            nodes: (0..count).map(|_| Node::new()).collect(),
        }
    }

    #[inline]
    pub fn get(&self, slot: u32) -> &Node {
        &self.nodes[slot as usize]
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub fn alive_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_alive()).count()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_is_one_way() {
        let node = Node::new();
        assert_eq!(node.liveness(), Liveness::Dead);
        assert!(!node.retire());

        node.revive(42, 3);
        assert!(node.is_current(PageRef { slot: 0, version: 3 }));
        assert!(!node.is_current(PageRef { slot: 0, version: 2 }));
        assert!(!node.die());

        assert!(node.retire());
        assert!(!node.retire());
        assert_eq!(node.liveness(), Liveness::Retired);

        assert!(node.die());
        assert!(!node.die());
        assert_eq!(node.liveness(), Liveness::Dead);
    }

    #[test]
    fn revive_resets_queue_tag() {
        let node = Node::new();
        node.revive(1, 1);
        node.make_main_protected();
        assert!(node.retire() && node.die());

        node.revive(2, 5);
        assert_eq!(node.queue(), QueueType::Window);
        assert_eq!(node.key(), 2);
    }

    #[test]
    #[should_panic(expected = "slot handed out")]
    fn reviving_a_live_node_panics() {
        let node = Node::new();
        node.revive(1, 1);
        node.revive(2, 2);
    }
}
