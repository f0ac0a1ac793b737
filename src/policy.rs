//! Adaptive W-TinyLFU eviction policy.
//!
//! New entries enter a small LRU admission window. Entries leaving the window
//! compete with the main space's least recently used entry, and the sketch's
//! frequency estimate decides which one stays. The main space is a segmented
//! LRU: probation for entries admitted once, protected for entries re-accessed
//! while in probation. A hill climber moves capacity between the window and
//! the main space whenever a sampled hit rate shows the split should change.
//!
//! The policy is owned by the maintenance lock; nothing in here synchronizes.

use crate::deque::{AccessOrderDeque, Links};
use crate::metrics::CacheMetrics;
use crate::node::{Nodes, PageRef, QueueType};
use crate::sketch::FrequencySketch;
use tracing::{debug, error, trace};

/// Share of capacity given to the main space when the cache is created.
const PERCENT_MAIN: f64 = 0.99;
/// Target share of the main space held by the protected segment.
const PERCENT_MAIN_PROTECTED: f64 = 0.80;
/// Hit rate change that makes the climber restart with a full step.
const HILL_CLIMBER_RESTART_THRESHOLD: f64 = 0.05;
/// Full step, as a fraction of the maximum.
const HILL_CLIMBER_STEP_PERCENT: f64 = 0.0625;
/// Step decay applied while the hit rate changes slowly.
const HILL_CLIMBER_STEP_DECAY_RATE: f64 = 0.98;
/// Cap on entries moved between queues in a single pass.
const QUEUE_TRANSFER_THRESHOLD: usize = 1000;
/// Candidates at least this popular may be admitted at random on a tie.
const ADMIT_HASHDOS_THRESHOLD: u8 = 6;

/// What the policy needs from the cache it manages.
pub(crate) trait PolicyContext {
    fn nodes(&self) -> &Nodes;

    /// Remove the index mapping for `key` only if it still maps to `entry`.
    fn unmap(&self, key: i64, entry: PageRef) -> bool;

    /// Return a dead entry's slot to the free queue.
    fn reclaim(&self, slot: u32);

    fn metrics(&self) -> &CacheMetrics;
}

/// Point-in-time view of the policy's sizes and climber state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyStats {
    pub maximum: u64,
    pub size: u64,
    pub window_maximum: u64,
    pub window_size: u64,
    pub main_protected_maximum: u64,
    pub main_protected_size: u64,
    pub main_probation_size: u64,
    pub step_size: f64,
    pub adjustment: i64,
    pub previous_sample_hit_rate: f64,
}

pub(crate) struct Policy {
    links: Box<[Links]>,
    window: AccessOrderDeque,
    probation: AccessOrderDeque,
    protected: AccessOrderDeque,
    sketch: FrequencySketch,

    maximum: u64,
    size: u64,
    window_maximum: u64,
    window_size: u64,
    main_protected_maximum: u64,
    main_protected_size: u64,

    hits_in_sample: u32,
    misses_in_sample: u32,
    previous_sample_hit_rate: f64,
    step_size: f64,
    adjustment: i64,
}

impl Policy {
    /// Policy for `maximum` entries tracked over a node table of `slots` entries.
    pub fn new(maximum: usize, slots: usize) -> Self {
        let max = maximum as u64;
        let window = max - (PERCENT_MAIN * max as f64) as u64;
        let main_protected = (PERCENT_MAIN_PROTECTED * (max - window) as f64) as u64;

        Self {
            links: vec![Links::default(); slots].into_boxed_slice(),
            window: AccessOrderDeque::new(),
            probation: AccessOrderDeque::new(),
            protected: AccessOrderDeque::new(),
            sketch: FrequencySketch::with_capacity(maximum),
            maximum: max,
            size: 0,
            window_maximum: window,
            window_size: 0,
            main_protected_maximum: main_protected,
            main_protected_size: 0,
            hits_in_sample: 0,
            misses_in_sample: 0,
            previous_sample_hit_rate: 0.0,
            step_size: -HILL_CLIMBER_STEP_PERCENT * max as f64,
            adjustment: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[cfg(test)]
    #[inline]
    pub fn maximum(&self) -> u64 {
        self.maximum
    }

    pub fn stats(&self) -> PolicyStats {
        PolicyStats {
            maximum: self.maximum,
            size: self.size,
            window_maximum: self.window_maximum,
            window_size: self.window_size,
            main_protected_maximum: self.main_protected_maximum,
            main_protected_size: self.main_protected_size,
            main_probation_size: self.probation.len() as u64,
            step_size: self.step_size,
            adjustment: self.adjustment,
            previous_sample_hit_rate: self.previous_sample_hit_rate,
        }
    }

    /// True if `slot` is linked into the queue its node is tagged with.
    pub fn is_linked(&self, ctx: &impl PolicyContext, slot: u32) -> bool {
        let deque = match ctx.nodes().get(slot).queue() {
            QueueType::Window => &self.window,
            QueueType::Probation => &self.probation,
            QueueType::Protected => &self.protected,
        };
        deque.contains(&self.links, slot)
    }

    // --- Buffered events ---

    /// Replay a read: age the sketch and reorder or promote the entry.
    pub fn on_access(&mut self, ctx: &impl PolicyContext, entry: PageRef) {
        let node = ctx.nodes().get(entry.slot);
        if !node.is_current(entry) {
            return;
        }

        self.sketch.increment(node.key());
        match node.queue() {
            QueueType::Window => {
                if self.window.contains(&self.links, entry.slot) {
                    self.window.move_to_back(&mut self.links, entry.slot);
                }
            }
            QueueType::Probation => self.reorder_probation(ctx, entry.slot),
            QueueType::Protected => {
                if self.protected.contains(&self.links, entry.slot) {
                    self.protected.move_to_back(&mut self.links, entry.slot);
                }
            }
        }
        self.hits_in_sample = self.hits_in_sample.saturating_add(1);
    }

    /// Promote a re-accessed probation entry. Protected overflow is settled by
    /// the next demotion pass.
    fn reorder_probation(&mut self, ctx: &impl PolicyContext, slot: u32) {
        if !self.probation.contains(&self.links, slot) {
            return;
        }
        if self.main_protected_maximum == 0 {
            self.probation.move_to_back(&mut self.links, slot);
            return;
        }

        self.main_protected_size += 1;
        self.probation.remove(&mut self.links, slot);
        self.protected.offer_last(&mut self.links, slot);
        ctx.nodes().get(slot).make_main_protected();
    }

    /// Replay an insertion: count it and link it into the window.
    ///
    /// An entry that was retired before its insertion was replayed is skipped;
    /// its removal never counted it either.
    pub fn on_add(&mut self, ctx: &impl PolicyContext, entry: PageRef) {
        let node = ctx.nodes().get(entry.slot);
        if !node.is_current(entry) {
            return;
        }
        if self.is_linked(ctx, entry.slot) {
            error!(
                page_id = node.key(),
                slot = entry.slot,
                "broken invariant: entry added to the policy twice"
            );
            return;
        }

        self.size += 1;
        self.window_size += 1;
        self.sketch.increment(node.key());
        self.misses_in_sample = self.misses_in_sample.saturating_add(1);

        node.make_window();
        self.window.offer_last(&mut self.links, entry.slot);
    }

    /// Replay a removal of an entry retired outside the maintenance lock.
    pub fn on_remove(&mut self, ctx: &impl PolicyContext, entry: PageRef) {
        let node = ctx.nodes().get(entry.slot);
        if node.version() != entry.version {
            // Slot already reclaimed and reused
            return;
        }

        let counted = self.unlink(ctx, entry.slot);
        self.make_dead(ctx, entry.slot, counted);
    }

    // --- Eviction ---

    /// Evict until the cache is within its maximum.
    pub fn evict_entries(&mut self, ctx: &impl PolicyContext) {
        self.evict_entries_to(ctx, self.maximum);
    }

    /// Evict until at most `limit` entries remain, moving window overflow into
    /// the main space first.
    pub fn evict_entries_to(&mut self, ctx: &impl PolicyContext, limit: u64) {
        let candidate = self.evict_from_window(ctx);
        self.evict_from_main(ctx, candidate, limit);
    }

    /// Move the window's least recently used entries into probation while the
    /// window is over its maximum. Returns the first moved entry.
    fn evict_from_window(&mut self, ctx: &impl PolicyContext) -> Option<u32> {
        let mut first = None;
        let mut node = self.window.peek_first();

        while self.window_size > self.window_maximum {
            let Some(slot) = node else {
                break;
            };
            node = AccessOrderDeque::next(&self.links, slot);

            ctx.nodes().get(slot).make_main_probation();
            self.window.remove(&mut self.links, slot);
            self.probation.offer_last(&mut self.links, slot);
            self.window_size -= 1;
            first.get_or_insert(slot);
        }

        first
    }

    /// Evict from the main space, comparing probation's victims against the
    /// candidates that just left the window.
    fn evict_from_main(&mut self, ctx: &impl PolicyContext, mut candidate: Option<u32>, limit: u64) {
        let mut victim_queue = QueueType::Probation;
        let mut candidate_queue = QueueType::Probation;
        let mut victim = self.probation.peek_first();

        while self.size > limit {
            // Fall back to the admission window for more candidates
            if candidate.is_none() && candidate_queue == QueueType::Probation {
                candidate = self.window.peek_first();
                candidate_queue = QueueType::Window;
            }

            // Out of victims: continue into protected, then the window
            if candidate.is_none() && victim.is_none() {
                match victim_queue {
                    QueueType::Probation => {
                        victim = self.protected.peek_first();
                        victim_queue = QueueType::Protected;
                        continue;
                    }
                    QueueType::Protected => {
                        victim = self.window.peek_first();
                        victim_queue = QueueType::Window;
                        continue;
                    }
                    QueueType::Window => break,
                }
            }

            let (c, v) = match (candidate, victim) {
                (Some(c), None) => {
                    candidate = self.next(c);
                    self.evict_entry(ctx, c);
                    continue;
                }
                (None, Some(v)) => {
                    victim = self.next(v);
                    self.evict_entry(ctx, v);
                    continue;
                }
                (Some(c), Some(v)) => (c, v),
                (None, None) => break,
            };

            if c == v {
                let next = self.next(v);
                victim = next;
                candidate = next;
                self.evict_entry(ctx, v);
                continue;
            }

            let nodes = ctx.nodes();
            if !nodes.get(v).is_alive() {
                victim = self.next(v);
                self.evict_entry(ctx, v);
                continue;
            }
            if !nodes.get(c).is_alive() {
                candidate = self.next(c);
                self.evict_entry(ctx, c);
                continue;
            }

            if self.admit(nodes.get(c).key(), nodes.get(v).key()) {
                let next_victim = self.next(v);
                let next_candidate = self.next(c);
                victim = next_victim;
                candidate = if next_candidate == Some(v) {
                    next_victim
                } else {
                    next_candidate
                };
                self.evict_entry(ctx, v);
            } else {
                candidate = self.next(c);
                self.evict_entry(ctx, c);
            }
        }
    }

    /// Decide whether `candidate` should replace `victim` in the main space.
    ///
    /// Ties go to the victim. A popular candidate still wins a tie about once
    /// in 128 attempts, so an attacker inflating a victim's counters cannot
    /// block admission forever.
    pub fn admit(&self, candidate_key: i64, victim_key: i64) -> bool {
        let victim_freq = self.sketch.frequency(victim_key);
        let candidate_freq = self.sketch.frequency(candidate_key);
        if candidate_freq > victim_freq {
            return true;
        }
        if candidate_freq >= ADMIT_HASHDOS_THRESHOLD {
            return Self::random_admission();
        }
        false
    }

    #[cfg(not(feature = "loom"))]
    fn random_admission() -> bool {
        use rand::Rng;
        (rand::thread_rng().r#gen::<u32>() & 127) == 0
    }

    #[cfg(feature = "loom")]
    fn random_admission() -> bool {
        false
    }

    /// Remove an entry from the index and the policy and reclaim its slot.
    fn evict_entry(&mut self, ctx: &impl PolicyContext, slot: u32) {
        let node = ctx.nodes().get(slot);
        let key = node.key();
        let entry = PageRef {
            slot,
            version: node.version(),
        };

        if !ctx.unmap(key, entry) && node.is_alive() {
            error!(
                page_id = key,
                slot,
                "broken invariant: live entry missing from the index"
            );
        }
        node.retire();

        let counted = self.unlink(ctx, slot);
        self.make_dead(ctx, slot, counted);
        ctx.metrics().evictions.increment();
        trace!(page_id = key, slot, "evicted");
    }

    /// Unlink `slot` from its queue. Returns `false` if it was not linked.
    fn unlink(&mut self, ctx: &impl PolicyContext, slot: u32) -> bool {
        if !self.is_linked(ctx, slot) {
            return false;
        }
        match ctx.nodes().get(slot).queue() {
            QueueType::Window => self.window.remove(&mut self.links, slot),
            QueueType::Probation => self.probation.remove(&mut self.links, slot),
            QueueType::Protected => self.protected.remove(&mut self.links, slot),
        }
        true
    }

    /// Retired → Dead: settle the size counters of the entry's last queue and
    /// hand its slot back.
    fn make_dead(&mut self, ctx: &impl PolicyContext, slot: u32, counted: bool) {
        let node = ctx.nodes().get(slot);
        if !node.die() {
            return;
        }

        if counted {
            self.size -= 1;
            match node.queue() {
                QueueType::Window => self.window_size -= 1,
                QueueType::Protected => self.main_protected_size -= 1,
                QueueType::Probation => {}
            }
        }
        ctx.reclaim(slot);
    }

    #[inline]
    fn next(&self, slot: u32) -> Option<u32> {
        AccessOrderDeque::next(&self.links, slot)
    }

    // --- Hill climbing ---

    /// Adapt the window/main split from the latest hit rate sample.
    pub fn climb(&mut self, ctx: &impl PolicyContext) {
        self.determine_adjustment();
        self.demote_from_main_protected(ctx);

        if self.adjustment > 0 {
            self.increase_window(ctx);
        } else if self.adjustment < 0 {
            self.decrease_window(ctx);
        }
    }

    fn determine_adjustment(&mut self) {
        let requests = self.hits_in_sample as u64 + self.misses_in_sample as u64;
        if requests < self.sketch.sample_size() as u64 {
            return;
        }

        let hit_rate = self.hits_in_sample as f64 / requests as f64;
        let hit_rate_change = hit_rate - self.previous_sample_hit_rate;
        let amount = if hit_rate_change >= 0.0 {
            self.step_size
        } else {
            -self.step_size
        };
        let next_step_size = if hit_rate_change.abs() > HILL_CLIMBER_RESTART_THRESHOLD {
            let direction = if amount >= 0.0 { 1.0 } else { -1.0 };
            HILL_CLIMBER_STEP_PERCENT * self.maximum as f64 * direction
        } else {
            HILL_CLIMBER_STEP_DECAY_RATE * amount
        };

        debug!(
            hit_rate,
            hit_rate_change,
            adjustment = amount as i64,
            window_maximum = self.window_maximum,
            "hill climber sample"
        );

        self.previous_sample_hit_rate = hit_rate;
        self.adjustment = amount as i64;
        self.step_size = next_step_size;
        self.hits_in_sample = 0;
        self.misses_in_sample = 0;
    }

    /// Move protected's least recently used entries into probation while
    /// protected is over its maximum.
    fn demote_from_main_protected(&mut self, ctx: &impl PolicyContext) {
        for _ in 0..QUEUE_TRANSFER_THRESHOLD {
            if self.main_protected_size <= self.main_protected_maximum {
                break;
            }
            let Some(demoted) = self.protected.poll(&mut self.links) else {
                break;
            };
            ctx.nodes().get(demoted).make_main_probation();
            self.probation.offer_last(&mut self.links, demoted);
            self.main_protected_size -= 1;
        }
    }

    /// Grow the window by taking capacity from protected, pulling entries
    /// from the main space to fill it.
    fn increase_window(&mut self, ctx: &impl PolicyContext) {
        if self.main_protected_maximum == 0 {
            return;
        }

        let mut quota = (self.adjustment as u64).min(self.main_protected_maximum);
        self.main_protected_maximum -= quota;
        self.window_maximum += quota;
        self.demote_from_main_protected(ctx);

        for _ in 0..QUEUE_TRANSFER_THRESHOLD {
            if quota == 0 {
                break;
            }
            let slot = if let Some(slot) = self.probation.peek_first() {
                self.probation.remove(&mut self.links, slot);
                slot
            } else if let Some(slot) = self.protected.peek_first() {
                self.protected.remove(&mut self.links, slot);
                self.main_protected_size -= 1;
                slot
            } else {
                break;
            };

            quota -= 1;
            self.window_size += 1;
            self.window.offer_last(&mut self.links, slot);
            ctx.nodes().get(slot).make_window();
        }

        // Give back what could not be moved
        self.main_protected_maximum += quota;
        self.window_maximum -= quota;
        self.adjustment = quota as i64;
    }

    /// Shrink the window, moving its least recently used entries into probation.
    fn decrease_window(&mut self, ctx: &impl PolicyContext) {
        if self.window_maximum <= 1 {
            return;
        }

        let mut quota = self
            .adjustment
            .unsigned_abs()
            .min(self.window_maximum - 1);
        self.main_protected_maximum += quota;
        self.window_maximum -= quota;

        for _ in 0..QUEUE_TRANSFER_THRESHOLD {
            if quota == 0 {
                break;
            }
            let Some(slot) = self.window.poll(&mut self.links) else {
                break;
            };

            quota -= 1;
            self.window_size -= 1;
            self.probation.offer_last(&mut self.links, slot);
            ctx.nodes().get(slot).make_main_probation();
        }

        self.main_protected_maximum -= quota;
        self.window_maximum += quota;
        self.adjustment = -(quota as i64);
    }

    // --- Test support ---

    #[cfg(test)]
    pub(crate) fn sketch_mut(&mut self) -> &mut FrequencySketch {
        &mut self.sketch
    }

    #[cfg(test)]
    pub(crate) fn record_sample(&mut self, hits: u32, misses: u32) {
        self.hits_in_sample = hits;
        self.misses_in_sample = misses;
    }

    #[cfg(test)]
    pub(crate) fn queue_slots(&self, queue: QueueType) -> Vec<u32> {
        let deque = match queue {
            QueueType::Window => &self.window,
            QueueType::Probation => &self.probation,
            QueueType::Protected => &self.protected,
        };
        deque.iter(&self.links).collect()
    }
}
