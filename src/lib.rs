mod deque;
mod drain;
mod error;
mod executor;
mod geometry;
mod hashtable;
mod loader;
mod node;
mod pages;
mod policy;
mod sketch;

pub(crate) mod metrics;
pub(crate) mod sync;
pub(crate) mod util;


use drain::*;
use loader::{Claim, InFlightLoads, LoadTicket};
use node::Nodes;
use pages::PageStore;
use policy::{Policy, PolicyContext};

pub use error::{CacheError, Result};
pub use executor::{CallerRunsExecutor, Executor, RejectedTask, Task, TokioExecutor};
pub use geometry::{BLOCK_SIZE, PAGE_HEADER_SIZE, PageGeometry};
pub use hashtable::{KeyIndex, ShardedIndex};
pub use loader::{FilePageSource, PageSource};
pub use metrics::{CacheMetrics, Counter, Gauge};
pub use node::PageRef;
pub use policy::PolicyStats;

use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};

/// Attempts to buffer a write before the writer runs maintenance itself.
const WRITE_BUFFER_RETRIES: u32 = 100;

/// How long to wait for the maintenance lock before logging a diagnostic.
const LOCK_WAIT_WARNING: Duration = Duration::from_secs(5);

/// Core cache data shared between the public API and background tasks
struct CacheCore {
    index: Box<dyn KeyIndex>,
    pages: PageStore,
    nodes: Nodes,
    policy: Mutex<Policy>,
    buffers: Buffers,
    drain_status: DrainStatus,
    executor: Arc<dyn Executor>,
    source: Arc<dyn PageSource>,
    geometry: PageGeometry,
    loads: InFlightLoads,
    metrics: CacheMetrics,
}

/// Disk-backed page cache with adaptive W-TinyLFU eviction.
///
/// Cloning is cheap and every clone shares the same cache.
#[derive(Clone)]
pub struct Cache {
    core: Arc<CacheCore>,
}

/// Builder for constructing a Cache with custom configuration
pub struct CacheBuilder {
    capacity_bytes: usize,
    geometry: PageGeometry,
    index_power: u8,
    read_buffer_size: usize,
    write_buffer_size: usize,
    executor: Option<Arc<dyn Executor>>,
    page_source: Option<Arc<dyn PageSource>>,
    key_index: Option<Box<dyn KeyIndex>>,
}

impl CacheBuilder {
    /// Create a new CacheBuilder with default settings
    pub fn new() -> Self {
        Self {
            capacity_bytes: 64 * 1024 * 1024, // 64MB
            geometry: PageGeometry::default(), // 4KB pages
            index_power: 6,                   // 64 index shards
            read_buffer_size: 512,
            write_buffer_size: 1024,
            executor: None,
            page_source: None,
            key_index: None,
        }
    }

    /// Set the total page memory in bytes
    ///
    /// The cache holds `capacity_bytes / page_size` pages. Default is 64MB.
    pub fn capacity_bytes(mut self, bytes: usize) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    /// Set the page layout. Default is opaque 4KB pages.
    pub fn geometry(mut self, geometry: PageGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Set the key index size as a power of 2
    ///
    /// The default index has 2^power shards, each behind its own lock.
    /// Must be in 4..=16; default is 6.
    pub fn index_power(mut self, power: u8) -> Self {
        self.index_power = power;
        self
    }

    /// Number of reads buffered before reads start being dropped.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Number of writes buffered before writers run maintenance inline.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Where scheduled maintenance runs
    ///
    /// Defaults to the blocking pool of the Tokio runtime current at build
    /// time, or to running on the caller when there is none.
    pub fn executor(mut self, executor: impl Executor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Where missing pages are read from. Required.
    pub fn page_source(mut self, source: impl PageSource + 'static) -> Self {
        self.page_source = Some(Arc::new(source));
        self
    }

    /// Replace the default sharded index.
    pub fn key_index(mut self, index: impl KeyIndex + 'static) -> Self {
        self.key_index = Some(Box::new(index));
        self
    }

    /// Build a cache over the file at `path`.
    pub fn open(self, path: impl AsRef<Path>) -> Result<Cache> {
        self.page_source(FilePageSource::open(path)?).build()
    }

    /// Build the Cache with the configured settings
    pub fn build(self) -> Result<Cache> {
        let page_size = self.geometry.page_size();
        if page_size == 0 {
            return Err(CacheError::invalid_config("page size must be positive"));
        }
        let page_count = self.capacity_bytes / page_size;
        if page_count == 0 {
            return Err(CacheError::invalid_config(format!(
                "capacity of {} bytes holds no {page_size}-byte page",
                self.capacity_bytes
            )));
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(CacheError::invalid_config("buffer sizes must be positive"));
        }
        if self.key_index.is_none() && !(4..=16).contains(&self.index_power) {
            return Err(CacheError::invalid_config(format!(
                "index power {} outside 4..=16",
                self.index_power
            )));
        }
        let source = self
            .page_source
            .ok_or_else(|| CacheError::invalid_config("a page source is required"))?;

        let executor = match self.executor {
            Some(executor) => executor,
            None => match TokioExecutor::current() {
                Some(executor) => Arc::new(executor) as Arc<dyn Executor>,
                None => Arc::new(CallerRunsExecutor),
            },
        };
        let index = match self.key_index {
            Some(index) => index,
            None => Box::new(ShardedIndex::new(self.index_power)),
        };

        let pages = PageStore::new(page_count, page_size)?;
        let metrics = CacheMetrics::new();

        // Initialize pages_free gauge to the total number of pages
        metrics.pages_free.set(page_count as i64);

        let policy = Policy::new(page_count, page_count);
        let stats = policy.stats();
        debug!(
            pages = page_count,
            page_size,
            window_maximum = stats.window_maximum,
            main_protected_maximum = stats.main_protected_maximum,
            "page cache opened"
        );

        let core = Arc::new(CacheCore {
            index,
            pages,
            nodes: Nodes::new(page_count),
            policy: Mutex::new(policy),
            buffers: Buffers::new(self.read_buffer_size, self.write_buffer_size),
            drain_status: DrainStatus::new(),
            executor,
            source,
            geometry: self.geometry,
            loads: InFlightLoads::new(),
            metrics,
        });

        Ok(Cache { core })
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    /// Open a cache of `capacity_bytes` over the backing file at `path`.
    ///
    /// For custom configuration, use CacheBuilder:
    /// ```no_run
    /// use async_pagecache::{CacheBuilder, PageGeometry};
    ///
    /// # fn main() -> async_pagecache::Result<()> {
    /// let cache = CacheBuilder::new()
    ///     .capacity_bytes(256 * 1024 * 1024) // 256MB
    ///     .geometry(PageGeometry::for_vectors(768, 64)?)
    ///     .read_buffer_size(1024)
    ///     .open("/var/lib/index/graph.bin")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open(
        capacity_bytes: usize,
        geometry: PageGeometry,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        CacheBuilder::new()
            .capacity_bytes(capacity_bytes)
            .geometry(geometry)
            .open(path)
    }

    /// Get a reference to the cache metrics
    pub fn metrics(&self) -> &CacheMetrics {
        &self.core.metrics
    }

    pub fn geometry(&self) -> PageGeometry {
        self.core.geometry
    }

    /// Percentage of lookups served without loading.
    pub fn hit_ratio(&self) -> f64 {
        self.core.metrics.hit_ratio()
    }

    /// Resolve a page to the slot holding it, loading it on a miss.
    ///
    /// The returned handle was validated against the slot's version before
    /// being returned; use it with [`read_page_bytes`](Self::read_page_bytes).
    /// Concurrent requests for the same missing page share a single load.
    ///
    /// # Returns
    ///
    /// - `Ok(PageRef)` - slot and version of the cached page
    /// - `Err(CacheError::InvalidPageId)` - `page_id` is negative or lies
    ///   beyond any addressable file offset
    /// - `Err(CacheError::PageLoad)` - reading the page failed; every caller
    ///   waiting on that load sees the same error
    pub async fn get(&self, page_id: i64) -> Result<PageRef> {
        if self.core.geometry.page_offset(page_id).is_none() {
            return Err(CacheError::InvalidPageId { page_id });
        }

        let mut missed = false;
        loop {
            if let Some(entry) = self.core.lookup(page_id) {
                self.core.after_read(entry);
                if !missed {
                    self.core.metrics.hits.increment();
                }
                return Ok(entry);
            }

            if !missed {
                missed = true;
                self.core.metrics.misses.increment();
            }

            // Use the loaded entry directly unless it was already evicted
            match self.core.load(page_id).await? {
                Some(entry) if self.core.is_current(page_id, entry) => return Ok(entry),
                Some(_) => {}
                // The leader vanished; let it unwind before claiming again
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// Start loading a page in the background if it is not cached.
    ///
    /// Best effort: failures are logged and dropped, and nothing happens
    /// outside a Tokio runtime.
    pub fn preload_if_needed(&self, page_id: i64) {
        if self.core.geometry.page_offset(page_id).is_none() || self.core.lookup(page_id).is_some()
        {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            debug!(page_id, "no runtime, preload skipped");
            return;
        };
        let core = Arc::clone(&self.core);
        handle.spawn(async move {
            if let Err(e) = core.load(page_id).await {
                debug!(page_id, error = %e, "preload failed");
            }
        });
    }

    /// Copy `len` bytes at `offset` out of a cached page.
    ///
    /// Returns `Err(CacheError::StaleRead)` if the slot no longer holds the
    /// version in `entry`; resolve the page again and retry.
    pub fn read_page_bytes(&self, entry: PageRef, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_page_into(entry, offset, &mut buf)?;
        Ok(buf)
    }

    /// Like [`read_page_bytes`](Self::read_page_bytes), into a caller buffer.
    pub fn read_page_into(&self, entry: PageRef, offset: usize, dst: &mut [u8]) -> Result<()> {
        if entry.slot as usize >= self.core.pages.page_count() {
            return Err(CacheError::StaleRead {
                slot: entry.slot,
                expected: entry.version,
                actual: 0,
            });
        }

        let result = self.core.pages.read(entry.slot, entry.version, offset, dst);
        if let Err(CacheError::StaleRead { .. }) = &result {
            self.core.metrics.stale_reads.increment();
        }
        result
    }

    /// Read `len` bytes at `offset` of a page, retrying until the copy is
    /// consistent.
    pub async fn read_page(&self, page_id: i64, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        loop {
            let entry = self.get(page_id).await?;
            match self.read_page_into(entry, offset, &mut buf) {
                Ok(()) => return Ok(buf),
                Err(e) if e.is_retryable() => {
                    trace!(page_id, "page changed during read, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop a page from the cache. Returns `false` if it was not cached.
    ///
    /// The page is gone from lookups immediately; its slot is reclaimed by
    /// the next maintenance pass.
    pub fn invalidate(&self, page_id: i64) -> bool {
        let core = &self.core;
        let entry = {
            // Serialized with eviction so the entry cannot die underneath us
            let _policy = core.lock_policy();
            let Some(entry) = core.index.get(page_id) else {
                return false;
            };
            if !core.index.remove_if(page_id, entry) {
                return false;
            }
            core.nodes.get(entry.slot).retire();
            entry
        };

        core.metrics.invalidations.increment();
        trace!(page_id, slot = entry.slot, "invalidated");
        core.after_write(WriteOp::Remove(entry));
        true
    }

    /// Run a maintenance pass now: replay buffered events, evict and adapt.
    pub fn cleanup(&self) {
        self.core.perform_cleanup();
    }

    /// Whether a page is cached right now.
    pub fn contains(&self, page_id: i64) -> bool {
        self.core.lookup(page_id).is_some()
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.core.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached pages.
    pub fn capacity(&self) -> usize {
        self.core.pages.page_count()
    }

    /// Snapshot of the eviction policy's sizes and hill climber state.
    pub fn policy_stats(&self) -> PolicyStats {
        self.core.lock_policy().stats()
    }

    /// Release this handle, running a final maintenance pass.
    ///
    /// Page memory and the backing file are released once the last clone of
    /// the cache and any in-flight load are gone.
    pub fn close(self) {
        self.core.perform_cleanup();
        debug!(
            entries = self.core.index.len(),
            hit_ratio = self.core.metrics.hit_ratio(),
            "page cache closed"
        );
    }
}

impl CacheCore {
    // --- Lookup ---

    /// True if `entry` is the live, unchanged entry for `page_id`.
    fn is_current(&self, page_id: i64, entry: PageRef) -> bool {
        let node = self.nodes.get(entry.slot);
        node.is_current(entry)
            && node.key() == page_id
            && self.pages.version(entry.slot) == entry.version
    }

    fn lookup(&self, page_id: i64) -> Option<PageRef> {
        let entry = self.index.get(page_id)?;
        self.is_current(page_id, entry).then_some(entry)
    }

    // --- Loading ---

    /// Load a missing page, or wait for the load already in flight.
    ///
    /// A claimed load runs to completion on the blocking pool even if the
    /// caller stops waiting. `Ok(None)` means the caller should look again.
    async fn load(self: &Arc<Self>, page_id: i64) -> Result<Option<PageRef>> {
        match self.loads.claim(page_id) {
            Claim::Leader(ticket) => {
                let rx = ticket.subscribe();
                match Handle::try_current() {
                    Ok(handle) => {
                        let core = Arc::clone(self);
                        drop(handle.spawn_blocking(move || core.run_load(ticket)));
                    }
                    Err(_) => self.run_load(ticket),
                }
                loader::wait_for(rx).await
            }
            Claim::Follower(rx) => {
                self.metrics.load_waits.increment();
                loader::wait_for(rx).await
            }
        }
    }

    /// Run a claimed load and publish its outcome, panics included, so
    /// waiters are never left without a result.
    fn run_load(self: &Arc<Self>, ticket: LoadTicket) {
        let page_id = ticket.page_id();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.fill_and_publish(page_id)))
            .unwrap_or_else(|payload| {
                error!(page_id, panic = panic_message(&*payload), "page load panicked");
                Err(CacheError::PageLoad {
                    page_id,
                    source: Arc::new(io::Error::other("page load panicked")),
                })
            });
        let _ = self.loads.finish(ticket, result);
    }

    fn fill_and_publish(self: &Arc<Self>, page_id: i64) -> Result<PageRef> {
        // A previous load may have published between the caller's lookup
        // and its claim
        if let Some(entry) = self.lookup(page_id) {
            return Ok(entry);
        }

        let offset = self
            .geometry
            .page_offset(page_id)
            .ok_or(CacheError::InvalidPageId { page_id })?;

        let slot = self.acquire_slot();
        let version = match self.pages.fill(slot, |buf| {
            // A panicking source fails this load like any I/O error
            panic::catch_unwind(AssertUnwindSafe(|| self.source.read_page(offset, buf)))
                .unwrap_or_else(|_| Err(io::Error::other("page source panicked")))
        }) {
            Ok(version) => version,
            Err(e) => {
                self.pages.release(slot, &self.metrics);
                self.metrics.load_failures.increment();
                warn!(page_id, offset, error = %e, "page load failed");
                return Err(CacheError::PageLoad {
                    page_id,
                    source: Arc::new(e),
                });
            }
        };

        let entry = PageRef { slot, version };
        let node = self.nodes.get(slot);
        node.revive(page_id, version);

        if let Some(existing) = self.index.put_if_absent(page_id, entry) {
            // A mapping to a retired entry may be replaced; a live one never
            if self.is_current(page_id, existing)
                || !self.index.replace_if(page_id, existing, entry)
            {
                error!(page_id, slot, "broken invariant: page already cached");
                node.retire();
                node.die();
                self.pages.release(slot, &self.metrics);
                return Err(CacheError::DuplicateInsert { page_id });
            }
        }

        self.metrics.loads.increment();
        self.metrics.entries_live.increment();
        trace!(page_id, slot, version, "page loaded");

        self.after_write(WriteOp::Add(entry));
        Ok(entry)
    }

    /// Take a free slot, evicting until one frees up.
    fn acquire_slot(self: &Arc<Self>) -> u32 {
        loop {
            if let Some(slot) = self.pages.reserve(&self.metrics) {
                return slot;
            }

            {
                let mut policy = self.lock_policy();
                self.maintenance(&mut policy, None);

                // Entries pending in the policy can't be evicted by the
                // regular bound alone when the cache holds exactly as many
                // pages as it has slots
                if self.pages.free_count() == 0 && policy.size() > 0 {
                    let limit = policy.size() - 1;
                    policy.evict_entries_to(&**self, limit);
                }
            }
            self.reschedule_cleanup_if_incomplete();

            std::thread::yield_now();
        }
    }

    // --- Buffering ---

    fn after_read(self: &Arc<Self>, entry: PageRef) {
        let delayable = self.buffers.record_read(entry, &self.metrics);
        if self.drain_status.should_drain_buffers(delayable) {
            self.schedule_drain_buffers();
        }
    }

    /// Buffer a write, falling back to running maintenance on this thread
    /// when the buffer stays full.
    fn after_write(self: &Arc<Self>, op: WriteOp) {
        let mut op = op;
        for attempt in 0..WRITE_BUFFER_RETRIES {
            match self.buffers.try_record_write(op) {
                Ok(()) => {
                    if self.drain_status.after_write(&self.metrics) {
                        self.schedule_drain_buffers();
                    }
                    return;
                }
                Err(returned) => {
                    op = returned;
                    self.metrics.write_buffer_retries.increment();
                    self.schedule_drain_buffers();
                    util::backoff(attempt);
                }
            }
        }

        self.metrics.inline_maintenance.increment();
        {
            let mut policy = self.lock_policy();
            self.maintenance(&mut policy, Some(op));
        }
        self.reschedule_cleanup_if_incomplete();
    }

    // --- Maintenance ---

    /// Acquire the maintenance lock, logging if it takes suspiciously long.
    fn lock_policy(&self) -> MutexGuard<'_, Policy> {
        if let Some(guard) = self.policy.try_lock_for(LOCK_WAIT_WARNING) {
            return guard;
        }

        self.metrics.lock_wait_warnings.increment();
        warn!(
            waited_secs = LOCK_WAIT_WARNING.as_secs(),
            "maintenance lock is contended, still waiting"
        );
        self.policy.lock()
    }

    /// Hand a maintenance pass to the executor unless one is already pending.
    fn schedule_drain_buffers(self: &Arc<Self>) {
        if self.drain_status.get() >= PROCESSING_TO_IDLE {
            return;
        }
        let Some(mut policy) = self.policy.try_lock() else {
            return;
        };
        if self.drain_status.get() >= PROCESSING_TO_IDLE {
            return;
        }

        self.drain_status.set(PROCESSING_TO_IDLE);
        let core: Weak<Self> = Arc::downgrade(self);
        let task: Task = Box::new(move || {
            if let Some(core) = core.upgrade() {
                core.perform_cleanup();
            }
        });

        if let Err(rejected) = self.executor.execute(task) {
            trace!(%rejected, "running maintenance inline");
            self.maintenance(&mut policy, None);
        }
    }

    fn perform_cleanup(self: &Arc<Self>) {
        {
            let mut policy = self.lock_policy();
            self.maintenance(&mut policy, None);
        }
        self.reschedule_cleanup_if_incomplete();
    }

    fn reschedule_cleanup_if_incomplete(self: &Arc<Self>) {
        if self.drain_status.get() == REQUIRED {
            self.schedule_drain_buffers();
        }
    }

    /// Replay buffered events, evict and adapt. Requires the maintenance lock.
    fn maintenance(&self, policy: &mut Policy, op: Option<WriteOp>) {
        self.drain_status.set(PROCESSING_TO_IDLE);

        for entry in self.buffers.drain_reads() {
            policy.on_access(self, entry);
        }
        for op in self.buffers.drain_writes() {
            self.apply(policy, op);
        }
        if let Some(op) = op {
            self.apply(policy, op);
        }

        policy.evict_entries(self);
        policy.climb(self);
        self.metrics.maintenance_runs.increment();

        if self.drain_status.get() != PROCESSING_TO_IDLE
            || !self.drain_status.compare_and_set(PROCESSING_TO_IDLE, IDLE)
        {
            self.drain_status.set(REQUIRED);
        }

        trace!(
            size = policy.size(),
            free = self.pages.free_count(),
            "maintenance pass"
        );
    }

    fn apply(&self, policy: &mut Policy, op: WriteOp) {
        match op {
            WriteOp::Add(entry) => policy.on_add(self, entry),
            WriteOp::Remove(entry) => policy.on_remove(self, entry),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl PolicyContext for CacheCore {
    fn nodes(&self) -> &Nodes {
        &self.nodes
    }

    fn unmap(&self, key: i64, entry: PageRef) -> bool {
        self.index.remove_if(key, entry)
    }

    fn reclaim(&self, slot: u32) {
        self.metrics.entries_live.decrement();
        self.pages.release(slot, &self.metrics);
    }

    fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

impl Drop for CacheCore {
    fn drop(&mut self) {
        debug!(pages = self.pages.page_count(), "page cache released");
    }
}
