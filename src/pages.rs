use crate::metrics::CacheMetrics;
use crate::sync::*;
use crate::{CacheError, Result};
use std::alloc::{Layout, alloc_zeroed};
use std::ptr::NonNull;

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;
const REGULAR_PAGE_SIZE: usize = 4096;

/// Fixed arena of equally sized pages with a lock-free free-slot queue.
///
/// Every slot carries a version counter that strictly increases whenever the
/// slot's contents change: once after a fill completes and once when the slot
/// is reclaimed. Readers outside the maintenance lock validate against it.
pub struct PageStore {
    slots: Box<[PageSlot]>,
    heap_ptr: NonNull<u8>,
    heap_layout: Layout,
    page_size: usize,

    free_queue: crossbeam_deque::Injector<u32>,
}

#[repr(C, align(64))]
struct PageSlot {
    version: AtomicU64,
}

// Safety: slot memory is handed out exclusively through the free queue and
// read concurrently only under version validation.
unsafe impl Send for PageStore {}
unsafe impl Sync for PageStore {}

impl PageStore {
    /// Allocate `page_count` zeroed pages of `page_size` bytes, all free.
    pub fn new(page_count: usize, page_size: usize) -> Result<Self> {
        if page_count == 0 || page_size == 0 {
            return Err(CacheError::invalid_config(
                "page store needs at least one non-empty page",
            ));
        }
        if page_count > u32::MAX as usize {
            return Err(CacheError::invalid_config(format!(
                "{page_count} pages exceed the addressable slot range"
            )));
        }

        let heap_size = page_count
            .checked_mul(page_size)
            .ok_or_else(|| CacheError::invalid_config("page store size overflows"))?;

        // Use 2MB alignment for potential huge page support
        let alignment = if heap_size >= HUGE_PAGE_SIZE && heap_size % HUGE_PAGE_SIZE == 0 {
            HUGE_PAGE_SIZE
        } else {
            REGULAR_PAGE_SIZE
        };

        let heap_layout = Layout::from_size_align(heap_size, alignment)
            .map_err(|e| CacheError::invalid_config(format!("page store layout: {e}")))?;

        let heap_ptr = unsafe { alloc_zeroed(heap_layout) };
        let heap_ptr = match NonNull::new(heap_ptr) {
            Some(ptr) => ptr,
            None => std::alloc::handle_alloc_error(heap_layout),
        };

        // Pre-fault one location per OS page so fills don't take page faults
        unsafe {
            for i in (0..heap_size).step_by(REGULAR_PAGE_SIZE) {
                std::ptr::write_volatile(heap_ptr.as_ptr().add(i), 0);
            }
        }

        let slots = (0..page_count)
            .map(|_| PageSlot {
                version: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let free_queue = crossbeam_deque::Injector::new();
        for slot in 0..page_count {
            free_queue.push(slot as u32);
        }

        Ok(Self {
            slots,
            heap_ptr,
            heap_layout,
            page_size,
            free_queue,
        })
    }

    #[cfg(test)]
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.slots.len()
    }

    /// Current version of a slot.
    #[inline]
    pub fn version(&self, slot: u32) -> u64 {
        self.slots[slot as usize].version.load(Ordering::Acquire)
    }

    /// Number of slots currently in the free queue.
    pub fn free_count(&self) -> usize {
        self.free_queue.len()
    }

    /// Take a slot from the free queue.
    ///
    /// Returns `None` when every slot is owned by a live entry or an in-flight load.
    pub fn reserve(&self, metrics: &CacheMetrics) -> Option<u32> {
        loop {
            match self.free_queue.steal() {
                crossbeam_deque::Steal::Success(slot) => {
                    metrics.pages_free.decrement();
                    return Some(slot);
                }
                crossbeam_deque::Steal::Empty => return None,
                crossbeam_deque::Steal::Retry => spin_loop(),
            }
        }
    }

    /// Bump the slot's version and return it to the free queue.
    ///
    /// The caller must own the slot: either it was reserved and never
    /// published, or the entry that owned it is dead.
    pub fn release(&self, slot: u32, metrics: &CacheMetrics) {
        self.slots[slot as usize].version.fetch_add(1, Ordering::AcqRel);
        metrics.pages_free.increment();
        self.free_queue.push(slot);
    }

    /// Fill a reserved slot in place and publish the new version.
    ///
    /// On error the version is left untouched; the caller releases the slot.
    pub fn fill<F>(&self, slot: u32, fill: F) -> std::io::Result<u64>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<()>,
    {
        // Safety: a reserved slot is exclusively owned by the caller.
        let buf = unsafe {
            std::slice::from_raw_parts_mut(self.page_ptr(slot), self.page_size)
        };
        fill(buf)?;
        Ok(self.slots[slot as usize].version.fetch_add(1, Ordering::Release) + 1)
    }

    /// Optimistically copy `dst.len()` bytes at `offset` out of a slot.
    ///
    /// Succeeds only if the slot carried `expected` both before and after the
    /// copy, which proves the bytes belong to that version of the page.
    pub fn read(&self, slot: u32, expected: u64, offset: usize, dst: &mut [u8]) -> Result<()> {
        let len = dst.len();
        if offset.checked_add(len).is_none_or(|end| end > self.page_size) {
            return Err(CacheError::OutOfBounds {
                offset,
                len,
                page_size: self.page_size,
            });
        }

        let version = &self.slots[slot as usize].version;
        let before = version.load(Ordering::Acquire);
        if before != expected {
            return Err(CacheError::StaleRead {
                slot,
                expected,
                actual: before,
            });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(self.page_ptr(slot).add(offset), dst.as_mut_ptr(), len);
        }

        // Order the copy before the validating load
        fence(Ordering::Acquire);
        let after = version.load(Ordering::Relaxed);
        if after != expected {
            return Err(CacheError::StaleRead {
                slot,
                expected,
                actual: after,
            });
        }

        Ok(())
    }

    #[inline]
    fn page_ptr(&self, slot: u32) -> *mut u8 {
        assert!((slot as usize) < self.slots.len(), "invalid slot {slot}");
        unsafe { self.heap_ptr.as_ptr().add(slot as usize * self.page_size) }
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        unsafe {
            std::alloc::dealloc(self.heap_ptr.as_ptr(), self.heap_layout);
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn store(pages: usize) -> (PageStore, CacheMetrics) {
        let metrics = CacheMetrics::new();
        metrics.pages_free.set(pages as i64);
        (PageStore::new(pages, 64).unwrap(), metrics)
    }

    #[test]
    fn reserve_drains_the_free_queue() {
        let (pages, metrics) = store(2);
        let a = pages.reserve(&metrics).unwrap();
        let b = pages.reserve(&metrics).unwrap();
        assert_ne!(a, b);
        assert!(pages.reserve(&metrics).is_none());
        assert_eq!(metrics.pages_free.value(), 0);

        pages.release(a, &metrics);
        assert_eq!(pages.free_count(), 1);
        assert_eq!(pages.reserve(&metrics), Some(a));
    }

    #[test]
    fn versions_increase_across_fill_and_release() {
        let (pages, metrics) = store(1);
        let slot = pages.reserve(&metrics).unwrap();
        let v0 = pages.version(slot);

        let v1 = pages.fill(slot, |buf| {
            buf.fill(0xAB);
            Ok(())
        })
        .unwrap();
        assert!(v1 > v0);

        pages.release(slot, &metrics);
        let v2 = pages.version(slot);
        assert!(v2 > v1);

        let slot = pages.reserve(&metrics).unwrap();
        let v3 = pages.fill(slot, |_| Ok(())).unwrap();
        assert!(v3 > v2);
    }

    #[test]
    fn failed_fill_keeps_version() {
        let (pages, metrics) = store(1);
        let slot = pages.reserve(&metrics).unwrap();
        let before = pages.version(slot);
        let err = pages
            .fill(slot, |_| Err(std::io::ErrorKind::UnexpectedEof.into()))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        assert_eq!(pages.version(slot), before);
    }

    #[test]
    fn read_validates_version() {
        let (pages, metrics) = store(1);
        let slot = pages.reserve(&metrics).unwrap();
        let version = pages
            .fill(slot, |buf| {
                buf[..4].copy_from_slice(&[1, 2, 3, 4]);
                Ok(())
            })
            .unwrap();

        let mut out = [0u8; 4];
        pages.read(slot, version, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        pages.release(slot, &metrics);
        let err = pages.read(slot, version, 0, &mut out).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn read_rejects_out_of_bounds_ranges() {
        let (pages, metrics) = store(1);
        let slot = pages.reserve(&metrics).unwrap();
        let version = pages.fill(slot, |_| Ok(())).unwrap();
        let mut out = [0u8; 8];
        assert!(matches!(
            pages.read(slot, version, 60, &mut out),
            Err(CacheError::OutOfBounds { .. })
        ));
    }
}
