// Per-page invalidation flags fed by the host fault handler
//
// Austin Shafer - 2024

use crate::range::AddressRange;

use std::sync::atomic::{AtomicU8, Ordering};

/// Host page granularity for write tracking.
pub const PAGE_SIZE: u64 = 0x1000;

/// Bit set by the host page-fault watcher when the guest CPU touched
/// a page behind the cache's back.
pub const PAGE_INVALIDATED: u8 = 1 << 0;

/// One atomic byte of flags per guest page.
///
/// The fault handler that sets bits lives outside this crate; the
/// cache only ever tests, consumes, and re-marks them. All accesses
/// are relaxed, the flag is a hint that forces a re-upload and never
/// carries data dependencies.
pub struct PageMap {
    pm_pages: Vec<AtomicU8>,
}

impl PageMap {
    /// Create a map covering `[0, page_count * PAGE_SIZE)`.
    pub fn new(page_count: usize) -> Self {
        let mut pages = Vec::with_capacity(page_count);
        pages.resize_with(page_count, || AtomicU8::new(0));

        Self { pm_pages: pages }
    }

    fn page_span(&self, range: AddressRange) -> std::ops::Range<usize> {
        let first = (range.begin() / PAGE_SIZE) as usize;
        let last = ((range.end() + PAGE_SIZE - 1) / PAGE_SIZE) as usize;

        first.min(self.pm_pages.len())..last.min(self.pm_pages.len())
    }

    /// Is any page in `range` marked invalidated?
    pub fn test(&self, range: AddressRange) -> bool {
        for page in self.page_span(range) {
            if self.pm_pages[page].load(Ordering::Relaxed) & PAGE_INVALIDATED != 0 {
                return true;
            }
        }

        false
    }

    /// Test and clear: returns true if any page in `range` was
    /// invalidated, clearing the flags as it goes.
    pub fn handle(&self, range: AddressRange) -> bool {
        let mut had_invalidations = false;

        for page in self.page_span(range) {
            let mut prev = self.pm_pages[page].load(Ordering::Relaxed);

            if prev & PAGE_INVALIDATED == 0 {
                continue;
            }

            while let Err(cur) = self.pm_pages[page].compare_exchange_weak(
                prev,
                prev & !PAGE_INVALIDATED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                prev = cur;
            }

            had_invalidations = true;
        }

        had_invalidations
    }

    /// Mark every page in `range` invalidated. Used by the coherency
    /// engine after guest-visible writes.
    pub fn mark(&self, range: AddressRange) {
        for page in self.page_span(range) {
            self.pm_pages[page].fetch_or(PAGE_INVALIDATED, Ordering::Relaxed);
        }
    }

    /// Arm tracking for `range`: the external watcher re-protects the
    /// pages, we start from a clean flag state.
    pub fn watch(&self, range: AddressRange) {
        for page in self.page_span(range) {
            self.pm_pages[page].fetch_and(!PAGE_INVALIDATED, Ordering::Relaxed);
        }
    }
}
