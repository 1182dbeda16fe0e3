// Host-visible linear buffers mirroring guest bytes
//
// Austin Shafer - 2024

use crate::entry::CacheEntry;
use crate::page_map::PAGE_SIZE;
use crate::platform::{BufferAlloc, MemoryLocation, Platform};
use crate::range::AddressRange;
use crate::remote::RemoteMemory;
use crate::tag::Tag;
use crate::Result;

use std::slice;
use std::sync::Arc;

/// Payload of a Buffer entry: a host-visible allocation of exactly
/// the entry range's size, addressable from both sides.
pub(crate) struct BufferPayload {
    pub b_alloc: BufferAlloc,
    pub b_location: MemoryLocation,
    /// Whether this buffer participates in page dirty tracking
    pub b_gpu_cache: bool,
    pub b_platform: Arc<dyn Platform>,
}

impl Drop for BufferPayload {
    fn drop(&mut self) {
        self.b_platform.destroy_buffer(self.b_alloc.handle);
    }
}

impl BufferPayload {
    /// Expensive buffers are worth keeping resident on the device:
    /// they span at least a page and caching is enabled. Anything
    /// smaller is simply re-uploaded on every read acquire.
    pub fn expensive(&self, range: AddressRange) -> bool {
        self.b_gpu_cache && range.size() >= PAGE_SIZE
    }

    /// Host bytes of this buffer for a guest subrange.
    ///
    /// Aliasing is governed by the acquisition protocol; the caller
    /// must hold the entry.
    pub fn data(&self, entry_range: AddressRange, range: AddressRange) -> &mut [u8] {
        assert!(self.b_location == MemoryLocation::HostVisible);
        assert!(entry_range.contains(range));
        assert!(!self.b_alloc.data.is_null());

        unsafe {
            slice::from_raw_parts_mut(
                self.b_alloc
                    .data
                    .add((range.begin() - entry_range.begin()) as usize),
                range.size() as usize,
            )
        }
    }

    /// Refill `range` from guest memory.
    pub fn update_from_guest(
        &self,
        entry_range: AddressRange,
        range: AddressRange,
        memory: &RemoteMemory,
    ) {
        memory.read(range, self.data(entry_range, range));
    }
}

/// Serialize this buffer's bytes back to guest memory if a flush is
/// owed. Returns true when a flush actually happened.
pub(crate) fn flush_buffer(entry: &CacheEntry, memory: &RemoteMemory) -> bool {
    if !entry.has_delayed_flush() {
        return false;
    }
    entry.set_delayed_flush(false);

    let payload = entry.as_buffer();
    memory.write(entry.e_range, payload.data(entry.e_range, entry.e_range));

    true
}

/// Release-time write-back for a Buffer entry acquired with WRITE.
///
/// Internal scratch buffers (range starting at zero) never flush.
/// Expensive buffers defer: the sync table is stamped and the flush
/// stays owed until something forces it. Cheap buffers go straight
/// back to guest memory.
pub(crate) fn release_buffer(entry: &CacheEntry, tag: &mut Tag) -> Result<bool> {
    if entry.e_range.begin() == 0 {
        return Ok(false);
    }

    let payload = entry.as_buffer();
    let locked = payload.expensive(entry.e_range);

    tag.cache()
        .track_write(entry.e_range, entry.tag_id(), locked);
    entry.set_delayed_flush(true);

    if locked {
        return Ok(false);
    }

    let memory = tag.cache().memory();
    flush_buffer(entry, &memory);
    Ok(false)
}
