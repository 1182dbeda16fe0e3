// The resource cache
//
// One Cache exists per guest VM. It owns the per-kind entry tables,
// the sync table that orders content versions, the sampler dedup map,
// and the pooled GPU-visible state (memory tables, GDS, descriptor
// sets) that tags borrow while they run.
//
// Austin Shafer - 2024

use crate::descpool::{DescPool, IndexPool};
use crate::entry::{CacheEntry, EntryType};
use crate::gcn::{ShaderFrontend, ShaderInfo};
use crate::gnm::{IndexType, PrimitiveType};
use crate::keys::SamplerKey;
use crate::page_map::PageMap;
use crate::platform::{
    BufferAlloc, BufferHandle, BufferUsage, Format, ImageHandle, ImageSubresourceRange,
    ImageViewHandle, MemoryLocation, Platform, SamplerHandle, ShaderHandle, ShaderStage,
};
use crate::range::AddressRange;
use crate::range_map::RangeMap;
use crate::remote::RemoteMemory;
use crate::scheduler::Scheduler;
use crate::tag::{ComputeTag, GraphicsTag, Tag};
use crate::tiler::GpuTiler;
use crate::Result;

extern crate utils as vortx_utils;
use vortx_utils::log;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Monotonic content generation stamp. Allocated in pairs per tag:
/// the even value orders reads, the odd value orders writes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagId(pub u64);

/// Bytes of one GPU-visible memory table.
pub(crate) const MEMORY_TABLE_SIZE: u64 = 0x10000;
/// Pooled memory tables; two can be held per tag (buffers + images).
pub(crate) const MEMORY_TABLE_COUNT: usize = 64;

/// Concurrent tags per cache.
const TAG_COUNT: usize = 128;

/// Byte size of the global data share mirror.
const GDS_SIZE: u64 = 0x40000;

/// A borrowed view of a cached host-visible buffer.
#[derive(Copy, Clone, Debug)]
pub struct Buffer {
    pub handle: BufferHandle,
    pub offset: u64,
    pub device_address: u64,
    pub tag_id: TagId,
    pub data: *mut u8,
}

/// A borrowed view of a cached device-local linear image mirror.
#[derive(Copy, Clone, Debug)]
pub struct ImageBuffer {
    pub handle: BufferHandle,
    pub offset: u64,
    pub device_address: u64,
    pub tag_id: TagId,
}

#[derive(Copy, Clone, Debug)]
pub struct Image {
    pub handle: ImageHandle,
    pub format: Format,
    pub subresource: ImageSubresourceRange,
}

#[derive(Copy, Clone, Debug)]
pub struct ImageView {
    pub handle: ImageViewHandle,
    pub image_handle: ImageHandle,
    pub subresource: ImageSubresourceRange,
}

#[derive(Copy, Clone, Debug)]
pub struct Sampler {
    pub handle: SamplerHandle,
}

/// A compiled shader. `handle` is None when translation or validation
/// failed; the caller substitutes a fallback and skips binding.
#[derive(Clone)]
pub struct Shader {
    pub handle: Option<ShaderHandle>,
    pub stage: ShaderStage,
    pub info: Option<Arc<ShaderInfo>>,
}

/// An index source for one draw. `handle` may be null when the draw
/// is non-indexed; offset/count still apply.
#[derive(Copy, Clone, Debug)]
pub struct IndexBuffer {
    pub handle: BufferHandle,
    pub offset: u64,
    pub index_count: u32,
    pub prim_type: PrimitiveType,
    pub index_type: IndexType,
}

/// Everything a Cache needs injected at creation. No globals.
pub struct CacheCreateInfo {
    pub platform: Arc<dyn Platform>,
    pub tiler: Arc<dyn GpuTiler>,
    pub frontend: Arc<dyn ShaderFrontend>,
    pub memory: RemoteMemory,
    pub pages: Arc<PageMap>,
    pub vm_id: u32,
    /// When false every buffer is re-uploaded on read acquire and the
    /// page tracker is ignored
    pub enable_gpu_cache: bool,
}

pub struct Cache {
    c_platform: Arc<dyn Platform>,
    c_tiler: Arc<dyn GpuTiler>,
    c_frontend: Arc<dyn ShaderFrontend>,
    c_memory: RemoteMemory,
    c_pages: Arc<PageMap>,
    c_vm_id: u32,
    c_enable_gpu_cache: bool,

    c_buffers: Mutex<RangeMap<Option<Arc<CacheEntry>>>>,
    c_image_buffers: Mutex<RangeMap<Option<Arc<CacheEntry>>>>,
    c_images: Mutex<RangeMap<Option<Arc<CacheEntry>>>>,
    c_index_buffers: Mutex<RangeMap<Option<Arc<CacheEntry>>>>,
    c_shaders: Mutex<RangeMap<Option<Arc<CacheEntry>>>>,
    /// TagId of the last write per range
    c_sync: Mutex<RangeMap<TagId>>,
    c_samplers: Mutex<HashMap<SamplerKey, SamplerHandle>>,

    c_next_tag_id: AtomicU64,
    pub(crate) c_tag_tokens: Mutex<IndexPool>,
    pub(crate) c_descpool: Mutex<DescPool>,
    pub(crate) c_memory_tables: Mutex<IndexPool>,
    c_memory_table_buffer: BufferAlloc,
    c_gds_buffer: BufferAlloc,
}

impl Cache {
    pub fn new(info: CacheCreateInfo) -> Result<Self> {
        let memory_table_buffer = info.platform.create_buffer(
            MemoryLocation::HostVisible,
            MEMORY_TABLE_SIZE * MEMORY_TABLE_COUNT as u64,
            BufferUsage::STORAGE,
        )?;

        let gds_buffer = info.platform.create_buffer(
            MemoryLocation::HostVisible,
            GDS_SIZE,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
        )?;

        let descpool = DescPool::new(info.platform.as_ref())?;

        Ok(Self {
            c_platform: info.platform,
            c_tiler: info.tiler,
            c_frontend: info.frontend,
            c_memory: info.memory,
            c_pages: info.pages,
            c_vm_id: info.vm_id,
            c_enable_gpu_cache: info.enable_gpu_cache,
            c_buffers: Mutex::new(RangeMap::new()),
            c_image_buffers: Mutex::new(RangeMap::new()),
            c_images: Mutex::new(RangeMap::new()),
            c_index_buffers: Mutex::new(RangeMap::new()),
            c_shaders: Mutex::new(RangeMap::new()),
            c_sync: Mutex::new(RangeMap::new()),
            c_samplers: Mutex::new(HashMap::new()),
            // Tag ids start above zero so a zero stamp always reads
            // as "never written"
            c_next_tag_id: AtomicU64::new(2),
            c_tag_tokens: Mutex::new(IndexPool::new(TAG_COUNT)),
            c_descpool: Mutex::new(descpool),
            c_memory_tables: Mutex::new(IndexPool::new(MEMORY_TABLE_COUNT)),
            c_memory_table_buffer: memory_table_buffer,
            c_gds_buffer: gds_buffer,
        })
    }

    pub fn vm_id(&self) -> u32 {
        self.c_vm_id
    }

    pub(crate) fn platform(&self) -> &dyn Platform {
        self.c_platform.as_ref()
    }

    pub(crate) fn platform_handle(&self) -> Arc<dyn Platform> {
        self.c_platform.clone()
    }

    pub(crate) fn tiler(&self) -> Arc<dyn GpuTiler> {
        self.c_tiler.clone()
    }

    pub(crate) fn frontend(&self) -> Arc<dyn ShaderFrontend> {
        self.c_frontend.clone()
    }

    pub(crate) fn memory(&self) -> RemoteMemory {
        self.c_memory
    }

    pub(crate) fn pages(&self) -> &PageMap {
        self.c_pages.as_ref()
    }

    pub(crate) fn gpu_cache_enabled(&self) -> bool {
        self.c_enable_gpu_cache
    }

    pub(crate) fn gds_address(&self) -> u64 {
        self.c_gds_buffer.device_address
    }

    /// View of one pooled memory table slot.
    pub(crate) fn memory_table_view(&self, slot: usize) -> Buffer {
        let offset = slot as u64 * MEMORY_TABLE_SIZE;
        Buffer {
            handle: self.c_memory_table_buffer.handle,
            offset,
            device_address: self.c_memory_table_buffer.device_address + offset,
            tag_id: TagId(0),
            data: unsafe { self.c_memory_table_buffer.data.add(offset as usize) },
        }
    }

    /// Allocate the next read/write TagId pair.
    fn next_tag_id(&self) -> TagId {
        TagId(self.c_next_tag_id.fetch_add(2, Ordering::Relaxed))
    }

    pub fn create_tag<'a>(&'a self, scheduler: &'a mut dyn Scheduler) -> Tag<'a> {
        Tag::new(self, scheduler, self.next_tag_id())
    }

    pub fn create_graphics_tag<'a>(&'a self, scheduler: &'a mut dyn Scheduler) -> GraphicsTag<'a> {
        GraphicsTag::new(Tag::new(self, scheduler, self.next_tag_id()))
    }

    pub fn create_compute_tag<'a>(&'a self, scheduler: &'a mut dyn Scheduler) -> ComputeTag<'a> {
        ComputeTag::new(Tag::new(self, scheduler, self.next_tag_id()))
    }

    pub(crate) fn table(&self, ty: EntryType) -> &Mutex<RangeMap<Option<Arc<CacheEntry>>>> {
        match ty {
            EntryType::Buffer => &self.c_buffers,
            EntryType::ImageBuffer => &self.c_image_buffers,
            EntryType::Image => &self.c_images,
            EntryType::IndexBuffer => &self.c_index_buffers,
            EntryType::Shader => &self.c_shaders,
        }
    }

    pub(crate) fn sampler_map(&self) -> &Mutex<HashMap<SamplerKey, SamplerHandle>> {
        &self.c_samplers
    }

    /// Record that `entry` now carries the content of `range` as of
    /// `tag_id`, and (re)insert it into its table.
    pub(crate) fn track_update(
        &self,
        ty: EntryType,
        range: AddressRange,
        entry: &Arc<CacheEntry>,
        tag_id: TagId,
        watch_changes: bool,
    ) {
        {
            let mut sync = self.c_sync.lock().unwrap();
            let slot = sync.map(range, TagId(0), false, true);
            if *slot < tag_id {
                *slot = tag_id;
            }
        }

        entry.set_tag_id(tag_id);

        {
            let mut table = self.table(ty).lock().unwrap();
            table.map(range, Some(entry.clone()), true, false);
        }

        if watch_changes {
            self.c_pages.watch(range);
        }
    }

    /// Record a write of `range` at `tag_id`. With `lock_memory` the
    /// external watcher re-arms so guest access forces a flush.
    pub(crate) fn track_write(&self, range: AddressRange, tag_id: TagId, lock_memory: bool) {
        {
            let mut sync = self.c_sync.lock().unwrap();
            let slot = sync.map(range, TagId(0), false, true);
            if *slot < tag_id {
                *slot = tag_id;
            }
        }

        if lock_memory {
            self.c_pages.watch(range);
        }
    }

    /// An entry with stamp `tag_id` is in sync over `range` iff the
    /// sync table records exactly that stamp across the whole range.
    pub(crate) fn is_in_sync(&self, range: AddressRange, tag_id: TagId) -> bool {
        let sync = self.c_sync.lock().unwrap();
        let mut covered = range.begin();

        for (arange, &stamp) in sync.lower_bound(range.begin()) {
            if arange.begin() > covered {
                return false;
            }
            if stamp != tag_id {
                return false;
            }

            covered = arange.end();
            if covered >= range.end() {
                return true;
            }
        }

        false
    }

    /// Fetch a table entry covering `range` whose content stamp still
    /// matches the sync table. Used by the shader lookup.
    pub(crate) fn get_in_sync_entry(
        &self,
        ty: EntryType,
        range: AddressRange,
    ) -> Option<Arc<CacheEntry>> {
        let entry = {
            let table = self.table(ty).lock().unwrap();
            match table.query_area(range.begin()) {
                Some((arange, Some(entry))) if arange.contains(range) => entry.clone(),
                _ => return None,
            }
        };

        let sync = self.c_sync.lock().unwrap();
        let (srange, &stamp) = sync.query_area(range.begin())?;
        if srange.end() < range.end() {
            return None;
        }
        if stamp != entry.tag_id() {
            return None;
        }

        Some(entry)
    }

    /// Collect entries of one kind overlapping `range`. The table
    /// lock drops before the caller runs flushes, so the nested
    /// acquisitions a flush performs cannot re-enter it.
    fn collect_overlaps(&self, ty: EntryType, range: AddressRange) -> Vec<Arc<CacheEntry>> {
        let table = self.table(ty).lock().unwrap();
        let mut result: Vec<Arc<CacheEntry>> = Vec::new();

        for (arange, payload) in table.lower_bound(range.begin()) {
            if arange.begin() >= range.end() {
                break;
            }

            if let Some(entry) = payload {
                if entry.e_range.intersects(range)
                    && !result.iter().any(|e| Arc::ptr_eq(e, entry))
                {
                    result.push(entry.clone());
                }
            }
        }

        result
    }

    /// Write dirty Images overlapping `range` back to their
    /// ImageBuffers. Returns the merged range of recorded work.
    pub(crate) fn flush_images(&self, tag: &mut Tag, range: AddressRange) -> Result<AddressRange> {
        let mut result = AddressRange::invalid();

        for entry in self.collect_overlaps(EntryType::Image, range) {
            if crate::image::flush_image(&entry, tag, entry.e_range)? {
                result = result.merge(entry.e_range);
            }
        }

        Ok(result)
    }

    /// Write dirty ImageBuffers overlapping `range` back to their
    /// Buffers.
    pub(crate) fn flush_image_buffers(
        &self,
        tag: &mut Tag,
        range: AddressRange,
    ) -> Result<AddressRange> {
        let mut result = AddressRange::invalid();

        for entry in self.collect_overlaps(EntryType::ImageBuffer, range) {
            if crate::image_buffer::flush_image_buffer(&entry, tag, entry.e_range)? {
                result = result.merge(entry.e_range);
            }
        }

        Ok(result)
    }

    /// Serialize dirty host-visible Buffers overlapping `range` back
    /// to guest memory.
    pub(crate) fn flush_buffers(&self, range: AddressRange) -> AddressRange {
        let mut result = AddressRange::invalid();

        for entry in self.collect_overlaps(EntryType::Buffer, range) {
            if crate::buffer::flush_buffer(&entry, &self.c_memory) {
                result = result.merge(entry.e_range);
            }
        }

        result
    }

    /// Materialize every host write overlapping `range` back toward
    /// guest memory, level by level: Image work first, then
    /// ImageBuffer work, each followed by a submit + wait so the
    /// lower level reads completed output, then the plain memcpy of
    /// the Buffer level.
    pub fn flush(&self, tag: &mut Tag, range: AddressRange) -> Result<()> {
        let mut flushed = self.flush_images(tag, range)?;
        flushed = flushed.merge(self.flush_image_buffers(tag, range)?);

        if flushed.is_valid() {
            tag.scheduler().submit()?;
            tag.scheduler().wait()?;
        }

        self.flush_buffers(range);
        Ok(())
    }

    /// Flush any host writes, then mark the pages dirty so the next
    /// read acquisition re-uploads from guest memory.
    pub fn invalidate(&self, tag: &mut Tag, range: AddressRange) -> Result<()> {
        self.flush(tag, range)?;
        self.c_pages.mark(range);

        log::debug!(
            "invalidated [{:#x}, {:#x}) for vm {}",
            range.begin(),
            range.end(),
            self.c_vm_id
        );
        Ok(())
    }
}
