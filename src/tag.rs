// Tags: one command stream's view of the cache
//
// A tag is a short lived, stack scoped handle. Everything it acquires
// stays acquired until release(), which walks the update chain from
// the top down (Image, then ImageBuffer, then Buffer) recording
// write-back work and submitting between levels so each level reads
// the completed output of the one above it.
//
// Austin Shafer - 2024

use crate::buffer::BufferPayload;
use crate::cache::{
    Buffer, Cache, Image, ImageBuffer, ImageView, IndexBuffer, Sampler, Shader, TagId,
};
use crate::descpool::{descriptor_binding, stage_index, stage_to_host};
use crate::entry::{CacheEntry, EntryPayload, EntryType};
use crate::gcn::{
    ConfigType, CsDispatchInput, CsSGprInput, Environment, PsVGprInput, SpiPsInput, Stage,
};
use crate::gnm::{DataFormat, IndexType, NumericFormat, PrimitiveType};
use crate::image::{ImagePayload, ImageViewPayload};
use crate::image_buffer::ImageBufferPayload;
use crate::index_buffer::{prim_converter, prim_requires_conversion, IndexBufferPayload};
use crate::keys::{ImageBufferKey, ImageKey, ImageKind, ImageViewKey, SamplerKey, ShaderKey};
use crate::platform::{
    BufferHandle, BufferUsage, DescriptorSetHandle, DescriptorType, DescriptorWrite, Format,
    ImageLayout, ImageSubresourceRange, ImageUsage, ImageViewType, MemoryLocation, ShaderStage,
};
use crate::range::AddressRange;
use crate::resources::{ConfigBuffer, MemoryTableConfigSlot, ShaderResources};
use crate::scheduler::Scheduler;
use crate::shader::ShaderPayload;
use crate::tiler::compute_surface_info;
use crate::{Access, Result};

extern crate utils as vortx_utils;
use vortx_utils::log;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// One viewport rectangle of the draw being assembled.
#[derive(Copy, Clone, Debug, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// The guest's viewport transform registers.
#[derive(Copy, Clone, Debug, Default)]
pub struct ViewportTransform {
    pub x_scale: f32,
    pub x_offset: f32,
    pub y_scale: f32,
    pub y_offset: f32,
    pub z_scale: f32,
    pub z_offset: f32,
}

/// Graphics register state the config-slot fixups read.
#[derive(Clone, Debug, Default)]
pub struct GraphicsContext {
    pub viewports: Vec<Viewport>,
    pub transforms: Vec<ViewportTransform>,
    /// Per render target component swap selectors
    pub cb_comp_swap: Vec<u32>,
}

/// One stage's shader program registers, distilled.
#[derive(Clone, Debug, Default)]
pub struct ShaderPgm {
    pub address: u64,
    pub vgpr_count: u8,
    pub sgpr_count: u8,
    pub user_sgprs: Vec<u32>,
}

/// Compute dispatch registers.
#[derive(Clone, Debug)]
pub struct ComputePgm {
    pub address: u64,
    pub vgpr_count: u8,
    pub sgpr_count: u8,
    pub num_thread_x: u8,
    pub num_thread_y: u8,
    pub num_thread_z: u8,
    pub user_sgprs: Vec<u32>,
    pub dispatch_input: CsDispatchInput,
    pub tg_id_comp_count: u32,
}

pub struct Tag<'a> {
    t_cache: &'a Cache,
    t_scheduler: &'a mut dyn Scheduler,
    /// Read id of this tag's id pair
    t_tag_id: TagId,
    t_token_slot: usize,
    t_released: bool,

    t_acquired_buffers: Vec<Arc<CacheEntry>>,
    t_acquired_image_buffers: Vec<Arc<CacheEntry>>,
    t_acquired_images: Vec<Arc<CacheEntry>>,
    /// Views, shaders and converted index buffers: held alive, never
    /// flushed
    t_acquired_views: Vec<Arc<CacheEntry>>,

    pub(crate) t_resources: ShaderResources,
    t_memory_table_slots: Vec<MemoryTableConfigSlot>,
    t_config_buffers: Vec<ConfigBuffer>,
    t_memory_table: Option<usize>,
    t_image_memory_table: Option<usize>,
}

impl<'a> Tag<'a> {
    pub(crate) fn new(cache: &'a Cache, scheduler: &'a mut dyn Scheduler, tag_id: TagId) -> Self {
        let token_slot = cache.c_tag_tokens.lock().unwrap().acquire();

        Self {
            t_cache: cache,
            t_scheduler: scheduler,
            t_tag_id: tag_id,
            t_token_slot: token_slot,
            t_released: false,
            t_acquired_buffers: Vec::new(),
            t_acquired_image_buffers: Vec::new(),
            t_acquired_images: Vec::new(),
            t_acquired_views: Vec::new(),
            t_resources: ShaderResources::default(),
            t_memory_table_slots: Vec::new(),
            t_config_buffers: Vec::new(),
            t_memory_table: None,
            t_image_memory_table: None,
        }
    }

    pub(crate) fn cache(&self) -> &'a Cache {
        self.t_cache
    }

    pub(crate) fn scheduler(&mut self) -> &mut dyn Scheduler {
        self.t_scheduler
    }

    /// Ownership token recorded on acquired entries.
    fn token(&self) -> u64 {
        self.t_token_slot as u64 + 1
    }

    pub fn read_id(&self) -> TagId {
        self.t_tag_id
    }

    pub fn write_id(&self) -> TagId {
        TagId(self.t_tag_id.0 + 1)
    }

    /// Flush any cached state overlapping `range` and copy the bytes
    /// out of guest memory.
    pub fn read_memory(&mut self, target: &mut [u8], range: AddressRange) -> Result<()> {
        let cache = self.t_cache;
        cache.flush(self, range)?;
        cache.memory().read(range, target);
        Ok(())
    }

    pub fn write_memory(&mut self, source: &[u8], range: AddressRange) -> Result<()> {
        let cache = self.t_cache;
        cache.flush(self, range)?;
        cache.memory().write(range, source);
        Ok(())
    }

    /// Flush-then-compare. True when guest memory equals `data`.
    pub fn compare_memory(&mut self, data: &[u8], range: AddressRange) -> Result<bool> {
        let cache = self.t_cache;
        cache.flush(self, range)?;
        Ok(cache.memory().compare(range, data))
    }

    /// Acquire the host-visible Buffer mirroring `range`.
    pub fn get_buffer(&mut self, range: AddressRange, access: Access) -> Result<Buffer> {
        let cache = self.t_cache;

        let existing = {
            let table = cache.table(EntryType::Buffer).lock().unwrap();
            match table.query_area(range.begin()) {
                Some((arange, Some(entry))) if arange.contains(range) => Some(entry.clone()),
                _ => None,
            }
        };

        let entry = match existing {
            Some(entry) => entry,
            None => {
                // Colliding higher-level content has to land in guest
                // memory before we mirror it
                let mut flushed = cache.flush_images(self, range)?;
                flushed = flushed.merge(cache.flush_image_buffers(self, range)?);
                if flushed.is_valid() {
                    self.t_scheduler.submit()?;
                    self.t_scheduler.wait()?;
                }
                cache.flush_buffers(range);

                let mut table = cache.table(EntryType::Buffer).lock().unwrap();
                let slot = table.map(range, None, false, true);
                if slot.is_none() {
                    let alloc = cache.platform().create_buffer(
                        MemoryLocation::HostVisible,
                        range.size(),
                        BufferUsage::TRANSFER_SRC
                            | BufferUsage::TRANSFER_DST
                            | BufferUsage::STORAGE
                            | BufferUsage::STORAGE_TEXEL
                            | BufferUsage::INDEX,
                    )?;

                    *slot = Some(Arc::new(CacheEntry::new(
                        range,
                        TagId(0),
                        EntryPayload::Buffer(BufferPayload {
                            b_alloc: alloc,
                            b_location: MemoryLocation::HostVisible,
                            b_gpu_cache: cache.gpu_cache_enabled(),
                            b_platform: cache.platform_handle(),
                        }),
                    )));
                }
                slot.clone().unwrap()
            }
        };

        entry.acquire(self.token(), access);
        let entry_range = entry.e_range;

        if access.contains(Access::READ) {
            let payload = entry.as_buffer();
            let needs_update = !payload.expensive(entry_range)
                || cache.pages().handle(entry_range)
                || !cache.is_in_sync(entry_range, entry.tag_id());

            if needs_update {
                let mut flushed = cache.flush_images(self, range)?;
                flushed = flushed.merge(cache.flush_image_buffers(self, range)?);
                if flushed.is_valid() {
                    self.t_scheduler.submit()?;
                    self.t_scheduler.wait()?;
                }

                cache.track_update(
                    EntryType::Buffer,
                    entry_range,
                    &entry,
                    self.read_id(),
                    !access.contains(Access::WRITE) && payload.expensive(entry_range),
                );
                payload.update_from_guest(entry_range, entry_range, &cache.memory());
            }
        }

        let payload = entry.as_buffer();
        let offset = range.begin() - entry_range.begin();
        let view = Buffer {
            handle: payload.b_alloc.handle,
            offset,
            device_address: payload.b_alloc.device_address + offset,
            tag_id: entry.tag_id(),
            data: unsafe { payload.b_alloc.data.add(offset as usize) },
        };

        self.t_acquired_buffers.push(entry);
        Ok(view)
    }

    /// An unmapped scratch buffer owned by this tag. Its range begins
    /// at zero, which is the marker release paths use to skip any
    /// flush toward guest memory.
    pub fn get_internal_buffer(&mut self, size: u64, location: MemoryLocation) -> Result<Buffer> {
        let cache = self.t_cache;
        let alloc = cache.platform().create_buffer(
            location,
            size,
            BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST | BufferUsage::STORAGE,
        )?;

        let entry = Arc::new(CacheEntry::new(
            AddressRange::from_begin_size(0, size),
            self.read_id(),
            EntryPayload::Buffer(BufferPayload {
                b_alloc: alloc,
                b_location: location,
                b_gpu_cache: false,
                b_platform: cache.platform_handle(),
            }),
        ));

        let view = Buffer {
            handle: alloc.handle,
            offset: 0,
            device_address: alloc.device_address,
            tag_id: self.read_id(),
            data: alloc.data,
        };

        self.t_acquired_buffers.push(entry);
        Ok(view)
    }

    /// Acquire the device-local de-tiled mirror for a tiled surface.
    pub fn get_image_buffer(&mut self, key: &ImageBufferKey, access: Access) -> Result<ImageBuffer> {
        let cache = self.t_cache;

        let surface = compute_surface_info(
            key.tile_mode,
            key.tex_type,
            key.dfmt,
            key.extent.width,
            key.extent.height,
            key.extent.depth,
            key.pitch,
            key.base_array_layer,
            key.array_layer_count,
            key.base_mip_level,
            key.mip_count,
            key.pow2pad,
        );
        let range = AddressRange::from_begin_size(key.address, surface.si_total_tiled_size);

        let overlaps = {
            let table = cache.table(EntryType::ImageBuffer).lock().unwrap();
            let mut list = Vec::new();
            for (arange, payload) in table.lower_bound(range.begin()) {
                if arange.begin() >= range.end() {
                    break;
                }
                if let Some(entry) = payload {
                    list.push((arange, entry.clone()));
                }
            }
            list
        };

        let mut recorded = false;
        for (arange, entry) in overlaps {
            if arange == range {
                let payload = entry.as_image_buffer();
                if payload.ib_key.dfmt == key.dfmt
                    && payload.ib_key.extent == key.extent
                    && payload.ib_key.pitch == key.pitch
                    && payload.ib_key.tile_mode == key.tile_mode
                {
                    break;
                }

                // Same range, different surface: evict, flushing any
                // content it still owes downward
                if crate::image_buffer::flush_image_buffer(&entry, self, entry.e_range)? {
                    recorded = true;
                }
                let mut table = cache.table(EntryType::ImageBuffer).lock().unwrap();
                if let Some((_, slot)) = table.query_area_mut(arange.begin()) {
                    *slot = None;
                }
                break;
            }

            if crate::image_buffer::flush_image_buffer(&entry, self, entry.e_range)? {
                recorded = true;
            }
        }

        if recorded {
            self.t_scheduler.submit()?;
            self.t_scheduler.wait()?;
        }

        let entry = {
            let mut table = cache.table(EntryType::ImageBuffer).lock().unwrap();
            let slot = table.map(range, None, false, true);
            if slot.is_none() {
                let alloc = cache.platform().create_buffer(
                    MemoryLocation::DeviceLocal,
                    surface.si_total_linear_size,
                    BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                )?;

                *slot = Some(Arc::new(CacheEntry::new(
                    range,
                    TagId(0),
                    EntryPayload::ImageBuffer(ImageBufferPayload {
                        ib_handle: alloc.handle,
                        ib_device_address: alloc.device_address,
                        ib_key: *key,
                        ib_tile_mode: key.tile_mode,
                        ib_info: surface,
                        ib_platform: cache.platform_handle(),
                    }),
                )));
            }
            slot.clone().unwrap()
        };

        entry.acquire(self.token(), access);

        if access.contains(Access::READ) {
            // ImageBuffers are never "expensive", so every read
            // acquisition consults the Buffer below; the tag-id
            // comparison is what makes the common case free
            let tiled = self.get_buffer(range, Access::READ)?;
            if tiled.tag_id != entry.tag_id() {
                cache.track_update(EntryType::ImageBuffer, range, &entry, tiled.tag_id, false);
                entry
                    .as_image_buffer()
                    .update(self, entry.e_range, entry.e_range, &tiled)?;
            }
        }

        let payload = entry.as_image_buffer();
        let view = ImageBuffer {
            handle: payload.ib_handle,
            offset: 0,
            device_address: payload.ib_device_address,
            tag_id: entry.tag_id(),
        };

        self.t_acquired_image_buffers.push(entry);
        Ok(view)
    }

    /// Acquire the sampled Image for a surface key.
    pub fn get_image(&mut self, key: &ImageKey, access: Access) -> Result<Image> {
        let cache = self.t_cache;

        let surface = compute_surface_info(
            key.tile_mode,
            key.tex_type,
            key.dfmt,
            key.extent.width,
            key.extent.height,
            key.extent.depth,
            key.pitch,
            key.base_array_layer,
            key.array_layer_count,
            key.base_mip_level,
            key.mip_count,
            key.pow2pad,
        );

        let update_range = AddressRange::from_begin_size(key.read_address, surface.si_total_tiled_size);
        let store_range = if access.contains(Access::WRITE) {
            AddressRange::from_begin_size(key.write_address, surface.si_total_tiled_size)
        } else {
            update_range
        };

        let overlaps = {
            let table = cache.table(EntryType::Image).lock().unwrap();
            let mut list = Vec::new();
            for (arange, payload) in table.lower_bound(store_range.begin()) {
                if arange.begin() >= store_range.end() {
                    break;
                }
                if let Some(entry) = payload {
                    list.push((arange, entry.clone()));
                }
            }
            list
        };

        let mut recorded = false;
        for (arange, entry) in overlaps {
            if arange == store_range {
                let payload = entry.as_image();
                let compatible = payload.i_format == image_format(key)
                    && payload.i_extent == key.extent
                    && payload.i_image_buffer_key.pitch == key.pitch
                    && payload.i_image_buffer_key.tile_mode == key.tile_mode
                    && payload.i_kind == key.kind;

                if compatible {
                    break;
                }

                if crate::image::flush_image(&entry, self, entry.e_range)? {
                    recorded = true;
                }
                let mut table = cache.table(EntryType::Image).lock().unwrap();
                if let Some((_, slot)) = table.query_area_mut(arange.begin()) {
                    *slot = None;
                }
                break;
            }

            if crate::image::flush_image(&entry, self, entry.e_range)? {
                recorded = true;
            }
        }

        if recorded {
            self.t_scheduler.submit()?;
            self.t_scheduler.wait()?;
        }

        let existing = {
            let mut table = cache.table(EntryType::Image).lock().unwrap();
            table.map(store_range, None, false, true).clone()
        };

        let entry = match existing {
            Some(entry) => entry,
            None => {
                // Build outside the table lock; if another stream won
                // the race in between, its entry wins
                let fresh = self.create_image_entry(key, store_range, &surface)?;
                let mut table = cache.table(EntryType::Image).lock().unwrap();
                let slot = table.map(store_range, None, false, true);
                if slot.is_none() {
                    *slot = Some(fresh);
                }
                slot.clone().unwrap()
            }
        };

        entry.acquire(self.token(), access);

        if access.contains(Access::READ) {
            let mut ib_key = entry.as_image().i_image_buffer_key;
            ib_key.address = key.read_address;

            let image_buffer = self.get_image_buffer(&ib_key, Access::READ)?;
            if image_buffer.tag_id != entry.tag_id() {
                cache.track_update(
                    EntryType::Image,
                    store_range,
                    &entry,
                    image_buffer.tag_id,
                    false,
                );
                entry
                    .as_image()
                    .update(self, entry.e_range, entry.e_range, &image_buffer)?;
            }
        }

        let payload = entry.as_image();
        let view = Image {
            handle: payload.i_handle,
            format: payload.i_format,
            subresource: payload.subresource(entry.e_range, store_range),
        };

        self.t_acquired_images.push(entry);
        Ok(view)
    }

    fn create_image_entry(
        &mut self,
        key: &ImageKey,
        store_range: AddressRange,
        surface: &crate::tiler::SurfaceInfo,
    ) -> Result<Arc<CacheEntry>> {
        let cache = self.t_cache;

        let mut usage = ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST;
        match key.kind {
            ImageKind::Color => {
                usage |= ImageUsage::SAMPLED;
                if !key.dfmt.is_compressed() {
                    usage |= ImageUsage::COLOR_ATTACHMENT;
                }
            }
            ImageKind::Depth | ImageKind::Stencil => {
                usage |= ImageUsage::DEPTH_STENCIL_ATTACHMENT;
            }
        }

        // The host image always carries the full chain; a key's base
        // mip/layer only window it for the requesting view
        let format = image_format(key);
        let handle = cache.platform().create_image(
            view_type(key.tex_type),
            key.extent,
            surface.si_mip_count,
            surface.si_array_layers,
            format,
            usage,
        )?;

        let payload = ImagePayload {
            i_handle: handle,
            i_kind: key.kind,
            i_format: format,
            i_extent: key.extent,
            i_mip_levels: surface.si_mip_count,
            i_array_layers: surface.si_array_layers,
            i_pitch: key.pitch,
            i_image_buffer_key: ImageBufferKey::from_image_key(key),
            i_info: *surface,
            i_platform: cache.platform_handle(),
        };

        let subresource = ImageSubresourceRange {
            aspect: key.kind.aspect(),
            base_mip_level: 0,
            level_count: surface.si_mip_count,
            base_array_layer: 0,
            layer_count: surface.si_array_layers,
        };

        let cmd = self.t_scheduler.get_command_buffer();
        cache.platform().cmd_transition_image(
            cmd,
            handle,
            ImageLayout::Undefined,
            ImageLayout::General,
            subresource,
        );

        Ok(Arc::new(CacheEntry::new(
            store_range,
            TagId(0),
            EntryPayload::Image(payload),
        )))
    }

    /// Acquire a view over the Image a T# describes. Views are cheap
    /// and stateless; one is built per acquisition and lives only as
    /// long as this tag.
    pub fn get_image_view(&mut self, key: &ImageViewKey, access: Access) -> Result<ImageView> {
        let cache = self.t_cache;
        let image = self.get_image(&ImageKey::from_view(key), access)?;

        let subresource = ImageSubresourceRange {
            aspect: key.image.kind.aspect(),
            base_mip_level: key.image.base_mip_level,
            level_count: key.image.mip_count,
            base_array_layer: key.image.base_array_layer,
            layer_count: key.image.array_layer_count,
        };

        let handle = cache.platform().create_image_view(
            image.handle,
            view_type(key.image.tex_type),
            image.format,
            key.swizzle,
            subresource,
        )?;

        let surface = compute_surface_info(
            key.image.tile_mode,
            key.image.tex_type,
            key.image.dfmt,
            key.image.extent.width,
            key.image.extent.height,
            key.image.extent.depth,
            key.image.pitch,
            key.image.base_array_layer,
            key.image.array_layer_count,
            key.image.base_mip_level,
            key.image.mip_count,
            key.image.pow2pad,
        );

        let entry = Arc::new(CacheEntry::new(
            AddressRange::from_begin_size(key.image.write_address, surface.si_total_tiled_size),
            self.read_id(),
            EntryPayload::ImageView(ImageViewPayload {
                v_handle: handle,
                v_image: image.handle,
                v_platform: cache.platform_handle(),
            }),
        ));
        self.t_acquired_views.push(entry);

        Ok(ImageView {
            handle,
            image_handle: image.handle,
            subresource: image.subresource,
        })
    }

    /// Deduplicated immutable sampler for a normalized S# record.
    pub fn get_sampler(&mut self, key: &SamplerKey) -> Result<Sampler> {
        let cache = self.t_cache;
        let mut samplers = cache.sampler_map().lock().unwrap();

        if let Some(&handle) = samplers.get(key) {
            return Ok(Sampler { handle });
        }

        let handle = cache.platform().create_sampler(key)?;
        samplers.insert(*key, handle);
        Ok(Sampler { handle })
    }

    fn find_shader(
        &mut self,
        key: &ShaderKey,
        _depended_key: Option<&ShaderKey>,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let magic_range = AddressRange::from_begin_size(key.address, 8);

        let Some(entry) = self
            .t_cache
            .get_in_sync_entry(EntryType::Shader, magic_range)
        else {
            return Ok(None);
        };

        let mut magic = [0u8; 8];
        self.read_memory(&mut magic, magic_range)?;

        let payload = entry.as_shader();
        if payload.sh_magic != u64::from_le_bytes(magic) {
            return Ok(None);
        }

        for &(index, sgpr) in payload.sh_info.required_sgprs.iter() {
            if key.env.user_sgprs.get(index as usize) != Some(&sgpr) {
                return Ok(None);
            }
        }

        for (address, bytes) in payload.sh_used_memory.iter() {
            let range = AddressRange::from_begin_size(*address, bytes.len() as u64);
            if !self.compare_memory(bytes, range)? {
                return Ok(None);
            }
        }

        Ok(Some(entry))
    }

    /// Look up or translate the shader at `key.address`. A returned
    /// shader with no handle means translation failed and the draw
    /// should fall back. `depended_key` names a paired stage whose
    /// lookup outcome this one follows.
    pub fn get_shader(
        &mut self,
        key: &ShaderKey,
        depended_key: Option<&ShaderKey>,
    ) -> Result<Shader> {
        let cache = self.t_cache;
        let stage = stage_to_host(key.stage);

        if let Some(entry) = self.find_shader(key, depended_key)? {
            let payload = entry.as_shader();
            let shader = Shader {
                handle: Some(payload.sh_handle),
                stage,
                info: Some(payload.sh_info.clone()),
            };
            self.t_acquired_views.push(entry);
            return Ok(shader);
        }

        let memory = cache.memory();
        let converted = cache.frontend().convert(key.address, key.stage, &key.env, &mut |addr| {
            memory.read_u32(addr)
        });

        let Some(converted) = converted else {
            log::error!("shader translation failed for {:#x}", key.address);
            return Ok(Shader {
                handle: None,
                stage,
                info: None,
            });
        };

        let layouts = {
            let descpool = cache.c_descpool.lock().unwrap();
            if stage == ShaderStage::Compute {
                vec![descpool.dp_compute_layout]
            } else {
                descpool.dp_graphics_layouts.clone()
            }
        };

        let Some(handle) = cache.platform().create_shader(stage, &converted.spv, &layouts)? else {
            log::error!("host rejected translated shader for {:#x}", key.address);
            return Ok(Shader {
                handle: None,
                stage,
                info: None,
            });
        };

        let magic_range = AddressRange::from_begin_size(key.address, 8);
        let mut magic = [0u8; 8];
        self.read_memory(&mut magic, magic_range)?;

        let mut used_memory = Vec::with_capacity(converted.info.memory_map.len());
        for range in converted.info.memory_map.iter() {
            let mut bytes = vec![0u8; range.size() as usize];
            self.read_memory(&mut bytes, *range)?;
            used_memory.push((range.begin(), bytes));
        }

        let info = Arc::new(converted.info);
        let entry = Arc::new(CacheEntry::new(
            magic_range,
            self.read_id(),
            EntryPayload::Shader(ShaderPayload {
                sh_handle: handle,
                sh_magic: u64::from_le_bytes(magic),
                sh_info: info.clone(),
                sh_used_memory: used_memory,
                sh_platform: cache.platform_handle(),
            }),
        ));

        cache.track_update(EntryType::Shader, magic_range, &entry, self.read_id(), true);
        self.t_acquired_views.push(entry);

        Ok(Shader {
            handle: Some(handle),
            stage,
            info: Some(info),
        })
    }

    /// Index source for one draw: either the guest indices verbatim
    /// or a cached triangle-list expansion.
    pub fn get_index_buffer(
        &mut self,
        address: u64,
        index_offset: u32,
        mut index_count: u32,
        mut prim_type: PrimitiveType,
        mut index_type: IndexType,
    ) -> Result<IndexBuffer> {
        let cache = self.t_cache;
        let orig_index_size = index_type.size();
        let size = index_count as u64 * orig_index_size;

        if address == 0 {
            // Auto-generated indices; only the counts change shape
            if prim_requires_conversion(prim_type) {
                prim_converter(prim_type, &mut index_count);
                prim_type = PrimitiveType::TriList;
            }

            return Ok(IndexBuffer {
                handle: BufferHandle::null(),
                offset: index_offset as u64,
                index_count,
                prim_type,
                index_type,
            });
        }

        let range = AddressRange::from_begin_size(
            address + index_offset as u64 * orig_index_size,
            size,
        );

        let source = self.get_buffer(range, Access::READ)?;

        if !prim_requires_conversion(prim_type) {
            return Ok(IndexBuffer {
                handle: source.handle,
                offset: source.offset,
                index_count,
                prim_type,
                index_type,
            });
        }

        // A converted copy is reusable while the source bytes are
        // still at the generation we converted from
        let cached = {
            let table = cache.table(EntryType::IndexBuffer).lock().unwrap();
            match table.query_area(range.begin()) {
                Some((arange, Some(entry))) if arange == range => Some(entry.clone()),
                _ => None,
            }
        };

        if let Some(entry) = cached {
            if entry.tag_id() == source.tag_id && entry.e_range == range {
                let payload = entry.as_index_buffer();
                prim_converter(prim_type, &mut index_count);
                let result = IndexBuffer {
                    handle: payload.idx_handle,
                    offset: payload.idx_offset,
                    index_count,
                    prim_type: payload.idx_prim_type,
                    index_type: payload.idx_index_type,
                };
                self.t_acquired_views.push(entry);
                return Ok(result);
            }
        }

        let converter = prim_converter(prim_type, &mut index_count);
        prim_type = PrimitiveType::TriList;

        if index_count >= 0x10000 {
            index_type = IndexType::Int32;
        }
        let index_size = index_type.size();
        let converted_size = index_size * index_count as u64;

        let alloc = cache.platform().create_buffer(
            MemoryLocation::HostVisible,
            converted_size,
            BufferUsage::TRANSFER_DST | BufferUsage::INDEX,
        )?;

        let src = unsafe {
            std::slice::from_raw_parts(source.data, size as usize)
        };
        let dst = unsafe {
            std::slice::from_raw_parts_mut(alloc.data, converted_size as usize)
        };

        for i in 0..index_count as u64 {
            let (dst_index, src_index) = converter(i);

            let orig: u32 = if orig_index_size == 2 {
                let at = src_index as usize * 2;
                u16::from_le_bytes([src[at], src[at + 1]]) as u32
            } else {
                let at = src_index as usize * 4;
                u32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
            };

            if index_size == 2 {
                let at = dst_index as usize * 2;
                dst[at..at + 2].copy_from_slice(&(orig as u16).to_le_bytes());
            } else {
                let at = dst_index as usize * 4;
                dst[at..at + 4].copy_from_slice(&orig.to_le_bytes());
            }
        }

        let entry = Arc::new(CacheEntry::new(
            range,
            source.tag_id,
            EntryPayload::IndexBuffer(IndexBufferPayload {
                idx_handle: alloc.handle,
                idx_offset: 0,
                idx_index_type: index_type,
                idx_prim_type: prim_type,
                idx_platform: cache.platform_handle(),
            }),
        ));

        cache.track_update(EntryType::IndexBuffer, range, &entry, source.tag_id, true);
        self.t_acquired_views.push(entry);

        Ok(IndexBuffer {
            handle: alloc.handle,
            offset: 0,
            index_count,
            prim_type,
            index_type,
        })
    }

    /// This tag's buffer memory table slot, acquired on first use.
    pub(crate) fn get_memory_table(&mut self) -> Buffer {
        let cache = self.t_cache;
        let slot = *self
            .t_memory_table
            .get_or_insert_with(|| cache.c_memory_tables.lock().unwrap().acquire());
        cache.memory_table_view(slot)
    }

    pub(crate) fn get_image_memory_table(&mut self) -> Buffer {
        let cache = self.t_cache;
        let slot = *self
            .t_image_memory_table
            .get_or_insert_with(|| cache.c_memory_tables.lock().unwrap().acquire());
        cache.memory_table_view(slot)
    }

    /// Resolve everything the loaded shaders asked for into the
    /// memory tables and write the sampler/image descriptors of
    /// `set`. Late ResourceSlot config fixups land here too.
    pub fn build_descriptors(&mut self, set: DescriptorSetHandle) -> Result<()> {
        let cache = self.t_cache;
        let memory_table = self.get_memory_table();
        let image_memory_table = self.get_image_memory_table();

        let mut res = std::mem::take(&mut self.t_resources);
        let built = res
            .build_memory_table(self, &memory_table)
            .and_then(|_| res.build_image_memory_table(self, &image_memory_table));

        let platform = cache.platform();
        for (index, sampler) in res.sr_sampler_resources.iter().enumerate() {
            platform.write_descriptor(
                set,
                descriptor_binding(DescriptorType::Sampler, 0),
                index as u32,
                DescriptorWrite::Sampler(sampler.handle),
            );
        }

        for dim in 0..3 {
            let binding = descriptor_binding(DescriptorType::SampledImage, dim + 1);
            for (index, image) in res.sr_image_resources[dim].iter().enumerate() {
                platform.write_descriptor(
                    set,
                    binding,
                    index as u32,
                    DescriptorWrite::SampledImage(image.handle),
                );
            }
        }

        for fixup in self.t_memory_table_slots.iter() {
            let config = self.t_config_buffers[fixup.mt_buffer_index as usize];
            config.write(
                fixup.mt_config_index as usize,
                res.get_resource_slot(fixup.mt_resource_slot),
            );
        }

        self.t_resources = res;
        built
    }

    fn release_entry(&mut self, entry: &Arc<CacheEntry>) -> Result<bool> {
        let Some(access) = entry.begin_release(self.token()) else {
            return Ok(false);
        };

        let mut recorded = false;
        if access.contains(Access::WRITE) {
            entry.set_tag_id(self.write_id());

            recorded = match &entry.e_payload {
                EntryPayload::Buffer(_) => crate::buffer::release_buffer(entry, self)?,
                EntryPayload::ImageBuffer(_) => {
                    crate::image_buffer::release_image_buffer(entry, self)?
                }
                EntryPayload::Image(_) => crate::image::release_image(entry, self)?,
                _ => false,
            };
        }

        entry.finish_release(self.token());
        Ok(recorded)
    }

    /// Hand everything back: write-back flows down the update chain
    /// with a submit + wait between levels, then pooled slots return.
    pub fn release(&mut self) -> Result<()> {
        if self.t_released {
            return Ok(());
        }
        self.t_released = true;

        let cache = self.t_cache;

        if let Some(slot) = self.t_memory_table.take() {
            cache.c_memory_tables.lock().unwrap().release(slot);
        }
        if let Some(slot) = self.t_image_memory_table.take() {
            cache.c_memory_tables.lock().unwrap().release(slot);
        }

        // Entries stay alive in here until all write-back submitted
        let mut done = Vec::new();
        let mut recorded = false;

        while let Some(entry) = self.t_acquired_images.pop() {
            if self.release_entry(&entry)? {
                recorded = true;
            }
            done.push(entry);
        }
        if recorded {
            recorded = false;
            self.t_scheduler.submit()?;
            self.t_scheduler.wait()?;
        }

        while let Some(entry) = self.t_acquired_image_buffers.pop() {
            if self.release_entry(&entry)? {
                recorded = true;
            }
            done.push(entry);
        }
        if recorded {
            self.t_scheduler.submit()?;
            self.t_scheduler.wait()?;
        }

        while let Some(entry) = self.t_acquired_buffers.pop() {
            self.release_entry(&entry)?;
            done.push(entry);
        }

        self.t_acquired_views.clear();
        self.t_resources = ShaderResources::default();
        self.t_memory_table_slots.clear();
        self.t_config_buffers.clear();
        drop(done);

        cache.c_tag_tokens.lock().unwrap().release(self.t_token_slot);
        Ok(())
    }
}

impl<'a> Drop for Tag<'a> {
    fn drop(&mut self) {
        if !self.t_released {
            // Release is mandatory on all paths; do our best from
            // here but the caller should have submitted first
            if let Err(e) = self.release() {
                log::error!("tag dropped without release: {:?}", e);
            }
        }
    }
}

fn image_format(key: &ImageKey) -> Format {
    match key.kind {
        ImageKind::Color => crate::platform::format_from_gnm(key.dfmt, key.nfmt),
        ImageKind::Depth => match (key.dfmt, key.nfmt) {
            (DataFormat::Fmt32, NumericFormat::Float) => Format::D32Float,
            (DataFormat::Fmt16, NumericFormat::UNorm) => Format::D16Unorm,
            _ => panic!("unexpected depth format {:?}, {:?}", key.dfmt, key.nfmt),
        },
        ImageKind::Stencil => match (key.dfmt, key.nfmt) {
            (DataFormat::Fmt8, NumericFormat::UInt) => Format::S8Uint,
            _ => panic!("unexpected stencil format {:?}, {:?}", key.dfmt, key.nfmt),
        },
    }
}

fn view_type(tex_type: crate::gnm::TextureType) -> ImageViewType {
    use crate::gnm::TextureType;
    match tex_type {
        TextureType::Dim1D => ImageViewType::Type1D,
        TextureType::Dim2D | TextureType::Msaa2D => ImageViewType::Type2D,
        TextureType::Dim3D => ImageViewType::Type3D,
        TextureType::Cube => ImageViewType::Cube,
        TextureType::Array1D => ImageViewType::Array1D,
        TextureType::Array2D | TextureType::MsaaArray2D => ImageViewType::Array2D,
    }
}

/// A tag that also owns per-stage graphics descriptor sets and knows
/// how to patch graphics config slots.
pub struct GraphicsTag<'a> {
    t_base: Tag<'a>,
    g_descriptor_slot: Option<usize>,
    g_descriptor_sets: Vec<DescriptorSetHandle>,
}

impl<'a> Deref for GraphicsTag<'a> {
    type Target = Tag<'a>;

    fn deref(&self) -> &Self::Target {
        &self.t_base
    }
}

impl<'a> DerefMut for GraphicsTag<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.t_base
    }
}

impl<'a> GraphicsTag<'a> {
    pub(crate) fn new(base: Tag<'a>) -> Self {
        Self {
            t_base: base,
            g_descriptor_slot: None,
            g_descriptor_sets: Vec::new(),
        }
    }

    /// The per-stage descriptor sets for this tag, acquired from the
    /// pool on first use.
    pub fn get_descriptor_sets(&mut self) -> Vec<DescriptorSetHandle> {
        if self.g_descriptor_slot.is_none() {
            let (slot, sets) = self
                .t_base
                .cache()
                .c_descpool
                .lock()
                .unwrap()
                .acquire_graphics_sets();
            self.g_descriptor_slot = Some(slot);
            self.g_descriptor_sets = sets;
        }

        self.g_descriptor_sets.clone()
    }

    pub fn get_pixel_shader(
        &mut self,
        pgm: &ShaderPgm,
        spi_inputs: SpiPsInput,
        ctx: &GraphicsContext,
    ) -> Result<Shader> {
        let mut inputs = Vec::new();

        if spi_inputs.contains(SpiPsInput::PERSP_SAMPLE_ENA) {
            inputs.push(PsVGprInput::IPerspSample);
            inputs.push(PsVGprInput::JPerspSample);
        }
        if spi_inputs.contains(SpiPsInput::PERSP_CENTER_ENA) {
            inputs.push(PsVGprInput::IPerspCenter);
            inputs.push(PsVGprInput::JPerspCenter);
        }
        if spi_inputs.contains(SpiPsInput::PERSP_CENTROID_ENA) {
            inputs.push(PsVGprInput::IPerspCentroid);
            inputs.push(PsVGprInput::JPerspCentroid);
        }
        if spi_inputs.contains(SpiPsInput::PERSP_PULL_MODEL_ENA) {
            inputs.push(PsVGprInput::IW);
            inputs.push(PsVGprInput::JW);
            inputs.push(PsVGprInput::W1);
        }
        if spi_inputs.contains(SpiPsInput::LINEAR_SAMPLE_ENA) {
            inputs.push(PsVGprInput::ILinearSample);
            inputs.push(PsVGprInput::JLinearSample);
        }
        if spi_inputs.contains(SpiPsInput::LINEAR_CENTER_ENA) {
            inputs.push(PsVGprInput::ILinearCenter);
            inputs.push(PsVGprInput::JLinearCenter);
        }
        if spi_inputs.contains(SpiPsInput::LINEAR_CENTROID_ENA) {
            inputs.push(PsVGprInput::ILinearCentroid);
            inputs.push(PsVGprInput::JLinearCentroid);
        }
        if spi_inputs.contains(SpiPsInput::POS_X_FLOAT_ENA) {
            inputs.push(PsVGprInput::X);
        }
        if spi_inputs.contains(SpiPsInput::POS_Y_FLOAT_ENA) {
            inputs.push(PsVGprInput::Y);
        }
        if spi_inputs.contains(SpiPsInput::POS_Z_FLOAT_ENA) {
            inputs.push(PsVGprInput::Z);
        }
        if spi_inputs.contains(SpiPsInput::POS_W_FLOAT_ENA) {
            inputs.push(PsVGprInput::W);
        }
        if spi_inputs.contains(SpiPsInput::FRONT_FACE_ENA) {
            inputs.push(PsVGprInput::FrontFace);
        }
        if spi_inputs.contains(SpiPsInput::ANCILLARY_ENA) {
            panic!("unimplemented ancillary fs input");
        }
        if spi_inputs.contains(SpiPsInput::SAMPLE_COVERAGE_ENA) {
            panic!("unimplemented sample coverage fs input");
        }
        if spi_inputs.contains(SpiPsInput::POS_FIXED_PT_ENA) {
            panic!("unimplemented pos fixed fs input");
        }

        self.get_stage_shader(Stage::Ps, pgm, ctx, 0, PrimitiveType::None, &inputs)
    }

    pub fn get_vertex_shader(
        &mut self,
        pgm: &ShaderPgm,
        prim_type: PrimitiveType,
        index_offset: u32,
        ctx: &GraphicsContext,
    ) -> Result<Shader> {
        self.get_stage_shader(Stage::VsVs, pgm, ctx, index_offset, prim_type, &[])
    }

    fn get_stage_shader(
        &mut self,
        stage: Stage,
        pgm: &ShaderPgm,
        ctx: &GraphicsContext,
        index_offset: u32,
        prim_type: PrimitiveType,
        ps_inputs: &[PsVGprInput],
    ) -> Result<Shader> {
        let sets = self.get_descriptor_sets();

        let env = Environment {
            vgpr_count: pgm.vgpr_count,
            sgpr_count: pgm.sgpr_count,
            user_sgprs: pgm.user_sgprs.clone(),
            ..Default::default()
        };

        let shader = self.t_base.get_shader(
            &ShaderKey {
                address: pgm.address,
                stage,
                env,
            },
            None,
        )?;

        let (Some(_), Some(info)) = (shader.handle, shader.info.clone()) else {
            return Ok(shader);
        };

        let memory_table_address = self.t_base.get_memory_table().device_address;
        let image_memory_table_address = self.t_base.get_image_memory_table().device_address;
        let gds_address = self.t_base.cache().gds_address();

        let slot_offset = self.t_base.t_resources.sr_slot_offset;

        let mut res = std::mem::take(&mut self.t_base.t_resources);
        let loaded = res.load_resources(&mut self.t_base, &info.resources, &pgm.user_sgprs);
        self.t_base.t_resources = res;
        loaded?;

        let config_slots = &info.config_slots;
        let config_size = (config_slots.len().max(1) * 4) as u64;
        let config = self
            .t_base
            .get_internal_buffer(config_size, MemoryLocation::HostVisible)?;
        let config_buf = ConfigBuffer {
            cb_data: config.data as *mut u32,
            cb_len: config_slots.len().max(1),
        };

        for (index, slot) in config_slots.iter().enumerate() {
            let d = slot.cs_data as usize;

            match slot.cs_type {
                ConfigType::Imm => {
                    let mut bytes = [0u8; 4];
                    self.t_base
                        .read_memory(&mut bytes, AddressRange::from_begin_size(slot.cs_data, 4))?;
                    config_buf.write(index, u32::from_le_bytes(bytes));
                }
                ConfigType::UserSgpr => {
                    config_buf.write(index, pgm.user_sgprs[d]);
                }
                ConfigType::ViewPortOffsetX => {
                    let value =
                        ctx.transforms[d].x_offset / (ctx.viewports[d].width / 2.0) - 1.0;
                    config_buf.write(index, value.to_bits());
                }
                ConfigType::ViewPortOffsetY => {
                    let value =
                        ctx.transforms[d].y_offset / (ctx.viewports[d].height / 2.0) - 1.0;
                    config_buf.write(index, value.to_bits());
                }
                ConfigType::ViewPortOffsetZ => {
                    config_buf.write(index, ctx.transforms[d].z_offset.to_bits());
                }
                ConfigType::ViewPortScaleX => {
                    let value = ctx.transforms[d].x_scale / (ctx.viewports[d].width / 2.0);
                    config_buf.write(index, value.to_bits());
                }
                ConfigType::ViewPortScaleY => {
                    let value = ctx.transforms[d].y_scale / (ctx.viewports[d].height / 2.0);
                    config_buf.write(index, value.to_bits());
                }
                ConfigType::ViewPortScaleZ => {
                    config_buf.write(index, ctx.transforms[d].z_scale.to_bits());
                }
                ConfigType::PsInputVGpr => {
                    let value = match ps_inputs.get(d) {
                        Some(&input) => input as u32,
                        None => !0,
                    };
                    config_buf.write(index, value);
                }
                ConfigType::VsPrimType => {
                    config_buf.write(index, prim_type as u32);
                }
                ConfigType::VsIndexOffset => {
                    config_buf.write(index, index_offset);
                }
                ConfigType::ResourceSlot => {
                    self.t_base.t_memory_table_slots.push(MemoryTableConfigSlot {
                        mt_buffer_index: self.t_base.t_config_buffers.len() as u32,
                        mt_config_index: index as u32,
                        mt_resource_slot: slot_offset + slot.cs_data as u32,
                    });
                }
                ConfigType::MemoryTable => {
                    let value = if slot.cs_data == 0 {
                        memory_table_address as u32
                    } else {
                        (memory_table_address >> 32) as u32
                    };
                    config_buf.write(index, value);
                }
                ConfigType::ImageMemoryTable => {
                    let value = if slot.cs_data == 0 {
                        image_memory_table_address as u32
                    } else {
                        (image_memory_table_address >> 32) as u32
                    };
                    config_buf.write(index, value);
                }
                ConfigType::Gds => {
                    let value = if slot.cs_data == 0 {
                        gds_address as u32
                    } else {
                        (gds_address >> 32) as u32
                    };
                    config_buf.write(index, value);
                }
                ConfigType::CbCompSwap => {
                    config_buf.write(index, ctx.cb_comp_swap[d]);
                }
                _ => panic!(
                    "unexpected config slot {:?} in graphics shader, stage {:?}",
                    slot.cs_type, stage
                ),
            }
        }

        self.t_base.t_config_buffers.push(config_buf);

        let set = sets[stage_index(stage)];
        self.t_base.cache().platform().write_descriptor(
            set,
            0,
            0,
            DescriptorWrite::StorageBuffer {
                buffer: config.handle,
                offset: config.offset,
                range: config_size,
            },
        );

        Ok(shader)
    }

    /// The graphics pipeline layout shared by every draw.
    pub fn pipeline_layout(&self) -> crate::platform::PipelineLayoutHandle {
        self.t_base
            .cache()
            .c_descpool
            .lock()
            .unwrap()
            .dp_graphics_pipeline_layout
    }

    pub fn release(&mut self) -> Result<()> {
        if let Some(slot) = self.g_descriptor_slot.take() {
            self.t_base
                .cache()
                .c_descpool
                .lock()
                .unwrap()
                .release_graphics_sets(slot);
            self.g_descriptor_sets.clear();
        }

        self.t_base.release()
    }
}

impl<'a> Drop for GraphicsTag<'a> {
    fn drop(&mut self) {
        if let Some(slot) = self.g_descriptor_slot.take() {
            self.t_base
                .cache()
                .c_descpool
                .lock()
                .unwrap()
                .release_graphics_sets(slot);
        }
    }
}

/// A tag with one compute descriptor set.
pub struct ComputeTag<'a> {
    t_base: Tag<'a>,
    c_descriptor_slot: Option<usize>,
    c_descriptor_set: DescriptorSetHandle,
}

impl<'a> Deref for ComputeTag<'a> {
    type Target = Tag<'a>;

    fn deref(&self) -> &Self::Target {
        &self.t_base
    }
}

impl<'a> DerefMut for ComputeTag<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.t_base
    }
}

impl<'a> ComputeTag<'a> {
    pub(crate) fn new(base: Tag<'a>) -> Self {
        Self {
            t_base: base,
            c_descriptor_slot: None,
            c_descriptor_set: DescriptorSetHandle::null(),
        }
    }

    pub fn get_descriptor_set(&mut self) -> DescriptorSetHandle {
        if self.c_descriptor_slot.is_none() {
            let (slot, set) = self
                .t_base
                .cache()
                .c_descpool
                .lock()
                .unwrap()
                .acquire_compute_set();
            self.c_descriptor_slot = Some(slot);
            self.c_descriptor_set = set;
        }

        self.c_descriptor_set
    }

    pub fn get_shader(&mut self, pgm: &ComputePgm) -> Result<Shader> {
        let set = self.get_descriptor_set();

        let env = Environment {
            vgpr_count: pgm.vgpr_count,
            sgpr_count: pgm.sgpr_count,
            num_thread_x: pgm.num_thread_x,
            num_thread_y: pgm.num_thread_y,
            num_thread_z: pgm.num_thread_z,
            user_sgprs: pgm.user_sgprs.clone(),
        };

        let shader = self.t_base.get_shader(
            &ShaderKey {
                address: pgm.address,
                stage: Stage::Cs,
                env,
            },
            None,
        )?;

        let (Some(_), Some(info)) = (shader.handle, shader.info.clone()) else {
            return Ok(shader);
        };

        let memory_table_address = self.t_base.get_memory_table().device_address;
        let image_memory_table_address = self.t_base.get_image_memory_table().device_address;
        let gds_address = self.t_base.cache().gds_address();

        let slot_offset = self.t_base.t_resources.sr_slot_offset;

        let mut res = std::mem::take(&mut self.t_base.t_resources);
        let loaded = res.load_resources(&mut self.t_base, &info.resources, &pgm.user_sgprs);
        self.t_base.t_resources = res;
        loaded?;

        let mut sgpr_inputs = Vec::new();
        if pgm.dispatch_input.contains(CsDispatchInput::TGID_X_EN) {
            sgpr_inputs.push(CsSGprInput::ThreadGroupIdX as u32);
        }
        if pgm.dispatch_input.contains(CsDispatchInput::TGID_Y_EN) {
            sgpr_inputs.push(CsSGprInput::ThreadGroupIdY as u32);
        }
        if pgm.dispatch_input.contains(CsDispatchInput::TGID_Z_EN) {
            sgpr_inputs.push(CsSGprInput::ThreadGroupIdZ as u32);
        }
        if pgm.dispatch_input.contains(CsDispatchInput::TG_SIZE_EN) {
            sgpr_inputs.push(CsSGprInput::ThreadGroupSize as u32);
        }
        if pgm.dispatch_input.contains(CsDispatchInput::SCRATCH_EN) {
            sgpr_inputs.push(CsSGprInput::Scratch as u32);
        }

        let config_slots = &info.config_slots;
        let config_size = (config_slots.len().max(1) * 4) as u64;
        let config = self
            .t_base
            .get_internal_buffer(config_size, MemoryLocation::HostVisible)?;
        let config_buf = ConfigBuffer {
            cb_data: config.data as *mut u32,
            cb_len: config_slots.len().max(1),
        };

        for (index, slot) in config_slots.iter().enumerate() {
            let d = slot.cs_data as usize;

            match slot.cs_type {
                ConfigType::Imm => {
                    let mut bytes = [0u8; 4];
                    self.t_base
                        .read_memory(&mut bytes, AddressRange::from_begin_size(slot.cs_data, 4))?;
                    config_buf.write(index, u32::from_le_bytes(bytes));
                }
                ConfigType::UserSgpr => {
                    config_buf.write(index, pgm.user_sgprs[d]);
                }
                ConfigType::ResourceSlot => {
                    self.t_base.t_memory_table_slots.push(MemoryTableConfigSlot {
                        mt_buffer_index: self.t_base.t_config_buffers.len() as u32,
                        mt_config_index: index as u32,
                        mt_resource_slot: slot_offset + slot.cs_data as u32,
                    });
                }
                ConfigType::MemoryTable => {
                    let value = if slot.cs_data == 0 {
                        memory_table_address as u32
                    } else {
                        (memory_table_address >> 32) as u32
                    };
                    config_buf.write(index, value);
                }
                ConfigType::ImageMemoryTable => {
                    let value = if slot.cs_data == 0 {
                        image_memory_table_address as u32
                    } else {
                        (image_memory_table_address >> 32) as u32
                    };
                    config_buf.write(index, value);
                }
                ConfigType::Gds => {
                    let value = if slot.cs_data == 0 {
                        gds_address as u32
                    } else {
                        (gds_address >> 32) as u32
                    };
                    config_buf.write(index, value);
                }
                ConfigType::CsTgIdCompCnt => {
                    config_buf.write(index, pgm.tg_id_comp_count);
                }
                ConfigType::CsInputSGpr => {
                    let value = match sgpr_inputs.get(d) {
                        Some(&input) => input,
                        None => !0,
                    };
                    config_buf.write(index, value);
                }
                _ => panic!("unexpected config slot {:?} in compute shader", slot.cs_type),
            }
        }

        self.t_base.t_config_buffers.push(config_buf);

        self.t_base.cache().platform().write_descriptor(
            set,
            0,
            0,
            DescriptorWrite::StorageBuffer {
                buffer: config.handle,
                offset: config.offset,
                range: config_size,
            },
        );

        Ok(shader)
    }

    pub fn pipeline_layout(&self) -> crate::platform::PipelineLayoutHandle {
        self.t_base
            .cache()
            .c_descpool
            .lock()
            .unwrap()
            .dp_compute_pipeline_layout
    }

    pub fn release(&mut self) -> Result<()> {
        if let Some(slot) = self.c_descriptor_slot.take() {
            self.t_base
                .cache()
                .c_descpool
                .lock()
                .unwrap()
                .release_compute_set(slot);
        }

        self.t_base.release()
    }
}

impl<'a> Drop for ComputeTag<'a> {
    fn drop(&mut self) {
        if let Some(slot) = self.c_descriptor_slot.take() {
            self.t_base
                .cache()
                .c_descpool
                .lock()
                .unwrap()
                .release_compute_set(slot);
        }
    }
}

