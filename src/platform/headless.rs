// Headless software backend
//
// Runs the whole cache without a GPU: buffers are heap allocations,
// images are linear texel stores, and recorded commands execute on
// submit. This is how the crate is driven in tests and CI, the same
// way the compositor side of the world keeps a headless platform
// around.
//
// Austin Shafer - 2024

use crate::gnm::Swizzle;
use crate::keys::SamplerKey;
use crate::platform::{
    BufferAlloc, BufferCopy, BufferHandle, BufferImageCopy, BufferUsage, DescriptorBinding,
    DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorWrite, Extent, Format, ImageHandle,
    ImageLayout, ImageSubresourceRange, ImageUsage, ImageViewHandle, ImageViewType,
    MemoryLocation, PipelineLayoutHandle, Platform, SamplerHandle, ShaderHandle, ShaderStage,
};
use crate::scheduler::{CommandBuffer, Scheduler};
use crate::tiler::{GpuTiler, SurfaceInfo, TileMode, MICRO_TILE_HEIGHT, MICRO_TILE_WIDTH};
use crate::{Result, VortxError};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Device addresses are synthesized from this base so a zero address
/// stays invalid.
const DEVICE_ADDRESS_BASE: u64 = 0x4000_0000_0000;

fn texel_size(format: Format) -> u64 {
    match format {
        Format::R8Unorm | Format::R8Uint | Format::S8Uint => 1,
        Format::R16Unorm | Format::R16Uint | Format::Rg8Unorm | Format::D16Unorm => 2,
        Format::R32Float
        | Format::R32Uint
        | Format::Rg16Float
        | Format::Rgba8Unorm
        | Format::Rgba8Srgb
        | Format::Rgba8Uint
        | Format::D32Float => 4,
        Format::Rg32Float | Format::Rgba16Float => 8,
        Format::Rgba32Float | Format::Rgba32Uint => 16,
        _ => panic!("headless: no per-texel size for {:?}", format),
    }
}

struct HeadlessBuffer {
    hb_data: Box<[u8]>,
    hb_device_address: u64,
}

struct HeadlessImage {
    hi_extent: Extent,
    hi_format: Format,
    /// Tightly packed: mips outermost, layers within a mip
    hi_data: Box<[u8]>,
    hi_mip_offsets: Vec<u64>,
}

impl HeadlessImage {
    fn mip_extent(&self, mip: u32) -> Extent {
        Extent {
            width: (self.hi_extent.width >> mip).max(1),
            height: (self.hi_extent.height >> mip).max(1),
            depth: (self.hi_extent.depth >> mip).max(1),
        }
    }

    fn layer_size(&self, mip: u32) -> u64 {
        let e = self.mip_extent(mip);
        e.width as u64 * e.height as u64 * e.depth as u64 * texel_size(self.hi_format)
    }
}

enum HeadlessOp {
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        regions: Vec<BufferCopy>,
    },
    CopyBufferToImage {
        src: BufferHandle,
        dst: ImageHandle,
        regions: Vec<BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: ImageHandle,
        dst: BufferHandle,
        regions: Vec<BufferImageCopy>,
    },
    Custom(Box<dyn FnOnce(&mut HeadlessState) + Send>),
}

#[derive(Default)]
struct HeadlessState {
    hs_next_handle: u64,
    hs_next_device_address: u64,
    hs_buffers: HashMap<u64, HeadlessBuffer>,
    /// device address -> (buffer id, size) for tiler lookups
    hs_address_index: BTreeMap<u64, (u64, u64)>,
    hs_images: HashMap<u64, HeadlessImage>,
    hs_commands: HashMap<u64, Vec<HeadlessOp>>,
    hs_next_command: u64,
    hs_sampler_count: u64,
    hs_view_count: u64,
    hs_shader_count: u64,
    hs_set_count: u64,
    hs_layout_count: u64,
}

impl HeadlessState {
    fn alloc_handle(&mut self) -> u64 {
        self.hs_next_handle += 1;
        self.hs_next_handle
    }

    /// Resolve a synthesized device address to a buffer and offset.
    fn resolve_address(&self, address: u64) -> (u64, u64) {
        let (&base, &(id, size)) = self
            .hs_address_index
            .range(..=address)
            .next_back()
            .expect("headless: unknown device address");
        assert!(address < base + size, "headless: device address out of range");
        (id, address - base)
    }

    fn buffer_bytes(&mut self, id: u64) -> &mut [u8] {
        &mut self.hs_buffers.get_mut(&id).unwrap().hb_data
    }

    fn run(&mut self, op: HeadlessOp) {
        match op {
            HeadlessOp::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    let bytes: Vec<u8> = {
                        let s = self.buffer_bytes(src.0);
                        s[region.src_offset as usize
                            ..(region.src_offset + region.size) as usize]
                            .to_vec()
                    };
                    let d = self.buffer_bytes(dst.0);
                    d[region.dst_offset as usize..(region.dst_offset + region.size) as usize]
                        .copy_from_slice(&bytes);
                }
            }

            HeadlessOp::CopyBufferToImage { src, dst, regions } => {
                for region in regions {
                    let plan = self.plan_image_copy(dst.0, &region);
                    let bytes: Vec<u8> = self.buffer_bytes(src.0).to_vec();
                    let image = self.hs_images.get_mut(&dst.0).unwrap();

                    for (buf_off, img_off, len) in plan {
                        image.hi_data[img_off as usize..(img_off + len) as usize]
                            .copy_from_slice(&bytes[buf_off as usize..(buf_off + len) as usize]);
                    }
                }
            }

            HeadlessOp::CopyImageToBuffer { src, dst, regions } => {
                for region in regions {
                    let plan = self.plan_image_copy(src.0, &region);
                    let bytes: Vec<u8> = self.hs_images.get(&src.0).unwrap().hi_data.to_vec();
                    let buffer = self.buffer_bytes(dst.0);

                    for (buf_off, img_off, len) in plan {
                        buffer[buf_off as usize..(buf_off + len) as usize]
                            .copy_from_slice(&bytes[img_off as usize..(img_off + len) as usize]);
                    }
                }
            }

            HeadlessOp::Custom(f) => f(self),
        }
    }

    /// Row-by-row copy plan for one buffer/image region:
    /// `(buffer_offset, image_offset, length)` per row.
    fn plan_image_copy(&self, image_id: u64, region: &BufferImageCopy) -> Vec<(u64, u64, u64)> {
        let image = &self.hs_images[&image_id];
        let texel = texel_size(image.hi_format);
        let extent = region.image_extent;
        let row_texels = if region.buffer_row_length != 0 {
            region.buffer_row_length as u64
        } else {
            extent.width as u64
        };

        let mip_offset = image.hi_mip_offsets[region.mip_level as usize];
        let layer_size = image.layer_size(region.mip_level);
        let mip_extent = image.mip_extent(region.mip_level);

        let rows = extent.height as u64 * extent.depth as u64;
        let row_bytes = extent.width as u64 * texel;

        let mut plan = Vec::new();
        for layer in 0..region.layer_count as u64 {
            let buf_layer = region.buffer_offset
                + layer * row_texels * extent.height as u64 * extent.depth as u64 * texel;
            let img_layer = mip_offset + (region.base_array_layer as u64 + layer) * layer_size;

            for row in 0..rows {
                plan.push((
                    buf_layer + row * row_texels * texel,
                    img_layer + row * mip_extent.width as u64 * texel,
                    row_bytes,
                ));
            }
        }

        plan
    }
}

pub struct HeadlessPlatform {
    h_state: Mutex<HeadlessState>,
}

impl HeadlessPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            h_state: Mutex::new(HeadlessState {
                hs_next_device_address: DEVICE_ADDRESS_BASE,
                ..Default::default()
            }),
        })
    }

    fn record(&self, cmd: CommandBuffer, op: HeadlessOp) {
        let mut state = self.h_state.lock().unwrap();
        state
            .hs_commands
            .entry(cmd.0)
            .or_insert_with(Vec::new)
            .push(op);
    }

    fn begin_commands(&self) -> CommandBuffer {
        let mut state = self.h_state.lock().unwrap();
        state.hs_next_command += 1;
        let cmd = CommandBuffer(state.hs_next_command);
        state.hs_commands.insert(cmd.0, Vec::new());
        cmd
    }

    /// Execute everything recorded into `cmd`, in order.
    pub fn execute(&self, cmd: CommandBuffer) {
        let ops = {
            let mut state = self.h_state.lock().unwrap();
            state.hs_commands.remove(&cmd.0).unwrap_or_default()
        };

        let mut state = self.h_state.lock().unwrap();
        for op in ops {
            state.run(op);
        }
    }

    /// Test access: snapshot a buffer's bytes.
    pub fn buffer_bytes(&self, buffer: BufferHandle) -> Vec<u8> {
        let state = self.h_state.lock().unwrap();
        state.hs_buffers[&buffer.0].hb_data.to_vec()
    }

    /// Test access: snapshot an image's texels for one mip/layer.
    pub fn image_bytes(&self, image: ImageHandle, mip: u32, layer: u32) -> Vec<u8> {
        let state = self.h_state.lock().unwrap();
        let img = &state.hs_images[&image.0];
        let offset = (img.hi_mip_offsets[mip as usize] + layer as u64 * img.layer_size(mip)) as usize;
        let size = img.layer_size(mip) as usize;
        img.hi_data[offset..offset + size].to_vec()
    }

    /// Test access: overwrite an image's texels for one mip/layer,
    /// standing in for a render the cache did not see.
    pub fn poke_image(&self, image: ImageHandle, mip: u32, layer: u32, data: &[u8]) {
        let mut state = self.h_state.lock().unwrap();
        let img = state.hs_images.get_mut(&image.0).unwrap();
        let offset = (img.hi_mip_offsets[mip as usize] + layer as u64 * img.layer_size(mip)) as usize;
        img.hi_data[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl Platform for HeadlessPlatform {
    fn create_buffer(
        &self,
        _location: MemoryLocation,
        size: u64,
        _usage: BufferUsage,
    ) -> Result<BufferAlloc> {
        let mut state = self.h_state.lock().unwrap();
        let id = state.alloc_handle();

        // Keep allocations naturally aligned in the fake address
        // space so device addresses stay distinguishable
        let address = (state.hs_next_device_address + 0xff) & !0xff;
        state.hs_next_device_address = address + size.max(1);

        let mut buffer = HeadlessBuffer {
            hb_data: vec![0u8; size as usize].into_boxed_slice(),
            hb_device_address: address,
        };
        let data = buffer.hb_data.as_mut_ptr();

        state.hs_address_index.insert(address, (id, size.max(1)));
        state.hs_buffers.insert(id, buffer);

        Ok(BufferAlloc {
            handle: BufferHandle(id),
            device_address: address,
            data,
        })
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.h_state.lock().unwrap();
        if let Some(b) = state.hs_buffers.remove(&buffer.0) {
            state.hs_address_index.remove(&b.hb_device_address);
        }
    }

    fn create_image(
        &self,
        _view_type: ImageViewType,
        extent: Extent,
        mip_levels: u32,
        array_layers: u32,
        format: Format,
        _usage: ImageUsage,
    ) -> Result<ImageHandle> {
        let mut state = self.h_state.lock().unwrap();
        let id = state.alloc_handle();

        let texel = texel_size(format);
        let mut mip_offsets = Vec::with_capacity(mip_levels as usize);
        let mut total = 0u64;
        for mip in 0..mip_levels {
            mip_offsets.push(total);
            let w = (extent.width >> mip).max(1) as u64;
            let h = (extent.height >> mip).max(1) as u64;
            let d = (extent.depth >> mip).max(1) as u64;
            total += w * h * d * texel * array_layers as u64;
        }

        state.hs_images.insert(
            id,
            HeadlessImage {
                hi_extent: extent,
                hi_format: format,
                hi_data: vec![0u8; total as usize].into_boxed_slice(),
                hi_mip_offsets: mip_offsets,
            },
        );

        Ok(ImageHandle(id))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.h_state.lock().unwrap().hs_images.remove(&image.0);
    }

    fn create_image_view(
        &self,
        image: ImageHandle,
        _view_type: ImageViewType,
        _format: Format,
        _swizzle: [Swizzle; 4],
        _subresource: ImageSubresourceRange,
    ) -> Result<ImageViewHandle> {
        let mut state = self.h_state.lock().unwrap();
        if !state.hs_images.contains_key(&image.0) {
            return Err(VortxError::INVALID);
        }
        state.hs_view_count += 1;
        Ok(ImageViewHandle(state.hs_view_count))
    }

    fn destroy_image_view(&self, _view: ImageViewHandle) {}

    fn create_sampler(&self, _key: &SamplerKey) -> Result<SamplerHandle> {
        let mut state = self.h_state.lock().unwrap();
        state.hs_sampler_count += 1;
        Ok(SamplerHandle(state.hs_sampler_count))
    }

    fn create_shader(
        &self,
        _stage: ShaderStage,
        spv: &[u32],
        _set_layouts: &[DescriptorSetLayoutHandle],
    ) -> Result<Option<ShaderHandle>> {
        if spv.is_empty() {
            return Ok(None);
        }

        let mut state = self.h_state.lock().unwrap();
        state.hs_shader_count += 1;
        Ok(Some(ShaderHandle(state.hs_shader_count)))
    }

    fn destroy_shader(&self, _shader: ShaderHandle) {}

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutHandle> {
        let mut state = self.h_state.lock().unwrap();
        state.hs_layout_count += 1;
        Ok(DescriptorSetLayoutHandle(state.hs_layout_count))
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[DescriptorSetLayoutHandle],
    ) -> Result<PipelineLayoutHandle> {
        let mut state = self.h_state.lock().unwrap();
        state.hs_layout_count += 1;
        Ok(PipelineLayoutHandle(state.hs_layout_count))
    }

    fn allocate_descriptor_sets(
        &self,
        _layout: DescriptorSetLayoutHandle,
        count: u32,
    ) -> Result<Vec<DescriptorSetHandle>> {
        let mut state = self.h_state.lock().unwrap();
        let mut sets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            state.hs_set_count += 1;
            sets.push(DescriptorSetHandle(state.hs_set_count));
        }
        Ok(sets)
    }

    fn write_descriptor(
        &self,
        _set: DescriptorSetHandle,
        _binding: u32,
        _element: u32,
        _write: DescriptorWrite,
    ) {
    }

    fn cmd_copy_buffer(
        &self,
        cmd: CommandBuffer,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) {
        self.record(
            cmd,
            HeadlessOp::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: CommandBuffer,
        src: BufferHandle,
        dst: ImageHandle,
        regions: &[BufferImageCopy],
    ) {
        self.record(
            cmd,
            HeadlessOp::CopyBufferToImage {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: CommandBuffer,
        src: ImageHandle,
        dst: BufferHandle,
        regions: &[BufferImageCopy],
    ) {
        self.record(
            cmd,
            HeadlessOp::CopyImageToBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_transition_image(
        &self,
        _cmd: CommandBuffer,
        _image: ImageHandle,
        _old_layout: ImageLayout,
        _new_layout: ImageLayout,
        _subresource: ImageSubresourceRange,
    ) {
        // Layouts are a device concept; nothing to reorder here
    }
}

/// A synchronous scheduler over the headless platform: submit runs
/// the recorded commands immediately, wait is free.
pub struct HeadlessScheduler {
    hs_platform: Arc<HeadlessPlatform>,
    hs_current: Option<CommandBuffer>,
    hs_hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl HeadlessScheduler {
    pub fn new(platform: Arc<HeadlessPlatform>) -> Self {
        Self {
            hs_platform: platform,
            hs_current: None,
            hs_hooks: Vec::new(),
        }
    }
}

impl Scheduler for HeadlessScheduler {
    fn get_command_buffer(&mut self) -> CommandBuffer {
        if self.hs_current.is_none() {
            self.hs_current = Some(self.hs_platform.begin_commands());
        }
        self.hs_current.unwrap()
    }

    fn submit(&mut self) -> Result<()> {
        if let Some(cmd) = self.hs_current.take() {
            self.hs_platform.execute(cmd);
        }
        for hook in self.hs_hooks.drain(..) {
            hook();
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        Ok(())
    }

    fn after_submit(&mut self, hook: Box<dyn FnOnce() + Send>) {
        self.hs_hooks.push(hook);
    }
}

/// Micro-tile layout used by the software tiler: 8x8 texel tiles,
/// texels row-major within a tile, tiles row-major across the padded
/// surface. Self-consistent with `compute_surface_info`'s padding.
pub(crate) fn tiled_offset(info: &SurfaceInfo, mip: u32, x: u64, y: u64, texel: u64) -> u64 {
    let sub = info.subresource(mip);
    let row = if mip == 0 {
        info.si_pitch as u64
    } else {
        sub.sr_data_width as u64
    };

    let tiles_per_row = (row + MICRO_TILE_WIDTH as u64 - 1) / MICRO_TILE_WIDTH as u64;
    let tx = x / MICRO_TILE_WIDTH as u64;
    let ty = y / MICRO_TILE_HEIGHT as u64;
    let tile = ty * tiles_per_row + tx;
    let within = (y % MICRO_TILE_HEIGHT as u64) * MICRO_TILE_WIDTH as u64
        + (x % MICRO_TILE_WIDTH as u64);

    (tile * (MICRO_TILE_WIDTH as u64 * MICRO_TILE_HEIGHT as u64) + within) * texel
}

/// Software tile/detile kernels for the headless platform. Records
/// onto the command stream like the real device-side kernels.
pub struct HeadlessTiler {
    ht_platform: Arc<HeadlessPlatform>,
}

impl HeadlessTiler {
    pub fn new(platform: Arc<HeadlessPlatform>) -> Self {
        Self {
            ht_platform: platform,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        sched: &mut dyn Scheduler,
        info: &SurfaceInfo,
        src_address: u64,
        dst_address: u64,
        mip_level: u32,
        detile: bool,
    ) -> Result<()> {
        let cmd = sched.get_command_buffer();
        let info = *info;

        self.ht_platform.record(
            cmd,
            HeadlessOp::Custom(Box::new(move |state: &mut HeadlessState| {
                let sub = info.subresource(mip_level);
                let texel = (info.si_bits_per_element.max(8) / 8) as u64;
                let row = if mip_level == 0 {
                    info.si_pitch as u64
                } else {
                    sub.sr_data_width as u64
                };

                let (tiled_addr, linear_addr) = if detile {
                    (src_address, dst_address)
                } else {
                    (dst_address, src_address)
                };

                let (tiled_id, tiled_base) = state.resolve_address(tiled_addr);
                let (linear_id, linear_base) = state.resolve_address(linear_addr);

                for layer in 0..info.si_array_layers as u64 {
                    let tiled_layer = tiled_base + sub.sr_tiled_offset + layer * sub.sr_tiled_size;
                    let linear_layer =
                        linear_base + sub.sr_linear_offset + layer * sub.sr_linear_size;

                    for y in 0..sub.sr_data_height as u64 * sub.sr_data_depth as u64 {
                        for x in 0..sub.sr_data_width as u64 {
                            let t_off =
                                tiled_layer + tiled_offset(&info, mip_level, x, y, texel);
                            let l_off = linear_layer + (y * row + x) * texel;

                            let bytes: Vec<u8> = {
                                let (src_id, src_off) = if detile {
                                    (tiled_id, t_off)
                                } else {
                                    (linear_id, l_off)
                                };
                                let data = state.buffer_bytes(src_id);
                                data[src_off as usize..(src_off + texel) as usize].to_vec()
                            };

                            let (dst_id, dst_off) = if detile {
                                (linear_id, l_off)
                            } else {
                                (tiled_id, t_off)
                            };
                            let data = state.buffer_bytes(dst_id);
                            data[dst_off as usize..(dst_off + texel) as usize]
                                .copy_from_slice(&bytes);
                        }
                    }
                }
            })),
        );

        Ok(())
    }
}

impl GpuTiler for HeadlessTiler {
    fn detile(
        &self,
        sched: &mut dyn Scheduler,
        info: &SurfaceInfo,
        _tile_mode: TileMode,
        src_tiled_address: u64,
        _src_size: u64,
        dst_linear_address: u64,
        _dst_size: u64,
        mip_level: u32,
        _base_array: u32,
        _array_count: u32,
    ) -> Result<()> {
        self.run(sched, info, src_tiled_address, dst_linear_address, mip_level, true)
    }

    fn tile(
        &self,
        sched: &mut dyn Scheduler,
        info: &SurfaceInfo,
        _tile_mode: TileMode,
        src_linear_address: u64,
        _src_size: u64,
        dst_tiled_address: u64,
        _dst_size: u64,
        mip_level: u32,
        _base_array: u32,
        _array_count: u32,
    ) -> Result<()> {
        self.run(sched, info, src_linear_address, dst_tiled_address, mip_level, false)
    }
}
