// Vulkan backend
//
// This is the real host device. It follows the same shape the
// compositor renderer uses: one Instance, one Device picked for
// graphics + compute + transfer, persistent mappings for everything
// host visible, and explicit barriers around every image move.
//
// Austin Shafer - 2024

#![allow(dead_code)]

use crate::gnm::Swizzle;
use crate::keys::SamplerKey;
use crate::platform::{
    BorderColorKind, BufferAlloc, BufferCopy, BufferHandle, BufferImageCopy, BufferUsage,
    CompareOp, DescriptorBinding, DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorType,
    DescriptorWrite, Extent, FilterMode, Format, ImageHandle, ImageLayout,
    ImageSubresourceRange, ImageUsage, ImageViewHandle, ImageViewType, MemoryLocation,
    PipelineLayoutHandle, Platform, SamplerAddressMode, SamplerHandle, SamplerMipmapMode,
    ShaderHandle, ShaderStage,
};
use crate::scheduler::{CommandBuffer, Scheduler};
use crate::{Result, VortxError};

extern crate utils as vortx_utils;
use vortx_utils::log;

use ash::vk;
use ash::vk::Handle;

use std::collections::HashMap;
use std::sync::Mutex;

fn to_vk_format(format: Format) -> vk::Format {
    match format {
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::R8Uint => vk::Format::R8_UINT,
        Format::R16Unorm => vk::Format::R16_UNORM,
        Format::R16Uint => vk::Format::R16_UINT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::Rg8Unorm => vk::Format::R8G8_UNORM,
        Format::Rg16Float => vk::Format::R16G16_SFLOAT,
        Format::Rg32Float => vk::Format::R32G32_SFLOAT,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Rgba8Uint => vk::Format::R8G8B8A8_UINT,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
        Format::Bc1Unorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
        Format::Bc2Unorm => vk::Format::BC2_UNORM_BLOCK,
        Format::Bc3Unorm => vk::Format::BC3_UNORM_BLOCK,
        Format::Bc4Unorm => vk::Format::BC4_UNORM_BLOCK,
        Format::Bc5Unorm => vk::Format::BC5_UNORM_BLOCK,
        Format::Bc6Ufloat => vk::Format::BC6H_UFLOAT_BLOCK,
        Format::Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::S8Uint => vk::Format::S8_UINT,
    }
}

fn to_vk_aspect(aspect: crate::platform::ImageAspect) -> vk::ImageAspectFlags {
    match aspect {
        crate::platform::ImageAspect::Color => vk::ImageAspectFlags::COLOR,
        crate::platform::ImageAspect::Depth => vk::ImageAspectFlags::DEPTH,
        crate::platform::ImageAspect::Stencil => vk::ImageAspectFlags::STENCIL,
    }
}

fn to_vk_subresource(sub: ImageSubresourceRange) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: to_vk_aspect(sub.aspect),
        base_mip_level: sub.base_mip_level,
        level_count: sub.level_count,
        base_array_layer: sub.base_array_layer,
        layer_count: sub.layer_count,
    }
}

fn to_vk_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    }
}

/// The fixed barrier table: stage and access masks for an image
/// moving out of (`is_src`) or into a layout.
fn layout_stage_access(layout: ImageLayout, is_src: bool) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match layout {
        ImageLayout::Undefined | ImageLayout::General => (
            if is_src {
                vk::PipelineStageFlags::BOTTOM_OF_PIPE
            } else {
                vk::PipelineStageFlags::TOP_OF_PIPE
            },
            vk::AccessFlags::empty(),
        ),
        ImageLayout::TransferDst => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        ),
        ImageLayout::TransferSrc => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        ),
    }
}

fn to_vk_filter(filter: FilterMode) -> vk::Filter {
    match filter {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

fn to_vk_mipmap_mode(mode: SamplerMipmapMode) -> vk::SamplerMipmapMode {
    match mode {
        SamplerMipmapMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        SamplerMipmapMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

fn to_vk_address_mode(mode: SamplerAddressMode) -> vk::SamplerAddressMode {
    match mode {
        SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        SamplerAddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        SamplerAddressMode::MirrorClampToEdge => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
    }
}

fn to_vk_compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

fn to_vk_border_color(color: BorderColorKind) -> vk::BorderColor {
    match color {
        BorderColorKind::OpaqueBlack => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        BorderColorKind::TransparentBlack => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        BorderColorKind::White => vk::BorderColor::FLOAT_OPAQUE_WHITE,
    }
}

fn to_vk_swizzle(swizzle: Swizzle) -> vk::ComponentSwizzle {
    match swizzle {
        Swizzle::Zero => vk::ComponentSwizzle::ZERO,
        Swizzle::One => vk::ComponentSwizzle::ONE,
        Swizzle::R => vk::ComponentSwizzle::R,
        Swizzle::G => vk::ComponentSwizzle::G,
        Swizzle::B => vk::ComponentSwizzle::B,
        Swizzle::A => vk::ComponentSwizzle::A,
    }
}

fn to_vk_view_type(view_type: ImageViewType) -> (vk::ImageType, vk::ImageViewType) {
    match view_type {
        ImageViewType::Type1D => (vk::ImageType::TYPE_1D, vk::ImageViewType::TYPE_1D),
        ImageViewType::Type2D => (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D),
        ImageViewType::Type3D => (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D),
        ImageViewType::Cube => (vk::ImageType::TYPE_2D, vk::ImageViewType::CUBE),
        ImageViewType::Array1D => (vk::ImageType::TYPE_1D, vk::ImageViewType::TYPE_1D_ARRAY),
        ImageViewType::Array2D => (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D_ARRAY),
    }
}

struct VkBuffer {
    vb_buffer: vk::Buffer,
    vb_memory: vk::DeviceMemory,
    vb_map: *mut u8,
}

struct VkImage {
    vi_image: vk::Image,
    vi_memory: vk::DeviceMemory,
}

#[derive(Default)]
struct VkObjects {
    vo_next: u64,
    vo_buffers: HashMap<u64, VkBuffer>,
    vo_images: HashMap<u64, VkImage>,
    vo_views: HashMap<u64, vk::ImageView>,
    vo_samplers: HashMap<u64, vk::Sampler>,
    vo_shaders: HashMap<u64, vk::ShaderModule>,
    vo_set_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    vo_pipeline_layouts: HashMap<u64, vk::PipelineLayout>,
    vo_sets: HashMap<u64, vk::DescriptorSet>,
}

/// The ash-backed platform.
pub struct VulkanPlatform {
    v_entry: ash::Entry,
    v_inst: ash::Instance,
    v_pdev: vk::PhysicalDevice,
    v_dev: ash::Device,
    v_mem_props: vk::PhysicalDeviceMemoryProperties,
    v_queue_family: u32,
    v_descriptor_pool: vk::DescriptorPool,
    v_objects: Mutex<VkObjects>,
}

unsafe impl Send for VulkanPlatform {}
unsafe impl Sync for VulkanPlatform {}

impl VulkanPlatform {
    /// Stand up an instance and device able to run the cache: a
    /// universal queue family and buffer device addressing.
    pub fn new() -> Result<Self> {
        unsafe {
            let entry = ash::Entry::load().map_err(|e| {
                log::error!("could not load the Vulkan loader: {:?}", e);
                VortxError::HOST_API_FAILURE
            })?;

            let app_info = vk::ApplicationInfo::builder()
                .application_version(0)
                .engine_version(0)
                .api_version(vk::API_VERSION_1_2);

            let create_info = vk::InstanceCreateInfo::builder().application_info(&app_info);
            let inst = entry
                .create_instance(&create_info, None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let pdevs = inst
                .enumerate_physical_devices()
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let (pdev, queue_family) = pdevs
                .iter()
                .find_map(|&pdev| {
                    inst.get_physical_device_queue_family_properties(pdev)
                        .iter()
                        .enumerate()
                        .find(|(_, props)| {
                            props.queue_flags.contains(
                                vk::QueueFlags::GRAPHICS
                                    | vk::QueueFlags::COMPUTE
                                    | vk::QueueFlags::TRANSFER,
                            )
                        })
                        .map(|(index, _)| (pdev, index as u32))
                })
                .ok_or(VortxError::HOST_API_FAILURE)?;

            let priorities = [1.0];
            let queue_info = [vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(queue_family)
                .queue_priorities(&priorities)
                .build()];

            let mut bda_features = vk::PhysicalDeviceBufferDeviceAddressFeatures::builder()
                .buffer_device_address(true);

            let dev_info = vk::DeviceCreateInfo::builder()
                .queue_create_infos(&queue_info)
                .push_next(&mut bda_features);

            let dev = inst
                .create_device(pdev, &dev_info, None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let mem_props = inst.get_physical_device_memory_properties(pdev);

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: 1024,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLER,
                    descriptor_count: 1024,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: 4096,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    descriptor_count: 1024,
                },
            ];
            let pool_info = vk::DescriptorPoolCreateInfo::builder()
                .pool_sizes(&pool_sizes)
                .max_sets(1024);
            let descriptor_pool = dev
                .create_descriptor_pool(&pool_info, None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            Ok(Self {
                v_entry: entry,
                v_inst: inst,
                v_pdev: pdev,
                v_dev: dev,
                v_mem_props: mem_props,
                v_queue_family: queue_family,
                v_descriptor_pool: descriptor_pool,
                v_objects: Mutex::new(VkObjects::default()),
            })
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.v_dev
    }

    pub fn queue_family(&self) -> u32 {
        self.v_queue_family
    }

    /// Find a memory type matching the requirement bits and flags,
    /// the same walk every Vulkan allocator does.
    fn find_memory_type_index(
        &self,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        for (i, mem_type) in self.v_mem_props.memory_types.iter().enumerate() {
            if (reqs.memory_type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Ok(i as u32);
            }
        }

        Err(VortxError::OUT_OF_MEMORY)
    }

    fn vk_cmd(cmd: CommandBuffer) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(cmd.0)
    }
}

impl Drop for VulkanPlatform {
    fn drop(&mut self) {
        unsafe {
            let _ = self.v_dev.device_wait_idle();

            let objects = self.v_objects.get_mut().unwrap();
            for (_, b) in objects.vo_buffers.drain() {
                if !b.vb_map.is_null() {
                    self.v_dev.unmap_memory(b.vb_memory);
                }
                self.v_dev.destroy_buffer(b.vb_buffer, None);
                self.v_dev.free_memory(b.vb_memory, None);
            }
            for (_, i) in objects.vo_images.drain() {
                self.v_dev.destroy_image(i.vi_image, None);
                self.v_dev.free_memory(i.vi_memory, None);
            }
            for (_, v) in objects.vo_views.drain() {
                self.v_dev.destroy_image_view(v, None);
            }
            for (_, s) in objects.vo_samplers.drain() {
                self.v_dev.destroy_sampler(s, None);
            }
            for (_, m) in objects.vo_shaders.drain() {
                self.v_dev.destroy_shader_module(m, None);
            }
            for (_, l) in objects.vo_pipeline_layouts.drain() {
                self.v_dev.destroy_pipeline_layout(l, None);
            }
            for (_, l) in objects.vo_set_layouts.drain() {
                self.v_dev.destroy_descriptor_set_layout(l, None);
            }

            self.v_dev.destroy_descriptor_pool(self.v_descriptor_pool, None);
            self.v_dev.destroy_device(None);
            self.v_inst.destroy_instance(None);
        }
    }
}

impl Platform for VulkanPlatform {
    fn create_buffer(
        &self,
        location: MemoryLocation,
        size: u64,
        usage: BufferUsage,
    ) -> Result<BufferAlloc> {
        unsafe {
            let mut vk_usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
            if usage.contains(BufferUsage::TRANSFER_SRC) {
                vk_usage |= vk::BufferUsageFlags::TRANSFER_SRC;
            }
            if usage.contains(BufferUsage::TRANSFER_DST) {
                vk_usage |= vk::BufferUsageFlags::TRANSFER_DST;
            }
            if usage.contains(BufferUsage::STORAGE) {
                vk_usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
            }
            if usage.contains(BufferUsage::STORAGE_TEXEL) {
                vk_usage |= vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
            }
            if usage.contains(BufferUsage::INDEX) {
                vk_usage |= vk::BufferUsageFlags::INDEX_BUFFER;
            }

            let info = vk::BufferCreateInfo::builder()
                .size(size)
                .usage(vk_usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let buffer = self
                .v_dev
                .create_buffer(&info, None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let reqs = self.v_dev.get_buffer_memory_requirements(buffer);
            let flags = match location {
                MemoryLocation::HostVisible => {
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
                }
                MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            };
            let memtype = self.find_memory_type_index(&reqs, flags)?;

            let mut alloc_flags = vk::MemoryAllocateFlagsInfo::builder()
                .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(reqs.size)
                .memory_type_index(memtype)
                .push_next(&mut alloc_flags);

            let memory = self
                .v_dev
                .allocate_memory(&alloc_info, None)
                .map_err(|_| VortxError::OUT_OF_MEMORY)?;

            self.v_dev
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let map = match location {
                MemoryLocation::HostVisible => self
                    .v_dev
                    .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                    .map_err(|_| VortxError::HOST_API_FAILURE)?
                    as *mut u8,
                MemoryLocation::DeviceLocal => std::ptr::null_mut(),
            };

            let address_info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
            let device_address = self.v_dev.get_buffer_device_address(&address_info);

            let mut objects = self.v_objects.lock().unwrap();
            objects.vo_next += 1;
            let id = objects.vo_next;
            objects.vo_buffers.insert(
                id,
                VkBuffer {
                    vb_buffer: buffer,
                    vb_memory: memory,
                    vb_map: map,
                },
            );

            Ok(BufferAlloc {
                handle: BufferHandle(id),
                device_address,
                data: map,
            })
        }
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let removed = self.v_objects.lock().unwrap().vo_buffers.remove(&buffer.0);
        if let Some(b) = removed {
            unsafe {
                if !b.vb_map.is_null() {
                    self.v_dev.unmap_memory(b.vb_memory);
                }
                self.v_dev.destroy_buffer(b.vb_buffer, None);
                self.v_dev.free_memory(b.vb_memory, None);
            }
        }
    }

    fn create_image(
        &self,
        view_type: ImageViewType,
        extent: Extent,
        mip_levels: u32,
        array_layers: u32,
        format: Format,
        usage: ImageUsage,
    ) -> Result<ImageHandle> {
        unsafe {
            let mut vk_usage = vk::ImageUsageFlags::empty();
            if usage.contains(ImageUsage::TRANSFER_SRC) {
                vk_usage |= vk::ImageUsageFlags::TRANSFER_SRC;
            }
            if usage.contains(ImageUsage::TRANSFER_DST) {
                vk_usage |= vk::ImageUsageFlags::TRANSFER_DST;
            }
            if usage.contains(ImageUsage::SAMPLED) {
                vk_usage |= vk::ImageUsageFlags::SAMPLED;
            }
            if usage.contains(ImageUsage::STORAGE) {
                vk_usage |= vk::ImageUsageFlags::STORAGE;
            }
            if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
                vk_usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            }
            if usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
                vk_usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
            }

            let (image_type, _) = to_vk_view_type(view_type);
            let info = vk::ImageCreateInfo::builder()
                .image_type(image_type)
                .format(to_vk_format(format))
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: extent.depth,
                })
                .mip_levels(mip_levels)
                .array_layers(array_layers)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk_usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let image = self
                .v_dev
                .create_image(&info, None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let reqs = self.v_dev.get_image_memory_requirements(image);
            let memtype =
                self.find_memory_type_index(&reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;

            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(reqs.size)
                .memory_type_index(memtype);
            let memory = self
                .v_dev
                .allocate_memory(&alloc_info, None)
                .map_err(|_| VortxError::OUT_OF_MEMORY)?;

            self.v_dev
                .bind_image_memory(image, memory, 0)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let mut objects = self.v_objects.lock().unwrap();
            objects.vo_next += 1;
            let id = objects.vo_next;
            objects.vo_images.insert(
                id,
                VkImage {
                    vi_image: image,
                    vi_memory: memory,
                },
            );

            Ok(ImageHandle(id))
        }
    }

    fn destroy_image(&self, image: ImageHandle) {
        let removed = self.v_objects.lock().unwrap().vo_images.remove(&image.0);
        if let Some(i) = removed {
            unsafe {
                self.v_dev.destroy_image(i.vi_image, None);
                self.v_dev.free_memory(i.vi_memory, None);
            }
        }
    }

    fn create_image_view(
        &self,
        image: ImageHandle,
        view_type: ImageViewType,
        format: Format,
        swizzle: [Swizzle; 4],
        subresource: ImageSubresourceRange,
    ) -> Result<ImageViewHandle> {
        unsafe {
            let vk_image = {
                let objects = self.v_objects.lock().unwrap();
                objects
                    .vo_images
                    .get(&image.0)
                    .ok_or(VortxError::INVALID)?
                    .vi_image
            };

            let (_, vk_view_type) = to_vk_view_type(view_type);
            let info = vk::ImageViewCreateInfo::builder()
                .image(vk_image)
                .view_type(vk_view_type)
                .format(to_vk_format(format))
                .components(vk::ComponentMapping {
                    r: to_vk_swizzle(swizzle[0]),
                    g: to_vk_swizzle(swizzle[1]),
                    b: to_vk_swizzle(swizzle[2]),
                    a: to_vk_swizzle(swizzle[3]),
                })
                .subresource_range(to_vk_subresource(subresource));

            let view = self
                .v_dev
                .create_image_view(&info, None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let mut objects = self.v_objects.lock().unwrap();
            objects.vo_next += 1;
            let id = objects.vo_next;
            objects.vo_views.insert(id, view);

            Ok(ImageViewHandle(id))
        }
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        let removed = self.v_objects.lock().unwrap().vo_views.remove(&view.0);
        if let Some(v) = removed {
            unsafe {
                self.v_dev.destroy_image_view(v, None);
            }
        }
    }

    fn create_sampler(&self, key: &SamplerKey) -> Result<SamplerHandle> {
        unsafe {
            let info = vk::SamplerCreateInfo::builder()
                .mag_filter(to_vk_filter(key.mag_filter))
                .min_filter(to_vk_filter(key.min_filter))
                .mipmap_mode(to_vk_mipmap_mode(key.mipmap_mode))
                .address_mode_u(to_vk_address_mode(key.address_mode_u))
                .address_mode_v(to_vk_address_mode(key.address_mode_v))
                .address_mode_w(to_vk_address_mode(key.address_mode_w))
                .mip_lod_bias(key.mip_lod_bias as f32 / 256.0)
                .anisotropy_enable(key.anisotropy_enable)
                .max_anisotropy(key.max_anisotropy as f32)
                .compare_enable(key.compare_enable)
                .compare_op(to_vk_compare_op(key.compare_op))
                .min_lod(key.min_lod as f32 / 256.0)
                .max_lod(key.max_lod as f32 / 256.0)
                .border_color(to_vk_border_color(key.border_color))
                .unnormalized_coordinates(key.unnormalized_coordinates);

            let sampler = self
                .v_dev
                .create_sampler(&info, None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let mut objects = self.v_objects.lock().unwrap();
            objects.vo_next += 1;
            let id = objects.vo_next;
            objects.vo_samplers.insert(id, sampler);

            Ok(SamplerHandle(id))
        }
    }

    fn create_shader(
        &self,
        _stage: ShaderStage,
        spv: &[u32],
        _set_layouts: &[DescriptorSetLayoutHandle],
    ) -> Result<Option<ShaderHandle>> {
        unsafe {
            let info = vk::ShaderModuleCreateInfo::builder().code(spv);

            let module = match self.v_dev.create_shader_module(&info, None) {
                Ok(m) => m,
                Err(_) => return Ok(None),
            };

            let mut objects = self.v_objects.lock().unwrap();
            objects.vo_next += 1;
            let id = objects.vo_next;
            objects.vo_shaders.insert(id, module);

            Ok(Some(ShaderHandle(id)))
        }
    }

    fn destroy_shader(&self, shader: ShaderHandle) {
        let removed = self.v_objects.lock().unwrap().vo_shaders.remove(&shader.0);
        if let Some(module) = removed {
            unsafe {
                self.v_dev.destroy_shader_module(module, None);
            }
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutHandle> {
        unsafe {
            let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
                .iter()
                .map(|b| {
                    let ty = match b.ty {
                        DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
                        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
                        DescriptorType::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
                        DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
                    };
                    let stages = if b.compute {
                        vk::ShaderStageFlags::COMPUTE
                    } else {
                        vk::ShaderStageFlags::ALL_GRAPHICS
                    };

                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(b.binding)
                        .descriptor_type(ty)
                        .descriptor_count(b.count)
                        .stage_flags(stages)
                        .build()
                })
                .collect();

            let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);
            let layout = self
                .v_dev
                .create_descriptor_set_layout(&info, None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let mut objects = self.v_objects.lock().unwrap();
            objects.vo_next += 1;
            let id = objects.vo_next;
            objects.vo_set_layouts.insert(id, layout);

            Ok(DescriptorSetLayoutHandle(id))
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> Result<PipelineLayoutHandle> {
        unsafe {
            let vk_layouts: Vec<vk::DescriptorSetLayout> = {
                let objects = self.v_objects.lock().unwrap();
                set_layouts
                    .iter()
                    .map(|l| objects.vo_set_layouts[&l.0])
                    .collect()
            };

            let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&vk_layouts);
            let layout = self
                .v_dev
                .create_pipeline_layout(&info, None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let mut objects = self.v_objects.lock().unwrap();
            objects.vo_next += 1;
            let id = objects.vo_next;
            objects.vo_pipeline_layouts.insert(id, layout);

            Ok(PipelineLayoutHandle(id))
        }
    }

    fn allocate_descriptor_sets(
        &self,
        layout: DescriptorSetLayoutHandle,
        count: u32,
    ) -> Result<Vec<DescriptorSetHandle>> {
        unsafe {
            let vk_layout = self.v_objects.lock().unwrap().vo_set_layouts[&layout.0];
            let layouts = vec![vk_layout; count as usize];

            let info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(self.v_descriptor_pool)
                .set_layouts(&layouts);

            let sets = self
                .v_dev
                .allocate_descriptor_sets(&info)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let mut objects = self.v_objects.lock().unwrap();
            let mut handles = Vec::with_capacity(sets.len());
            for set in sets {
                objects.vo_next += 1;
                let id = objects.vo_next;
                objects.vo_sets.insert(id, set);
                handles.push(DescriptorSetHandle(id));
            }

            Ok(handles)
        }
    }

    fn write_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        element: u32,
        write: DescriptorWrite,
    ) {
        unsafe {
            let objects = self.v_objects.lock().unwrap();
            let vk_set = objects.vo_sets[&set.0];

            match write {
                DescriptorWrite::StorageBuffer {
                    buffer,
                    offset,
                    range,
                } => {
                    let info = [vk::DescriptorBufferInfo {
                        buffer: objects.vo_buffers[&buffer.0].vb_buffer,
                        offset,
                        range,
                    }];
                    let write = vk::WriteDescriptorSet::builder()
                        .dst_set(vk_set)
                        .dst_binding(binding)
                        .dst_array_element(element)
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(&info)
                        .build();
                    self.v_dev.update_descriptor_sets(&[write], &[]);
                }
                DescriptorWrite::Sampler(sampler) => {
                    let info = [vk::DescriptorImageInfo {
                        sampler: objects.vo_samplers[&sampler.0],
                        ..Default::default()
                    }];
                    let write = vk::WriteDescriptorSet::builder()
                        .dst_set(vk_set)
                        .dst_binding(binding)
                        .dst_array_element(element)
                        .descriptor_type(vk::DescriptorType::SAMPLER)
                        .image_info(&info)
                        .build();
                    self.v_dev.update_descriptor_sets(&[write], &[]);
                }
                DescriptorWrite::SampledImage(view) | DescriptorWrite::StorageImage(view) => {
                    let ty = match write {
                        DescriptorWrite::SampledImage(_) => vk::DescriptorType::SAMPLED_IMAGE,
                        _ => vk::DescriptorType::STORAGE_IMAGE,
                    };
                    let info = [vk::DescriptorImageInfo {
                        image_view: objects.vo_views[&view.0],
                        image_layout: vk::ImageLayout::GENERAL,
                        ..Default::default()
                    }];
                    let write = vk::WriteDescriptorSet::builder()
                        .dst_set(vk_set)
                        .dst_binding(binding)
                        .dst_array_element(element)
                        .descriptor_type(ty)
                        .image_info(&info)
                        .build();
                    self.v_dev.update_descriptor_sets(&[write], &[]);
                }
            }
        }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: CommandBuffer,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    ) {
        unsafe {
            let objects = self.v_objects.lock().unwrap();
            let vk_regions: Vec<vk::BufferCopy> = regions
                .iter()
                .map(|r| vk::BufferCopy {
                    src_offset: r.src_offset,
                    dst_offset: r.dst_offset,
                    size: r.size,
                })
                .collect();

            self.v_dev.cmd_copy_buffer(
                Self::vk_cmd(cmd),
                objects.vo_buffers[&src.0].vb_buffer,
                objects.vo_buffers[&dst.0].vb_buffer,
                &vk_regions,
            );
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: CommandBuffer,
        src: BufferHandle,
        dst: ImageHandle,
        regions: &[BufferImageCopy],
    ) {
        unsafe {
            let objects = self.v_objects.lock().unwrap();
            let vk_regions: Vec<vk::BufferImageCopy> = regions
                .iter()
                .map(|r| vk::BufferImageCopy {
                    buffer_offset: r.buffer_offset,
                    buffer_row_length: r.buffer_row_length,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: to_vk_aspect(r.aspect),
                        mip_level: r.mip_level,
                        base_array_layer: r.base_array_layer,
                        layer_count: r.layer_count,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: r.image_extent.width,
                        height: r.image_extent.height,
                        depth: r.image_extent.depth,
                    },
                })
                .collect();

            self.v_dev.cmd_copy_buffer_to_image(
                Self::vk_cmd(cmd),
                objects.vo_buffers[&src.0].vb_buffer,
                objects.vo_images[&dst.0].vi_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk_regions,
            );
        }
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: CommandBuffer,
        src: ImageHandle,
        dst: BufferHandle,
        regions: &[BufferImageCopy],
    ) {
        unsafe {
            let objects = self.v_objects.lock().unwrap();
            let vk_regions: Vec<vk::BufferImageCopy> = regions
                .iter()
                .map(|r| vk::BufferImageCopy {
                    buffer_offset: r.buffer_offset,
                    buffer_row_length: r.buffer_row_length,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: to_vk_aspect(r.aspect),
                        mip_level: r.mip_level,
                        base_array_layer: r.base_array_layer,
                        layer_count: r.layer_count,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: r.image_extent.width,
                        height: r.image_extent.height,
                        depth: r.image_extent.depth,
                    },
                })
                .collect();

            self.v_dev.cmd_copy_image_to_buffer(
                Self::vk_cmd(cmd),
                objects.vo_images[&src.0].vi_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                objects.vo_buffers[&dst.0].vb_buffer,
                &vk_regions,
            );
        }
    }

    fn cmd_transition_image(
        &self,
        cmd: CommandBuffer,
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        subresource: ImageSubresourceRange,
    ) {
        unsafe {
            let vk_image = self.v_objects.lock().unwrap().vo_images[&image.0].vi_image;

            let (src_stage, src_access) = layout_stage_access(old_layout, true);
            let (dst_stage, dst_access) = layout_stage_access(new_layout, false);

            let barrier = vk::ImageMemoryBarrier::builder()
                .old_layout(to_vk_layout(old_layout))
                .new_layout(to_vk_layout(new_layout))
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(vk_image)
                .subresource_range(to_vk_subresource(subresource))
                .src_access_mask(src_access)
                .dst_access_mask(dst_access)
                .build();

            self.v_dev.cmd_pipeline_barrier(
                Self::vk_cmd(cmd),
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

/// A fence-based scheduler over one Vulkan queue.
pub struct VulkanScheduler {
    vs_dev: ash::Device,
    vs_queue: vk::Queue,
    vs_pool: vk::CommandPool,
    vs_fence: vk::Fence,
    vs_current: Option<vk::CommandBuffer>,
    vs_pending: Vec<vk::CommandBuffer>,
    vs_hooks: Vec<Box<dyn FnOnce() + Send>>,
}

unsafe impl Send for VulkanScheduler {}

impl VulkanScheduler {
    pub fn new(platform: &VulkanPlatform) -> Result<Self> {
        unsafe {
            let dev = platform.v_dev.clone();
            let queue = dev.get_device_queue(platform.v_queue_family, 0);

            let pool_info = vk::CommandPoolCreateInfo::builder()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(platform.v_queue_family);
            let pool = dev
                .create_command_pool(&pool_info, None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let fence = dev
                .create_fence(&vk::FenceCreateInfo::builder(), None)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            Ok(Self {
                vs_dev: dev,
                vs_queue: queue,
                vs_pool: pool,
                vs_fence: fence,
                vs_current: None,
                vs_pending: Vec::new(),
                vs_hooks: Vec::new(),
            })
        }
    }
}

impl Scheduler for VulkanScheduler {
    fn get_command_buffer(&mut self) -> CommandBuffer {
        unsafe {
            if self.vs_current.is_none() {
                let info = vk::CommandBufferAllocateInfo::builder()
                    .command_pool(self.vs_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);

                let cbuf = self
                    .vs_dev
                    .allocate_command_buffers(&info)
                    .expect("could not allocate a command buffer")[0];

                self.vs_dev
                    .begin_command_buffer(
                        cbuf,
                        &vk::CommandBufferBeginInfo::builder()
                            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                    )
                    .expect("could not begin a command buffer");

                self.vs_current = Some(cbuf);
            }

            CommandBuffer(self.vs_current.unwrap().as_raw())
        }
    }

    fn submit(&mut self) -> Result<()> {
        unsafe {
            let Some(cbuf) = self.vs_current.take() else {
                for hook in self.vs_hooks.drain(..) {
                    hook();
                }
                return Ok(());
            };

            self.vs_dev
                .end_command_buffer(cbuf)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            let cbufs = [cbuf];
            let submit = vk::SubmitInfo::builder().command_buffers(&cbufs).build();

            self.vs_dev
                .queue_submit(self.vs_queue, &[submit], self.vs_fence)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            self.vs_pending.push(cbuf);
            for hook in self.vs_hooks.drain(..) {
                hook();
            }
            Ok(())
        }
    }

    fn wait(&mut self) -> Result<()> {
        unsafe {
            if self.vs_pending.is_empty() {
                return Ok(());
            }

            self.vs_dev
                .wait_for_fences(&[self.vs_fence], true, u64::MAX)
                .map_err(|_| VortxError::HOST_API_FAILURE)?;
            self.vs_dev
                .reset_fences(&[self.vs_fence])
                .map_err(|_| VortxError::HOST_API_FAILURE)?;

            self.vs_dev
                .free_command_buffers(self.vs_pool, &self.vs_pending);
            self.vs_pending.clear();
            Ok(())
        }
    }

    fn after_submit(&mut self, hook: Box<dyn FnOnce() + Send>) {
        self.vs_hooks.push(hook);
    }
}

impl Drop for VulkanScheduler {
    fn drop(&mut self) {
        unsafe {
            let _ = self.vs_dev.queue_wait_idle(self.vs_queue);
            self.vs_dev.destroy_fence(self.vs_fence, None);
            self.vs_dev.destroy_command_pool(self.vs_pool, None);
        }
    }
}
