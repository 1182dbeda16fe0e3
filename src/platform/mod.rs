// Host graphics API abstraction
//
// The cache renders guest resources into whatever explicit API the
// host offers. All of that glue sits behind this trait so the rest of
// the crate never names a host handle directly; the real backend is
// Vulkan, and a headless software backend exists for driving the
// cache in tests and CI.
//
// Austin Shafer - 2024

pub mod headless;
pub mod vulkan;

use crate::gnm::Swizzle;
use crate::keys::SamplerKey;
use crate::scheduler::CommandBuffer;
use crate::Result;

use std::fmt;

macro_rules! define_handle {
    ($name:ident) => {
        /// Opaque host object handle.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);

        impl $name {
            pub fn null() -> Self {
                Self(0)
            }

            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }
    };
}

define_handle!(BufferHandle);
define_handle!(ImageHandle);
define_handle!(ImageViewHandle);
define_handle!(SamplerHandle);
define_handle!(ShaderHandle);
define_handle!(DescriptorSetHandle);
define_handle!(DescriptorSetLayoutHandle);
define_handle!(PipelineLayoutHandle);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Mapped for the host CPU, coherent
    HostVisible,
    /// Device only; reachable through transfer commands
    DeviceLocal,
}

bitflags::bitflags! {
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const STORAGE = 1 << 2;
        const STORAGE_TEXEL = 1 << 3;
        const INDEX = 1 << 4;
    }
}

bitflags::bitflags! {
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
    }
}

/// A freshly allocated buffer: the handle, its GPU virtual address,
/// and the host mapping when the location allows one.
#[derive(Copy, Clone, Debug)]
pub struct BufferAlloc {
    pub handle: BufferHandle,
    pub device_address: u64,
    pub data: *mut u8,
}

unsafe impl Send for BufferAlloc {}
unsafe impl Sync for BufferAlloc {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Host image formats the cache can mirror guest surfaces into.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    R8Uint,
    R16Unorm,
    R16Uint,
    R32Float,
    R32Uint,
    Rg8Unorm,
    Rg16Float,
    Rg32Float,
    Rgba8Unorm,
    Rgba8Srgb,
    Rgba8Uint,
    Rgba16Float,
    Rgba32Float,
    Rgba32Uint,
    Bc1Unorm,
    Bc2Unorm,
    Bc3Unorm,
    Bc4Unorm,
    Bc5Unorm,
    Bc6Ufloat,
    Bc7Unorm,
    D16Unorm,
    D32Float,
    S8Uint,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageViewType {
    Type1D,
    Type2D,
    Type3D,
    Cube,
    Array1D,
    Array2D,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageAspect {
    Color,
    Depth,
    Stencil,
}

/// The layouts an image moves through while the cache shuttles its
/// contents. Cached images rest in General.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageLayout {
    Undefined,
    General,
    TransferSrc,
    TransferDst,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageSubresourceRange {
    pub aspect: ImageAspect,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Copy, Clone, Debug)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    /// Texels per row in the buffer; 0 means tightly packed
    pub buffer_row_length: u32,
    pub aspect: ImageAspect,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub image_extent: Extent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DescriptorType {
    StorageBuffer,
    Sampler,
    SampledImage,
    StorageImage,
}

#[derive(Copy, Clone, Debug)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    /// Set for compute-only layouts; graphics layouts are visible to
    /// all graphics stages
    pub compute: bool,
}

/// One descriptor write.
#[derive(Copy, Clone, Debug)]
pub enum DescriptorWrite {
    StorageBuffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    Sampler(SamplerHandle),
    SampledImage(ImageViewHandle),
    StorageImage(ImageViewHandle),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SamplerMipmapMode {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
    MirrorClampToEdge,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BorderColorKind {
    OpaqueBlack,
    TransparentBlack,
    White,
}

/// Host format for a guest color data/numeric format pair. Unknown
/// combinations are a malformed descriptor.
pub fn format_from_gnm(dfmt: crate::gnm::DataFormat, nfmt: crate::gnm::NumericFormat) -> Format {
    use crate::gnm::{DataFormat, NumericFormat};

    match (dfmt, nfmt) {
        (DataFormat::Fmt8, NumericFormat::UNorm) => Format::R8Unorm,
        (DataFormat::Fmt8, NumericFormat::UInt) => Format::R8Uint,
        (DataFormat::Fmt16, NumericFormat::UNorm) => Format::R16Unorm,
        (DataFormat::Fmt16, NumericFormat::UInt) => Format::R16Uint,
        (DataFormat::Fmt32, NumericFormat::Float) => Format::R32Float,
        (DataFormat::Fmt32, NumericFormat::UInt) => Format::R32Uint,
        (DataFormat::Fmt8_8, NumericFormat::UNorm) => Format::Rg8Unorm,
        (DataFormat::Fmt16_16, NumericFormat::Float) => Format::Rg16Float,
        (DataFormat::Fmt32_32, NumericFormat::Float) => Format::Rg32Float,
        (DataFormat::Fmt8_8_8_8, NumericFormat::UNorm) => Format::Rgba8Unorm,
        (DataFormat::Fmt8_8_8_8, NumericFormat::Srgb) => Format::Rgba8Srgb,
        (DataFormat::Fmt8_8_8_8, NumericFormat::UInt) => Format::Rgba8Uint,
        (DataFormat::Fmt16_16_16_16, NumericFormat::Float) => Format::Rgba16Float,
        (DataFormat::Fmt32_32_32_32, NumericFormat::Float) => Format::Rgba32Float,
        (DataFormat::Fmt32_32_32_32, NumericFormat::UInt) => Format::Rgba32Uint,
        (DataFormat::FmtBc1, _) => Format::Bc1Unorm,
        (DataFormat::FmtBc2, _) => Format::Bc2Unorm,
        (DataFormat::FmtBc3, _) => Format::Bc3Unorm,
        (DataFormat::FmtBc4, _) => Format::Bc4Unorm,
        (DataFormat::FmtBc5, _) => Format::Bc5Unorm,
        (DataFormat::FmtBc6, _) => Format::Bc6Ufloat,
        (DataFormat::FmtBc7, _) => Format::Bc7Unorm,
        _ => panic!("unhandled color format {:?}, {:?}", dfmt, nfmt),
    }
}

/// The host graphics device, injected into the cache at creation.
pub trait Platform: Send + Sync {
    fn create_buffer(
        &self,
        location: MemoryLocation,
        size: u64,
        usage: BufferUsage,
    ) -> Result<BufferAlloc>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    fn create_image(
        &self,
        view_type: ImageViewType,
        extent: Extent,
        mip_levels: u32,
        array_layers: u32,
        format: Format,
        usage: ImageUsage,
    ) -> Result<ImageHandle>;

    fn destroy_image(&self, image: ImageHandle);

    fn create_image_view(
        &self,
        image: ImageHandle,
        view_type: ImageViewType,
        format: Format,
        swizzle: [Swizzle; 4],
        subresource: ImageSubresourceRange,
    ) -> Result<ImageViewHandle>;

    fn destroy_image_view(&self, view: ImageViewHandle);

    fn create_sampler(&self, key: &SamplerKey) -> Result<SamplerHandle>;

    /// Build a shader object from SPIR-V. Returns Ok(None) when the
    /// module is rejected by the host; the caller falls back.
    fn create_shader(
        &self,
        stage: ShaderStage,
        spv: &[u32],
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> Result<Option<ShaderHandle>>;

    fn destroy_shader(&self, shader: ShaderHandle);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutHandle>;

    fn create_pipeline_layout(
        &self,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> Result<PipelineLayoutHandle>;

    fn allocate_descriptor_sets(
        &self,
        layout: DescriptorSetLayoutHandle,
        count: u32,
    ) -> Result<Vec<DescriptorSetHandle>>;

    fn write_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        element: u32,
        write: DescriptorWrite,
    );

    fn cmd_copy_buffer(
        &self,
        cmd: CommandBuffer,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[BufferCopy],
    );

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: CommandBuffer,
        src: BufferHandle,
        dst: ImageHandle,
        regions: &[BufferImageCopy],
    );

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: CommandBuffer,
        src: ImageHandle,
        dst: BufferHandle,
        regions: &[BufferImageCopy],
    );

    fn cmd_transition_image(
        &self,
        cmd: CommandBuffer,
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        subresource: ImageSubresourceRange,
    );
}
