// Cache entry keys
//
// Keys are normalized forms of the guest's descriptor records. Two
// descriptors that decode to the same key share one host resource,
// which is the whole content-addressing story: the key chain walks
// ImageViewKey -> ImageKey -> ImageBufferKey as resources shadow one
// another down toward guest memory.
//
// Austin Shafer - 2024

use crate::gcn::{Environment, Stage};
use crate::gnm::{
    BorderColor, ClampMode, CompareFunc, DataFormat, Filter, MipFilter, NumericFormat, SSampler,
    Swizzle, TBuffer, TextureType,
};
use crate::platform::{
    BorderColorKind, CompareOp, Extent, FilterMode, ImageAspect, SamplerAddressMode,
    SamplerMipmapMode,
};
use crate::tiler::TileMode;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Color,
    Depth,
    Stencil,
}

impl ImageKind {
    pub fn aspect(&self) -> ImageAspect {
        match self {
            ImageKind::Color => ImageAspect::Color,
            ImageKind::Depth => ImageAspect::Depth,
            ImageKind::Stencil => ImageAspect::Stencil,
        }
    }
}

/// Key of a cached Image.
///
/// Images may read from one address and write another (resolve-style
/// surfaces); for read-only acquisition the store range collapses to
/// the read range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub read_address: u64,
    pub write_address: u64,
    pub tex_type: TextureType,
    pub dfmt: DataFormat,
    pub nfmt: NumericFormat,
    pub tile_mode: TileMode,
    pub extent: Extent,
    pub pitch: u32,
    pub base_mip_level: u32,
    pub mip_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
    pub kind: ImageKind,
    pub pow2pad: bool,
}

/// Key of a cached ImageView: an Image plus swizzle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageViewKey {
    pub image: ImageKey,
    pub swizzle: [Swizzle; 4],
}

/// Key of a cached ImageBuffer, the de-tiled linear mirror.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageBufferKey {
    pub address: u64,
    pub tex_type: TextureType,
    pub dfmt: DataFormat,
    pub tile_mode: TileMode,
    pub extent: Extent,
    pub pitch: u32,
    pub base_mip_level: u32,
    pub mip_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
    pub pow2pad: bool,
}

fn tbuffer_tile_mode(tbuffer: &TBuffer) -> TileMode {
    TileMode::default_modes()[tbuffer.tiling_idx() as usize]
}

fn tbuffer_extent(tbuffer: &TBuffer) -> Extent {
    Extent {
        width: tbuffer.width(),
        height: tbuffer.height(),
        depth: tbuffer.depth(),
    }
}

impl ImageKey {
    pub fn from_tbuffer(tbuffer: &TBuffer) -> Self {
        Self {
            read_address: tbuffer.address(),
            write_address: tbuffer.address(),
            tex_type: tbuffer.texture_type(),
            dfmt: tbuffer.dfmt(),
            nfmt: tbuffer.nfmt(),
            tile_mode: tbuffer_tile_mode(tbuffer),
            extent: tbuffer_extent(tbuffer),
            pitch: tbuffer.pitch(),
            base_mip_level: tbuffer.base_level(),
            mip_count: tbuffer.last_level() - tbuffer.base_level() + 1,
            base_array_layer: tbuffer.base_array(),
            array_layer_count: tbuffer.last_array() - tbuffer.base_array() + 1,
            kind: ImageKind::Color,
            pow2pad: tbuffer.pow2pad(),
        }
    }

    pub fn from_view(view: &ImageViewKey) -> Self {
        view.image
    }
}

impl ImageViewKey {
    pub fn from_tbuffer(tbuffer: &TBuffer) -> Self {
        Self {
            image: ImageKey::from_tbuffer(tbuffer),
            swizzle: tbuffer.dst_sel(),
        }
    }
}

impl ImageBufferKey {
    pub fn from_tbuffer(tbuffer: &TBuffer) -> Self {
        Self::from_image_key(&ImageKey::from_tbuffer(tbuffer))
    }

    pub fn from_image_key(key: &ImageKey) -> Self {
        Self {
            address: key.read_address,
            tex_type: key.tex_type,
            dfmt: key.dfmt,
            tile_mode: key.tile_mode,
            extent: key.extent,
            pitch: key.pitch,
            base_mip_level: key.base_mip_level,
            mip_count: key.mip_count,
            base_array_layer: key.base_array_layer,
            array_layer_count: key.array_layer_count,
            pow2pad: key.pow2pad,
        }
    }
}

/// Shader lookup key. The environment participates in content
/// addressing: translations burn user sgprs into the output.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderKey {
    pub address: u64,
    pub stage: Stage,
    pub env: Environment,
}

/// Normalized sampler state.
///
/// Fixed-point lod fields stay in raw guest units so the key derives
/// Eq/Hash; the backend divides by 256 when it builds the host
/// sampler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SamplerKey {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_mode: SamplerMipmapMode,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    /// Raw 14-bit fixed point, divided by 256 at creation
    pub mip_lod_bias: u32,
    pub max_anisotropy: u32,
    pub compare_op: CompareOp,
    /// Raw 12-bit fixed point
    pub min_lod: u32,
    pub max_lod: u32,
    pub border_color: BorderColorKind,
    pub anisotropy_enable: bool,
    pub compare_enable: bool,
    pub unnormalized_coordinates: bool,
}

fn to_filter_mode(filter: Filter) -> FilterMode {
    match filter {
        Filter::Point | Filter::AnisoPoint => FilterMode::Nearest,
        Filter::Bilinear | Filter::AnisoLinear => FilterMode::Linear,
    }
}

fn to_mipmap_mode(filter: MipFilter) -> SamplerMipmapMode {
    match filter {
        MipFilter::Linear => SamplerMipmapMode::Linear,
        MipFilter::None | MipFilter::Point => SamplerMipmapMode::Nearest,
    }
}

fn to_address_mode(clamp: ClampMode) -> SamplerAddressMode {
    match clamp {
        ClampMode::Wrap => SamplerAddressMode::Repeat,
        ClampMode::Mirror => SamplerAddressMode::MirroredRepeat,
        ClampMode::ClampLastTexel => SamplerAddressMode::ClampToEdge,
        ClampMode::MirrorOnceLastTexel => SamplerAddressMode::MirrorClampToEdge,
        ClampMode::ClampHalfBorder | ClampMode::ClampBorder => SamplerAddressMode::ClampToBorder,
        ClampMode::MirrorOnceHalfBorder | ClampMode::MirrorOnceBorder => {
            SamplerAddressMode::MirrorClampToEdge
        }
    }
}

fn to_compare_op(func: CompareFunc) -> CompareOp {
    match func {
        CompareFunc::Never => CompareOp::Never,
        CompareFunc::Less => CompareOp::Less,
        CompareFunc::Equal => CompareOp::Equal,
        CompareFunc::LessEqual => CompareOp::LessOrEqual,
        CompareFunc::Greater => CompareOp::Greater,
        CompareFunc::NotEqual => CompareOp::NotEqual,
        CompareFunc::GreaterEqual => CompareOp::GreaterOrEqual,
        CompareFunc::Always => CompareOp::Always,
    }
}

fn to_border_color(color: BorderColor) -> BorderColorKind {
    match color {
        BorderColor::TransparentBlack => BorderColorKind::TransparentBlack,
        BorderColor::White => BorderColorKind::White,
        // Custom border color tables are not carried over
        BorderColor::OpaqueBlack | BorderColor::Custom => BorderColorKind::OpaqueBlack,
    }
}

impl SamplerKey {
    pub fn from_ssampler(sampler: &SSampler) -> Self {
        Self {
            mag_filter: to_filter_mode(sampler.xy_mag_filter()),
            min_filter: to_filter_mode(sampler.xy_min_filter()),
            mipmap_mode: to_mipmap_mode(sampler.mip_filter()),
            address_mode_u: to_address_mode(sampler.clamp_x()),
            address_mode_v: to_address_mode(sampler.clamp_y()),
            address_mode_w: to_address_mode(sampler.clamp_z()),
            mip_lod_bias: sampler.lod_bias(),
            max_anisotropy: 0,
            compare_op: to_compare_op(sampler.depth_compare_func()),
            min_lod: sampler.min_lod(),
            max_lod: sampler.max_lod(),
            border_color: to_border_color(sampler.border_color_type()),
            anisotropy_enable: false,
            compare_enable: sampler.depth_compare_func() != CompareFunc::Never,
            unnormalized_coordinates: sampler.force_unorm_coords(),
        }
    }
}
