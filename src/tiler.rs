// Tile mode records and surface layout computation
//
// The actual texel address arithmetic lives behind the GpuTiler
// trait; the cache only needs per-mip sizes and offsets in both the
// tiled and linear layouts so it can slice copies and pick
// subresources from byte ranges.
//
// Austin Shafer - 2024

use crate::gnm::{DataFormat, TextureType};
use crate::range::AddressRange;
use crate::scheduler::Scheduler;
use crate::Result;

pub const MICRO_TILE_WIDTH: u32 = 8;
pub const MICRO_TILE_HEIGHT: u32 = 8;

pub const MAX_MIP_LEVELS: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ArrayMode {
    LinearGeneral = 0x0,
    LinearAligned = 0x1,
    Tiled1dThin = 0x2,
    Tiled1dThick = 0x3,
    Tiled2dThin = 0x4,
    TiledThinPrt = 0x5,
    Tiled2dThinPrt = 0x6,
    Tiled2dThick = 0x7,
    Tiled2dXThick = 0x8,
    TiledThickPrt = 0x9,
    Tiled2dThickPrt = 0xa,
    Tiled3dThinPrt = 0xb,
    Tiled3dThin = 0xc,
    Tiled3dThick = 0xd,
    Tiled3dXThick = 0xe,
    Tiled3dThickPrt = 0xf,
}

impl ArrayMode {
    pub fn from_raw(raw: u32) -> ArrayMode {
        match raw & 0xf {
            0x0 => ArrayMode::LinearGeneral,
            0x1 => ArrayMode::LinearAligned,
            0x2 => ArrayMode::Tiled1dThin,
            0x3 => ArrayMode::Tiled1dThick,
            0x4 => ArrayMode::Tiled2dThin,
            0x5 => ArrayMode::TiledThinPrt,
            0x6 => ArrayMode::Tiled2dThinPrt,
            0x7 => ArrayMode::Tiled2dThick,
            0x8 => ArrayMode::Tiled2dXThick,
            0x9 => ArrayMode::TiledThickPrt,
            0xa => ArrayMode::Tiled2dThickPrt,
            0xb => ArrayMode::Tiled3dThinPrt,
            0xc => ArrayMode::Tiled3dThin,
            0xd => ArrayMode::Tiled3dThick,
            0xe => ArrayMode::Tiled3dXThick,
            _ => ArrayMode::Tiled3dThickPrt,
        }
    }

    /// Slices of a volume packed into one micro tile.
    pub fn micro_tile_thickness(&self) -> u32 {
        match self {
            ArrayMode::Tiled1dThick
            | ArrayMode::Tiled2dThick
            | ArrayMode::Tiled3dThick
            | ArrayMode::TiledThickPrt
            | ArrayMode::Tiled2dThickPrt
            | ArrayMode::Tiled3dThickPrt => 4,
            ArrayMode::Tiled2dXThick | ArrayMode::Tiled3dXThick => 8,
            _ => 1,
        }
    }
}

/// Packed tile mode register selecting array mode, pipe config,
/// micro tile mode, sample split and bank geometry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TileMode {
    pub tm_raw: u32,
}

impl TileMode {
    pub fn from_raw(raw: u32) -> Self {
        Self { tm_raw: raw }
    }

    /// The guest's default tile mode table, indexed by a T#'s
    /// tiling_idx field.
    pub fn default_modes() -> [TileMode; 32] {
        const RAW: [u32; 32] = [
            0x90800310, 0x90800b10, 0x90801310, 0x90801b10, 0x90802310, 0x90800308, 0x90801318,
            0x90802318, 0x90000304, 0x90000308, 0x92000310, 0x92000294, 0x92000318, 0x90400308,
            0x92400310, 0x924002b0, 0x92400294, 0x92400318, 0x9240032c, 0x9100030c, 0x9100031c,
            0x910002b4, 0x910002a4, 0x91000328, 0x910002bc, 0x91000320, 0x910002b8, 0x90c00308,
            0x92c00310, 0x92c00294, 0x92c00318, 0x00000000,
        ];

        let mut modes = [TileMode { tm_raw: 0 }; 32];
        let mut i = 0;
        while i < 32 {
            modes[i].tm_raw = RAW[i];
            i += 1;
        }
        modes
    }

    pub fn array_mode(&self) -> ArrayMode {
        ArrayMode::from_raw((self.tm_raw & 0x0000003c) >> 2)
    }

    pub fn pipe_config(&self) -> u32 {
        (self.tm_raw & 0x000007c0) >> 6
    }

    pub fn tile_split(&self) -> u32 {
        (self.tm_raw & 0x00003800) >> 11
    }

    pub fn micro_tile_mode(&self) -> u32 {
        (self.tm_raw & 0x01c00000) >> 22
    }

    pub fn sample_split(&self) -> u32 {
        (self.tm_raw & 0x06000000) >> 25
    }

    pub fn is_linear(&self) -> bool {
        matches!(
            self.array_mode(),
            ArrayMode::LinearGeneral | ArrayMode::LinearAligned
        )
    }
}

/// Layout of one mip level, in both the guest's tiled layout and the
/// de-tiled linear layout. Sizes are per array layer; layers of a mip
/// are contiguous.
#[derive(Copy, Clone, Debug, Default)]
pub struct SubresourceInfo {
    pub sr_data_width: u32,
    pub sr_data_height: u32,
    pub sr_data_depth: u32,
    pub sr_tiled_offset: u64,
    pub sr_tiled_size: u64,
    pub sr_linear_offset: u64,
    pub sr_linear_size: u64,
}

/// Precomputed surface layout for a tile mode and image geometry.
#[derive(Copy, Clone, Debug, Default)]
pub struct SurfaceInfo {
    pub si_width: u32,
    pub si_height: u32,
    pub si_depth: u32,
    pub si_pitch: u32,
    pub si_array_layers: u32,
    pub si_mip_count: u32,
    pub si_bits_per_element: u32,
    pub si_total_tiled_size: u64,
    pub si_total_linear_size: u64,
    si_subresources: [SubresourceInfo; MAX_MIP_LEVELS],
}

impl SurfaceInfo {
    pub fn subresource(&self, mip_level: u32) -> &SubresourceInfo {
        assert!((mip_level as usize) < MAX_MIP_LEVELS);
        &self.si_subresources[mip_level as usize]
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

/// Compute per-mip offsets and sizes for a surface.
///
/// Linear modes are exact. Tiled modes pad each mip to whole micro
/// tiles, which is what every size consumer in the cache needs; texel
/// addressing within the padded region belongs to the GpuTiler.
///
/// A descriptor's base mip and base layer select a window into the
/// surface, they never change where its bytes live: the layout always
/// spans absolute mips `0..base_mip + mip_count` and layers
/// `0..base_array + array_layers`, so two windows over the same
/// surface compute identical layouts.
pub fn compute_surface_info(
    tile_mode: TileMode,
    _tex_type: TextureType,
    dfmt: DataFormat,
    width: u32,
    height: u32,
    depth: u32,
    pitch: u32,
    base_array: u32,
    array_layers: u32,
    base_mip: u32,
    mip_count: u32,
    pow2pad: bool,
) -> SurfaceInfo {
    let bpe = dfmt.bits_per_element().max(8);
    let array_mode = tile_mode.array_mode();
    let thickness = array_mode.micro_tile_thickness();
    let mip_count = (base_mip + mip_count).max(1).min(MAX_MIP_LEVELS as u32);
    let array_layers = (base_array + array_layers).max(1);

    let mut info = SurfaceInfo {
        si_width: width,
        si_height: height,
        si_depth: depth,
        si_pitch: pitch.max(width),
        si_array_layers: array_layers,
        si_mip_count: mip_count,
        si_bits_per_element: bpe,
        ..Default::default()
    };

    let mut tiled_offset: u64 = 0;
    let mut linear_offset: u64 = 0;

    for mip in 0..mip_count {
        let mut w = (width >> mip).max(1);
        let mut h = (height >> mip).max(1);
        let mut d = (depth >> mip).max(1);

        if pow2pad {
            w = w.next_power_of_two();
            h = h.next_power_of_two();
            d = d.next_power_of_two();
        }

        // The pitch override only applies to the top level
        let row = if mip == 0 { info.si_pitch } else { w };

        let linear_size = (row as u64 * h as u64 * d as u64 * bpe as u64) / 8;

        let tiled_size = if tile_mode.is_linear() {
            linear_size
        } else {
            let tw = align_up(row, MICRO_TILE_WIDTH);
            let th = align_up(h, MICRO_TILE_HEIGHT);
            let td = align_up(d, thickness);
            (tw as u64 * th as u64 * td as u64 * bpe as u64) / 8
        };

        info.si_subresources[mip as usize] = SubresourceInfo {
            sr_data_width: w,
            sr_data_height: h,
            sr_data_depth: d,
            sr_tiled_offset: tiled_offset,
            sr_tiled_size: tiled_size,
            sr_linear_offset: linear_offset,
            sr_linear_size: linear_size,
        };

        tiled_offset += tiled_size * array_layers as u64;
        linear_offset += linear_size * array_layers as u64;
    }

    info.si_total_tiled_size = tiled_offset;
    info.si_total_linear_size = linear_offset;

    info
}

/// Device-side tile/detile kernels. The cache records these onto the
/// scheduler's command stream like any other copy; the arithmetic
/// inside is not its business.
pub trait GpuTiler: Send + Sync {
    /// De-tile one mip level from the tiled source buffer into the
    /// linear destination buffer.
    fn detile(
        &self,
        sched: &mut dyn Scheduler,
        info: &SurfaceInfo,
        tile_mode: TileMode,
        src_tiled_address: u64,
        src_size: u64,
        dst_linear_address: u64,
        dst_size: u64,
        mip_level: u32,
        base_array: u32,
        array_count: u32,
    ) -> Result<()>;

    /// Tile one mip level from the linear source buffer back into the
    /// tiled destination buffer.
    fn tile(
        &self,
        sched: &mut dyn Scheduler,
        info: &SurfaceInfo,
        tile_mode: TileMode,
        src_linear_address: u64,
        src_size: u64,
        dst_tiled_address: u64,
        dst_size: u64,
        mip_level: u32,
        base_array: u32,
        array_count: u32,
    ) -> Result<()>;
}

/// Guest address span of a surface: its total tiled footprint.
pub fn surface_range(address: u64, info: &SurfaceInfo) -> AddressRange {
    AddressRange::from_begin_size(address, info.si_total_tiled_size)
}
