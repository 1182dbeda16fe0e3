// Shader front end interface
//
// The bytecode-to-SPIR-V translation is an external collaborator. We
// only carry the types it reports back: which resources a shader will
// bind, the config slots it wants patched, and the memory it read at
// translation time (for content addressing).
//
// Austin Shafer - 2024

use crate::range::AddressRange;
use crate::Access;

use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Ps,
    VsVs,
    VsEs,
    VsLs,
    Cs,
    Gs,
    GsVs,
    Hs,
    DsVs,
    DsEs,
}

/// Execution environment a shader was translated against. A cached
/// translation is only reusable when the parts it depended on match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Environment {
    pub vgpr_count: u8,
    pub sgpr_count: u8,
    pub num_thread_x: u8,
    pub num_thread_y: u8,
    pub num_thread_z: u8,
    /// The architected scalar register prefix handed to the shader
    pub user_sgprs: Vec<u32>,
}

/// A symbolic value in the front end's IR. Descriptor words come back
/// as trees of these; the resolver reduces them against the current
/// user sgprs and guest memory.
#[derive(Clone, Debug)]
pub enum Expr {
    Const(u64),
    /// Read of user sgpr `n`
    UserSgpr(u32),
    /// Dereference of a 32-bit immediate at a fixed guest address
    Imm(u64),
    /// Load of `size` bytes at `base + offset`
    Pointer {
        size: u32,
        base: ExprRef,
        offset: ExprRef,
    },
    BinOp(BinOp, ExprRef, ExprRef),
}

pub type ExprRef = Arc<Expr>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// The resource requirements of one translated shader.
#[derive(Clone, Debug, Default)]
pub struct Resources {
    /// Total resource slots handed out across the lists below
    pub slots: u32,
    pub pointers: Vec<PointerResource>,
    pub buffers: Vec<BufferResource>,
    pub image_buffers: Vec<ImageBufferResource>,
    pub textures: Vec<TextureResource>,
    pub samplers: Vec<SamplerResource>,
}

/// A raw pointer range `[base + offset, base + offset + size)` the
/// shader reads through the memory table.
#[derive(Clone, Debug)]
pub struct PointerResource {
    pub resource_slot: u32,
    pub size: u32,
    pub base: ExprRef,
    pub offset: ExprRef,
}

/// A V# record, one symbolic expression per 32-bit word.
#[derive(Clone, Debug)]
pub struct BufferResource {
    pub resource_slot: u32,
    pub access: Access,
    pub words: [ExprRef; 4],
}

/// A T# used for texel-buffer style access; resolves through the
/// image memory table rather than a sampled view.
#[derive(Clone, Debug)]
pub struct ImageBufferResource {
    pub resource_slot: u32,
    pub access: Access,
    pub words: [ExprRef; 4],
    pub words_hi: Option<[ExprRef; 4]>,
}

/// A T# record, 128 or 256 bits.
#[derive(Clone, Debug)]
pub struct TextureResource {
    pub resource_slot: u32,
    pub access: Access,
    pub words: [ExprRef; 4],
    pub words_hi: Option<[ExprRef; 4]>,
}

/// An S# record.
#[derive(Clone, Debug)]
pub struct SamplerResource {
    pub resource_slot: u32,
    /// Forces unnormalized coordinates regardless of the S# contents
    pub unorm: bool,
    pub words: [ExprRef; 4],
}

/// Kinds of fixups a shader wants written into its config buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigType {
    Imm,
    UserSgpr,
    ResourceSlot,
    MemoryTable,
    ImageMemoryTable,
    Gds,
    PsInputVGpr,
    VsPrimType,
    VsIndexOffset,
    CsTgIdCompCnt,
    CsInputSGpr,
    CbCompSwap,
    ViewPortOffsetX,
    ViewPortOffsetY,
    ViewPortOffsetZ,
    ViewPortScaleX,
    ViewPortScaleY,
    ViewPortScaleZ,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigSlot {
    pub cs_type: ConfigType,
    pub cs_data: u64,
}

/// Everything the cache needs to know about a translated shader.
#[derive(Clone, Debug, Default)]
pub struct ShaderInfo {
    pub config_slots: Vec<ConfigSlot>,
    /// Guest ranges the translator read; snapshotted for cache keying
    pub memory_map: Vec<AddressRange>,
    /// User sgprs the translation burned in as constants
    pub required_sgprs: Vec<(u32, u32)>,
    pub resources: Resources,
}

#[derive(Clone, Debug)]
pub struct ConvertedShader {
    pub spv: Vec<u32>,
    pub info: ShaderInfo,
}

/// The opaque deserialize + convert-to-SPIR-V front end. A `None`
/// return covers both translation rejects and target validation
/// failures; the caller substitutes a fallback shader.
pub trait ShaderFrontend: Send + Sync {
    fn convert(
        &self,
        address: u64,
        stage: Stage,
        env: &Environment,
        read_memory: &mut dyn FnMut(u64) -> u32,
    ) -> Option<ConvertedShader>;
}

/// Fragment shader VGPR inputs, in hardware order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PsVGprInput {
    IPerspSample,
    JPerspSample,
    IPerspCenter,
    JPerspCenter,
    IPerspCentroid,
    JPerspCentroid,
    IW,
    JW,
    W1,
    ILinearSample,
    JLinearSample,
    ILinearCenter,
    JLinearCenter,
    ILinearCentroid,
    JLinearCentroid,
    X,
    Y,
    Z,
    W,
    FrontFace,
    Ancillary,
    SampleCoverage,
    PosFixed,
}

/// Compute shader SGPR inputs, in hardware order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CsSGprInput {
    ThreadGroupIdX,
    ThreadGroupIdY,
    ThreadGroupIdZ,
    ThreadGroupSize,
    Scratch,
}

bitflags::bitflags! {
    /// SPI_PS_INPUT_ADDR: which interpolants the rasterizer feeds the
    /// fragment shader.
    pub struct SpiPsInput: u32 {
        const PERSP_SAMPLE_ENA    = 1 << 0;
        const PERSP_CENTER_ENA    = 1 << 1;
        const PERSP_CENTROID_ENA  = 1 << 2;
        const PERSP_PULL_MODEL_ENA = 1 << 3;
        const LINEAR_SAMPLE_ENA   = 1 << 4;
        const LINEAR_CENTER_ENA   = 1 << 5;
        const LINEAR_CENTROID_ENA = 1 << 6;
        const POS_X_FLOAT_ENA     = 1 << 8;
        const POS_Y_FLOAT_ENA     = 1 << 9;
        const POS_Z_FLOAT_ENA     = 1 << 10;
        const POS_W_FLOAT_ENA     = 1 << 11;
        const FRONT_FACE_ENA      = 1 << 12;
        const ANCILLARY_ENA       = 1 << 13;
        const SAMPLE_COVERAGE_ENA = 1 << 14;
        const POS_FIXED_PT_ENA    = 1 << 15;
    }
}

bitflags::bitflags! {
    /// COMPUTE_PGM_RSRC2 dispatch input enables.
    pub struct CsDispatchInput: u32 {
        const TGID_X_EN  = 1 << 0;
        const TGID_Y_EN  = 1 << 1;
        const TGID_Z_EN  = 1 << 2;
        const TG_SIZE_EN = 1 << 3;
        const SCRATCH_EN = 1 << 4;
    }
}
