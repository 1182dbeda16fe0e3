// Index buffers and primitive expansion
//
// The host API has no quad primitives, so quad lists, quad strips
// and polygons are expanded into triangle lists with the tabulated
// index mappings below.
//
// Austin Shafer - 2024

use crate::gnm::{IndexType, PrimitiveType};
use crate::platform::BufferHandle;

/// Payload of a cached converted index buffer.
pub(crate) struct IndexBufferPayload {
    pub idx_handle: BufferHandle,
    pub idx_offset: u64,
    pub idx_index_type: IndexType,
    pub idx_prim_type: PrimitiveType,
    pub idx_platform: std::sync::Arc<dyn crate::platform::Platform>,
}

impl Drop for IndexBufferPayload {
    fn drop(&mut self) {
        self.idx_platform.destroy_buffer(self.idx_handle);
    }
}

/// Does this primitive type need expansion before the host can draw
/// it?
pub(crate) fn prim_requires_conversion(prim_type: PrimitiveType) -> bool {
    match prim_type {
        PrimitiveType::PointList
        | PrimitiveType::LineList
        | PrimitiveType::LineStrip
        | PrimitiveType::TriList
        | PrimitiveType::TriFan
        | PrimitiveType::TriStrip
        | PrimitiveType::Patch
        | PrimitiveType::LineListAdjacency
        | PrimitiveType::LineStripAdjacency
        | PrimitiveType::TriListAdjacency
        | PrimitiveType::TriStripAdjacency
        | PrimitiveType::RectList => false,

        PrimitiveType::LineLoop => panic!("unimplemented line loop primitive"),

        PrimitiveType::QuadList | PrimitiveType::QuadStrip | PrimitiveType::Polygon => true,

        PrimitiveType::None => panic!("draw with primitive type None"),
    }
}

/// Index mapping for one expanded output index: returns
/// `(dst_index, src_index)`.
pub(crate) type PrimConverter = fn(u64) -> (u64, u64);

fn quad_list_converter(index: u64) -> (u64, u64) {
    const INDICES: [u64; 6] = [0, 1, 2, 2, 3, 0];
    (index, (index / 6) * 4 + INDICES[(index % 6) as usize])
}

fn quad_strip_converter(index: u64) -> (u64, u64) {
    const INDICES: [u64; 6] = [0, 1, 3, 0, 3, 2];
    (index, (index / 6) * 4 + INDICES[(index % 6) as usize])
}

// Polygons fan out from vertex 0: triangle n is {0, n+1, n+2}
fn polygon_converter(index: u64) -> (u64, u64) {
    let rem = index % 3;
    let src = if rem == 0 { 0 } else { index / 3 + rem };
    (index, src)
}

/// Pick the converter for a primitive type and rewrite `count` to the
/// expanded index count.
pub(crate) fn prim_converter(prim_type: PrimitiveType, count: &mut u32) -> PrimConverter {
    match prim_type {
        PrimitiveType::QuadList => {
            *count = *count / 4 * 6;
            quad_list_converter
        }
        PrimitiveType::QuadStrip => {
            *count = *count / 4 * 6;
            quad_strip_converter
        }
        PrimitiveType::Polygon => {
            *count = count.saturating_sub(2) * 3;
            polygon_converter
        }
        _ => panic!("prim_converter: unexpected primitive type {:?}", prim_type),
    }
}
