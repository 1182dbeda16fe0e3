// The Vortx guest GPU resource cache
//
// Vortx mirrors a guest console GPU's memory-addressed resources
// (buffers, tiled images, shaders, descriptor records) into host
// Vulkan-class objects and keeps both sides coherent while draws and
// dispatches stream through.
//
// Austin Shafer - 2024

pub mod range;
pub mod range_map;
pub mod page_map;
pub mod gnm;
pub mod gcn;
pub mod tiler;
pub mod keys;
pub mod platform;
pub mod scheduler;
pub mod remote;

mod buffer;
mod cache;
mod descpool;
mod entry;
mod image;
mod image_buffer;
mod index_buffer;
mod resources;
mod shader;
mod tag;
#[cfg(test)]
mod tests;

pub use cache::{
    Buffer, Cache, CacheCreateInfo, Image, ImageBuffer, ImageView, IndexBuffer, Sampler, Shader,
    TagId,
};
pub use range::AddressRange;
pub use range_map::RangeMap;
pub use tag::{
    ComputePgm, ComputeTag, GraphicsContext, GraphicsTag, ShaderPgm, Tag, Viewport,
    ViewportTransform,
};

use std::fmt;

bitflags::bitflags! {
    /// How a tag holds a cache entry. An entry tracks the union of
    /// the access every current holder asked for.
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Default for Access {
    fn default() -> Self {
        Access::empty()
    }
}

/// Errors returned by Vortx
///
/// The rule of thumb: a recoverable miss (shader that will not
/// translate, descriptor that will not resolve) comes back as an
/// error or empty handle so the caller can skip the draw; a broken
/// structural invariant panics.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum VortxError {
    #[error("A symbolic descriptor word could not be reduced to a constant")]
    UNRESOLVABLE_RESOURCE,
    #[error("The shader front end rejected the input program")]
    COMPILE_FAILURE,
    #[error("The host graphics API returned a failure")]
    HOST_API_FAILURE,
    #[error("Out of device or host memory")]
    OUT_OF_MEMORY,
    #[error("Invalid argument or state")]
    INVALID,
}

pub type Result<T> = std::result::Result<T, VortxError>;
