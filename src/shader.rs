// Compiled shader entries
//
// Austin Shafer - 2024

use crate::gcn::ShaderInfo;
use crate::platform::ShaderHandle;

use std::sync::Arc;

/// Payload of a Shader entry.
///
/// Shaders are content addressed: `sh_magic` holds the first eight
/// bytes of the source, and `sh_used_memory` snapshots every guest
/// range the translator read. A lookup only hits while all of it
/// still compares equal to live guest memory.
pub(crate) struct ShaderPayload {
    pub sh_handle: ShaderHandle,
    pub sh_magic: u64,
    pub sh_info: Arc<ShaderInfo>,
    pub sh_used_memory: Vec<(u64, Vec<u8>)>,
    pub sh_platform: Arc<dyn crate::platform::Platform>,
}

impl Drop for ShaderPayload {
    fn drop(&mut self) {
        self.sh_platform.destroy_shader(self.sh_handle);
    }
}
