// Sampled host images backed by ImageBuffers
//
// Cached images rest in the General layout; every content move
// transitions them to a transfer layout and back, with barrier
// stage/access pairs taken from the backend's layout table.
//
// Austin Shafer - 2024

use crate::cache::ImageBuffer;
use crate::entry::CacheEntry;
use crate::keys::{ImageBufferKey, ImageKind};
use crate::platform::{
    BufferImageCopy, Extent, Format, ImageHandle, ImageLayout, ImageSubresourceRange,
    ImageViewHandle,
};
use crate::range::AddressRange;
use crate::tag::Tag;
use crate::tiler::SurfaceInfo;
use crate::{Access, Result};

pub(crate) struct ImagePayload {
    pub i_handle: ImageHandle,
    pub i_kind: ImageKind,
    pub i_format: Format,
    pub i_extent: Extent,
    pub i_mip_levels: u32,
    pub i_array_layers: u32,
    pub i_pitch: u32,
    pub i_image_buffer_key: ImageBufferKey,
    pub i_info: SurfaceInfo,
    pub i_platform: std::sync::Arc<dyn crate::platform::Platform>,
}

impl Drop for ImagePayload {
    fn drop(&mut self) {
        self.i_platform.destroy_image(self.i_handle);
    }
}

impl ImagePayload {
    pub fn subresource(&self, entry_range: AddressRange, range: AddressRange) -> ImageSubresourceRange {
        crate::image_buffer::subresource_from_range(
            &self.i_info,
            self.i_kind.aspect(),
            entry_range,
            range,
        )
    }

    fn copy_regions(&self, image_buffer: &ImageBuffer, subresource: &ImageSubresourceRange) -> Vec<BufferImageCopy> {
        let mut regions = Vec::with_capacity(subresource.level_count as usize);

        for mip in subresource.base_mip_level..subresource.base_mip_level + subresource.level_count
        {
            let sub = self.i_info.subresource(mip);
            regions.push(BufferImageCopy {
                buffer_offset: image_buffer.offset + sub.sr_linear_offset,
                buffer_row_length: if mip > 0 { 0 } else { self.i_pitch.max(1) },
                aspect: self.i_kind.aspect(),
                mip_level: mip,
                base_array_layer: 0,
                layer_count: self.i_array_layers,
                image_extent: Extent {
                    width: (self.i_extent.width >> mip).max(1),
                    height: (self.i_extent.height >> mip).max(1),
                    depth: (self.i_extent.depth >> mip).max(1),
                },
            });
        }

        regions
    }

    /// Pull the mips selected by `range` in from the linear
    /// ImageBuffer.
    pub fn update(
        &self,
        tag: &mut Tag,
        entry_range: AddressRange,
        range: AddressRange,
        image_buffer: &ImageBuffer,
    ) -> Result<()> {
        let subresource = self.subresource(entry_range, range);
        let regions = self.copy_regions(image_buffer, &subresource);

        let cmd = tag.scheduler().get_command_buffer();
        let platform = tag.cache().platform();

        platform.cmd_transition_image(
            cmd,
            self.i_handle,
            ImageLayout::General,
            ImageLayout::TransferDst,
            subresource,
        );
        platform.cmd_copy_buffer_to_image(cmd, image_buffer.handle, self.i_handle, &regions);
        platform.cmd_transition_image(
            cmd,
            self.i_handle,
            ImageLayout::TransferDst,
            ImageLayout::General,
            subresource,
        );

        Ok(())
    }

    /// Record commands copying image content back out to the linear
    /// ImageBuffer.
    pub fn write(
        &self,
        tag: &mut Tag,
        entry_range: AddressRange,
        range: AddressRange,
        image_buffer: &ImageBuffer,
    ) -> Result<()> {
        let subresource = self.subresource(entry_range, range);
        let regions = self.copy_regions(image_buffer, &subresource);

        let cmd = tag.scheduler().get_command_buffer();
        let platform = tag.cache().platform();

        platform.cmd_transition_image(
            cmd,
            self.i_handle,
            ImageLayout::General,
            ImageLayout::TransferSrc,
            subresource,
        );
        platform.cmd_copy_image_to_buffer(cmd, self.i_handle, image_buffer.handle, &regions);
        platform.cmd_transition_image(
            cmd,
            self.i_handle,
            ImageLayout::TransferSrc,
            ImageLayout::General,
            subresource,
        );

        Ok(())
    }
}

/// Flush an Image's content down to its ImageBuffer when owed.
/// Returns true when commands were recorded.
pub(crate) fn flush_image(entry: &CacheEntry, tag: &mut Tag, range: AddressRange) -> Result<bool> {
    if !entry.has_delayed_flush() {
        return Ok(false);
    }
    entry.set_delayed_flush(false);

    let payload = entry.as_image();
    let image_buffer = tag.get_image_buffer(&payload.i_image_buffer_key, Access::WRITE)?;
    payload.write(tag, entry.e_range, range, &image_buffer)?;
    Ok(true)
}

/// Release-time write-back for an Image acquired with WRITE.
pub(crate) fn release_image(entry: &CacheEntry, tag: &mut Tag) -> Result<bool> {
    entry.set_delayed_flush(true);
    tag.cache().track_write(entry.e_range, entry.tag_id(), false);

    flush_image(entry, tag, entry.e_range)
}

/// Payload of an ImageView entry: a stateless alias of an Image.
pub(crate) struct ImageViewPayload {
    pub v_handle: ImageViewHandle,
    pub v_image: ImageHandle,
    pub v_platform: std::sync::Arc<dyn crate::platform::Platform>,
}

impl Drop for ImageViewPayload {
    fn drop(&mut self) {
        self.v_platform.destroy_image_view(self.v_handle);
    }
}
