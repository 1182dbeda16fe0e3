// Device-local linear mirrors of tiled guest images
//
// An ImageBuffer sits between a Buffer (raw guest bytes, possibly in
// a proprietary tile order) and an Image (the sampled host object).
// Linear tile modes are plain per-mip copies; everything else goes
// through the external tiler's kernels.
//
// Austin Shafer - 2024

use crate::cache::Buffer;
use crate::entry::CacheEntry;
use crate::keys::ImageBufferKey;
use crate::platform::{
    BufferCopy, BufferHandle, ImageAspect, ImageSubresourceRange,
};
use crate::range::AddressRange;
use crate::tag::Tag;
use crate::tiler::SurfaceInfo;
use crate::tiler::TileMode;
use crate::{Access, Result};

/// Payload of an ImageBuffer entry.
pub(crate) struct ImageBufferPayload {
    pub ib_handle: BufferHandle,
    pub ib_device_address: u64,
    pub ib_key: ImageBufferKey,
    pub ib_tile_mode: TileMode,
    pub ib_info: SurfaceInfo,
    pub ib_platform: std::sync::Arc<dyn crate::platform::Platform>,
}

impl Drop for ImageBufferPayload {
    fn drop(&mut self) {
        self.ib_platform.destroy_buffer(self.ib_handle);
    }
}

/// Pick the mip window a byte range touches by walking the tiled
/// layout. Layers of a mip are contiguous, so a mip is in the window
/// when `[tiled_offset, tiled_offset + tiled_size * layers)` overlaps
/// the byte range.
pub(crate) fn subresource_from_range(
    info: &SurfaceInfo,
    aspect: ImageAspect,
    entry_range: AddressRange,
    range: AddressRange,
) -> ImageSubresourceRange {
    let offset = range.begin() - entry_range.begin();
    let size = range.size();
    let mut first_mip = u32::MAX;
    let mut last_mip = 0;

    for mip in 0..info.si_mip_count {
        let sub = info.subresource(mip);
        if sub.sr_tiled_offset > offset + size {
            break;
        }

        if sub.sr_tiled_offset + sub.sr_tiled_size * (info.si_array_layers as u64) < offset {
            continue;
        }

        first_mip = first_mip.min(mip);
        last_mip = last_mip.max(mip);
    }

    assert!(first_mip <= last_mip, "byte range selects no subresource");

    ImageSubresourceRange {
        aspect,
        base_mip_level: first_mip,
        level_count: last_mip - first_mip + 1,
        base_array_layer: 0,
        layer_count: info.si_array_layers,
    }
}

impl ImageBufferPayload {
    pub fn is_linear(&self) -> bool {
        self.ib_tile_mode.is_linear()
    }

    pub fn subresource(&self, entry_range: AddressRange, range: AddressRange) -> ImageSubresourceRange {
        subresource_from_range(&self.ib_info, ImageAspect::Color, entry_range, range)
    }

    /// Pull content in from the tiled Buffer below us, restricted to
    /// the mips `range` selects.
    pub fn update(
        &self,
        tag: &mut Tag,
        entry_range: AddressRange,
        range: AddressRange,
        tiled: &Buffer,
    ) -> Result<()> {
        let subresource = self.subresource(entry_range, range);

        if !self.is_linear() {
            let tiler = tag.cache().tiler();

            for mip in subresource.base_mip_level
                ..subresource.base_mip_level + subresource.level_count
            {
                tiler.detile(
                    tag.scheduler(),
                    &self.ib_info,
                    self.ib_tile_mode,
                    tiled.device_address,
                    self.ib_info.si_total_tiled_size,
                    self.ib_device_address,
                    self.ib_info.si_total_linear_size,
                    mip,
                    0,
                    self.ib_info.si_array_layers,
                )?;
            }
            return Ok(());
        }

        let mut regions = Vec::with_capacity(subresource.level_count as usize);
        for mip in
            subresource.base_mip_level..subresource.base_mip_level + subresource.level_count
        {
            let sub = self.ib_info.subresource(mip);
            regions.push(BufferCopy {
                src_offset: sub.sr_tiled_offset + tiled.offset,
                dst_offset: sub.sr_linear_offset,
                size: sub.sr_linear_size,
            });
        }

        let cmd = tag.scheduler().get_command_buffer();
        tag.cache()
            .platform()
            .cmd_copy_buffer(cmd, tiled.handle, self.ib_handle, &regions);
        Ok(())
    }

    /// Record commands copying our authoritative linear content back
    /// into the tiled Buffer.
    pub fn write(
        &self,
        tag: &mut Tag,
        tiled: &Buffer,
        subresource: ImageSubresourceRange,
    ) -> Result<()> {
        if !self.is_linear() {
            let tiler = tag.cache().tiler();

            for mip in subresource.base_mip_level
                ..subresource.base_mip_level + subresource.level_count
            {
                tiler.tile(
                    tag.scheduler(),
                    &self.ib_info,
                    self.ib_tile_mode,
                    self.ib_device_address,
                    self.ib_info.si_total_linear_size,
                    tiled.device_address,
                    self.ib_info.si_total_tiled_size,
                    mip,
                    0,
                    self.ib_info.si_array_layers,
                )?;
            }
            return Ok(());
        }

        let mut regions = Vec::with_capacity(subresource.level_count as usize);
        for mip in
            subresource.base_mip_level..subresource.base_mip_level + subresource.level_count
        {
            let sub = self.ib_info.subresource(mip);
            regions.push(BufferCopy {
                src_offset: sub.sr_linear_offset,
                dst_offset: sub.sr_tiled_offset + tiled.offset,
                size: sub.sr_linear_size,
            });
        }

        let cmd = tag.scheduler().get_command_buffer();
        tag.cache()
            .platform()
            .cmd_copy_buffer(cmd, self.ib_handle, tiled.handle, &regions);
        Ok(())
    }
}

/// Flush the mips of `range` down to the Buffer level if a flush is
/// owed. Returns true when commands were recorded.
pub(crate) fn flush_image_buffer(
    entry: &CacheEntry,
    tag: &mut Tag,
    range: AddressRange,
) -> Result<bool> {
    if !entry.has_delayed_flush() {
        return Ok(false);
    }
    entry.set_delayed_flush(false);

    let payload = entry.as_image_buffer();
    let subresource = payload.subresource(entry.e_range, range);

    // The target is the exact tiled span of the selected mips
    let begin_offset = payload
        .ib_info
        .subresource(subresource.base_mip_level)
        .sr_tiled_offset;
    let last = payload
        .ib_info
        .subresource(subresource.base_mip_level + subresource.level_count - 1);
    let total = last.sr_tiled_offset + last.sr_tiled_size * subresource.layer_count as u64
        - begin_offset;

    let target_range = AddressRange::from_begin_size(range.begin() + begin_offset, total);

    let tiled = tag.get_buffer(target_range, Access::WRITE)?;
    payload.write(tag, &tiled, subresource)?;
    Ok(true)
}

/// Release-time write-back for an ImageBuffer acquired with WRITE.
pub(crate) fn release_image_buffer(entry: &CacheEntry, tag: &mut Tag) -> Result<bool> {
    entry.set_delayed_flush(true);

    let payload = entry.as_image_buffer();
    for mip in 0..payload.ib_info.si_mip_count {
        let sub = payload.ib_info.subresource(mip);
        let sub_range = AddressRange::from_begin_size(
            entry.e_range.begin() + sub.sr_tiled_offset,
            sub.sr_tiled_size * payload.ib_info.si_array_layers as u64,
        );

        tag.cache().track_write(sub_range, entry.tag_id(), false);
    }

    flush_image_buffer(entry, tag, entry.e_range)
}
