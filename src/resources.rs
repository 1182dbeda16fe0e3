// Shader resource resolution
//
// A translated shader reports its resource descriptors as symbolic
// expressions over user sgprs and guest memory. Before a draw can be
// recorded those have to be reduced to concrete addresses, the
// referenced ranges acquired, and the whole set packed into the
// GPU-visible memory tables the shader indexes at runtime.
//
// Austin Shafer - 2024

use crate::cache::{Buffer, ImageView, Sampler, MEMORY_TABLE_SIZE};
use crate::gcn::{BinOp, Expr, Resources};
use crate::gnm::{SSampler, TBuffer, VBuffer};
use crate::keys::{ImageBufferKey, ImageViewKey, SamplerKey};
use crate::range::AddressRange;
use crate::range_map::RangeMap;
use crate::remote::RemoteMemory;
use crate::tag::Tag;
use crate::tiler::compute_surface_info;
use crate::{Access, Result, VortxError};

extern crate utils as vortx_utils;
use vortx_utils::log;

use serde::Serialize;
use std::collections::HashMap;

/// A reduced symbolic value: a scalar, or one of the small vectors a
/// wide pointer load produces.
#[derive(Clone, Debug)]
pub(crate) enum Value {
    Scalar(u64),
    Vector(Vec<u32>),
}

impl Value {
    pub fn zext_scalar(&self) -> Option<u64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Vector(_) => None,
        }
    }
}

enum Task<'e> {
    Eval(&'e Expr),
    Bin(BinOp),
    Load(u32),
}

/// Reduce an expression against the current user sgprs and guest
/// memory.
///
/// This is an explicit work-stack interpreter: shader IR arrives from
/// the guest, so recursion depth must not be its to choose.
pub(crate) fn eval_expr(expr: &Expr, user_sgprs: &[u32], memory: &RemoteMemory) -> Result<Value> {
    let mut tasks = vec![Task::Eval(expr)];
    let mut values: Vec<Value> = Vec::new();

    while let Some(task) = tasks.pop() {
        match task {
            Task::Eval(e) => match e {
                Expr::Const(v) => values.push(Value::Scalar(*v)),
                Expr::UserSgpr(index) => {
                    let Some(&v) = user_sgprs.get(*index as usize) else {
                        log::error!("descriptor depends on user sgpr {} beyond the prefix", index);
                        return Err(VortxError::UNRESOLVABLE_RESOURCE);
                    };
                    values.push(Value::Scalar(v as u64));
                }
                Expr::Imm(address) => {
                    values.push(Value::Scalar(memory.read_u32(*address) as u64));
                }
                Expr::Pointer { size, base, offset } => {
                    tasks.push(Task::Load(*size));
                    tasks.push(Task::Eval(offset));
                    tasks.push(Task::Eval(base));
                }
                Expr::BinOp(op, lhs, rhs) => {
                    tasks.push(Task::Bin(*op));
                    tasks.push(Task::Eval(rhs));
                    tasks.push(Task::Eval(lhs));
                }
            },

            Task::Bin(op) => {
                let rhs = values.pop().unwrap();
                let lhs = values.pop().unwrap();
                let (Some(a), Some(b)) = (lhs.zext_scalar(), rhs.zext_scalar()) else {
                    return Err(VortxError::UNRESOLVABLE_RESOURCE);
                };

                let result = match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Shl => a.wrapping_shl(b as u32),
                    BinOp::Shr => a.wrapping_shr(b as u32),
                };
                values.push(Value::Scalar(result));
            }

            Task::Load(size) => {
                let offset = values.pop().unwrap();
                let base = values.pop().unwrap();
                let (Some(base), Some(offset)) = (base.zext_scalar(), offset.zext_scalar()) else {
                    return Err(VortxError::UNRESOLVABLE_RESOURCE);
                };

                let address = base.wrapping_add(offset);
                let range = AddressRange::from_begin_size(address, size as u64);
                let bytes = memory.slice(range);

                let value = match size {
                    1 => Value::Scalar(bytes[0] as u64),
                    2 => Value::Scalar(u16::from_le_bytes(bytes.try_into().unwrap()) as u64),
                    4 => Value::Scalar(u32::from_le_bytes(bytes.try_into().unwrap()) as u64),
                    8 => Value::Scalar(u64::from_le_bytes(bytes.try_into().unwrap())),
                    12 | 16 | 32 => Value::Vector(
                        bytes
                            .chunks_exact(4)
                            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                            .collect(),
                    ),
                    _ => panic!("unexpected pointer load size {}", size),
                };
                values.push(value);
            }
        }
    }

    assert_eq!(values.len(), 1);
    Ok(values.pop().unwrap())
}

fn eval_word(expr: &Expr, user_sgprs: &[u32], memory: &RemoteMemory) -> Result<u32> {
    match eval_expr(expr, user_sgprs, memory)?.zext_scalar() {
        Some(v) => Ok(v as u32),
        None => {
            log::error!("descriptor word reduced to a vector value");
            Err(VortxError::UNRESOLVABLE_RESOURCE)
        }
    }
}

fn eval_words4(
    words: &[crate::gcn::ExprRef; 4],
    user_sgprs: &[u32],
    memory: &RemoteMemory,
) -> Result<[u32; 4]> {
    Ok([
        eval_word(&words[0], user_sgprs, memory)?,
        eval_word(&words[1], user_sgprs, memory)?,
        eval_word(&words[2], user_sgprs, memory)?,
        eval_word(&words[3], user_sgprs, memory)?,
    ])
}

/// One slot of the GPU-visible memory table, packed little-endian.
#[derive(Serialize)]
struct MemoryTableSlot {
    address: u64,
    size: u64,
    flags: u64,
    device_address: u64,
}

/// Per-tag resolution state: the merged access tables, acquired view
/// and sampler lists, and the slot-to-table-index map the late config
/// fixups read.
#[derive(Default)]
pub(crate) struct ShaderResources {
    /// Slot numbering is cumulative across every stage loaded into
    /// this tag
    pub sr_slot_offset: u32,
    sr_buffer_memory_table: RangeMap<Access>,
    sr_image_memory_table: RangeMap<(ImageBufferKey, Access)>,
    sr_resource_slot_to_address: Vec<(u32, u64)>,
    pub sr_image_resources: [Vec<ImageView>; 3],
    pub sr_sampler_resources: Vec<Sampler>,
    sr_slot_resources: HashMap<u32, u32>,
}

fn map_buffer_access(table: &mut RangeMap<Access>, range: AddressRange, access: Access) {
    if let Some((arange, slot)) = table.query_area_mut(range.begin()) {
        if arange == range {
            *slot |= access;
            return;
        }
    }

    table.map(range, access, true, false);
}

fn map_image_access(
    table: &mut RangeMap<(ImageBufferKey, Access)>,
    range: AddressRange,
    key: ImageBufferKey,
    access: Access,
) {
    if let Some((arange, slot)) = table.query_area_mut(range.begin()) {
        if arange == range {
            slot.1 |= access;
            return;
        }
    }

    table.map(range, (key, access), false, false);
}

impl ShaderResources {
    /// Resolve one stage's `Resources` against its user sgprs:
    /// evaluate every descriptor word, record the touched ranges, and
    /// acquire views and samplers through `tag`.
    pub fn load_resources(
        &mut self,
        tag: &mut Tag,
        res: &Resources,
        user_sgprs: &[u32],
    ) -> Result<()> {
        let memory = tag.cache().memory();

        for pointer in res.pointers.iter() {
            let base = eval_expr(&pointer.base, user_sgprs, &memory)?
                .zext_scalar()
                .ok_or(VortxError::UNRESOLVABLE_RESOURCE)?;
            let offset = eval_expr(&pointer.offset, user_sgprs, &memory)?
                .zext_scalar()
                .ok_or(VortxError::UNRESOLVABLE_RESOURCE)?;

            let begin = base.wrapping_add(offset);
            map_buffer_access(
                &mut self.sr_buffer_memory_table,
                AddressRange::from_begin_size(begin, pointer.size as u64),
                Access::READ,
            );
            self.sr_resource_slot_to_address
                .push((self.sr_slot_offset + pointer.resource_slot, begin));
        }

        for buffer_res in res.buffers.iter() {
            let words = eval_words4(&buffer_res.words, user_sgprs, &memory)?;
            let vbuffer = VBuffer::from_words(words);

            map_buffer_access(
                &mut self.sr_buffer_memory_table,
                AddressRange::from_begin_size(vbuffer.address(), vbuffer.size()),
                buffer_res.access,
            );
            self.sr_resource_slot_to_address
                .push((self.sr_slot_offset + buffer_res.resource_slot, vbuffer.address()));
        }

        for image_buffer in res.image_buffers.iter() {
            let mut words = [0u32; 8];
            words[..4].copy_from_slice(&eval_words4(&image_buffer.words, user_sgprs, &memory)?);
            if let Some(hi) = &image_buffer.words_hi {
                words[4..].copy_from_slice(&eval_words4(hi, user_sgprs, &memory)?);
            }
            let tbuffer = TBuffer::from_words(words);
            let key = ImageBufferKey::from_tbuffer(&tbuffer);

            let info = compute_surface_info(
                key.tile_mode,
                key.tex_type,
                key.dfmt,
                key.extent.width,
                key.extent.height,
                key.extent.depth,
                key.pitch,
                key.base_array_layer,
                key.array_layer_count,
                key.base_mip_level,
                key.mip_count,
                key.pow2pad,
            );

            map_image_access(
                &mut self.sr_image_memory_table,
                AddressRange::from_begin_size(tbuffer.address(), info.si_total_tiled_size),
                key,
                image_buffer.access,
            );
            self.sr_resource_slot_to_address.push((
                self.sr_slot_offset + image_buffer.resource_slot,
                tbuffer.address(),
            ));
        }

        for texture in res.textures.iter() {
            let mut words = [0u32; 8];
            words[..4].copy_from_slice(&eval_words4(&texture.words, user_sgprs, &memory)?);
            if let Some(hi) = &texture.words_hi {
                words[4..].copy_from_slice(&eval_words4(hi, user_sgprs, &memory)?);
            }
            let tbuffer = TBuffer::from_words(words);

            let dim = tbuffer.texture_type().dim() - 1;
            let view = tag.get_image_view(&ImageViewKey::from_tbuffer(&tbuffer), texture.access)?;

            self.sr_slot_resources.insert(
                self.sr_slot_offset + texture.resource_slot,
                self.sr_image_resources[dim].len() as u32,
            );
            self.sr_image_resources[dim].push(view);
        }

        for sampler_res in res.samplers.iter() {
            let words = eval_words4(&sampler_res.words, user_sgprs, &memory)?;
            let mut ssampler = SSampler::from_words(words);

            if sampler_res.unorm {
                ssampler.set_force_unorm_coords(true);
            }

            let sampler = tag.get_sampler(&SamplerKey::from_ssampler(&ssampler))?;
            self.sr_slot_resources.insert(
                self.sr_slot_offset + sampler_res.resource_slot,
                self.sr_sampler_resources.len() as u32,
            );
            self.sr_sampler_resources.push(sampler);
        }

        self.sr_slot_offset += res.slots;
        Ok(())
    }

    /// The memory-table index a resource slot resolved to, or the
    /// poison value for slots nothing resolved.
    pub fn get_resource_slot(&self, id: u32) -> u32 {
        self.sr_slot_resources.get(&id).copied().unwrap_or(u32::MAX)
    }

    fn patch_slots(&mut self, range: AddressRange, table_slot: u32) {
        for &(slot, address) in self.sr_resource_slot_to_address.iter() {
            if range.contains_address(address) {
                self.sr_slot_resources.insert(slot, table_slot);
            }
        }
    }

    fn write_table(table: &Buffer, slots: &[MemoryTableSlot]) {
        let bytes = bincode::serialize(&slots).unwrap();
        assert!(bytes.len() as u64 <= MEMORY_TABLE_SIZE, "memory table overflow");

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), table.data, bytes.len());
        }
    }

    /// Acquire a Buffer per merged interval and pack the table the
    /// shader indexes for raw memory access.
    pub fn build_memory_table(&mut self, tag: &mut Tag, table: &Buffer) -> Result<()> {
        let intervals: Vec<(AddressRange, Access)> = self
            .sr_buffer_memory_table
            .iter()
            .map(|(r, &a)| (r, a))
            .collect();

        let mut slots = Vec::with_capacity(intervals.len());
        for (range, access) in intervals {
            let buffer = tag.get_buffer(range, access)?;

            self.patch_slots(range, slots.len() as u32);
            slots.push(MemoryTableSlot {
                address: range.begin(),
                size: range.size(),
                flags: access.bits() as u64,
                device_address: buffer.device_address,
            });
        }

        Self::write_table(table, &slots);
        Ok(())
    }

    /// The image flavor: one ImageBuffer per interval.
    pub fn build_image_memory_table(&mut self, tag: &mut Tag, table: &Buffer) -> Result<()> {
        let intervals: Vec<(AddressRange, (ImageBufferKey, Access))> = self
            .sr_image_memory_table
            .iter()
            .map(|(r, p)| (r, p.clone()))
            .collect();

        let mut slots = Vec::with_capacity(intervals.len());
        for (range, (key, access)) in intervals {
            let image_buffer = tag.get_image_buffer(&key, access)?;

            self.patch_slots(range, slots.len() as u32);
            slots.push(MemoryTableSlot {
                address: range.begin(),
                size: range.size(),
                flags: access.bits() as u64,
                device_address: image_buffer.device_address,
            });
        }

        Self::write_table(table, &slots);
        Ok(())
    }
}

/// A late config-buffer fixup: the table index for a resource slot is
/// only known after `build_memory_table` runs.
#[derive(Copy, Clone, Debug)]
pub(crate) struct MemoryTableConfigSlot {
    pub mt_buffer_index: u32,
    pub mt_config_index: u32,
    pub mt_resource_slot: u32,
}

/// A tag-held config buffer: host pointer plus length in u32s.
#[derive(Copy, Clone, Debug)]
pub(crate) struct ConfigBuffer {
    pub cb_data: *mut u32,
    pub cb_len: usize,
}

impl ConfigBuffer {
    pub fn write(&self, index: usize, value: u32) {
        assert!(index < self.cb_len);
        unsafe {
            self.cb_data.add(index).write(value);
        }
    }
}
