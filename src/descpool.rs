// Pipeline layouts and descriptor set pools
//
// Layouts are fixed for the whole cache: every shader sees the same
// binding map, so descriptor sets can be preallocated up front and
// handed out round-robin as tags come and go.
//
// Austin Shafer - 2024

use crate::gcn::Stage;
use crate::platform::{
    DescriptorBinding, DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorType,
    PipelineLayoutHandle, Platform, ShaderStage,
};
use crate::Result;

/// The binding map shared by every pipeline:
///   0 - per-stage config storage buffer
///   1 - sampler array
///   2..4 - sampled image arrays by dimensionality
///   5 - storage image array
pub(crate) fn descriptor_binding(ty: DescriptorType, dim: usize) -> u32 {
    match (ty, dim) {
        (DescriptorType::StorageBuffer, _) => 0,
        (DescriptorType::Sampler, _) => 1,
        (DescriptorType::SampledImage, 1) => 2,
        (DescriptorType::SampledImage, 2) => 3,
        (DescriptorType::SampledImage, 3) => 4,
        (DescriptorType::StorageImage, _) => 5,
        (DescriptorType::SampledImage, d) => panic!("sampled image with dimension {}", d),
    }
}

pub(crate) const DESCRIPTOR_BINDING_COUNT: usize = 6;

/// Resources per array binding.
pub(crate) const DESCRIPTOR_ARRAY_SIZE: u32 = 16;

/// Concurrent tag generations worth of descriptor sets.
pub(crate) const DESCRIPTOR_SET_COUNT: usize = 32;

/// Graphics stages with their own descriptor set, in set order.
pub(crate) const GRAPHICS_STAGES: [Stage; 2] = [Stage::VsVs, Stage::Ps];

pub(crate) fn stage_index(stage: Stage) -> usize {
    match stage {
        Stage::VsVs => 0,
        Stage::Ps => 1,
        _ => panic!("unsupported shader stage {:?}", stage),
    }
}

pub(crate) fn stage_to_host(stage: Stage) -> ShaderStage {
    match stage {
        Stage::VsVs => ShaderStage::Vertex,
        Stage::Ps => ShaderStage::Fragment,
        Stage::Cs => ShaderStage::Compute,
        _ => panic!("unsupported shader stage {:?}", stage),
    }
}

/// A round-robin integer slot allocator. Slot indices convey
/// exclusive ownership of pooled resources to one tag at a time.
pub(crate) struct IndexPool {
    ip_in_use: Vec<bool>,
    ip_cursor: usize,
}

impl IndexPool {
    pub fn new(count: usize) -> Self {
        Self {
            ip_in_use: vec![false; count],
            ip_cursor: 0,
        }
    }

    pub fn acquire(&mut self) -> usize {
        let count = self.ip_in_use.len();

        for probe in 0..count {
            let index = (self.ip_cursor + probe) % count;
            if !self.ip_in_use[index] {
                self.ip_in_use[index] = true;
                self.ip_cursor = (index + 1) % count;
                return index;
            }
        }

        // Every slot is owned by a live tag; tags are stack scoped so
        // this means the pool was sized below the real concurrency
        panic!("index pool exhausted");
    }

    pub fn release(&mut self, index: usize) {
        assert!(self.ip_in_use[index], "releasing a free pool slot");
        self.ip_in_use[index] = false;
    }
}

fn stage_bindings(first_set: bool, compute: bool) -> Vec<DescriptorBinding> {
    let mut bindings = vec![DescriptorBinding {
        binding: 0,
        ty: DescriptorType::StorageBuffer,
        count: 1,
        compute,
    }];

    if first_set {
        bindings.push(DescriptorBinding {
            binding: descriptor_binding(DescriptorType::Sampler, 0),
            ty: DescriptorType::Sampler,
            count: DESCRIPTOR_ARRAY_SIZE,
            compute,
        });
        for dim in 1..=3 {
            bindings.push(DescriptorBinding {
                binding: descriptor_binding(DescriptorType::SampledImage, dim),
                ty: DescriptorType::SampledImage,
                count: DESCRIPTOR_ARRAY_SIZE,
                compute,
            });
        }
        bindings.push(DescriptorBinding {
            binding: descriptor_binding(DescriptorType::StorageImage, 0),
            ty: DescriptorType::StorageImage,
            count: DESCRIPTOR_ARRAY_SIZE,
            compute,
        });
    }

    bindings
}

/// All fixed layout state plus the preallocated descriptor sets.
pub(crate) struct DescPool {
    pub dp_graphics_layouts: Vec<DescriptorSetLayoutHandle>,
    pub dp_compute_layout: DescriptorSetLayoutHandle,
    pub dp_graphics_pipeline_layout: PipelineLayoutHandle,
    pub dp_compute_pipeline_layout: PipelineLayoutHandle,
    /// One descriptor set per graphics stage, per pool slot
    dp_graphics_sets: Vec<Vec<DescriptorSetHandle>>,
    dp_compute_sets: Vec<DescriptorSetHandle>,
    dp_graphics_pool: IndexPool,
    dp_compute_pool: IndexPool,
}

impl DescPool {
    pub fn new(platform: &dyn Platform) -> Result<Self> {
        let mut graphics_layouts = Vec::with_capacity(GRAPHICS_STAGES.len());
        for set_index in 0..GRAPHICS_STAGES.len() {
            graphics_layouts
                .push(platform.create_descriptor_set_layout(&stage_bindings(set_index == 0, false))?);
        }

        let compute_layout = platform.create_descriptor_set_layout(&stage_bindings(true, true))?;

        let graphics_pipeline_layout = platform.create_pipeline_layout(&graphics_layouts)?;
        let compute_pipeline_layout = platform.create_pipeline_layout(&[compute_layout])?;

        let mut graphics_sets = Vec::with_capacity(DESCRIPTOR_SET_COUNT);
        for _ in 0..DESCRIPTOR_SET_COUNT {
            let mut per_stage = Vec::with_capacity(graphics_layouts.len());
            for &layout in graphics_layouts.iter() {
                per_stage.push(platform.allocate_descriptor_sets(layout, 1)?[0]);
            }
            graphics_sets.push(per_stage);
        }

        let mut compute_sets = Vec::with_capacity(DESCRIPTOR_SET_COUNT);
        for _ in 0..DESCRIPTOR_SET_COUNT {
            compute_sets.push(platform.allocate_descriptor_sets(compute_layout, 1)?[0]);
        }

        Ok(Self {
            dp_graphics_layouts: graphics_layouts,
            dp_compute_layout: compute_layout,
            dp_graphics_pipeline_layout: graphics_pipeline_layout,
            dp_compute_pipeline_layout: compute_pipeline_layout,
            dp_graphics_sets: graphics_sets,
            dp_compute_sets: compute_sets,
            dp_graphics_pool: IndexPool::new(DESCRIPTOR_SET_COUNT),
            dp_compute_pool: IndexPool::new(DESCRIPTOR_SET_COUNT),
        })
    }

    pub fn acquire_graphics_sets(&mut self) -> (usize, Vec<DescriptorSetHandle>) {
        let slot = self.dp_graphics_pool.acquire();
        (slot, self.dp_graphics_sets[slot].clone())
    }

    pub fn release_graphics_sets(&mut self, slot: usize) {
        self.dp_graphics_pool.release(slot);
    }

    pub fn acquire_compute_set(&mut self) -> (usize, DescriptorSetHandle) {
        let slot = self.dp_compute_pool.acquire();
        (slot, self.dp_compute_sets[slot])
    }

    pub fn release_compute_set(&mut self, slot: usize) {
        self.dp_compute_pool.release(slot);
    }
}
