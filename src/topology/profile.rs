//! Device catalogs: supported GPU and compute partition profiles per
//! device generation.

use serde::{Deserialize, Serialize};

use crate::engine::class::EngineCounts;
use crate::engine::inventory::DeviceEngineInventory;
use crate::error::{PartitionError, PartitionResult};
use crate::topology::tree::{bit, slots, Shape, COMPUTE_TREE, GPU_TREE, LEAF_SLICES};

/// GPCs on a full device.
pub const MAX_GPCS: u32 = LEAF_SLICES;

/// VEIDs (sub-contexts) per GPC.
pub const VEIDS_PER_GPC: u32 = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    #[default]
    Ga100,
    Gh100,
}

/// A GPU partition shape and what it costs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuProfile {
    pub name: &'static str,
    /// Stable identifier written into persistence records.
    pub flag: u32,
    pub shape: Shape,
    pub gpc_count: u32,
    /// Engine counts; `gr` equals `gpc_count`.
    pub engines: EngineCounts,
}

/// A compute partition shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComputeProfile {
    pub size: Shape,
    pub gpc_count: u32,
    pub sm_count: u32,
    pub veid_count: u32,
}

const fn counts(gr: u32, copy: u32, nvdec: u32, nvenc: u32, nvjpg: u32, ofa: u32) -> EngineCounts {
    EngineCounts {
        gr,
        copy,
        nvdec,
        nvenc,
        nvjpg,
        ofa,
    }
}

const fn gpu_profile(name: &'static str, flag: u32, shape: Shape, gpc: u32, engines: EngineCounts) -> GpuProfile {
    GpuProfile {
        name,
        flag,
        shape,
        gpc_count: gpc,
        engines,
    }
}

struct GenerationTable {
    sms_per_gpc: u32,
    engines: EngineCounts,
    system_engines: u32,
    gpu_profiles: &'static [GpuProfile],
    compute_sizes: &'static [(Shape, u32)],
}

static GA100: GenerationTable = GenerationTable {
    sms_per_gpc: 14,
    engines: counts(8, 10, 5, 0, 1, 1),
    system_engines: 3,
    gpu_profiles: &[
        gpu_profile("full", 0x0, Shape::Full, 8, counts(8, 8, 5, 0, 1, 1)),
        gpu_profile("half", 0x1, Shape::Half, 4, counts(4, 4, 2, 0, 0, 0)),
        gpu_profile("quarter", 0x2, Shape::Quarter, 2, counts(2, 2, 1, 0, 0, 0)),
        gpu_profile("eighth", 0x3, Shape::Eighth, 1, counts(1, 1, 0, 0, 0, 0)),
        gpu_profile("eighth+me", 0x13, Shape::Eighth, 1, counts(1, 1, 1, 0, 1, 1)),
    ],
    compute_sizes: &[
        (Shape::Full, 8),
        (Shape::Half, 4),
        (Shape::MiniHalf, 3),
        (Shape::Quarter, 2),
        (Shape::Eighth, 1),
    ],
};

static GH100: GenerationTable = GenerationTable {
    sms_per_gpc: 16,
    engines: counts(8, 10, 7, 0, 7, 1),
    system_engines: 3,
    gpu_profiles: &[
        gpu_profile("full", 0x0, Shape::Full, 8, counts(8, 8, 7, 0, 7, 1)),
        gpu_profile("half", 0x1, Shape::Half, 4, counts(4, 4, 3, 0, 3, 0)),
        gpu_profile("quarter", 0x2, Shape::Quarter, 2, counts(2, 2, 1, 0, 1, 0)),
        gpu_profile("eighth", 0x3, Shape::Eighth, 1, counts(1, 1, 0, 0, 0, 0)),
        gpu_profile("eighth+me", 0x13, Shape::Eighth, 1, counts(1, 1, 1, 0, 1, 1)),
    ],
    compute_sizes: &[
        (Shape::Full, 8),
        (Shape::Half, 4),
        (Shape::MiniHalf, 3),
        (Shape::Quarter, 2),
        (Shape::Eighth, 1),
    ],
};

/// Everything static about one device: its engines, memory and the
/// profiles it supports. Built once at startup.
#[derive(Debug, Clone)]
pub struct DeviceCatalog {
    generation: Generation,
    sms_per_gpc: u32,
    memory_size: u64,
    invalid_swizz_mask: u64,
    inventory: DeviceEngineInventory,
    gpu_profiles: &'static [GpuProfile],
    compute_profiles: Vec<ComputeProfile>,
}

impl DeviceCatalog {
    /// `invalid_swizz_mask` lists GPU slots unusable on this board.
    pub fn new(generation: Generation, memory_size: u64, invalid_swizz_mask: u64) -> Self {
        let table = match generation {
            Generation::Ga100 => &GA100,
            Generation::Gh100 => &GH100,
        };
        let compute_profiles = table
            .compute_sizes
            .iter()
            .map(|&(size, gpc)| ComputeProfile {
                size,
                gpc_count: gpc,
                sm_count: gpc * table.sms_per_gpc,
                veid_count: gpc * VEIDS_PER_GPC,
            })
            .collect();

        Self {
            generation,
            sms_per_gpc: table.sms_per_gpc,
            memory_size,
            invalid_swizz_mask,
            inventory: DeviceEngineInventory::new(table.engines, table.system_engines),
            gpu_profiles: table.gpu_profiles,
            compute_profiles,
        }
    }

    /// Override the generation's SMs per GPC, as on boards with
    /// non-standard floorsweeping.
    pub fn with_sms_per_gpc(mut self, sms_per_gpc: u32) -> Self {
        self.sms_per_gpc = sms_per_gpc;
        for profile in &mut self.compute_profiles {
            profile.sm_count = profile.gpc_count * sms_per_gpc;
        }
        self
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn inventory(&self) -> &DeviceEngineInventory {
        &self.inventory
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn sms_per_gpc(&self) -> u32 {
        self.sms_per_gpc
    }

    pub fn gpu_profiles(&self) -> &[GpuProfile] {
        self.gpu_profiles
    }

    pub fn compute_profiles(&self) -> &[ComputeProfile] {
        &self.compute_profiles
    }

    pub fn gpu_profile(&self, name: &str) -> PartitionResult<&GpuProfile> {
        self.gpu_profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| PartitionError::InvalidArgument(format!("unknown GPU partition profile '{name}'")))
    }

    pub fn gpu_profile_by_flag(&self, flag: u32) -> PartitionResult<&GpuProfile> {
        self.gpu_profiles
            .iter()
            .find(|p| p.flag == flag)
            .ok_or_else(|| PartitionError::InvalidArgument(format!("unknown GPU partition profile flag {flag:#x}")))
    }

    /// GPU slots usable on this device.
    pub fn valid_swizz_mask(&self) -> u64 {
        GPU_TREE.all_slots() & !self.invalid_swizz_mask
    }

    /// Span unit for GPU partitions (one eighth).
    pub fn swizz_basis(&self) -> u64 {
        GPU_TREE.level_mask(Shape::Eighth).unwrap_or(0)
    }

    /// Span unit for compute partitions: the smallest supported compute size.
    pub fn cts_basis(&self) -> u64 {
        self.compute_profiles
            .iter()
            .min_by_key(|p| p.gpc_count)
            .and_then(|p| COMPUTE_TREE.level_mask(p.size).ok())
            .unwrap_or(0)
    }

    /// Leaf slices a GPU partition of `shape` covers.
    pub fn slices_for(&self, shape: Shape) -> u32 {
        GPU_TREE
            .level_range(shape)
            .map(|r| GPU_TREE.slice_span(r.start).len() as u32)
            .unwrap_or(0)
    }

    /// Memory owned by a GPU partition of `profile`.
    pub fn memory_for(&self, profile: &GpuProfile) -> u64 {
        self.memory_size / u64::from(LEAF_SLICES) * u64::from(self.slices_for(profile.shape))
    }

    pub fn sm_count(&self, gpc_count: u32) -> u32 {
        gpc_count * self.sms_per_gpc
    }

    pub fn compute_profile(&self, size: Shape) -> PartitionResult<&ComputeProfile> {
        self.compute_profiles
            .iter()
            .find(|p| p.size == size)
            .ok_or_else(|| {
                PartitionError::NotSupported(format!(
                    "compute size {} not supported on {:?}",
                    size.name(),
                    self.generation
                ))
            })
    }

    pub fn compute_profile_for_sm_count(&self, sm_count: u32) -> PartitionResult<&ComputeProfile> {
        self.compute_profiles
            .iter()
            .find(|p| p.sm_count == sm_count)
            .ok_or_else(|| PartitionError::InvalidArgument(format!("no compute profile with {sm_count} SMs")))
    }

    /// Smallest compute size able to hold `gpc_count` GPCs.
    pub fn compute_profile_for_gpc_count(&self, gpc_count: u32) -> PartitionResult<&ComputeProfile> {
        if gpc_count == 0 {
            return Err(PartitionError::InvalidArgument("gpc count must be non-zero".into()));
        }
        let size = if gpc_count <= MAX_GPCS / 8 {
            Shape::Eighth
        } else if gpc_count <= MAX_GPCS / 4 {
            Shape::Quarter
        } else if gpc_count < MAX_GPCS / 2 {
            Shape::MiniHalf
        } else if gpc_count == MAX_GPCS / 2 {
            Shape::Half
        } else {
            Shape::Full
        };
        self.compute_profile(size)
    }

    /// Compute slots usable inside a GPU partition of `profile`: slots
    /// that fit in the partition's slices, whose size is in the catalog and
    /// needs no more GPCs than the partition has.
    pub fn valid_cts_mask(&self, profile: &GpuProfile) -> u64 {
        let slices = self.slices_for(profile.shape);
        slots(COMPUTE_TREE.all_slots())
            .filter(|&id| COMPUTE_TREE.slice_span(id).end <= slices)
            .filter(|&id| {
                COMPUTE_TREE
                    .slot_to_shape(id)
                    .and_then(|shape| self.compute_profile(shape))
                    .is_ok_and(|cp| cp.gpc_count <= profile.gpc_count)
            })
            .fold(0, |acc, id| acc | bit(id))
    }
}
