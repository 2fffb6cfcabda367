//! Partition manager: the arena that owns every GPU partition.
//!
//! Array index is the stable arena handle; callers address GPU partitions
//! by swizz ID and compute partitions by (swizz ID, slot). The manager is
//! synchronous. Callers serialize mutations behind one device-wide lock.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::collab::Collaborators;
use crate::engine::bitset::EngineSet;
use crate::engine::class::EngineClass;
use crate::engine::pool::EnginePool;
use crate::error::{PartitionError, PartitionResult};
use crate::partition::compute::{ComputeExport, ComputeRequest};
use crate::partition::gpu::{DeviceBooks, GpuBuild, GpuPartition, GrConfigRequest, MAX_GPU_PARTITIONS};
use crate::partition::refcount::RefGuard;
use crate::partition::Placement;
use crate::topology::profile::{DeviceCatalog, GpuProfile};
use crate::topology::tree::{bit, slots, SlotId, GPU_TREE};

/// Saved identity of a GPU partition, trusted verbatim on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuRestore {
    pub swizz_id: SlotId,
    pub profile_flag: u32,
    pub engines: EngineSet,
    pub uuid: Uuid,
}

/// Inclusive span of basis slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRange {
    pub lo: u32,
    pub hi: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuCapacity {
    pub profile: String,
    /// Partitions of this profile that could be created right now.
    pub available: u32,
    /// Partitions of this profile an empty device holds.
    pub total: u32,
    /// Spans a new partition of this profile could be placed at.
    pub spans: Vec<SpanRange>,
}

pub struct PartitionManager {
    catalog: DeviceCatalog,
    collab: Collaborators,
    pool: EnginePool,
    swizz_in_use: u64,
    slots: Vec<Option<GpuPartition>>,
    partitioning: bool,
}

impl PartitionManager {
    pub fn new(catalog: DeviceCatalog, collab: Collaborators) -> Self {
        Self {
            catalog,
            collab,
            pool: EnginePool::new(),
            swizz_in_use: 0,
            slots: (0..MAX_GPU_PARTITIONS).map(|_| None).collect(),
            partitioning: false,
        }
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// Device-wide set of engines owned by GPU partitions.
    pub fn engines_in_use(&self) -> &EngineSet {
        self.pool.in_use()
    }

    /// Swizz IDs currently claimed.
    pub fn swizz_in_use(&self) -> u64 {
        self.swizz_in_use
    }

    pub fn is_partitioning_enabled(&self) -> bool {
        self.partitioning
    }

    /// Toggle device-wide partitioning mode.
    pub fn set_partitioning(&mut self, enabled: bool) -> PartitionResult<()> {
        if self.partitioning == enabled {
            return Ok(());
        }
        if !enabled && self.gpu_partitions().next().is_some() {
            return Err(PartitionError::StillInUse(
                "GPU partitions exist; cannot disable partitioning".into(),
            ));
        }
        self.collab.mode.set_partitioning(enabled)?;
        self.partitioning = enabled;
        info!(enabled, "Partitioning mode changed");
        Ok(())
    }

    /// Active GPU partitions in arena order.
    pub fn gpu_partitions(&self) -> impl Iterator<Item = &GpuPartition> {
        self.slots.iter().flatten()
    }

    /// Arena slots, empty ones included.
    pub fn arena(&self) -> &[Option<GpuPartition>] {
        &self.slots
    }

    pub fn gpu_partition(&self, swizz_id: SlotId) -> PartitionResult<&GpuPartition> {
        self.slot_index(swizz_id)
            .and_then(|idx| self.slots[idx].as_ref())
            .ok_or_else(|| not_found(swizz_id))
    }

    fn gpu_partition_mut(&mut self, swizz_id: SlotId) -> PartitionResult<&mut GpuPartition> {
        self.slot_index(swizz_id)
            .and_then(|idx| self.slots[idx].as_mut())
            .ok_or_else(|| not_found(swizz_id))
    }

    fn slot_index(&self, swizz_id: SlotId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|gpu| gpu.swizz_id == swizz_id))
    }

    /// Create a GPU partition of the named profile.
    pub fn create_gpu_partition(&mut self, profile: &str, placement: Placement) -> PartitionResult<SlotId> {
        self.require_partitioning()?;
        let profile = self.catalog.gpu_profile(profile)?.clone();
        let valid = self.catalog.valid_swizz_mask();

        let swizz_id = match placement {
            Placement::Auto => GPU_TREE.get_free_slot(profile.shape, valid, self.swizz_in_use)?,
            Placement::Span(offset) => {
                let id = GPU_TREE.offset_to_slot(profile.shape, offset, self.catalog.swizz_basis())?;
                self.check_explicit_swizz(id, &profile)?
            }
            Placement::Slot(id) => self.check_explicit_swizz(id, &profile)?,
        };

        let mut engines = EngineSet::empty();
        let slices = GPU_TREE.slice_span(swizz_id);
        let gr = EngineClass::Gr.base();
        engines.set_range(gr + slices.start..gr + slices.end);
        for class in EngineClass::ALL.into_iter().filter(|c| *c != EngineClass::Gr) {
            engines |= self
                .pool
                .pick_free(self.catalog.inventory().partitionable(), class, profile.engines.get(class))?;
        }

        self.build(GpuBuild {
            swizz_id,
            profile,
            engines,
            uuid: Uuid::new_v4(),
        })
    }

    /// Recreate a GPU partition from saved state without recomputing its
    /// slot or engines.
    pub fn restore_gpu_partition(&mut self, saved: &GpuRestore) -> PartitionResult<SlotId> {
        self.require_partitioning()?;
        let profile = self.catalog.gpu_profile_by_flag(saved.profile_flag)?.clone();
        let swizz_id = self.check_explicit_swizz(saved.swizz_id, &profile)?;

        if !saved.engines.is_subset(self.catalog.inventory().partitionable()) {
            return Err(PartitionError::InvalidArgument(format!(
                "saved engines {:?} are not partitionable on this device",
                saved.engines
            )));
        }
        let slices = GPU_TREE.slice_span(swizz_id);
        let gr = EngineClass::Gr.base();
        if saved.engines.of_class(EngineClass::Gr) != EngineSet::from_range(gr + slices.start..gr + slices.end) {
            return Err(PartitionError::InvalidArgument(format!(
                "saved graphics engines do not match swizz {swizz_id}"
            )));
        }

        self.build(GpuBuild {
            swizz_id,
            profile,
            engines: saved.engines,
            uuid: saved.uuid,
        })
    }

    fn build(&mut self, plan: GpuBuild) -> PartitionResult<SlotId> {
        let idx = self.slots.iter().position(Option::is_none).ok_or_else(|| {
            PartitionError::InsufficientResources(format!("all {MAX_GPU_PARTITIONS} GPU partition slots in use"))
        })?;
        let swizz_id = plan.swizz_id;
        let mut books = DeviceBooks {
            pool: &mut self.pool,
            swizz_in_use: &mut self.swizz_in_use,
        };
        let gpu = GpuPartition::build(plan, &self.catalog, &self.collab, &mut books)?;
        self.slots[idx] = Some(gpu);
        Ok(swizz_id)
    }

    fn check_explicit_swizz(&self, id: SlotId, profile: &GpuProfile) -> PartitionResult<SlotId> {
        if GPU_TREE.slot_to_shape(id)? != profile.shape {
            return Err(PartitionError::InvalidArgument(format!(
                "swizz {id} is not a {} slot",
                profile.shape.name()
            )));
        }
        if self.catalog.valid_swizz_mask() & bit(id) == 0 {
            return Err(PartitionError::NotSupported(format!("swizz {id} is unavailable on this device")));
        }
        if !GPU_TREE.is_available(self.catalog.valid_swizz_mask(), self.swizz_in_use, id) {
            return Err(PartitionError::StateConflict(format!(
                "swizz {id} conflicts with an active GPU partition"
            )));
        }
        Ok(id)
    }

    fn require_partitioning(&self) -> PartitionResult<()> {
        if self.partitioning {
            Ok(())
        } else {
            Err(PartitionError::NotSupported("partitioning mode is disabled".into()))
        }
    }

    /// Destroy a GPU partition. It must have no compute partitions and no
    /// subscribers beyond its internal references.
    pub fn invalidate_gpu_partition(&mut self, swizz_id: SlotId) -> PartitionResult<()> {
        let idx = self.slot_index(swizz_id).ok_or_else(|| not_found(swizz_id))?;
        {
            let gpu = self.slots[idx].as_ref().ok_or_else(|| not_found(swizz_id))?;
            let active = gpu.active_compute_count();
            if active > 0 {
                return Err(PartitionError::StillInUse(format!(
                    "GPU partition {swizz_id} has {active} compute partitions"
                )));
            }
            gpu.refcount().try_retire()?;
        }

        let gpu = self.slots[idx].take().ok_or_else(|| not_found(swizz_id))?;
        let mut books = DeviceBooks {
            pool: &mut self.pool,
            swizz_in_use: &mut self.swizz_in_use,
        };
        gpu.teardown(&self.collab, &mut books);
        Ok(())
    }

    pub fn configure_gpu_partition(&mut self, swizz_id: SlotId, requests: &[GrConfigRequest]) -> PartitionResult<()> {
        let ctx = self.collab.ctx_buffers.clone();
        self.gpu_partition_mut(swizz_id)?.configure(requests, ctx.as_ref())
    }

    pub fn create_compute_partition(&mut self, swizz_id: SlotId, request: &ComputeRequest) -> PartitionResult<u32> {
        let idx = self.slot_index(swizz_id).ok_or_else(|| not_found(swizz_id))?;
        let gpu = self.slots[idx].as_mut().ok_or_else(|| not_found(swizz_id))?;
        gpu.create_compute(request, &self.catalog, &self.collab)
    }

    pub fn import_compute_partition(&mut self, swizz_id: SlotId, export: &ComputeExport) -> PartitionResult<u32> {
        let idx = self.slot_index(swizz_id).ok_or_else(|| not_found(swizz_id))?;
        let gpu = self.slots[idx].as_mut().ok_or_else(|| not_found(swizz_id))?;
        gpu.import_compute(export, &self.catalog, &self.collab)
    }

    pub fn export_compute_partition(&self, swizz_id: SlotId, id: u32) -> PartitionResult<ComputeExport> {
        self.gpu_partition(swizz_id)?.export_compute(id)
    }

    pub fn delete_compute_partition(&mut self, swizz_id: SlotId, id: u32) -> PartitionResult<()> {
        let idx = self.slot_index(swizz_id).ok_or_else(|| not_found(swizz_id))?;
        let gpu = self.slots[idx].as_mut().ok_or_else(|| not_found(swizz_id))?;
        gpu.delete_compute(id, &self.collab)
    }

    /// Take an external reference on a GPU partition, or on one of its
    /// compute partitions.
    pub fn subscribe(&self, swizz_id: SlotId, compute_id: Option<u32>) -> PartitionResult<RefGuard> {
        let gpu = self.gpu_partition(swizz_id)?;
        match compute_id {
            Some(id) => gpu.compute(id)?.subscribe(),
            None => gpu.subscribe(),
        }
    }

    /// How many more partitions of `profile` fit, and where.
    pub fn gpu_capacity(&self, profile: &str) -> PartitionResult<GpuCapacity> {
        let profile = self.catalog.gpu_profile(profile)?;
        let valid = self.catalog.valid_swizz_mask();
        let basis = self.catalog.swizz_basis();
        let per_node = GPU_TREE.slots_per_node(profile.shape, basis)?;

        let mut spans = Vec::new();
        for id in slots(GPU_TREE.level_mask(profile.shape)? & valid) {
            if GPU_TREE.is_available(valid, self.swizz_in_use, id) {
                let lo = GPU_TREE.slot_to_offset(id, basis)?;
                spans.push(SpanRange {
                    lo,
                    hi: lo + per_node - 1,
                });
            }
        }

        let partitionable = self.catalog.inventory().partitionable();
        let available = GPU_TREE
            .greedy_capacity(profile.shape, valid, self.swizz_in_use)
            .min(engine_capacity(&profile, &(*partitionable - *self.pool.in_use())));
        let total = GPU_TREE
            .greedy_capacity(profile.shape, valid, 0)
            .min(engine_capacity(&profile, partitionable));
        if available == 0 {
            spans.clear();
        }

        Ok(GpuCapacity {
            profile: profile.name.to_string(),
            available,
            total,
            spans,
        })
    }
}

/// Partitions of `profile` that `free` can supply with non-graphics
/// engines. Graphics engines follow the slot and are bounded by the tree.
fn engine_capacity(profile: &GpuProfile, free: &EngineSet) -> u32 {
    EngineClass::ALL
        .into_iter()
        .filter(|class| *class != EngineClass::Gr)
        .filter_map(|class| {
            let need = profile.engines.get(class);
            (need > 0).then(|| free.count_class(class) / need)
        })
        .min()
        .unwrap_or(u32::MAX)
}

fn not_found(swizz_id: SlotId) -> PartitionError {
    PartitionError::NotFound(format!("GPU partition {swizz_id}"))
}
