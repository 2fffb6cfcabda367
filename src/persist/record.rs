//! The persistence record.
//!
//! A fixed-size array of GPU partition saves, each holding a fixed-size
//! array of compute partition saves. Every entry is plain old data so the
//! whole record is written and read as one byte slice.

use bytemuck::{Pod, Zeroable};
use uuid::Uuid;

use crate::engine::bitset::EngineSet;
use crate::engine::class::SharedClasses;
use crate::error::PartitionResult;
use crate::partition::compute::{ComputeExport, ComputePartition};
use crate::partition::gpu::{GpuPartition, MAX_COMPUTE_PARTITIONS, MAX_GPU_PARTITIONS};
use crate::partition::manager::{GpuRestore, PartitionManager};
use crate::topology::tree::{SlotId, COMPUTE_TREE};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ComputePartitionSave {
    /// Engines in the parent's local namespace.
    pub engine_mask: [u64; 2],
    pub uuid: [u8; 16],
    pub valid: u32,
    pub id: u32,
    pub cts_id: u32,
    pub span_start: u32,
    pub gpc_count: u32,
    pub sm_count: u32,
    pub veid_count: u32,
    pub shared_flags: u32,
}

impl ComputePartitionSave {
    pub fn capture(cp: &ComputePartition) -> Self {
        Self {
            engine_mask: cp.engines.raw(),
            uuid: *cp.uuid.as_bytes(),
            valid: 1,
            id: cp.id,
            cts_id: cp.cts_id,
            span_start: cp.span_start,
            gpc_count: cp.profile.gpc_count,
            sm_count: cp.profile.sm_count,
            veid_count: cp.profile.veid_count,
            shared_flags: cp.shared.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }

    /// The import description that recreates this partition verbatim.
    pub fn to_export(&self) -> PartitionResult<ComputeExport> {
        Ok(ComputeExport {
            id: self.id,
            uuid: Uuid::from_bytes(self.uuid),
            size: COMPUTE_TREE.slot_to_shape(self.cts_id)?,
            cts_id: self.cts_id,
            span_start: self.span_start,
            gpc_count: self.gpc_count,
            sm_count: self.sm_count,
            veid_count: self.veid_count,
            engines: EngineSet::from_raw(self.engine_mask),
            shared: SharedClasses(self.shared_flags),
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuPartitionSave {
    /// Engines in the device namespace.
    pub engine_mask: [u64; 2],
    pub uuid: [u8; 16],
    pub valid: u32,
    pub swizz_id: u32,
    pub profile_flag: u32,
    /// Leaf slices (GPCs) covered, as a bit mask.
    pub gpc_mask: u32,
    pub veid_offset: u32,
    pub veid_count: u32,
    pub compute: [ComputePartitionSave; MAX_COMPUTE_PARTITIONS],
}

impl GpuPartitionSave {
    pub fn capture(gpu: &GpuPartition) -> Self {
        let mut compute = [ComputePartitionSave::zeroed(); MAX_COMPUTE_PARTITIONS];
        for cp in gpu.computes() {
            compute[cp.id as usize] = ComputePartitionSave::capture(cp);
        }
        Self {
            engine_mask: gpu.engines.raw(),
            uuid: *gpu.uuid.as_bytes(),
            valid: 1,
            swizz_id: gpu.swizz_id,
            profile_flag: gpu.profile.flag,
            gpc_mask: gpu.gpc_mask(),
            veid_offset: gpu.veid_offset(),
            veid_count: gpu.veid_count(),
            compute,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }

    pub fn swizz_id(&self) -> SlotId {
        self.swizz_id
    }

    pub fn restore_request(&self) -> GpuRestore {
        GpuRestore {
            swizz_id: self.swizz_id,
            profile_flag: self.profile_flag,
            engines: EngineSet::from_raw(self.engine_mask),
            uuid: Uuid::from_bytes(self.uuid),
        }
    }

    /// Valid compute partition entries.
    pub fn computes(&self) -> impl Iterator<Item = &ComputePartitionSave> {
        self.compute.iter().filter(|cp| cp.is_valid())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PersistenceRecord {
    pub gpu: [GpuPartitionSave; MAX_GPU_PARTITIONS],
}

impl Default for PersistenceRecord {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl PersistenceRecord {
    /// Snapshot every active partition, keyed by arena slot.
    pub fn capture(manager: &PartitionManager) -> Self {
        let mut record = Self::default();
        for (slot, gpu) in manager.arena().iter().enumerate() {
            if let Some(gpu) = gpu {
                record.gpu[slot] = GpuPartitionSave::capture(gpu);
            }
        }
        record
    }

    /// Valid GPU partition entries.
    pub fn gpu_partitions(&self) -> impl Iterator<Item = &GpuPartitionSave> {
        self.gpu.iter().filter(|gpu| gpu.is_valid())
    }

    pub fn is_empty(&self) -> bool {
        self.gpu_partitions().next().is_none()
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::sim::SimDevice;
    use crate::engine::class::EngineClass;
    use crate::partition::compute::ComputeRequest;
    use crate::partition::Placement;
    use crate::topology::profile::{DeviceCatalog, Generation};
    use crate::topology::tree::Shape;

    #[test]
    fn test_record_layout() {
        assert_eq!(std::mem::size_of::<ComputePartitionSave>(), 64);
        assert_eq!(std::mem::size_of::<GpuPartitionSave>(), 56 + 8 * 64);
        assert_eq!(
            std::mem::size_of::<PersistenceRecord>(),
            MAX_GPU_PARTITIONS * std::mem::size_of::<GpuPartitionSave>()
        );
        assert!(PersistenceRecord::default().is_empty());
    }

    #[test]
    fn test_capture_reflects_topology() {
        let sim = SimDevice::new(80 << 30);
        let mut mgr = PartitionManager::new(DeviceCatalog::new(Generation::Ga100, 80 << 30, 0), sim.collaborators());
        mgr.set_partitioning(true).unwrap();
        let swizz = mgr.create_gpu_partition("half", Placement::Auto).unwrap();
        let mut request = ComputeRequest::of_size(Shape::Quarter);
        request.engines.set(EngineClass::Copy, 1);
        let cp = mgr.create_compute_partition(swizz, &request).unwrap();

        let record = PersistenceRecord::capture(&mgr);
        let saved: Vec<_> = record.gpu_partitions().collect();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].swizz_id(), swizz);
        assert_eq!(saved[0].gpc_mask, 0x0f);
        assert_eq!(saved[0].veid_count, 32);

        let computes: Vec<_> = saved[0].computes().collect();
        assert_eq!(computes.len(), 1);
        let export = computes[0].to_export().unwrap();
        assert_eq!(export, mgr.export_compute_partition(swizz, cp).unwrap());
    }
}
