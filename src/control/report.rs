//! Views of the topology returned by the control plane, and the events
//! it broadcasts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::class::{EngineCounts, SharedClasses};
use crate::partition::compute::ComputePartition;
use crate::partition::gpu::GpuPartition;
use crate::partition::Placement;
use crate::persist::strategy::RestoreSource;
use crate::topology::profile::{DeviceCatalog, GpuProfile, VEIDS_PER_GPC};
use crate::topology::tree::{Shape, SlotId};

/// One entry of a `SetPartitions` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// `true` creates a partition, `false` destroys `swizz_id`.
    pub valid: bool,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub swizz_id: Option<SlotId>,
    #[serde(default)]
    pub placement: Placement,
}

impl PartitionEntry {
    pub fn create(profile: &str) -> Self {
        Self {
            valid: true,
            profile: Some(profile.to_string()),
            swizz_id: None,
            placement: Placement::Auto,
        }
    }

    pub fn destroy(swizz_id: SlotId) -> Self {
        Self {
            valid: false,
            profile: None,
            swizz_id: Some(swizz_id),
            placement: Placement::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputePartitionReport {
    pub id: u32,
    pub uuid: Uuid,
    pub size: Shape,
    pub cts_id: SlotId,
    pub span_start: u32,
    pub gpc_count: u32,
    pub sm_count: u32,
    pub veid_count: u32,
    pub engines: EngineCounts,
    pub shared: SharedClasses,
    pub subscribers: u32,
}

impl From<&ComputePartition> for ComputePartitionReport {
    fn from(cp: &ComputePartition) -> Self {
        Self {
            id: cp.id,
            uuid: cp.uuid,
            size: cp.profile.size,
            cts_id: cp.cts_id,
            span_start: cp.span_start,
            gpc_count: cp.profile.gpc_count,
            sm_count: cp.profile.sm_count,
            veid_count: cp.profile.veid_count,
            engines: cp.engines.counts(),
            shared: cp.shared,
            subscribers: cp.refcount().subscribers(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuPartitionReport {
    pub swizz_id: SlotId,
    pub uuid: Uuid,
    pub profile: String,
    pub engines: EngineCounts,
    /// Device-namespace engine mask, hex.
    pub engine_mask: String,
    pub gpc_count: u32,
    pub gpc_mask: u32,
    pub veid_offset: u32,
    pub veid_count: u32,
    pub memory_offset: u64,
    pub memory_size: u64,
    pub valid_cts_mask: u64,
    pub cts_in_use: u64,
    pub subscribers: u32,
    pub ready_to_destroy: bool,
    pub compute: Vec<ComputePartitionReport>,
}

impl From<&GpuPartition> for GpuPartitionReport {
    fn from(gpu: &GpuPartition) -> Self {
        Self {
            swizz_id: gpu.swizz_id,
            uuid: gpu.uuid,
            profile: gpu.profile.name.to_string(),
            engines: gpu.engines.counts(),
            engine_mask: gpu.engines.to_string(),
            gpc_count: gpu.gpc_count(),
            gpc_mask: gpu.gpc_mask(),
            veid_offset: gpu.veid_offset(),
            veid_count: gpu.veid_count(),
            memory_offset: gpu.memory.offset,
            memory_size: gpu.memory.size,
            valid_cts_mask: gpu.valid_cts_mask,
            cts_in_use: gpu.cts_in_use,
            subscribers: gpu.refcount().subscribers(),
            ready_to_destroy: gpu.is_ready_to_destroy() && gpu.active_compute_count() == 0,
            compute: gpu.computes().map(ComputePartitionReport::from).collect(),
        }
    }
}

/// A GPU profile and what it costs on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileReport {
    pub name: String,
    pub flag: u32,
    pub shape: Shape,
    pub gpc_count: u32,
    pub sm_count: u32,
    pub veid_count: u32,
    pub memory_size: u64,
    pub engines: EngineCounts,
    pub valid_cts_mask: u64,
}

impl ProfileReport {
    pub fn new(profile: &GpuProfile, catalog: &DeviceCatalog) -> Self {
        Self {
            name: profile.name.to_string(),
            flag: profile.flag,
            shape: profile.shape,
            gpc_count: profile.gpc_count,
            sm_count: catalog.sm_count(profile.gpc_count),
            veid_count: profile.gpc_count * VEIDS_PER_GPC,
            memory_size: catalog.memory_for(profile),
            engines: profile.engines,
            valid_cts_mask: catalog.valid_cts_mask(profile),
        }
    }
}

/// A compute size and how many more fit in one GPU partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeProfileReport {
    pub size: Shape,
    pub gpc_count: u32,
    pub sm_count: u32,
    pub veid_count: u32,
    pub available: u32,
    pub total: u32,
}

/// An open subscription as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionReport {
    pub id: Uuid,
    pub client_id: String,
    pub swizz_id: SlotId,
    pub compute_id: Option<u32>,
}

/// Topology change broadcast to event subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PartitionEvent {
    GpuCreated { swizz_id: SlotId, profile: String, uuid: Uuid },
    GpuDestroyed { swizz_id: SlotId },
    ComputeCreated { swizz_id: SlotId, compute_id: u32, uuid: Uuid },
    ComputeDestroyed { swizz_id: SlotId, compute_id: u32 },
    Restored { source: RestoreSource, gpu_partitions: Vec<SlotId> },
    ModeChanged { enabled: bool },
}

impl PartitionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PartitionEvent::GpuCreated { .. } => "gpu_created",
            PartitionEvent::GpuDestroyed { .. } => "gpu_destroyed",
            PartitionEvent::ComputeCreated { .. } => "compute_created",
            PartitionEvent::ComputeDestroyed { .. } => "compute_destroyed",
            PartitionEvent::Restored { .. } => "restored",
            PartitionEvent::ModeChanged { .. } => "mode_changed",
        }
    }
}
