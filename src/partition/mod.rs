//! Partition state machines.
//!
//! - [`refcount`]: Baseline-aware reference counts and subscription guards
//! - [`gpu`]: GPU partitions (outer slices of the device)
//! - [`compute`]: Compute partitions nested in a GPU partition
//! - [`manager`]: The arena owning every partition and the device books

pub mod compute;
pub mod gpu;
pub mod manager;
pub mod refcount;

use serde::{Deserialize, Serialize};

use crate::topology::tree::SlotId;

/// Where a new partition goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Placement {
    /// Let the capacity tree pick.
    #[default]
    Auto,
    /// A specific capacity-tree slot.
    Slot(SlotId),
    /// The slot starting at this span offset, in basis units.
    Span(u32),
}

pub use compute::{ComputeExport, ComputePartition, ComputeRequest, ComputeShape, COMPUTE_PARTITION_BASELINE};
pub use gpu::{GpuPartition, GrConfigRequest, GPU_PARTITION_BASELINE, MAX_COMPUTE_PARTITIONS, MAX_GPU_PARTITIONS};
pub use manager::{GpuCapacity, GpuRestore, PartitionManager, SpanRange};
pub use refcount::{RefCount, RefGuard};
