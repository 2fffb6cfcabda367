//! Spatial topology of the device.
//!
//! - [`tree`]: Capacity-tree slot allocator (GPU and compute trees)
//! - [`profile`]: Per-generation catalogs of partition profiles

pub mod profile;
pub mod tree;

pub use profile::{ComputeProfile, DeviceCatalog, Generation, GpuProfile};
pub use tree::{CapacityTree, Shape, SlotId, COMPUTE_TREE, GPU_TREE};
