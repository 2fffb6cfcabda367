//! Interfaces to the subsystems the partition core drives but does not own.
//!
//! - [`sim`]: In-memory implementations with fault injection
//!
//! Every acquisition returns an opaque [`Handle`] that the core hands back
//! on release. All calls may block.

pub mod sim;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::engine::bitset::EngineSet;
use crate::error::CollabError;

/// Opaque token for a collaborator-owned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A physical memory slice handed out by the memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRange {
    pub handle: Handle,
    pub offset: u64,
    pub size: u64,
}

pub trait MemoryManager: Send + Sync {
    fn allocate_range(&self, size: u64) -> Result<MemoryRange, CollabError>;
    fn free_range(&self, range: MemoryRange) -> Result<(), CollabError>;

    /// Start the background scrubber over a partition's memory.
    fn start_scrubber(&self, range: &MemoryRange) -> Result<Handle, CollabError>;
    fn stop_scrubber(&self, scrubber: Handle) -> Result<(), CollabError>;

    /// Page-table pool backing a partition's address spaces.
    fn create_page_table_pool(&self, range: &MemoryRange) -> Result<Handle, CollabError>;
    fn destroy_page_table_pool(&self, pool: Handle) -> Result<(), CollabError>;
}

pub trait RunQueueSubsystem: Send + Sync {
    fn install_run_queues(&self, engines: &EngineSet) -> Result<Handle, CollabError>;
    fn teardown_run_queues(&self, queues: Handle) -> Result<(), CollabError>;
}

/// Spatial resources bound to one graphics engine of a GPU partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrBinding {
    /// First GPC, relative to the partition.
    pub gpc_offset: u32,
    pub gpc_count: u32,
    pub veid_offset: u32,
    pub veid_count: u32,
}

pub trait ContextBufferSubsystem: Send + Sync {
    /// Per-partition context buffer pools.
    fn create_pools(&self, partition: u32) -> Result<Handle, CollabError>;
    fn destroy_pools(&self, pools: Handle) -> Result<(), CollabError>;

    /// Size and allocate context buffers for one graphics engine.
    fn allocate_gr_buffers(&self, pools: Handle, local_gr: u32, binding: &GrBinding) -> Result<Handle, CollabError>;
    fn free_gr_buffers(&self, buffers: Handle) -> Result<(), CollabError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    GpuPartition,
    ComputePartition,
}

pub trait CapabilityRegistry: Send + Sync {
    fn register(&self, kind: CapabilityKind, id: &str) -> Result<Handle, CollabError>;
    fn unregister(&self, capability: Handle) -> Result<(), CollabError>;
}

/// Operations carried to a peer privilege domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOp {
    FetchTopology,
    StoreTopology,
    ReplayGpuPartition,
    DropGpuPartition,
}

pub trait RemoteTransport: Send + Sync {
    fn call(&self, op: RemoteOp, payload: Bytes) -> Result<Bytes, CollabError>;
}

/// Device-wide partitioning mode switch.
pub trait ModeControl: Send + Sync {
    fn set_partitioning(&self, enabled: bool) -> Result<(), CollabError>;
}

/// The full set of collaborators handed to the partition manager.
#[derive(Clone)]
pub struct Collaborators {
    pub memory: Arc<dyn MemoryManager>,
    pub run_queues: Arc<dyn RunQueueSubsystem>,
    pub ctx_buffers: Arc<dyn ContextBufferSubsystem>,
    pub capabilities: Arc<dyn CapabilityRegistry>,
    pub mode: Arc<dyn ModeControl>,
    pub transport: Option<Arc<dyn RemoteTransport>>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}
