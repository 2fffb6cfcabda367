//! GPU partitions: the outer state machine.
//!
//! A GPU partition is built by acquiring its resources one step at a time,
//! recording each step in an acquisition log. Teardown (and the failure
//! path of a half-finished build) pops that log and releases every entry
//! in reverse order.

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collab::{
    CapabilityKind, Collaborators, ContextBufferSubsystem, GrBinding, Handle, MemoryRange,
};
use crate::engine::bitset::EngineSet;
use crate::engine::class::EngineClass;
use crate::engine::pool::{local_engine_mask, EngineBooks, EnginePool};
use crate::error::{CollabError, PartitionError, PartitionResult};
use crate::partition::compute::ComputePartition;
use crate::partition::refcount::{RefCount, RefGuard};
use crate::topology::profile::{DeviceCatalog, GpuProfile, VEIDS_PER_GPC};
use crate::topology::tree::{bit, SlotId, GPU_TREE};

/// Slots in the GPU partition arena.
pub const MAX_GPU_PARTITIONS: usize = 8;

/// Compute partition slots per GPU partition.
pub const MAX_COMPUTE_PARTITIONS: usize = 8;

/// Internal references held on every active GPU partition: capability
/// registration, memory scrubber and page-table pool.
pub const GPU_PARTITION_BASELINE: u32 = 3;

/// One resource acquired while building a GPU partition.
#[derive(Debug)]
enum Acquired {
    Slot(SlotId),
    Engines(EngineSet),
    Memory(MemoryRange),
    PageTablePool(Handle),
    Capability(Handle),
    ContextPools(Handle),
    Scrubber(Handle),
    RunQueues(Handle),
}

impl Acquired {
    fn step(&self) -> &'static str {
        match self {
            Acquired::Slot(_) => "slot",
            Acquired::Engines(_) => "engines",
            Acquired::Memory(_) => "memory",
            Acquired::PageTablePool(_) => "page_table_pool",
            Acquired::Capability(_) => "capability",
            Acquired::ContextPools(_) => "context_pools",
            Acquired::Scrubber(_) => "scrubber",
            Acquired::RunQueues(_) => "run_queues",
        }
    }
}

/// Device-wide state a GPU partition claims from.
pub(crate) struct DeviceBooks<'a> {
    pub pool: &'a mut EnginePool,
    pub swizz_in_use: &'a mut u64,
}

/// A fully resolved build request: which slot, which engines.
#[derive(Debug, Clone)]
pub(crate) struct GpuBuild {
    pub swizz_id: SlotId,
    pub profile: GpuProfile,
    pub engines: EngineSet,
    pub uuid: Uuid,
}

/// Spatial resources bound to one graphics engine, plus the context
/// buffers backing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundGr {
    pub binding: GrBinding,
    pub buffers: Handle,
}

/// A change to one graphics engine's binding. `None` unbinds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrConfigRequest {
    pub local_gr: u32,
    pub binding: Option<GrBinding>,
}

#[derive(Debug)]
pub struct GpuPartition {
    pub swizz_id: SlotId,
    pub uuid: Uuid,
    pub profile: GpuProfile,
    /// Engines in the device namespace.
    pub engines: EngineSet,
    /// The same engines numbered densely from each class base.
    pub local_engines: EngineSet,
    /// Leaf slices (GPCs) covered.
    pub slices: Range<u32>,
    pub memory: MemoryRange,
    pub valid_cts_mask: u64,
    pub cts_in_use: u64,
    pub books: EngineBooks,
    pub(crate) gr_bindings: Vec<Option<BoundGr>>,
    pub(crate) computes: Vec<Option<ComputePartition>>,
    ctx_pools: Handle,
    refcount: Arc<RefCount>,
    log: Vec<Acquired>,
}

impl GpuPartition {
    pub(crate) fn build(
        plan: GpuBuild,
        catalog: &DeviceCatalog,
        collab: &Collaborators,
        books: &mut DeviceBooks<'_>,
    ) -> PartitionResult<Self> {
        let mut log = Vec::new();
        let refcount = RefCount::new();

        let (memory, ctx_pools) = match Self::acquire(&plan, catalog, collab, books, &refcount, &mut log) {
            Ok(acquired) => acquired,
            Err(err) => {
                warn!(
                    swizz_id = plan.swizz_id,
                    profile = plan.profile.name,
                    completed = log.len(),
                    error = %err,
                    "GPU partition build failed, rolling back"
                );
                unwind(plan.swizz_id, &mut log, collab, books);
                return Err(err);
            }
        };

        let slices = GPU_TREE.slice_span(plan.swizz_id);
        let gr_count = plan.engines.count_class(EngineClass::Gr) as usize;
        info!(
            swizz_id = plan.swizz_id,
            profile = plan.profile.name,
            engines = %plan.engines,
            memory_offset = memory.offset,
            memory_size = memory.size,
            "GPU partition created"
        );

        Ok(Self {
            swizz_id: plan.swizz_id,
            uuid: plan.uuid,
            local_engines: local_engine_mask(&plan.engines),
            engines: plan.engines,
            valid_cts_mask: catalog.valid_cts_mask(&plan.profile),
            profile: plan.profile,
            slices,
            memory,
            cts_in_use: 0,
            books: EngineBooks::default(),
            gr_bindings: vec![None; gr_count],
            computes: (0..MAX_COMPUTE_PARTITIONS).map(|_| None).collect(),
            ctx_pools,
            refcount,
            log,
        })
    }

    fn acquire(
        plan: &GpuBuild,
        catalog: &DeviceCatalog,
        collab: &Collaborators,
        books: &mut DeviceBooks<'_>,
        refcount: &RefCount,
        log: &mut Vec<Acquired>,
    ) -> PartitionResult<(MemoryRange, Handle)> {
        *books.swizz_in_use |= bit(plan.swizz_id);
        log.push(Acquired::Slot(plan.swizz_id));

        books.pool.claim_engines(&plan.engines)?;
        log.push(Acquired::Engines(plan.engines));

        let memory = collab.memory.allocate_range(catalog.memory_for(&plan.profile))?;
        log.push(Acquired::Memory(memory));

        let page_tables = collab.memory.create_page_table_pool(&memory)?;
        log.push(Acquired::PageTablePool(page_tables));
        refcount.acquire_internal();

        let capability = collab
            .capabilities
            .register(CapabilityKind::GpuPartition, &plan.uuid.to_string())?;
        log.push(Acquired::Capability(capability));
        refcount.acquire_internal();

        let ctx_pools = collab.ctx_buffers.create_pools(plan.swizz_id)?;
        log.push(Acquired::ContextPools(ctx_pools));

        let scrubber = collab.memory.start_scrubber(&memory)?;
        log.push(Acquired::Scrubber(scrubber));
        refcount.acquire_internal();

        let run_queues = collab.run_queues.install_run_queues(&plan.engines)?;
        log.push(Acquired::RunQueues(run_queues));

        debug_assert_eq!(refcount.baseline(), GPU_PARTITION_BASELINE);
        Ok((memory, ctx_pools))
    }

    /// Release everything in reverse acquisition order. The caller has
    /// already retired the reference count.
    pub(crate) fn teardown(mut self, collab: &Collaborators, books: &mut DeviceBooks<'_>) {
        let swizz_id = self.swizz_id;
        for (gr, slot) in self.gr_bindings.iter_mut().enumerate() {
            if let Some(stale) = slot.take() {
                warn!(swizz_id, local_gr = gr, "Graphics engine still bound at teardown");
                log_release(swizz_id, "gr_buffers", collab.ctx_buffers.free_gr_buffers(stale.buffers));
            }
        }

        unwind(self.swizz_id, &mut self.log, collab, books);
        info!(swizz_id = self.swizz_id, profile = self.profile.name, "GPU partition invalidated");
    }

    pub fn refcount(&self) -> &Arc<RefCount> {
        &self.refcount
    }

    pub fn subscribe(&self) -> PartitionResult<RefGuard> {
        self.refcount.subscribe()
    }

    /// Ready to be destroyed: nothing beyond the internal references holds it.
    pub fn is_ready_to_destroy(&self) -> bool {
        self.refcount.is_safe_to_destroy()
    }

    pub fn gpc_count(&self) -> u32 {
        self.slices.len() as u32
    }

    /// Slices as a bit mask.
    pub fn gpc_mask(&self) -> u32 {
        self.slices.clone().fold(0, |acc, s| acc | (1 << s))
    }

    pub fn veid_offset(&self) -> u32 {
        self.slices.start * VEIDS_PER_GPC
    }

    pub fn veid_count(&self) -> u32 {
        self.gpc_count() * VEIDS_PER_GPC
    }

    pub fn engine_count(&self, class: EngineClass) -> u32 {
        self.engines.count_class(class)
    }

    pub fn compute(&self, id: u32) -> PartitionResult<&ComputePartition> {
        self.computes
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                PartitionError::NotFound(format!("compute partition {id} in GPU partition {}", self.swizz_id))
            })
    }

    pub fn computes(&self) -> impl Iterator<Item = &ComputePartition> {
        self.computes.iter().flatten()
    }

    pub fn active_compute_count(&self) -> usize {
        self.computes().count()
    }

    /// GPCs bound to compute partitions.
    pub fn bound_gpcs(&self) -> u32 {
        self.gr_bindings.iter().flatten().map(|b| b.binding.gpc_count).sum()
    }

    pub fn binding(&self, local_gr: u32) -> Option<&BoundGr> {
        self.gr_bindings.get(local_gr as usize).and_then(Option::as_ref)
    }

    /// Rebind graphics engines to spatial sub-ranges of this partition.
    ///
    /// The whole request is validated against the partition's capacity
    /// before anything changes. Requests are then applied in order; if one
    /// fails, the ones already applied are rolled back, newest first.
    pub fn configure(&mut self, requests: &[GrConfigRequest], ctx: &dyn ContextBufferSubsystem) -> PartitionResult<()> {
        self.validate_configuration(requests)?;

        let mut applied: Vec<(u32, Option<BoundGr>)> = Vec::with_capacity(requests.len());
        for req in requests {
            let slot = req.local_gr as usize;
            let next = match req.binding {
                Some(binding) => match ctx.allocate_gr_buffers(self.ctx_pools, req.local_gr, &binding) {
                    Ok(buffers) => Some(BoundGr { binding, buffers }),
                    Err(err) => {
                        warn!(
                            swizz_id = self.swizz_id,
                            local_gr = req.local_gr,
                            rolled_back = applied.len(),
                            error = %err,
                            "Configure failed, rolling back"
                        );
                        self.rollback_configuration(applied, ctx);
                        return Err(err.into());
                    }
                },
                None => None,
            };
            let previous = std::mem::replace(&mut self.gr_bindings[slot], next);
            applied.push((req.local_gr, previous));
        }

        for (gr, previous) in applied {
            if let Some(old) = previous {
                log_release(self.swizz_id, "gr_buffers", ctx.free_gr_buffers(old.buffers));
            }
            debug!(swizz_id = self.swizz_id, local_gr = gr, binding = ?self.gr_bindings[gr as usize], "Configured graphics engine");
        }
        Ok(())
    }

    fn validate_configuration(&self, requests: &[GrConfigRequest]) -> PartitionResult<()> {
        let gpc_count = self.gpc_count();
        let veid_count = self.veid_count();
        let mut proposed: Vec<Option<GrBinding>> = self.gr_bindings.iter().map(|b| b.map(|b| b.binding)).collect();

        for req in requests {
            let slot = proposed.get_mut(req.local_gr as usize).ok_or_else(|| {
                PartitionError::InvalidArgument(format!(
                    "graphics engine {} not in GPU partition {}",
                    req.local_gr, self.swizz_id
                ))
            })?;
            if let Some(b) = &req.binding {
                if b.gpc_count == 0 || b.gpc_offset + b.gpc_count > gpc_count {
                    return Err(PartitionError::InsufficientResources(format!(
                        "GPCs {}..{} exceed the partition's {gpc_count}",
                        b.gpc_offset,
                        b.gpc_offset + b.gpc_count
                    )));
                }
                if b.veid_offset + b.veid_count > veid_count {
                    return Err(PartitionError::InsufficientResources(format!(
                        "VEIDs {}..{} exceed the partition's {veid_count}",
                        b.veid_offset,
                        b.veid_offset + b.veid_count
                    )));
                }
            }
            *slot = req.binding;
        }

        let mut used = 0u32;
        let mut total = 0u32;
        for b in proposed.iter().flatten() {
            let mask = ((1u32 << b.gpc_count) - 1) << b.gpc_offset;
            if used & mask != 0 {
                return Err(PartitionError::StateConflict(format!(
                    "GPCs {}..{} bound twice",
                    b.gpc_offset,
                    b.gpc_offset + b.gpc_count
                )));
            }
            used |= mask;
            total += b.gpc_count;
        }
        if total > gpc_count {
            return Err(PartitionError::InsufficientResources(format!(
                "{total} GPCs requested, partition has {gpc_count}"
            )));
        }
        Ok(())
    }

    fn rollback_configuration(&mut self, applied: Vec<(u32, Option<BoundGr>)>, ctx: &dyn ContextBufferSubsystem) {
        for (gr, previous) in applied.into_iter().rev() {
            let current = std::mem::replace(&mut self.gr_bindings[gr as usize], previous);
            if let Some(new) = current {
                log_release(self.swizz_id, "gr_buffers", ctx.free_gr_buffers(new.buffers));
            }
        }
    }
}

fn release(entry: Acquired, collab: &Collaborators, books: &mut DeviceBooks<'_>) -> Result<(), CollabError> {
    match entry {
        Acquired::Slot(id) => {
            *books.swizz_in_use &= !bit(id);
            Ok(())
        }
        Acquired::Engines(set) => {
            books.pool.release_engines(&set);
            Ok(())
        }
        Acquired::Memory(range) => collab.memory.free_range(range),
        Acquired::PageTablePool(h) => collab.memory.destroy_page_table_pool(h),
        Acquired::Capability(h) => collab.capabilities.unregister(h),
        Acquired::ContextPools(h) => collab.ctx_buffers.destroy_pools(h),
        Acquired::Scrubber(h) => collab.memory.stop_scrubber(h),
        Acquired::RunQueues(h) => collab.run_queues.teardown_run_queues(h),
    }
}

fn unwind(swizz_id: SlotId, log: &mut Vec<Acquired>, collab: &Collaborators, books: &mut DeviceBooks<'_>) {
    while let Some(entry) = log.pop() {
        let step = entry.step();
        log_release(swizz_id, step, release(entry, collab, books));
    }
}

fn log_release(swizz_id: SlotId, step: &'static str, result: Result<(), CollabError>) {
    if let Err(err) = result {
        warn!(swizz_id, step, error = %err, "Release failed, continuing teardown");
    }
}
