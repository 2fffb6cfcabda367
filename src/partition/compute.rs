//! Compute partitions: the nested state machine inside a GPU partition.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::collab::{CapabilityKind, Collaborators, GrBinding, Handle};
use crate::engine::bitset::{translate_set, EngineSet};
use crate::engine::class::{EngineClass, EngineCounts, SharedClasses};
use crate::engine::pool::{
    allocate_class_engines, claim_verbatim, local_engine_mask, release_compute_engines, ClassRequest, EngineBooks,
};
use crate::error::{PartitionError, PartitionResult};
use crate::partition::gpu::{GpuPartition, GrConfigRequest, MAX_COMPUTE_PARTITIONS};
use crate::partition::refcount::{RefCount, RefGuard};
use crate::partition::Placement;
use crate::topology::profile::{ComputeProfile, DeviceCatalog, VEIDS_PER_GPC};
use crate::topology::tree::{bit, Shape, SlotId, COMPUTE_TREE};

/// Internal references held on every active compute partition: capability
/// registration and the internal handle allocation.
pub const COMPUTE_PARTITION_BASELINE: u32 = 2;

/// How the size of a new compute partition is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum ComputeShape {
    Size(Shape),
    SmCount(u32),
    GpcCount(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub shape: ComputeShape,
    #[serde(default)]
    pub placement: Placement,
    /// Requested slot; first free when absent.
    #[serde(default)]
    pub id: Option<u32>,
    /// Per-class engine counts. The graphics count is always one.
    #[serde(default)]
    pub engines: EngineCounts,
    #[serde(default)]
    pub shared: SharedClasses,
}

impl ComputeRequest {
    pub fn of_size(size: Shape) -> Self {
        Self {
            shape: ComputeShape::Size(size),
            placement: Placement::Auto,
            id: None,
            engines: EngineCounts::default(),
            shared: SharedClasses::NONE,
        }
    }
}

/// Complete description of a compute partition, enough for another party
/// to recreate it without re-deriving anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeExport {
    pub id: u32,
    pub uuid: Uuid,
    pub size: Shape,
    pub cts_id: SlotId,
    pub span_start: u32,
    pub gpc_count: u32,
    pub sm_count: u32,
    pub veid_count: u32,
    /// Engines in the parent's local namespace.
    pub engines: EngineSet,
    pub shared: SharedClasses,
}

#[derive(Debug)]
pub struct ComputePartition {
    pub id: u32,
    pub uuid: Uuid,
    pub profile: ComputeProfile,
    pub cts_id: SlotId,
    /// Offset of the partition's span inside its parent, in basis slots.
    pub span_start: u32,
    /// Graphics engine, in the parent's local namespace.
    pub local_gr: u32,
    /// Engines in the parent's local namespace.
    pub engines: EngineSet,
    /// Engines in the device namespace.
    pub global_engines: EngineSet,
    /// Engines numbered densely from each class base.
    pub local_engines: EngineSet,
    pub shared: SharedClasses,
    capability: Handle,
    refcount: Arc<RefCount>,
}

impl ComputePartition {
    pub fn refcount(&self) -> &Arc<RefCount> {
        &self.refcount
    }

    pub fn subscribe(&self) -> PartitionResult<RefGuard> {
        self.refcount.subscribe()
    }

    pub fn export(&self) -> ComputeExport {
        ComputeExport {
            id: self.id,
            uuid: self.uuid,
            size: self.profile.size,
            cts_id: self.cts_id,
            span_start: self.span_start,
            gpc_count: self.profile.gpc_count,
            sm_count: self.profile.sm_count,
            veid_count: self.profile.veid_count,
            engines: self.engines,
            shared: self.shared,
        }
    }
}

/// Everything decided about a compute partition before anything is bound.
struct ComputePlan {
    id: u32,
    uuid: Uuid,
    profile: ComputeProfile,
    cts_id: SlotId,
    engines: EngineSet,
    shared: SharedClasses,
    books: EngineBooks,
}

impl GpuPartition {
    /// Create a compute partition from a request, choosing its slot,
    /// capacity-tree node and engines.
    pub(crate) fn create_compute(
        &mut self,
        request: &ComputeRequest,
        catalog: &DeviceCatalog,
        collab: &Collaborators,
    ) -> PartitionResult<u32> {
        let id = self.claim_compute_slot(request.id)?;
        let profile = *match request.shape {
            ComputeShape::Size(size) => catalog.compute_profile(size)?,
            ComputeShape::SmCount(sm) => catalog.compute_profile_for_sm_count(sm)?,
            ComputeShape::GpcCount(gpc) => catalog.compute_profile_for_gpc_count(gpc)?,
        };
        let cts_id = self.resolve_cts(catalog, profile.size, request.placement)?;
        self.check_gpc_capacity(&profile)?;

        let allocatable = *catalog.inventory().partitionable();
        let mut books = self.books;
        let mut engines = EngineSet::empty();
        for class in EngineClass::ALL {
            let (count, shared) = match class {
                EngineClass::Gr => (1, false),
                _ => (request.engines.get(class), request.shared.contains(class)),
            };
            allocate_class_engines(
                &self.engines,
                &allocatable,
                ClassRequest { class, count, shared },
                &mut engines,
                &mut books,
            )?;
        }

        self.install_compute(
            ComputePlan {
                id,
                uuid: Uuid::new_v4(),
                profile,
                cts_id,
                engines,
                shared: request.shared,
                books,
            },
            catalog,
            collab,
        )
    }

    /// Recreate a compute partition exactly as described, trusting the
    /// description's slot, node and engines.
    pub(crate) fn import_compute(
        &mut self,
        export: &ComputeExport,
        catalog: &DeviceCatalog,
        collab: &Collaborators,
    ) -> PartitionResult<u32> {
        let id = self.claim_compute_slot(Some(export.id))?;
        let profile = *catalog.compute_profile(export.size)?;
        if (profile.gpc_count, profile.sm_count, profile.veid_count)
            != (export.gpc_count, export.sm_count, export.veid_count)
        {
            return Err(PartitionError::InvalidArgument(format!(
                "compute partition {} does not match the {} profile",
                export.id,
                export.size.name()
            )));
        }

        let cts_id = self.resolve_cts(catalog, profile.size, Placement::Slot(export.cts_id))?;
        if COMPUTE_TREE.slot_to_offset(cts_id, catalog.cts_basis())? != export.span_start {
            return Err(PartitionError::InvalidArgument(format!(
                "span start {} does not match node {cts_id}",
                export.span_start
            )));
        }
        self.check_gpc_capacity(&profile)?;

        if !export.engines.is_subset(&self.local_engines) {
            return Err(PartitionError::InvalidArgument(format!(
                "engines {:?} are not part of GPU partition {}",
                export.engines, self.swizz_id
            )));
        }
        if export.engines.count_class(EngineClass::Gr) != 1 {
            return Err(PartitionError::InvalidArgument(
                "a compute partition owns exactly one graphics engine".into(),
            ));
        }
        let global = translate_set(&self.local_engines, &export.engines, &self.engines)?;
        let books = claim_verbatim(&self.books, &global, export.shared)?;

        self.install_compute(
            ComputePlan {
                id,
                uuid: export.uuid,
                profile,
                cts_id,
                engines: export.engines,
                shared: export.shared,
                books,
            },
            catalog,
            collab,
        )
    }

    /// Bind the planned partition's span, register it and commit the books.
    fn install_compute(
        &mut self,
        plan: ComputePlan,
        catalog: &DeviceCatalog,
        collab: &Collaborators,
    ) -> PartitionResult<u32> {
        let span_start = COMPUTE_TREE.slot_to_offset(plan.cts_id, catalog.cts_basis())?;
        let global_engines = translate_set(&self.local_engines, &plan.engines, &self.engines)?;
        let local_gr = plan
            .engines
            .of_class(EngineClass::Gr)
            .iter()
            .next()
            .map(|id| id - EngineClass::Gr.base())
            .ok_or_else(|| PartitionError::Internal("compute partition without a graphics engine".into()))?;

        // One basis slot is one GPC.
        let binding = GrBinding {
            gpc_offset: span_start,
            gpc_count: plan.profile.gpc_count,
            veid_offset: span_start * VEIDS_PER_GPC,
            veid_count: plan.profile.veid_count,
        };
        self.configure(
            &[GrConfigRequest {
                local_gr,
                binding: Some(binding),
            }],
            collab.ctx_buffers.as_ref(),
        )?;

        let capability = match collab
            .capabilities
            .register(CapabilityKind::ComputePartition, &plan.uuid.to_string())
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    swizz_id = self.swizz_id,
                    compute_id = plan.id,
                    error = %err,
                    "Compute partition registration failed, unbinding"
                );
                self.unbind_gr(local_gr, collab);
                return Err(err.into());
            }
        };

        let refcount = RefCount::new();
        refcount.acquire_internal();
        refcount.acquire_internal();

        self.books = plan.books;
        self.cts_in_use |= bit(plan.cts_id);
        self.computes[plan.id as usize] = Some(ComputePartition {
            id: plan.id,
            uuid: plan.uuid,
            profile: plan.profile,
            cts_id: plan.cts_id,
            span_start,
            local_gr,
            engines: plan.engines,
            global_engines,
            local_engines: local_engine_mask(&plan.engines),
            shared: plan.shared,
            capability,
            refcount,
        });

        info!(
            swizz_id = self.swizz_id,
            compute_id = plan.id,
            size = plan.profile.size.name(),
            cts_id = plan.cts_id,
            span_start,
            engines = %global_engines,
            "Compute partition created"
        );
        Ok(plan.id)
    }

    /// Tear down a compute partition. Fails with `StillInUse` while anyone
    /// beyond its internal references holds it.
    pub(crate) fn delete_compute(&mut self, id: u32, collab: &Collaborators) -> PartitionResult<()> {
        self.compute(id)?.refcount().try_retire()?;
        let cp = self.computes[id as usize]
            .take()
            .ok_or_else(|| PartitionError::Internal(format!("compute slot {id} emptied during delete")))?;

        if let Err(err) = collab.capabilities.unregister(cp.capability) {
            warn!(swizz_id = self.swizz_id, compute_id = id, error = %err, "Capability release failed");
        }
        self.unbind_gr(cp.local_gr, collab);
        self.cts_in_use &= !bit(cp.cts_id);

        let siblings = self
            .computes()
            .fold(EngineSet::empty(), |acc, sibling| acc | sibling.global_engines);
        release_compute_engines(&mut self.books, &cp.global_engines, &siblings);

        info!(
            swizz_id = self.swizz_id,
            compute_id = id,
            cts_id = cp.cts_id,
            "Compute partition deleted"
        );
        Ok(())
    }

    pub fn export_compute(&self, id: u32) -> PartitionResult<ComputeExport> {
        Ok(self.compute(id)?.export())
    }

    /// Available compute nodes of `size` right now and on an empty parent.
    pub fn compute_capacity(&self, size: Shape) -> (u32, u32) {
        (
            COMPUTE_TREE.greedy_capacity(size, self.valid_cts_mask, self.cts_in_use),
            COMPUTE_TREE.greedy_capacity(size, self.valid_cts_mask, 0),
        )
    }

    fn unbind_gr(&mut self, local_gr: u32, collab: &Collaborators) {
        let unbind = [GrConfigRequest {
            local_gr,
            binding: None,
        }];
        if let Err(err) = self.configure(&unbind, collab.ctx_buffers.as_ref()) {
            warn!(swizz_id = self.swizz_id, local_gr, error = %err, "Unbind failed");
        }
    }

    fn claim_compute_slot(&self, requested: Option<u32>) -> PartitionResult<u32> {
        match requested {
            Some(id) if id as usize >= MAX_COMPUTE_PARTITIONS => Err(PartitionError::InvalidArgument(format!(
                "compute partition id {id} out of range"
            ))),
            Some(id) if self.computes[id as usize].is_some() => Err(PartitionError::StateConflict(format!(
                "compute partition {id} already exists in GPU partition {}",
                self.swizz_id
            ))),
            Some(id) => Ok(id),
            None => self
                .computes
                .iter()
                .position(Option::is_none)
                .map(|idx| idx as u32)
                .ok_or_else(|| {
                    PartitionError::InsufficientResources(format!(
                        "GPU partition {} has no free compute slot",
                        self.swizz_id
                    ))
                }),
        }
    }

    fn resolve_cts(&self, catalog: &DeviceCatalog, size: Shape, placement: Placement) -> PartitionResult<SlotId> {
        let explicit = match placement {
            Placement::Auto => return COMPUTE_TREE.get_free_slot(size, self.valid_cts_mask, self.cts_in_use),
            Placement::Span(offset) => COMPUTE_TREE.offset_to_slot(size, offset, catalog.cts_basis())?,
            Placement::Slot(id) => {
                if COMPUTE_TREE.slot_to_shape(id)? != size {
                    return Err(PartitionError::InvalidArgument(format!(
                        "compute node {id} is not a {} node",
                        size.name()
                    )));
                }
                id
            }
        };

        if self.valid_cts_mask & bit(explicit) == 0 {
            return Err(PartitionError::InvalidArgument(format!(
                "compute node {explicit} lies outside GPU partition {}",
                self.swizz_id
            )));
        }
        if !COMPUTE_TREE.is_available(self.valid_cts_mask, self.cts_in_use, explicit) {
            return Err(PartitionError::StateConflict(format!(
                "compute node {explicit} conflicts with an active compute partition"
            )));
        }
        Ok(explicit)
    }

    fn check_gpc_capacity(&self, profile: &ComputeProfile) -> PartitionResult<()> {
        let used: u32 = self.computes().map(|cp| cp.profile.gpc_count).sum();
        if used + profile.gpc_count > self.gpc_count() {
            return Err(PartitionError::InsufficientResources(format!(
                "{} GPCs requested, {} of {} left",
                profile.gpc_count,
                self.gpc_count() - used,
                self.gpc_count()
            )));
        }
        Ok(())
    }
}
