//! Control plane: the operation set exposed to clients.
//!
//! - [`access`]: Caller identity and privilege checks
//! - [`report`]: Topology views, batch entries and broadcast events
//!
//! [`ControlPlane`] owns the partition manager, the persistence strategy
//! and the open subscriptions. The service keeps it behind one
//! [`tokio::sync::RwLock`] ([`SharedControlPlane`]), which is the
//! device-wide lock: mutations take it for writing, queries for reading.

pub mod access;
pub mod report;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collab::Collaborators;
use crate::config::Config;
use crate::error::{PartitionError, PartitionResult};
use crate::metrics::Metrics;
use crate::partition::compute::{ComputeExport, ComputeRequest};
use crate::partition::manager::{GpuCapacity, PartitionManager};
use crate::partition::refcount::RefGuard;
use crate::partition::Placement;
use crate::persist::record::GpuPartitionSave;
use crate::persist::strategy::{select_strategy, teardown_gpu, PersistenceStrategy, RestoreOutcome};
use crate::persist::PersistError;
use crate::topology::tree::SlotId;

pub use access::Caller;
pub use report::{
    ComputePartitionReport, ComputeProfileReport, GpuPartitionReport, PartitionEntry, PartitionEvent, ProfileReport,
    SubscriptionReport,
};

const EVENT_CAPACITY: usize = 256;

/// Thread-safe control plane shared by the HTTP handlers.
pub type SharedControlPlane = Arc<RwLock<ControlPlane>>;

pub fn new_shared_control_plane(control: ControlPlane) -> SharedControlPlane {
    Arc::new(RwLock::new(control))
}

struct Subscription {
    client_id: String,
    swizz_id: SlotId,
    compute_id: Option<u32>,
    _guard: RefGuard,
}

/// One applied batch entry, kept until the batch commits.
enum Applied {
    Created(SlotId),
    Destroyed(GpuPartitionSave),
}

impl Applied {
    fn swizz_id(&self) -> SlotId {
        match self {
            Applied::Created(id) => *id,
            Applied::Destroyed(save) => save.swizz_id,
        }
    }
}

pub struct ControlPlane {
    manager: PartitionManager,
    strategy: Box<dyn PersistenceStrategy>,
    boot: Vec<String>,
    subscriptions: HashMap<Uuid, Subscription>,
    events: broadcast::Sender<PartitionEvent>,
    metrics: Metrics,
}

impl ControlPlane {
    pub fn new(
        manager: PartitionManager,
        strategy: Box<dyn PersistenceStrategy>,
        boot: Vec<String>,
        metrics: Metrics,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            manager,
            strategy,
            boot,
            subscriptions: HashMap::new(),
            events,
            metrics,
        }
    }

    /// Wire up a control plane for `config` on top of `collab`.
    pub fn from_config(config: &Config, collab: Collaborators, metrics: Metrics) -> Result<Self, PersistError> {
        let strategy = select_strategy(config.platform, &config.persistence, collab.transport.clone())?;
        let manager = PartitionManager::new(config.device.catalog(), collab);
        Ok(Self::new(manager, strategy, config.boot.profiles.clone(), metrics))
    }

    pub fn manager(&self) -> &PartitionManager {
        &self.manager
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Receive topology events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PartitionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PartitionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn refresh_metrics(&self) {
        self.metrics.observe(&self.manager, self.subscriptions.len());
    }

    // ─── GPU partitions ────────────────────────────────────────────────────

    /// Apply a batch of GPU partition creates and destroys. If any entry
    /// fails, the entries before it are reverted newest first and the
    /// error is returned.
    pub fn set_partitions(&mut self, caller: &Caller, entries: &[PartitionEntry]) -> PartitionResult<Vec<SlotId>> {
        caller.require_privileged("set_partitions")?;
        let result = self.apply_batch(entries);
        self.metrics.record("set_partitions", &result);
        self.refresh_metrics();
        result
    }

    fn apply_batch(&mut self, entries: &[PartitionEntry]) -> PartitionResult<Vec<SlotId>> {
        let enabled_here = !self.manager.is_partitioning_enabled() && entries.iter().any(|e| e.valid);
        if enabled_here {
            self.manager.set_partitioning(true)?;
        }

        let mut applied: Vec<Applied> = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            match self.apply_entry(entry) {
                Ok(step) => applied.push(step),
                Err(err) => {
                    warn!(index, applied = applied.len(), error = %err, "Batch entry failed, reverting");
                    self.revert_batch(applied);
                    if enabled_here {
                        self.disable_partitioning_best_effort();
                    }
                    return Err(err);
                }
            }
        }

        // The last partition went away: partitioning mode goes with it.
        let disabled_here = !applied.is_empty() && self.manager.gpu_partitions().next().is_none();
        if disabled_here {
            if let Err(err) = self.manager.set_partitioning(false) {
                warn!(error = %err, "Disabling partitioning failed, reverting batch");
                self.revert_batch(applied);
                return Err(err);
            }
        }

        if enabled_here {
            self.emit(PartitionEvent::ModeChanged { enabled: true });
        }
        for step in &applied {
            match step {
                Applied::Created(swizz_id) => {
                    if let Ok(gpu) = self.manager.gpu_partition(*swizz_id) {
                        self.emit(PartitionEvent::GpuCreated {
                            swizz_id: *swizz_id,
                            profile: gpu.profile.name.to_string(),
                            uuid: gpu.uuid,
                        });
                    }
                }
                Applied::Destroyed(save) => self.emit(PartitionEvent::GpuDestroyed {
                    swizz_id: save.swizz_id,
                }),
            }
        }
        if disabled_here {
            self.emit(PartitionEvent::ModeChanged { enabled: false });
        }

        info!(entries = entries.len(), "Partition batch applied");
        Ok(applied.iter().map(Applied::swizz_id).collect())
    }

    fn apply_entry(&mut self, entry: &PartitionEntry) -> PartitionResult<Applied> {
        if entry.valid {
            let profile = entry
                .profile
                .as_deref()
                .ok_or_else(|| PartitionError::InvalidArgument("create entry without a profile".into()))?;
            let placement = match entry.swizz_id {
                Some(id) => Placement::Slot(id),
                None => entry.placement,
            };
            Ok(Applied::Created(self.manager.create_gpu_partition(profile, placement)?))
        } else {
            let swizz_id = entry
                .swizz_id
                .ok_or_else(|| PartitionError::InvalidArgument("destroy entry without a swizz id".into()))?;
            let save = GpuPartitionSave::capture(self.manager.gpu_partition(swizz_id)?);
            self.manager.invalidate_gpu_partition(swizz_id)?;
            Ok(Applied::Destroyed(save))
        }
    }

    fn revert_batch(&mut self, applied: Vec<Applied>) {
        for step in applied.into_iter().rev() {
            let reverted = match &step {
                Applied::Created(swizz_id) => self.manager.invalidate_gpu_partition(*swizz_id),
                Applied::Destroyed(save) => self.manager.restore_gpu_partition(&save.restore_request()).map(|_| ()),
            };
            if let Err(err) = reverted {
                error!(swizz_id = step.swizz_id(), error = %err, "Batch revert failed");
            }
        }
    }

    fn disable_partitioning_best_effort(&mut self) {
        if let Err(err) = self.manager.set_partitioning(false) {
            warn!(error = %err, "Disabling partitioning failed");
        }
    }

    /// GPU partitions visible to `caller`: every one with `all` (privileged
    /// only), otherwise those the caller subscribes to.
    pub fn get_partitions(&self, caller: &Caller, all: bool) -> PartitionResult<Vec<GpuPartitionReport>> {
        if all {
            caller.require_privileged("list all partitions")?;
            return Ok(self.manager.gpu_partitions().map(GpuPartitionReport::from).collect());
        }
        let mine: BTreeSet<SlotId> = self
            .subscriptions
            .values()
            .filter(|s| s.client_id == caller.client_id)
            .map(|s| s.swizz_id)
            .collect();
        Ok(self
            .manager
            .gpu_partitions()
            .filter(|gpu| mine.contains(&gpu.swizz_id))
            .map(GpuPartitionReport::from)
            .collect())
    }

    /// Static catalog of GPU profiles on this device.
    pub fn describe(&self) -> Vec<ProfileReport> {
        let catalog = self.manager.catalog();
        catalog
            .gpu_profiles()
            .iter()
            .map(|profile| ProfileReport::new(profile, catalog))
            .collect()
    }

    pub fn capacity(&self, profile: &str) -> PartitionResult<GpuCapacity> {
        self.manager.gpu_capacity(profile)
    }

    fn check_visible(&self, caller: &Caller, swizz_id: SlotId) -> PartitionResult<()> {
        self.manager.gpu_partition(swizz_id)?;
        let subscribed = self
            .subscriptions
            .values()
            .any(|s| s.client_id == caller.client_id && s.swizz_id == swizz_id);
        if caller.privileged || subscribed {
            Ok(())
        } else {
            Err(PartitionError::PermissionDenied(format!(
                "client {} is not subscribed to GPU partition {swizz_id}",
                caller.client_id
            )))
        }
    }

    // ─── Compute partitions ────────────────────────────────────────────────

    pub fn compute_partitions(&self, caller: &Caller, swizz_id: SlotId) -> PartitionResult<Vec<ComputePartitionReport>> {
        self.check_visible(caller, swizz_id)?;
        let gpu = self.manager.gpu_partition(swizz_id)?;
        Ok(gpu.computes().map(ComputePartitionReport::from).collect())
    }

    /// Compute sizes that fit the GPU partition, with how many more of each
    /// could be created now.
    pub fn compute_profiles(&self, caller: &Caller, swizz_id: SlotId) -> PartitionResult<Vec<ComputeProfileReport>> {
        self.check_visible(caller, swizz_id)?;
        let gpu = self.manager.gpu_partition(swizz_id)?;
        Ok(self
            .manager
            .catalog()
            .compute_profiles()
            .iter()
            .filter_map(|profile| {
                let (available, total) = gpu.compute_capacity(profile.size);
                (total > 0).then_some(ComputeProfileReport {
                    size: profile.size,
                    gpc_count: profile.gpc_count,
                    sm_count: profile.sm_count,
                    veid_count: profile.veid_count,
                    available,
                    total,
                })
            })
            .collect())
    }

    pub fn create_compute(
        &mut self,
        caller: &Caller,
        swizz_id: SlotId,
        request: &ComputeRequest,
    ) -> PartitionResult<ComputePartitionReport> {
        caller.require_privileged("create compute partition")?;
        let result = self.manager.create_compute_partition(swizz_id, request);
        self.metrics.record("create_compute", &result);
        self.compute_installed(swizz_id, result?)
    }

    pub fn import_compute(
        &mut self,
        caller: &Caller,
        swizz_id: SlotId,
        export: &ComputeExport,
    ) -> PartitionResult<ComputePartitionReport> {
        caller.require_privileged("import compute partition")?;
        let result = self.manager.import_compute_partition(swizz_id, export);
        self.metrics.record("import_compute", &result);
        self.compute_installed(swizz_id, result?)
    }

    fn compute_installed(&self, swizz_id: SlotId, id: u32) -> PartitionResult<ComputePartitionReport> {
        self.refresh_metrics();
        let cp = self.manager.gpu_partition(swizz_id)?.compute(id)?;
        self.emit(PartitionEvent::ComputeCreated {
            swizz_id,
            compute_id: id,
            uuid: cp.uuid,
        });
        Ok(ComputePartitionReport::from(cp))
    }

    pub fn export_compute(&self, caller: &Caller, swizz_id: SlotId, id: u32) -> PartitionResult<ComputeExport> {
        caller.require_privileged("export compute partition")?;
        self.manager.export_compute_partition(swizz_id, id)
    }

    pub fn delete_compute(&mut self, caller: &Caller, swizz_id: SlotId, id: u32) -> PartitionResult<()> {
        caller.require_privileged("delete compute partition")?;
        let result = self.manager.delete_compute_partition(swizz_id, id);
        self.metrics.record("delete_compute", &result);
        result?;
        self.refresh_metrics();
        self.emit(PartitionEvent::ComputeDestroyed {
            swizz_id,
            compute_id: id,
        });
        Ok(())
    }

    // ─── Subscriptions ─────────────────────────────────────────────────────

    /// Hold a reference on a GPU partition, or on one of its compute
    /// partitions, on behalf of `caller`.
    pub fn subscribe(
        &mut self,
        caller: &Caller,
        swizz_id: SlotId,
        compute_id: Option<u32>,
    ) -> PartitionResult<SubscriptionReport> {
        let guard = self.manager.subscribe(swizz_id, compute_id)?;
        let id = Uuid::new_v4();
        self.subscriptions.insert(
            id,
            Subscription {
                client_id: caller.client_id.clone(),
                swizz_id,
                compute_id,
                _guard: guard,
            },
        );
        self.refresh_metrics();
        info!(subscription = %id, client = %caller.client_id, swizz_id, ?compute_id, "Subscribed");
        Ok(SubscriptionReport {
            id,
            client_id: caller.client_id.clone(),
            swizz_id,
            compute_id,
        })
    }

    pub fn unsubscribe(&mut self, caller: &Caller, id: Uuid) -> PartitionResult<()> {
        let sub = self
            .subscriptions
            .get(&id)
            .ok_or_else(|| PartitionError::NotFound(format!("subscription {id}")))?;
        if sub.client_id != caller.client_id && !caller.privileged {
            return Err(PartitionError::PermissionDenied(format!(
                "subscription {id} belongs to another client"
            )));
        }
        self.subscriptions.remove(&id);
        self.refresh_metrics();
        info!(subscription = %id, client = %caller.client_id, "Unsubscribed");
        Ok(())
    }

    pub fn subscriptions(&self, caller: &Caller) -> Vec<SubscriptionReport> {
        self.subscriptions
            .iter()
            .filter(|(_, s)| caller.privileged || s.client_id == caller.client_id)
            .map(|(id, s)| SubscriptionReport {
                id: *id,
                client_id: s.client_id.clone(),
                swizz_id: s.swizz_id,
                compute_id: s.compute_id,
            })
            .collect()
    }

    // ─── Mode ──────────────────────────────────────────────────────────────

    /// Enable (attach and restore) or disable (save and detach)
    /// partitioning. Returns the restore outcome on enable.
    pub fn set_mode(&mut self, caller: &Caller, enabled: bool) -> PartitionResult<Option<RestoreOutcome>> {
        caller.require_privileged("set partitioning mode")?;
        if enabled {
            self.attach().map(Some)
        } else {
            self.detach().map(|()| None)
        }
    }

    /// Enable partitioning and rebuild the saved (or boot) topology.
    pub fn attach(&mut self) -> PartitionResult<RestoreOutcome> {
        if self.manager.is_partitioning_enabled() {
            return Err(PartitionError::StateConflict("partitioning is already enabled".into()));
        }
        self.manager.set_partitioning(true)?;

        let result = self.strategy.restore(&mut self.manager, &self.boot).map_err(PartitionError::from);
        self.metrics.record("attach", &result);
        self.refresh_metrics();
        match result {
            Ok(outcome) => {
                info!(
                    source = ?outcome.source,
                    gpu_partitions = outcome.gpu_partitions.len(),
                    "Attached"
                );
                self.emit(PartitionEvent::ModeChanged { enabled: true });
                self.emit(PartitionEvent::Restored {
                    source: outcome.source,
                    gpu_partitions: outcome.gpu_partitions.clone(),
                });
                Ok(outcome)
            }
            Err(err) => {
                error!(error = %err, "Attach failed");
                self.disable_partitioning_best_effort();
                Err(err)
            }
        }
    }

    /// Save the topology, tear it down and disable partitioning. Refused
    /// while any client holds a subscription.
    pub fn detach(&mut self) -> PartitionResult<()> {
        if !self.manager.is_partitioning_enabled() {
            return Err(PartitionError::StateConflict("partitioning is already disabled".into()));
        }
        if !self.subscriptions.is_empty() {
            return Err(PartitionError::StillInUse(format!(
                "{} subscriptions open",
                self.subscriptions.len()
            )));
        }

        self.strategy.save(&self.manager)?;

        let swizz_ids: Vec<SlotId> = self.manager.gpu_partitions().map(|gpu| gpu.swizz_id).collect();
        for swizz_id in swizz_ids.into_iter().rev() {
            teardown_gpu(&mut self.manager, swizz_id)?;
            self.emit(PartitionEvent::GpuDestroyed { swizz_id });
        }
        self.manager.set_partitioning(false)?;
        self.refresh_metrics();
        self.emit(PartitionEvent::ModeChanged { enabled: false });
        info!(platform = self.strategy.platform().name(), "Detached");
        Ok(())
    }

    /// Called once when the service stops.
    pub fn shutdown(&mut self, save: bool) -> PartitionResult<()> {
        if !self.manager.is_partitioning_enabled() || !save {
            return Ok(());
        }
        // Subscriptions do not outlive the process.
        self.subscriptions.clear();
        self.detach()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::sim::SimDevice;
    use crate::topology::tree::Shape;

    fn control(dir: &tempfile::TempDir, sim: &SimDevice) -> ControlPlane {
        let mut config = Config::default();
        config.persistence.path = dir.path().join("topology.bin");
        ControlPlane::from_config(&config, sim.collaborators(), Metrics::new().unwrap()).unwrap()
    }

    #[test]
    fn test_mutations_require_privilege() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimDevice::new(80 << 30);
        let mut cp = control(&dir, &sim);
        let user = Caller::unprivileged("alice");

        assert!(matches!(
            cp.set_partitions(&user, &[PartitionEntry::create("half")]),
            Err(PartitionError::PermissionDenied(_))
        ));
        assert!(matches!(
            cp.get_partitions(&user, true),
            Err(PartitionError::PermissionDenied(_))
        ));
        assert!(matches!(cp.set_mode(&user, true), Err(PartitionError::PermissionDenied(_))));
    }

    #[test]
    fn test_unprivileged_sees_only_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimDevice::new(80 << 30);
        let mut cp = control(&dir, &sim);
        let admin = Caller::privileged("admin");
        let alice = Caller::unprivileged("alice");

        let ids = cp
            .set_partitions(&admin, &[PartitionEntry::create("half"), PartitionEntry::create("half")])
            .unwrap();
        assert!(cp.get_partitions(&alice, false).unwrap().is_empty());
        assert!(matches!(
            cp.compute_profiles(&alice, ids[0]),
            Err(PartitionError::PermissionDenied(_))
        ));

        let sub = cp.subscribe(&alice, ids[1], None).unwrap();
        let visible = cp.get_partitions(&alice, false).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].swizz_id, ids[1]);
        assert_eq!(visible[0].subscribers, 1);
        assert!(!cp.compute_profiles(&alice, ids[1]).unwrap().is_empty());

        // Subscribed partitions cannot be destroyed.
        assert!(matches!(
            cp.set_partitions(&admin, &[PartitionEntry::destroy(ids[1])]),
            Err(PartitionError::StillInUse(_))
        ));

        assert!(matches!(
            cp.unsubscribe(&Caller::unprivileged("bob"), sub.id),
            Err(PartitionError::PermissionDenied(_))
        ));
        cp.unsubscribe(&alice, sub.id).unwrap();
        cp.set_partitions(&admin, &[PartitionEntry::destroy(ids[1])]).unwrap();
    }

    #[test]
    fn test_compute_profiles_track_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimDevice::new(80 << 30);
        let mut cp = control(&dir, &sim);
        let admin = Caller::privileged("admin");
        let ids = cp.set_partitions(&admin, &[PartitionEntry::create("half")]).unwrap();

        let quarter = |cp: &ControlPlane| {
            cp.compute_profiles(&admin, ids[0])
                .unwrap()
                .into_iter()
                .find(|p| p.size == Shape::Quarter)
                .unwrap()
        };
        assert_eq!((quarter(&cp).available, quarter(&cp).total), (2, 2));

        cp.create_compute(&admin, ids[0], &ComputeRequest::of_size(Shape::Quarter))
            .unwrap();
        assert_eq!(quarter(&cp).available, 1);

        // A half partition offers no full-size compute partition.
        let sizes: Vec<Shape> = cp
            .compute_profiles(&admin, ids[0])
            .unwrap()
            .iter()
            .map(|p| p.size)
            .collect();
        assert!(!sizes.contains(&Shape::Full));
    }

    #[test]
    fn test_events_are_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimDevice::new(80 << 30);
        let mut cp = control(&dir, &sim);
        let admin = Caller::privileged("admin");
        let mut rx = cp.subscribe_events();

        let ids = cp.set_partitions(&admin, &[PartitionEntry::create("quarter")]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), PartitionEvent::ModeChanged { enabled: true });
        assert!(matches!(
            rx.try_recv().unwrap(),
            PartitionEvent::GpuCreated { swizz_id, .. } if swizz_id == ids[0]
        ));

        cp.set_partitions(&admin, &[PartitionEntry::destroy(ids[0])]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), PartitionEvent::GpuDestroyed { swizz_id: ids[0] });
        assert_eq!(rx.try_recv().unwrap(), PartitionEvent::ModeChanged { enabled: false });
        assert!(!sim.mode.is_enabled());
    }

    #[test]
    fn test_detach_refused_while_subscribed() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimDevice::new(80 << 30);
        let mut cp = control(&dir, &sim);
        let admin = Caller::privileged("admin");
        let ids = cp.set_partitions(&admin, &[PartitionEntry::create("eighth")]).unwrap();

        let sub = cp.subscribe(&Caller::unprivileged("alice"), ids[0], None).unwrap();
        assert!(matches!(cp.set_mode(&admin, false), Err(PartitionError::StillInUse(_))));

        cp.unsubscribe(&admin, sub.id).unwrap();
        cp.set_mode(&admin, false).unwrap();
        assert_eq!(cp.manager().gpu_partitions().count(), 0);
        assert!(dir.path().join("topology.bin").exists());
    }
}
