//! Persistence strategies, one per platform.
//!
//! The platform is chosen once at startup. A bare-metal owner keeps the
//! record in a local file. A virtualized guest hands it to the host
//! through the remote transport. With firmware offload the record stays
//! local, and every restored GPU partition is also replayed to the
//! firmware (and dropped from it on save).

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::collab::{RemoteOp, RemoteTransport};
use crate::config::PersistenceConfig;
use crate::error::{PartitionError, PartitionResult};
use crate::partition::manager::PartitionManager;
use crate::partition::Placement;
use crate::persist::record::{GpuPartitionSave, PersistenceRecord};
use crate::persist::store::{decode_record, encode_record, RecordStore};
use crate::persist::PersistError;
use crate::topology::tree::SlotId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    BareMetal,
    VirtualGuest,
    FirmwareOffload,
}

impl Platform {
    pub fn name(self) -> &'static str {
        match self {
            Platform::BareMetal => "bare_metal",
            Platform::VirtualGuest => "virtual_guest",
            Platform::FirmwareOffload => "firmware_offload",
        }
    }
}

/// Where a restored topology came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    Record,
    Boot,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub source: RestoreSource,
    pub gpu_partitions: Vec<SlotId>,
}

pub trait PersistenceStrategy: Send + Sync {
    fn platform(&self) -> Platform;

    /// Snapshot the current topology into the backing store.
    fn save(&self, manager: &PartitionManager) -> Result<(), PersistError>;

    /// Rebuild the topology on attach: the saved record when it holds any
    /// GPU partition, otherwise the boot profiles. Partitioning mode must
    /// already be enabled.
    fn restore(&self, manager: &mut PartitionManager, boot: &[String]) -> Result<RestoreOutcome, PersistError>;
}

/// Build the strategy for `platform`. The guest and firmware platforms
/// need a transport.
pub fn select_strategy(
    platform: Platform,
    config: &PersistenceConfig,
    transport: Option<Arc<dyn RemoteTransport>>,
) -> Result<Box<dyn PersistenceStrategy>, PersistError> {
    let store = RecordStore::from_config(config);
    let strategy: Box<dyn PersistenceStrategy> = match platform {
        Platform::BareMetal => Box::new(BareMetal { store }),
        Platform::VirtualGuest => Box::new(VirtualGuest {
            transport: transport.ok_or(PersistError::NoTransport(platform.name()))?,
            zstd_level: config.zstd_compression.then_some(config.zstd_level),
        }),
        Platform::FirmwareOffload => Box::new(FirmwareOffload {
            store,
            transport: transport.ok_or(PersistError::NoTransport(platform.name()))?,
        }),
    };
    info!(platform = platform.name(), "Persistence strategy selected");
    Ok(strategy)
}

// ─── Strategies ────────────────────────────────────────────────────────────

pub struct BareMetal {
    store: RecordStore,
}

impl BareMetal {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }
}

impl PersistenceStrategy for BareMetal {
    fn platform(&self) -> Platform {
        Platform::BareMetal
    }

    fn save(&self, manager: &PartitionManager) -> Result<(), PersistError> {
        self.store.write(&PersistenceRecord::capture(manager))
    }

    fn restore(&self, manager: &mut PartitionManager, boot: &[String]) -> Result<RestoreOutcome, PersistError> {
        let record = self.store.read()?;
        Ok(restore_or_boot(manager, record.as_ref(), boot)?)
    }
}

pub struct VirtualGuest {
    transport: Arc<dyn RemoteTransport>,
    zstd_level: Option<i32>,
}

impl PersistenceStrategy for VirtualGuest {
    fn platform(&self) -> Platform {
        Platform::VirtualGuest
    }

    fn save(&self, manager: &PartitionManager) -> Result<(), PersistError> {
        let record = PersistenceRecord::capture(manager);
        let data = encode_record(&record, self.zstd_level)?;
        self.transport.call(RemoteOp::StoreTopology, data)?;
        info!(
            gpu_partitions = record.gpu_partitions().count(),
            "Sent persistence record to host"
        );
        Ok(())
    }

    fn restore(&self, manager: &mut PartitionManager, boot: &[String]) -> Result<RestoreOutcome, PersistError> {
        let data = self.transport.call(RemoteOp::FetchTopology, Bytes::new())?;
        let record = if data.is_empty() {
            None
        } else {
            Some(decode_record(&data)?)
        };
        Ok(restore_or_boot(manager, record.as_ref(), boot)?)
    }
}

pub struct FirmwareOffload {
    store: RecordStore,
    transport: Arc<dyn RemoteTransport>,
}

impl PersistenceStrategy for FirmwareOffload {
    fn platform(&self) -> Platform {
        Platform::FirmwareOffload
    }

    fn save(&self, manager: &PartitionManager) -> Result<(), PersistError> {
        let record = PersistenceRecord::capture(manager);
        self.store.write(&record)?;
        for save in record.gpu_partitions() {
            if let Err(err) = self.transport.call(RemoteOp::DropGpuPartition, replay_payload(save)) {
                warn!(swizz_id = save.swizz_id, error = %err, "Firmware drop failed");
            }
        }
        Ok(())
    }

    fn restore(&self, manager: &mut PartitionManager, boot: &[String]) -> Result<RestoreOutcome, PersistError> {
        let record = self.store.read()?;
        let outcome = restore_or_boot(manager, record.as_ref(), boot)?;

        for &swizz_id in &outcome.gpu_partitions {
            let replayed = manager
                .gpu_partition(swizz_id)
                .map(GpuPartitionSave::capture)
                .map_err(PersistError::from)
                .and_then(|save| Ok(self.transport.call(RemoteOp::ReplayGpuPartition, replay_payload(&save))?));
            if let Err(err) = replayed {
                error!(swizz_id, error = %err, "Firmware replay failed, cleaning up");
                cleanup(manager, &outcome.gpu_partitions);
                return Err(err);
            }
        }
        Ok(outcome)
    }
}

/// Swizz ID (LE u32) followed by the raw save entry.
fn replay_payload(save: &GpuPartitionSave) -> Bytes {
    let raw = bytemuck::bytes_of(save);
    let mut buf = BytesMut::with_capacity(4 + raw.len());
    buf.put_u32_le(save.swizz_id);
    buf.put_slice(raw);
    buf.freeze()
}

// ─── Restore ───────────────────────────────────────────────────────────────

fn restore_or_boot(
    manager: &mut PartitionManager,
    record: Option<&PersistenceRecord>,
    boot: &[String],
) -> PartitionResult<RestoreOutcome> {
    match record {
        Some(record) if !record.is_empty() => Ok(RestoreOutcome {
            source: RestoreSource::Record,
            gpu_partitions: restore_topology(manager, record)?,
        }),
        _ if !boot.is_empty() => Ok(RestoreOutcome {
            source: RestoreSource::Boot,
            gpu_partitions: build_boot_topology(manager, boot)?,
        }),
        _ => Ok(RestoreOutcome {
            source: RestoreSource::Empty,
            gpu_partitions: Vec::new(),
        }),
    }
}

/// Recreate every partition in `record` verbatim. On failure everything
/// restored so far is torn down before the error is returned.
pub fn restore_topology(manager: &mut PartitionManager, record: &PersistenceRecord) -> PartitionResult<Vec<SlotId>> {
    let mut restored = Vec::new();
    for save in record.gpu_partitions() {
        if let Err(err) = restore_gpu(manager, save, &mut restored) {
            error!(swizz_id = save.swizz_id, error = %err, "Topology restore failed, cleaning up");
            cleanup(manager, &restored);
            return Err(err);
        }
    }
    info!(gpu_partitions = restored.len(), "Topology restored from record");
    Ok(restored)
}

fn restore_gpu(manager: &mut PartitionManager, save: &GpuPartitionSave, restored: &mut Vec<SlotId>) -> PartitionResult<()> {
    let swizz_id = manager.restore_gpu_partition(&save.restore_request())?;
    restored.push(swizz_id);

    let gpu = manager.gpu_partition(swizz_id)?;
    if (gpu.gpc_mask(), gpu.veid_offset(), gpu.veid_count()) != (save.gpc_mask, save.veid_offset, save.veid_count) {
        return Err(PartitionError::InvalidArgument(format!(
            "saved spatial mask of GPU partition {swizz_id} does not match its slot"
        )));
    }

    for cp in save.computes() {
        manager.import_compute_partition(swizz_id, &cp.to_export()?)?;
    }
    Ok(())
}

/// Create one GPU partition per boot profile, in order.
pub fn build_boot_topology(manager: &mut PartitionManager, profiles: &[String]) -> PartitionResult<Vec<SlotId>> {
    let mut created = Vec::new();
    for profile in profiles {
        match manager.create_gpu_partition(profile, Placement::Auto) {
            Ok(swizz_id) => created.push(swizz_id),
            Err(err) => {
                error!(profile = %profile, error = %err, "Boot topology failed, cleaning up");
                cleanup(manager, &created);
                return Err(err);
            }
        }
    }
    info!(gpu_partitions = created.len(), "Boot topology created");
    Ok(created)
}

/// Delete a GPU partition's compute partitions, newest slot first, then
/// the GPU partition itself.
pub fn teardown_gpu(manager: &mut PartitionManager, swizz_id: SlotId) -> PartitionResult<()> {
    let compute_ids: Vec<u32> = manager.gpu_partition(swizz_id)?.computes().map(|cp| cp.id).collect();
    for id in compute_ids.into_iter().rev() {
        manager.delete_compute_partition(swizz_id, id)?;
    }
    manager.invalidate_gpu_partition(swizz_id)
}

/// Best-effort teardown; failures are logged, not returned.
fn cleanup(manager: &mut PartitionManager, swizz_ids: &[SlotId]) {
    for &swizz_id in swizz_ids.iter().rev() {
        if let Err(err) = teardown_gpu(manager, swizz_id) {
            warn!(swizz_id, error = %err, "Cleanup failed, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::sim::{FaultPoint, SimDevice};
    use crate::topology::profile::{DeviceCatalog, Generation};

    fn manager(sim: &SimDevice) -> PartitionManager {
        let mut mgr = PartitionManager::new(DeviceCatalog::new(Generation::Gh100, 80 << 30, 0), sim.collaborators());
        mgr.set_partitioning(true).unwrap();
        mgr
    }

    fn config(dir: &tempfile::TempDir) -> PersistenceConfig {
        PersistenceConfig {
            path: dir.path().join("topology.bin"),
            ..PersistenceConfig::default()
        }
    }

    #[test]
    fn test_empty_record_uses_boot_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimDevice::new(80 << 30);
        let mut mgr = manager(&sim);
        let strategy = select_strategy(Platform::BareMetal, &config(&dir), None).unwrap();

        let boot = vec!["quarter".to_string(), "quarter".to_string()];
        let outcome = strategy.restore(&mut mgr, &boot).unwrap();
        assert_eq!(outcome.source, RestoreSource::Boot);
        assert_eq!(outcome.gpu_partitions, vec![3, 4]);

        let outcome = strategy.restore(&mut manager(&SimDevice::new(80 << 30)), &[]).unwrap();
        assert_eq!(outcome.source, RestoreSource::Empty);
    }

    #[test]
    fn test_failed_boot_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimDevice::new(80 << 30);
        let mut mgr = manager(&sim);
        let strategy = select_strategy(Platform::BareMetal, &config(&dir), None).unwrap();

        let boot = vec!["half".to_string(), "bogus".to_string()];
        assert!(strategy.restore(&mut mgr, &boot).is_err());
        assert_eq!(mgr.gpu_partitions().count(), 0);
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn test_conflicting_record_cleans_up() {
        let sim = SimDevice::new(80 << 30);
        let mut mgr = manager(&sim);
        let swizz = mgr.create_gpu_partition("half", Placement::Auto).unwrap();
        let mut record = PersistenceRecord::capture(&mgr);
        teardown_gpu(&mut mgr, swizz).unwrap();

        // A second entry claiming the same slot.
        record.gpu[1] = record.gpu[0];
        let err = restore_topology(&mut mgr, &record).unwrap_err();
        assert!(matches!(err, PartitionError::StateConflict(_)));
        assert_eq!(mgr.gpu_partitions().count(), 0);
        assert!(mgr.engines_in_use().is_empty());
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn test_guest_round_trips_through_host() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimDevice::new(80 << 30);
        let mut mgr = manager(&sim);
        let transport: Arc<dyn RemoteTransport> = sim.transport.clone();
        let strategy = select_strategy(Platform::VirtualGuest, &config(&dir), Some(transport)).unwrap();

        // Nothing stored on the host yet.
        assert_eq!(strategy.restore(&mut mgr, &[]).unwrap().source, RestoreSource::Empty);

        let swizz = mgr.create_gpu_partition("quarter", Placement::Slot(5)).unwrap();
        let uuid = mgr.gpu_partition(swizz).unwrap().uuid;
        strategy.save(&mgr).unwrap();
        teardown_gpu(&mut mgr, swizz).unwrap();

        let outcome = strategy.restore(&mut mgr, &[]).unwrap();
        assert_eq!(outcome.source, RestoreSource::Record);
        assert_eq!(outcome.gpu_partitions, vec![5]);
        assert_eq!(mgr.gpu_partition(5).unwrap().uuid, uuid);
        assert!(!dir.path().join("topology.bin").exists());
    }

    #[test]
    fn test_guest_requires_transport() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            select_strategy(Platform::VirtualGuest, &config(&dir), None),
            Err(PersistError::NoTransport("virtual_guest"))
        ));
    }

    #[test]
    fn test_firmware_replays_restored_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimDevice::new(80 << 30);
        let mut mgr = manager(&sim);
        let transport: Arc<dyn RemoteTransport> = sim.transport.clone();
        let strategy = select_strategy(Platform::FirmwareOffload, &config(&dir), Some(transport)).unwrap();

        let boot = vec!["half".to_string(), "eighth".to_string()];
        strategy.restore(&mut mgr, &boot).unwrap();
        assert_eq!(sim.transport.replayed(), 2);

        strategy.save(&mgr).unwrap();
        assert_eq!(sim.transport.replayed(), 0);
    }

    #[test]
    fn test_firmware_replay_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimDevice::new(80 << 30);
        let mut mgr = manager(&sim);
        let transport: Arc<dyn RemoteTransport> = sim.transport.clone();
        let strategy = select_strategy(Platform::FirmwareOffload, &config(&dir), Some(transport)).unwrap();

        sim.faults.arm_after(FaultPoint::Transport, 1);
        let boot = vec!["half".to_string(), "half".to_string()];
        assert!(strategy.restore(&mut mgr, &boot).is_err());
        assert_eq!(mgr.gpu_partitions().count(), 0);
        assert_eq!(sim.live_handles(), 0);
    }
}
