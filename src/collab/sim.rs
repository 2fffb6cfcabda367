//! Simulated collaborators.
//!
//! Used by the daemon when no hardware backend is attached and by the
//! tests. Every live handle is tracked in a shared ledger so leaks are
//! observable, and any call can be made to fail through [`FaultInjector`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::debug;

use crate::collab::{
    CapabilityKind, CapabilityRegistry, Collaborators, ContextBufferSubsystem, GrBinding, Handle, MemoryManager,
    MemoryRange, ModeControl, RemoteOp, RemoteTransport, RunQueueSubsystem,
};
use crate::engine::bitset::EngineSet;
use crate::error::CollabError;

/// Call sites that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    AllocateRange,
    StartScrubber,
    PageTablePool,
    RunQueues,
    ContextPools,
    GrBuffers,
    Capability,
    Transport,
    ModeToggle,
}

/// Arms failures at specific call sites.
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: Mutex<HashMap<FaultPoint, u32>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call at `point`.
    pub fn arm(&self, point: FaultPoint) {
        self.arm_after(point, 0);
    }

    /// Let `skip` calls at `point` succeed, then fail the next one.
    pub fn arm_after(&self, point: FaultPoint, skip: u32) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.insert(point, skip);
        }
    }

    fn check(&self, point: FaultPoint, op: &'static str) -> Result<(), CollabError> {
        let Ok(mut armed) = self.armed.lock() else {
            return Ok(());
        };
        match armed.get_mut(&point) {
            Some(0) => {
                armed.remove(&point);
                Err(CollabError::Failed {
                    op,
                    reason: "injected fault".into(),
                })
            }
            Some(skip) => {
                *skip -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Live-handle bookkeeping shared by all simulated collaborators.
#[derive(Debug, Default)]
struct Ledger {
    next: AtomicU64,
    live: Mutex<HashMap<u64, &'static str>>,
}

impl Ledger {
    fn issue(&self, kind: &'static str) -> Handle {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut live) = self.live.lock() {
            live.insert(id, kind);
        }
        Handle(id)
    }

    fn retire(&self, handle: Handle, op: &'static str) -> Result<(), CollabError> {
        let removed = self.live.lock().ok().and_then(|mut live| live.remove(&handle.0));
        removed.map(|_| ()).ok_or(CollabError::UnknownHandle { op, handle: handle.0 })
    }

    fn count(&self, kind: Option<&str>) -> usize {
        self.live
            .lock()
            .map(|live| live.values().filter(|k| kind.map_or(true, |want| **k == want)).count())
            .unwrap_or(0)
    }
}

pub struct SimMemoryManager {
    capacity: u64,
    allocations: Mutex<BTreeMap<u64, (u64, Handle)>>,
    ledger: Arc<Ledger>,
    faults: Arc<FaultInjector>,
}

impl SimMemoryManager {
    fn first_fit(allocations: &BTreeMap<u64, (u64, Handle)>, capacity: u64, size: u64) -> Option<u64> {
        let mut cursor = 0;
        for (&offset, &(len, _)) in allocations {
            if offset - cursor >= size {
                return Some(cursor);
            }
            cursor = offset + len;
        }
        (capacity - cursor >= size).then_some(cursor)
    }

    /// Bytes currently handed out.
    pub fn allocated(&self) -> u64 {
        self.allocations
            .lock()
            .map(|a| a.values().map(|(len, _)| len).sum())
            .unwrap_or(0)
    }
}

impl MemoryManager for SimMemoryManager {
    fn allocate_range(&self, size: u64) -> Result<MemoryRange, CollabError> {
        self.faults.check(FaultPoint::AllocateRange, "allocate_range")?;
        let mut allocations = self.allocations.lock().map_err(|_| CollabError::Failed {
            op: "allocate_range",
            reason: "allocator poisoned".into(),
        })?;
        let offset = Self::first_fit(&allocations, self.capacity, size).ok_or(CollabError::Exhausted {
            op: "allocate_range",
        })?;
        let handle = self.ledger.issue("memory");
        allocations.insert(offset, (size, handle));
        debug!(offset, size, %handle, "Allocated memory range");
        Ok(MemoryRange { handle, offset, size })
    }

    fn free_range(&self, range: MemoryRange) -> Result<(), CollabError> {
        self.ledger.retire(range.handle, "free_range")?;
        if let Ok(mut allocations) = self.allocations.lock() {
            allocations.remove(&range.offset);
        }
        Ok(())
    }

    fn start_scrubber(&self, _range: &MemoryRange) -> Result<Handle, CollabError> {
        self.faults.check(FaultPoint::StartScrubber, "start_scrubber")?;
        Ok(self.ledger.issue("scrubber"))
    }

    fn stop_scrubber(&self, scrubber: Handle) -> Result<(), CollabError> {
        self.ledger.retire(scrubber, "stop_scrubber")
    }

    fn create_page_table_pool(&self, _range: &MemoryRange) -> Result<Handle, CollabError> {
        self.faults.check(FaultPoint::PageTablePool, "create_page_table_pool")?;
        Ok(self.ledger.issue("page_table_pool"))
    }

    fn destroy_page_table_pool(&self, pool: Handle) -> Result<(), CollabError> {
        self.ledger.retire(pool, "destroy_page_table_pool")
    }
}

pub struct SimRunQueues {
    ledger: Arc<Ledger>,
    faults: Arc<FaultInjector>,
}

impl RunQueueSubsystem for SimRunQueues {
    fn install_run_queues(&self, engines: &EngineSet) -> Result<Handle, CollabError> {
        self.faults.check(FaultPoint::RunQueues, "install_run_queues")?;
        if engines.is_empty() {
            return Err(CollabError::Failed {
                op: "install_run_queues",
                reason: "no engines".into(),
            });
        }
        Ok(self.ledger.issue("run_queues"))
    }

    fn teardown_run_queues(&self, queues: Handle) -> Result<(), CollabError> {
        self.ledger.retire(queues, "teardown_run_queues")
    }
}

pub struct SimContextBuffers {
    ledger: Arc<Ledger>,
    faults: Arc<FaultInjector>,
}

impl ContextBufferSubsystem for SimContextBuffers {
    fn create_pools(&self, _partition: u32) -> Result<Handle, CollabError> {
        self.faults.check(FaultPoint::ContextPools, "create_pools")?;
        Ok(self.ledger.issue("ctx_pools"))
    }

    fn destroy_pools(&self, pools: Handle) -> Result<(), CollabError> {
        self.ledger.retire(pools, "destroy_pools")
    }

    fn allocate_gr_buffers(&self, _pools: Handle, _local_gr: u32, binding: &GrBinding) -> Result<Handle, CollabError> {
        self.faults.check(FaultPoint::GrBuffers, "allocate_gr_buffers")?;
        if binding.gpc_count == 0 {
            return Err(CollabError::Failed {
                op: "allocate_gr_buffers",
                reason: "empty binding".into(),
            });
        }
        Ok(self.ledger.issue("gr_buffers"))
    }

    fn free_gr_buffers(&self, buffers: Handle) -> Result<(), CollabError> {
        self.ledger.retire(buffers, "free_gr_buffers")
    }
}

pub struct SimCapabilities {
    ledger: Arc<Ledger>,
    faults: Arc<FaultInjector>,
}

impl CapabilityRegistry for SimCapabilities {
    fn register(&self, kind: CapabilityKind, id: &str) -> Result<Handle, CollabError> {
        self.faults.check(FaultPoint::Capability, "register_capability")?;
        let handle = self.ledger.issue("capability");
        debug!(?kind, id, %handle, "Registered capability");
        Ok(handle)
    }

    fn unregister(&self, capability: Handle) -> Result<(), CollabError> {
        self.ledger.retire(capability, "unregister_capability")
    }
}

pub struct SimModeControl {
    enabled: AtomicBool,
    faults: Arc<FaultInjector>,
}

impl SimModeControl {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl ModeControl for SimModeControl {
    fn set_partitioning(&self, enabled: bool) -> Result<(), CollabError> {
        self.faults.check(FaultPoint::ModeToggle, "set_partitioning")?;
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

/// Stand-in for the peer privilege domain. Keeps the topology it is sent
/// and counts replayed partitions.
pub struct SimTransport {
    stored: Mutex<Bytes>,
    replayed: Mutex<HashMap<u32, Bytes>>,
    faults: Arc<FaultInjector>,
}

impl SimTransport {
    /// GPU partitions the peer currently holds a replay for.
    pub fn replayed(&self) -> usize {
        self.replayed.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl RemoteTransport for SimTransport {
    fn call(&self, op: RemoteOp, payload: Bytes) -> Result<Bytes, CollabError> {
        self.faults.check(FaultPoint::Transport, "remote_call")?;
        match op {
            RemoteOp::FetchTopology => Ok(self.stored.lock().map_err(poisoned)?.clone()),
            RemoteOp::StoreTopology => {
                *self.stored.lock().map_err(poisoned)? = payload;
                Ok(Bytes::new())
            }
            RemoteOp::ReplayGpuPartition | RemoteOp::DropGpuPartition => {
                let id = payload
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .map(u32::from_le_bytes)
                    .ok_or(CollabError::Failed {
                        op: "remote_call",
                        reason: "short payload".into(),
                    })?;
                let mut replayed = self.replayed.lock().map_err(poisoned)?;
                if op == RemoteOp::ReplayGpuPartition {
                    replayed.insert(id, payload);
                } else {
                    replayed.remove(&id);
                }
                Ok(Bytes::new())
            }
        }
    }
}

fn poisoned<T>(_: T) -> CollabError {
    CollabError::Failed {
        op: "remote_call",
        reason: "peer state poisoned".into(),
    }
}

/// One simulated device: every collaborator plus the shared ledger and
/// fault injector.
pub struct SimDevice {
    pub faults: Arc<FaultInjector>,
    pub memory: Arc<SimMemoryManager>,
    pub mode: Arc<SimModeControl>,
    pub transport: Arc<SimTransport>,
    run_queues: Arc<SimRunQueues>,
    ctx_buffers: Arc<SimContextBuffers>,
    capabilities: Arc<SimCapabilities>,
    ledger: Arc<Ledger>,
}

impl SimDevice {
    pub fn new(memory_size: u64) -> Self {
        let faults = Arc::new(FaultInjector::new());
        let ledger = Arc::new(Ledger::default());
        Self {
            memory: Arc::new(SimMemoryManager {
                capacity: memory_size,
                allocations: Mutex::new(BTreeMap::new()),
                ledger: ledger.clone(),
                faults: faults.clone(),
            }),
            mode: Arc::new(SimModeControl {
                enabled: AtomicBool::new(false),
                faults: faults.clone(),
            }),
            transport: Arc::new(SimTransport {
                stored: Mutex::new(Bytes::new()),
                replayed: Mutex::new(HashMap::new()),
                faults: faults.clone(),
            }),
            run_queues: Arc::new(SimRunQueues {
                ledger: ledger.clone(),
                faults: faults.clone(),
            }),
            ctx_buffers: Arc::new(SimContextBuffers {
                ledger: ledger.clone(),
                faults: faults.clone(),
            }),
            capabilities: Arc::new(SimCapabilities {
                ledger: ledger.clone(),
                faults: faults.clone(),
            }),
            faults,
            ledger,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            memory: self.memory.clone(),
            run_queues: self.run_queues.clone(),
            ctx_buffers: self.ctx_buffers.clone(),
            capabilities: self.capabilities.clone(),
            mode: self.mode.clone(),
            transport: Some(self.transport.clone()),
        }
    }

    /// Handles currently outstanding across all collaborators.
    pub fn live_handles(&self) -> usize {
        self.ledger.count(None)
    }

    /// Outstanding handles of one kind ("memory", "capability", ...).
    pub fn live_of(&self, kind: &str) -> usize {
        self.ledger.count(Some(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_fires_once() {
        let faults = FaultInjector::new();
        faults.arm_after(FaultPoint::Capability, 1);
        assert!(faults.check(FaultPoint::Capability, "x").is_ok());
        assert!(faults.check(FaultPoint::Capability, "x").is_err());
        assert!(faults.check(FaultPoint::Capability, "x").is_ok());
    }

    #[test]
    fn test_memory_first_fit_reuses_holes() {
        let sim = SimDevice::new(100);
        let a = sim.memory.allocate_range(40).unwrap();
        let b = sim.memory.allocate_range(40).unwrap();
        assert!(sim.memory.allocate_range(40).is_err());

        sim.memory.free_range(a).unwrap();
        let c = sim.memory.allocate_range(30).unwrap();
        assert_eq!(c.offset, 0);
        assert_eq!(sim.memory.allocated(), 70);

        sim.memory.free_range(b).unwrap();
        sim.memory.free_range(c).unwrap();
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn test_double_release_is_rejected() {
        let sim = SimDevice::new(100);
        let range = sim.memory.allocate_range(10).unwrap();
        let scrubber = sim.memory.start_scrubber(&range).unwrap();
        sim.memory.stop_scrubber(scrubber).unwrap();
        assert!(matches!(
            sim.memory.stop_scrubber(scrubber),
            Err(CollabError::UnknownHandle { .. })
        ));
    }

    #[test]
    fn test_transport_keeps_topology() {
        let sim = SimDevice::new(100);
        let transport = sim.transport.clone();
        transport
            .call(RemoteOp::StoreTopology, Bytes::from_static(b"snapshot"))
            .unwrap();
        assert_eq!(transport.call(RemoteOp::FetchTopology, Bytes::new()).unwrap(), "snapshot");

        transport
            .call(RemoteOp::ReplayGpuPartition, Bytes::from(3u32.to_le_bytes().to_vec()))
            .unwrap();
        assert_eq!(transport.replayed(), 1);
        transport
            .call(RemoteOp::DropGpuPartition, Bytes::from(3u32.to_le_bytes().to_vec()))
            .unwrap();
        assert_eq!(transport.replayed(), 0);
    }
}
