//! Prometheus metrics for the partition service.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::PartitionResult;
use crate::partition::manager::PartitionManager;

/// Registry plus handles to every metric the service exports. Cloning
/// shares the underlying metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    gpu_partitions: IntGauge,
    compute_partitions: IntGauge,
    engines_in_use: IntGauge,
    subscriptions: IntGauge,
    operations: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let gpu_partitions = IntGauge::new("gpu_partd_gpu_partitions", "Active GPU partitions")?;
        let compute_partitions = IntGauge::new("gpu_partd_compute_partitions", "Active compute partitions")?;
        let engines_in_use = IntGauge::new("gpu_partd_engines_in_use", "Engines owned by GPU partitions")?;
        let subscriptions = IntGauge::new("gpu_partd_subscriptions", "Open client subscriptions")?;
        let operations = IntCounterVec::new(
            Opts::new("gpu_partd_operations_total", "Topology operations by outcome"),
            &["op", "outcome"],
        )?;

        registry.register(Box::new(gpu_partitions.clone()))?;
        registry.register(Box::new(compute_partitions.clone()))?;
        registry.register(Box::new(engines_in_use.clone()))?;
        registry.register(Box::new(subscriptions.clone()))?;
        registry.register(Box::new(operations.clone()))?;

        Ok(Self {
            registry,
            gpu_partitions,
            compute_partitions,
            engines_in_use,
            subscriptions,
            operations,
        })
    }

    /// Refresh the gauges from the current topology.
    pub fn observe(&self, manager: &PartitionManager, subscriptions: usize) {
        let gpus = manager.gpu_partitions().count();
        let computes: usize = manager.gpu_partitions().map(|gpu| gpu.active_compute_count()).sum();
        self.gpu_partitions.set(gpus as i64);
        self.compute_partitions.set(computes as i64);
        self.engines_in_use.set(i64::from(manager.engines_in_use().count()));
        self.subscriptions.set(subscriptions as i64);
    }

    /// Count one operation; failures are labelled with the error kind.
    pub fn record<T>(&self, op: &str, result: &PartitionResult<T>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        self.operations.with_label_values(&[op, outcome]).inc();
    }

    pub fn operation_count(&self, op: &str, outcome: &str) -> u64 {
        self.operations.with_label_values(&[op, outcome]).get()
    }

    /// Text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
