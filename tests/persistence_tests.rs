//! Topology persistence across a simulated detach/attach.

use gpu_partd::collab::sim::SimDevice;
use gpu_partd::config::PersistenceConfig;
use gpu_partd::engine::{EngineClass, SharedClasses};
use gpu_partd::partition::{ComputeRequest, PartitionManager, Placement};
use gpu_partd::persist::strategy::{select_strategy, teardown_gpu, RestoreSource};
use gpu_partd::persist::{decode_record, encode_record, PersistError, PersistenceRecord, Platform, RecordStore};
use gpu_partd::topology::{DeviceCatalog, Generation, Shape};

fn attached(sim: &SimDevice) -> PartitionManager {
    let mut mgr = PartitionManager::new(DeviceCatalog::new(Generation::Ga100, 80 << 30, 0), sim.collaborators());
    mgr.set_partitioning(true).unwrap();
    mgr
}

fn persistence(dir: &tempfile::TempDir, zstd: bool) -> PersistenceConfig {
    PersistenceConfig {
        path: dir.path().join("state").join("topology.bin"),
        zstd_compression: zstd,
        ..PersistenceConfig::default()
    }
}

/// Two GPU partitions, the first holding one compute partition.
fn build_topology(mgr: &mut PartitionManager) {
    let half = mgr.create_gpu_partition("half", Placement::Slot(2)).unwrap();
    mgr.create_gpu_partition("quarter", Placement::Auto).unwrap();

    let mut request = ComputeRequest::of_size(Shape::Quarter);
    request.placement = Placement::Span(2);
    request.engines.set(EngineClass::Copy, 1);
    request.engines.set(EngineClass::Nvdec, 1);
    request.shared = SharedClasses::of(&[EngineClass::Nvdec]);
    mgr.create_compute_partition(half, &request).unwrap();
}

fn detach(mgr: &mut PartitionManager) {
    let ids: Vec<_> = mgr.gpu_partitions().map(|gpu| gpu.swizz_id).collect();
    for id in ids {
        teardown_gpu(mgr, id).unwrap();
    }
    mgr.set_partitioning(false).unwrap();
}

#[test]
fn test_reattach_restores_bit_for_bit() {
    for zstd in [true, false] {
        let dir = tempfile::tempdir().unwrap();
        let strategy = select_strategy(Platform::BareMetal, &persistence(&dir, zstd), None).unwrap();

        let sim = SimDevice::new(80 << 30);
        let mut mgr = attached(&sim);
        build_topology(&mut mgr);
        let saved = PersistenceRecord::capture(&mgr);
        strategy.save(&mgr).unwrap();
        detach(&mut mgr);
        assert_eq!(sim.live_handles(), 0);

        // A fresh driver instance on the same device.
        let sim = SimDevice::new(80 << 30);
        let mut mgr = attached(&sim);
        let outcome = strategy.restore(&mut mgr, &["full".to_string()]).unwrap();
        assert_eq!(outcome.source, RestoreSource::Record);
        assert_eq!(outcome.gpu_partitions, vec![2, 3]);

        let restored = PersistenceRecord::capture(&mgr);
        assert_eq!(restored.as_bytes(), saved.as_bytes(), "zstd={zstd}");

        let half = mgr.gpu_partition(2).unwrap();
        let cp = half.computes().next().unwrap();
        assert_eq!(cp.span_start, 2);
        assert_eq!(cp.global_engines.count_class(EngineClass::Nvdec), 1);
        assert!(cp.global_engines.of_class(EngineClass::Nvdec).is_subset(&half.books.shared));
    }
}

#[test]
fn test_save_of_empty_topology_restores_boot() {
    let dir = tempfile::tempdir().unwrap();
    let strategy = select_strategy(Platform::BareMetal, &persistence(&dir, true), None).unwrap();
    let sim = SimDevice::new(80 << 30);
    let mut mgr = attached(&sim);

    strategy.save(&mgr).unwrap();
    let outcome = strategy.restore(&mut mgr, &["eighth".to_string()]).unwrap();
    assert_eq!(outcome.source, RestoreSource::Boot);
    assert_eq!(mgr.gpu_partitions().count(), 1);
}

#[test]
fn test_corrupt_record_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = persistence(&dir, true);
    let strategy = select_strategy(Platform::BareMetal, &config, None).unwrap();

    let sim = SimDevice::new(80 << 30);
    let mut mgr = attached(&sim);
    build_topology(&mut mgr);
    strategy.save(&mgr).unwrap();
    detach(&mut mgr);

    let mut data = std::fs::read(&config.path).unwrap();
    data[0] = b'X';
    std::fs::write(&config.path, &data).unwrap();

    let mut mgr = attached(&sim);
    assert!(matches!(
        strategy.restore(&mut mgr, &[]),
        Err(PersistError::BadMagic(_))
    ));
    assert_eq!(mgr.gpu_partitions().count(), 0);
}

#[test]
fn test_compressed_and_plain_frames_decode_alike() {
    let sim = SimDevice::new(80 << 30);
    let mut mgr = attached(&sim);
    build_topology(&mut mgr);
    let record = PersistenceRecord::capture(&mgr);

    let plain = encode_record(&record, None).unwrap();
    let packed = encode_record(&record, Some(19)).unwrap();
    assert!(packed.len() < plain.len());
    assert_eq!(decode_record(&plain).unwrap(), record);
    assert_eq!(decode_record(&packed).unwrap(), record);

    // A store without compression still reads a compressed file.
    let dir = tempfile::tempdir().unwrap();
    RecordStore::new(dir.path().join("a.bin"), Some(3)).write(&record).unwrap();
    let read = RecordStore::new(dir.path().join("a.bin"), None).read().unwrap();
    assert_eq!(read, Some(record));
}
