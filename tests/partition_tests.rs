//! Partition core scenarios against the simulated device.

use gpu_partd::collab::sim::SimDevice;
use gpu_partd::engine::{translate_set, EngineClass, EngineCounts, EngineSet, SharedClasses};
use gpu_partd::error::PartitionError;
use gpu_partd::partition::{ComputeRequest, PartitionManager, Placement};
use gpu_partd::topology::tree::{bit, slots};
use gpu_partd::topology::{DeviceCatalog, Generation, Shape, COMPUTE_TREE, GPU_TREE};

fn manager(generation: Generation) -> (SimDevice, PartitionManager) {
    let sim = SimDevice::new(80 << 30);
    let mut mgr = PartitionManager::new(DeviceCatalog::new(generation, 80 << 30, 0), sim.collaborators());
    mgr.set_partitioning(true).unwrap();
    (sim, mgr)
}

fn quarter_with_shared_copy() -> ComputeRequest {
    let mut request = ComputeRequest::of_size(Shape::Quarter);
    let mut engines = EngineCounts::default();
    engines.set(EngineClass::Copy, 1);
    request.engines = engines;
    request.shared = SharedClasses::of(&[EngineClass::Copy]);
    request
}

#[test]
fn test_two_halves_fill_the_device() {
    let (_sim, mut mgr) = manager(Generation::Ga100);

    let first = mgr.create_gpu_partition("half", Placement::Auto).unwrap();
    assert!(first == 1 || first == 2);
    let gpu = mgr.gpu_partition(first).unwrap();
    assert_eq!(gpu.engines.count_class(EngineClass::Gr), 4);

    let second = mgr.create_gpu_partition("half", Placement::Auto).unwrap();
    assert_eq!(first + second, 3, "the halves take both of 1 and 2");
    assert_eq!(mgr.gpu_partition(second).unwrap().engines.count_class(EngineClass::Gr), 4);
    assert!(mgr
        .gpu_partition(first)
        .unwrap()
        .engines
        .is_disjoint(&mgr.gpu_partition(second).unwrap().engines));

    for profile in ["half", "full"] {
        assert!(matches!(
            mgr.create_gpu_partition(profile, Placement::Auto),
            Err(PartitionError::InsufficientResources(_))
        ));
    }
    assert_eq!(mgr.gpu_partitions().count(), 2);
}

#[test]
fn test_shared_copy_engine_outlives_first_user() {
    let (_sim, mut mgr) = manager(Generation::Ga100);
    let swizz = mgr.create_gpu_partition("half", Placement::Auto).unwrap();

    let a = mgr.create_compute_partition(swizz, &quarter_with_shared_copy()).unwrap();
    let b = mgr.create_compute_partition(swizz, &quarter_with_shared_copy()).unwrap();

    let gpu = mgr.gpu_partition(swizz).unwrap();
    let copy_a = gpu.compute(a).unwrap().global_engines.of_class(EngineClass::Copy);
    let copy_b = gpu.compute(b).unwrap().global_engines.of_class(EngineClass::Copy);
    assert_eq!(copy_a.count(), 1);
    assert_eq!(copy_a, copy_b, "the second request reuses the shared engine");
    assert!(copy_a.is_subset(&gpu.books.shared));

    mgr.delete_compute_partition(swizz, a).unwrap();
    let gpu = mgr.gpu_partition(swizz).unwrap();
    assert!(gpu.compute(a).is_err());
    assert!(copy_a.is_subset(&gpu.books.shared), "sibling still holds it");
    assert!(copy_a.is_subset(&gpu.compute(b).unwrap().global_engines));

    mgr.delete_compute_partition(swizz, b).unwrap();
    let gpu = mgr.gpu_partition(swizz).unwrap();
    assert!(gpu.books.shared.is_disjoint(&copy_a));
    assert!(gpu.books.exclusive.is_empty());
    assert_eq!(gpu.cts_in_use, 0);
}

#[test]
fn test_exclusive_engines_are_not_shared() {
    let (_sim, mut mgr) = manager(Generation::Ga100);
    let swizz = mgr.create_gpu_partition("quarter", Placement::Auto).unwrap();

    let mut request = ComputeRequest::of_size(Shape::Eighth);
    request.engines.set(EngineClass::Copy, 2);
    mgr.create_compute_partition(swizz, &request).unwrap();

    // The quarter has two copy engines and both are now exclusive.
    assert!(matches!(
        mgr.create_compute_partition(swizz, &request),
        Err(PartitionError::InsufficientResources(_))
    ));
    assert_eq!(mgr.gpu_partition(swizz).unwrap().active_compute_count(), 1);
}

#[test]
fn test_create_then_destroy_restores_initial_state() {
    let (sim, mut mgr) = manager(Generation::Gh100);
    let swizz_before = mgr.swizz_in_use();
    let engines_before = *mgr.engines_in_use();

    let half = mgr.create_gpu_partition("half", Placement::Auto).unwrap();
    let eighth = mgr.create_gpu_partition("eighth+me", Placement::Auto).unwrap();
    let cp = mgr
        .create_compute_partition(half, &ComputeRequest::of_size(Shape::Quarter))
        .unwrap();

    mgr.delete_compute_partition(half, cp).unwrap();
    mgr.invalidate_gpu_partition(eighth).unwrap();
    mgr.invalidate_gpu_partition(half).unwrap();

    assert_eq!(mgr.swizz_in_use(), swizz_before);
    assert_eq!(*mgr.engines_in_use(), engines_before);
    assert_eq!(sim.live_handles(), 0);
    assert_eq!(sim.memory.allocated(), 0);
}

#[test]
fn test_allocation_is_deterministic() {
    let run = || {
        let (_sim, mut mgr) = manager(Generation::Ga100);
        let mut out = Vec::new();
        for profile in ["quarter", "eighth", "eighth+me", "quarter"] {
            let swizz = mgr.create_gpu_partition(profile, Placement::Auto).unwrap();
            out.push((swizz, mgr.gpu_partition(swizz).unwrap().engines));
        }
        out
    };
    assert_eq!(run(), run());
}

#[test]
fn test_conflicts_are_span_overlaps() {
    for tree in [&GPU_TREE, &COMPUTE_TREE] {
        for a in slots(tree.all_slots()) {
            for b in slots(tree.all_slots()) {
                let (sa, sb) = (tree.slice_span(a), tree.slice_span(b));
                let overlap = sa.start < sb.end && sb.start < sa.end;
                assert_eq!(
                    tree.conflict_mask(a) & bit(b) != 0,
                    overlap,
                    "{} tree: {a} vs {b}",
                    tree.name()
                );
            }
        }
    }
}

#[test]
fn test_compute_engines_translate_both_ways() {
    let (_sim, mut mgr) = manager(Generation::Ga100);
    // Quarter 4 sits in slices 2..4, so its local engines differ from the
    // device IDs.
    let swizz = mgr.create_gpu_partition("quarter", Placement::Slot(4)).unwrap();
    let mut request = ComputeRequest::of_size(Shape::Eighth);
    request.engines.set(EngineClass::Copy, 1);
    let id = mgr.create_compute_partition(swizz, &request).unwrap();

    let gpu = mgr.gpu_partition(swizz).unwrap();
    let cp = gpu.compute(id).unwrap();
    let global = translate_set(&gpu.local_engines, &cp.engines, &gpu.engines).unwrap();
    assert_eq!(global, cp.global_engines);
    assert_eq!(translate_set(&gpu.engines, &global, &gpu.local_engines).unwrap(), cp.engines);

    let gr: EngineSet = global.of_class(EngineClass::Gr);
    assert!(gr.iter().all(|id| (2..4).contains(&id)));
}

#[test]
fn test_compute_placement_by_span() {
    let (_sim, mut mgr) = manager(Generation::Ga100);
    let swizz = mgr.create_gpu_partition("half", Placement::Auto).unwrap();

    let mut request = ComputeRequest::of_size(Shape::Quarter);
    request.placement = Placement::Span(2);
    let id = mgr.create_compute_partition(swizz, &request).unwrap();
    let cp = mgr.gpu_partition(swizz).unwrap().compute(id).unwrap();
    assert_eq!(cp.span_start, 2);
    assert_eq!(cp.cts_id, 6);

    // Misaligned span.
    request.placement = Placement::Span(1);
    assert!(matches!(
        mgr.create_compute_partition(swizz, &request),
        Err(PartitionError::InvalidArgument(_))
    ));
}

#[test]
fn test_export_import_round_trip() {
    let (sim, mut mgr) = manager(Generation::Ga100);
    let swizz = mgr.create_gpu_partition("half", Placement::Auto).unwrap();
    let id = mgr
        .create_compute_partition(swizz, &quarter_with_shared_copy())
        .unwrap();

    let export = mgr.export_compute_partition(swizz, id).unwrap();

    // Importing over the live partition conflicts.
    assert!(mgr.import_compute_partition(swizz, &export).is_err());

    mgr.delete_compute_partition(swizz, id).unwrap();
    let handles = sim.live_handles();
    assert_eq!(mgr.import_compute_partition(swizz, &export).unwrap(), id);
    assert_eq!(mgr.export_compute_partition(swizz, id).unwrap(), export);
    assert!(sim.live_handles() > handles);
}

#[test]
fn test_capacity_counts_engine_supply() {
    let (_sim, mut mgr) = manager(Generation::Ga100);

    // One NVJPG and one OFA on the board.
    let cap = mgr.gpu_capacity("eighth+me").unwrap();
    assert_eq!((cap.available, cap.total), (1, 1));

    mgr.create_gpu_partition("eighth+me", Placement::Auto).unwrap();
    let cap = mgr.gpu_capacity("eighth+me").unwrap();
    assert_eq!((cap.available, cap.total), (0, 1));
    assert!(cap.spans.is_empty());
    assert!(matches!(
        mgr.create_gpu_partition("eighth+me", Placement::Auto),
        Err(PartitionError::InsufficientResources(_))
    ));

    // Plain eighths still fit in the remaining slices.
    let cap = mgr.gpu_capacity("eighth").unwrap();
    assert_eq!((cap.available, cap.total), (7, 8));
}
