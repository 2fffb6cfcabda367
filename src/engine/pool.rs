//! Engine resource pools.
//!
//! Two levels of bookkeeping:
//! - [`EnginePool`]: the device-wide in-use set that GPU partitions claim from.
//! - [`EngineBooks`]: a GPU partition's exclusive/shared books that its
//!   compute partitions draw from via [`allocate_class_engines`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::bitset::EngineSet;
use crate::engine::class::{EngineClass, SharedClasses};
use crate::error::{PartitionError, PartitionResult};

/// Device-wide set of engines owned by some GPU partition.
#[derive(Debug, Clone, Default)]
pub struct EnginePool {
    in_use: EngineSet,
}

impl EnginePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every engine in `set` as in use. Nothing is mutated if any of
    /// them is already claimed.
    pub fn claim_engines(&mut self, set: &EngineSet) -> PartitionResult<()> {
        let overlap = self.in_use & *set;
        if !overlap.is_empty() {
            return Err(PartitionError::StateConflict(format!(
                "engines {overlap:?} already claimed"
            )));
        }
        self.in_use |= *set;
        debug!(claimed = %set, in_use = %self.in_use, "Claimed engines");
        Ok(())
    }

    pub fn release_engines(&mut self, set: &EngineSet) {
        self.in_use = self.in_use - *set;
        debug!(released = %set, in_use = %self.in_use, "Released engines");
    }

    pub fn in_use(&self) -> &EngineSet {
        &self.in_use
    }

    /// First `count` engines of `class` in `candidates` that nobody owns yet.
    pub fn pick_free(&self, candidates: &EngineSet, class: EngineClass, count: u32) -> PartitionResult<EngineSet> {
        let free = candidates.of_class(class) - self.in_use;
        if free.count() < count {
            return Err(PartitionError::InsufficientResources(format!(
                "{count} {class} engines requested, {} free",
                free.count()
            )));
        }
        Ok(free.iter().take(count as usize).collect())
    }
}

/// Exclusive and shared engine books of one GPU partition, in the device
/// namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineBooks {
    pub exclusive: EngineSet,
    pub shared: EngineSet,
}

/// One per-class slice of a compute partition's engine request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassRequest {
    pub class: EngineClass,
    pub count: u32,
    pub shared: bool,
}

/// Choose `request.count` engines of one class for a compute partition.
///
/// `source` is the parent's engine set; candidates are the members of
/// `source ∩ allocatable` in the requested class. A shared request first
/// reuses engines already in the shared book. The rest come from engines
/// in neither book and are recorded in the book matching the request.
///
/// Chosen engines are written to `out` in the parent-local namespace. The
/// books and `out` are updated only when the full count is found.
pub fn allocate_class_engines(
    source: &EngineSet,
    allocatable: &EngineSet,
    request: ClassRequest,
    out: &mut EngineSet,
    books: &mut EngineBooks,
) -> PartitionResult<()> {
    if request.count == 0 {
        return Ok(());
    }

    let class = request.class;
    let base = class.base();
    let candidates = source.of_class(class);
    let mut shadow = *books;
    let mut chosen = EngineSet::empty();
    let mut allocated = 0;

    if request.shared {
        for (local_idx, id) in candidates.iter().enumerate() {
            if allocated == request.count {
                break;
            }
            if !allocatable.contains(id) || !shadow.shared.contains(id) {
                continue;
            }
            chosen.insert(base + local_idx as u32);
            allocated += 1;
        }
    }

    for (local_idx, id) in candidates.iter().enumerate() {
        if allocated == request.count {
            break;
        }
        if !allocatable.contains(id) || shadow.shared.contains(id) || shadow.exclusive.contains(id) {
            continue;
        }
        if request.shared {
            shadow.shared.insert(id);
        } else {
            shadow.exclusive.insert(id);
        }
        chosen.insert(base + local_idx as u32);
        allocated += 1;
    }

    if allocated != request.count {
        return Err(PartitionError::InsufficientResources(format!(
            "{} {class} engines requested ({}), {allocated} available",
            request.count,
            if request.shared { "shared" } else { "exclusive" }
        )));
    }

    *books = shadow;
    *out |= chosen;
    Ok(())
}

/// Record a previously chosen engine set in the books without choosing
/// anything, as when a compute partition is imported or restored.
///
/// Returns the updated books; fails with `StateConflict` if an exclusive
/// engine is already held, or a shared engine is held exclusively.
pub fn claim_verbatim(books: &EngineBooks, engines: &EngineSet, shared: SharedClasses) -> PartitionResult<EngineBooks> {
    let mut next = *books;
    for id in engines.iter() {
        let is_shared = EngineClass::of(id).is_some_and(|class| shared.contains(class));
        let taken = if is_shared {
            next.exclusive.contains(id)
        } else {
            next.exclusive.contains(id) || next.shared.contains(id)
        };
        if taken {
            return Err(PartitionError::StateConflict(format!("engine {id} already claimed")));
        }
        if is_shared {
            next.shared.insert(id);
        } else {
            next.exclusive.insert(id);
        }
    }
    Ok(next)
}

/// Dense mask numbering each class of `engines` from the class base.
pub fn local_engine_mask(engines: &EngineSet) -> EngineSet {
    let mut local = EngineSet::empty();
    for class in EngineClass::ALL {
        let n = engines.count_class(class);
        local.set_range(class.base()..class.base() + n);
    }
    local
}

/// Return a departing compute partition's engines to its parent's books.
///
/// `engines` and `siblings` are in the device namespace. Exclusive claims
/// are dropped unconditionally; a shared engine leaves the shared book only
/// when no remaining sibling still holds it.
pub fn release_compute_engines(books: &mut EngineBooks, engines: &EngineSet, siblings: &EngineSet) {
    books.exclusive = books.exclusive - *engines;
    let orphaned = *engines - *siblings;
    books.shared = books.shared - orphaned;
}
