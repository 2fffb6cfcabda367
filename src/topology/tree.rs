//! Capacity-tree allocator.
//!
//! A capacity tree is a fixed forest of slot IDs over eight leaf slices of
//! the device. Each level of the tree is a shape (full, half, ...) owning a
//! contiguous ID range. The published per-slice tables below list, for
//! each leaf slice, every slot that covers it; a slot's conflict set is the
//! union of the rows of the slices it covers, which includes the slot
//! itself together with all its ancestors and descendants.
//!
//! The allocator keeps no state. Callers pass the valid mask for their
//! context and the mask of slots already in use.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PartitionError, PartitionResult};

pub type SlotId = u32;

/// Number of leaf slices under the root of every tree.
pub const LEAF_SLICES: u32 = 8;

/// Spatial shape of a slot. GPU and compute trees use a subset each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Full,
    Half,
    MiniHalf,
    Quarter,
    MiniQuarter,
    Eighth,
}

impl Shape {
    pub fn name(self) -> &'static str {
        match self {
            Shape::Full => "full",
            Shape::Half => "half",
            Shape::MiniHalf => "mini_half",
            Shape::Quarter => "quarter",
            Shape::MiniQuarter => "mini_quarter",
            Shape::Eighth => "eighth",
        }
    }
}

const fn mask(ids: &[u32]) -> u64 {
    let mut m = 0u64;
    let mut i = 0;
    while i < ids.len() {
        m |= 1u64 << ids[i];
        i += 1;
    }
    m
}

/// Bit for a single slot.
pub const fn bit(id: SlotId) -> u64 {
    1u64 << id
}

/// Iterate the slot IDs present in `mask`, lowest first.
pub fn slots(mask: u64) -> impl Iterator<Item = SlotId> {
    let mut rest = mask;
    std::iter::from_fn(move || {
        if rest == 0 {
            return None;
        }
        let id = rest.trailing_zeros();
        rest &= rest - 1;
        Some(id)
    })
}

#[derive(Debug)]
pub struct CapacityTree {
    name: &'static str,
    slices: [u64; LEAF_SLICES as usize],
    levels: &'static [(Shape, Range<SlotId>)],
}

/// GPU partition (swizz) tree: IDs 0..=14.
pub static GPU_TREE: CapacityTree = CapacityTree {
    name: "swizz",
    slices: [
        mask(&[0, 1, 3, 7]),
        mask(&[0, 1, 3, 8]),
        mask(&[0, 1, 4, 9]),
        mask(&[0, 1, 4, 10]),
        mask(&[0, 2, 5, 11]),
        mask(&[0, 2, 5, 12]),
        mask(&[0, 2, 6, 13]),
        mask(&[0, 2, 6, 14]),
    ],
    levels: &[
        (Shape::Full, 0..1),
        (Shape::Half, 1..3),
        (Shape::Quarter, 3..7),
        (Shape::Eighth, 7..15),
    ],
};

/// Compute partition (CTS) tree: IDs 0..=20.
pub static COMPUTE_TREE: CapacityTree = CapacityTree {
    name: "cts",
    slices: [
        mask(&[0, 1, 3, 5, 9, 13]),
        mask(&[0, 1, 3, 5, 9, 14]),
        mask(&[0, 1, 3, 6, 10, 15]),
        mask(&[0, 1, 3, 6, 10, 16]),
        mask(&[0, 2, 4, 7, 11, 17]),
        mask(&[0, 2, 4, 7, 11, 18]),
        mask(&[0, 2, 4, 8, 12, 19]),
        mask(&[0, 2, 4, 8, 12, 20]),
    ],
    levels: &[
        (Shape::Full, 0..1),
        (Shape::Half, 1..3),
        (Shape::MiniHalf, 3..5),
        (Shape::Quarter, 5..9),
        (Shape::MiniQuarter, 9..13),
        (Shape::Eighth, 13..21),
    ],
};

impl CapacityTree {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Every slot ID in the tree.
    pub fn all_slots(&self) -> u64 {
        self.slices.iter().fold(0, |acc, s| acc | s)
    }

    pub fn contains_shape(&self, shape: Shape) -> bool {
        self.levels.iter().any(|(s, _)| *s == shape)
    }

    /// Shapes of this tree, largest first.
    pub fn shapes(&self) -> impl Iterator<Item = Shape> + '_ {
        self.levels.iter().map(|(s, _)| *s)
    }

    pub fn level_range(&self, shape: Shape) -> PartitionResult<Range<SlotId>> {
        self.levels
            .iter()
            .find(|(s, _)| *s == shape)
            .map(|(_, r)| r.clone())
            .ok_or_else(|| {
                PartitionError::NotSupported(format!("{} tree has no {} level", self.name, shape.name()))
            })
    }

    /// Mask of every slot at `shape`'s level.
    pub fn level_mask(&self, shape: Shape) -> PartitionResult<u64> {
        let range = self.level_range(shape)?;
        Ok(range.fold(0, |acc, id| acc | bit(id)))
    }

    /// Slots that become illegal once `id` is claimed, `id` included.
    pub fn conflict_mask(&self, id: SlotId) -> u64 {
        if id >= 64 {
            return 0;
        }
        self.slices
            .iter()
            .filter(|s| *s & bit(id) != 0)
            .fold(0, |acc, s| acc | s)
    }

    /// Union of the conflict sets of every slot in `in_use`.
    pub fn blocked_by(&self, in_use: u64) -> u64 {
        slots(in_use).fold(0, |acc, id| acc | self.conflict_mask(id))
    }

    /// Leaf slices covered by `id`.
    pub fn slice_span(&self, id: SlotId) -> Range<u32> {
        let covered: Vec<u32> = (0..LEAF_SLICES)
            .filter(|i| self.slices[*i as usize] & bit(id) != 0)
            .collect();
        match (covered.first(), covered.last()) {
            (Some(lo), Some(hi)) => *lo..*hi + 1,
            _ => 0..0,
        }
    }

    /// Shape level owning `id`.
    pub fn slot_to_shape(&self, id: SlotId) -> PartitionResult<Shape> {
        self.levels
            .iter()
            .find(|(_, r)| r.contains(&id))
            .map(|(s, _)| *s)
            .ok_or_else(|| PartitionError::InvalidArgument(format!("{} slot {id} out of range", self.name)))
    }

    /// Pick a free slot of `shape`.
    ///
    /// Among the candidates, the slot whose own conflict set leaves the
    /// most other slots available wins; ties go to the lowest ID.
    pub fn get_free_slot(&self, shape: Shape, valid: u64, in_use: u64) -> PartitionResult<SlotId> {
        let available = valid & !self.blocked_by(in_use);
        let candidates = available & self.level_mask(shape)?;

        let mut best: Option<(SlotId, u32)> = None;
        for id in slots(candidates) {
            let remaining = (available & !self.conflict_mask(id)).count_ones();
            if best.map_or(true, |(_, score)| remaining > score) {
                best = Some((id, remaining));
            }
        }

        let (id, remaining) = best.ok_or_else(|| {
            PartitionError::InsufficientResources(format!(
                "no free {} slot for shape {}",
                self.name,
                shape.name()
            ))
        })?;
        debug!(tree = self.name, shape = shape.name(), slot = id, remaining, "Selected free slot");
        Ok(id)
    }

    /// Number of basis slots one node of `shape` spans.
    pub fn slots_per_node(&self, shape: Shape, basis: u64) -> PartitionResult<u32> {
        let lo = self.level_range(shape)?.start;
        Ok((self.conflict_mask(lo) & basis).count_ones())
    }

    /// Translate a span start (in basis units) into the slot of `shape`
    /// beginning there.
    pub fn offset_to_slot(&self, shape: Shape, offset: u32, basis: u64) -> PartitionResult<SlotId> {
        if offset >= basis.count_ones() {
            return Err(PartitionError::InvalidArgument(format!(
                "span start {offset} beyond {} basis slots",
                basis.count_ones()
            )));
        }
        let per_node = self.slots_per_node(shape, basis)?;
        if per_node == 0 || offset % per_node != 0 {
            return Err(PartitionError::InvalidArgument(format!(
                "span start {offset} is not aligned to {} ({per_node} slots per node)",
                shape.name()
            )));
        }
        let range = self.level_range(shape)?;
        let id = range.start + offset / per_node;
        if !range.contains(&id) {
            return Err(PartitionError::InvalidArgument(format!(
                "span start {offset} has no {} slot",
                shape.name()
            )));
        }
        Ok(id)
    }

    /// Span start (in basis units) of `id`.
    pub fn slot_to_offset(&self, id: SlotId, basis: u64) -> PartitionResult<u32> {
        let shape = self.slot_to_shape(id)?;
        let lo = self.level_range(shape)?.start;
        Ok((id - lo) * self.slots_per_node(shape, basis)?)
    }

    /// True iff `id` is valid and not blocked by anything in `in_use`.
    pub fn is_available(&self, valid: u64, in_use: u64, id: SlotId) -> bool {
        id < 64 && valid & bit(id) != 0 && self.blocked_by(in_use) & bit(id) == 0
    }

    /// How many `shape` slots fit given `in_use`, counting greedily.
    pub fn greedy_capacity(&self, shape: Shape, valid: u64, in_use: u64) -> u32 {
        let mut shadow = in_use;
        let mut count = 0;
        while let Ok(id) = self.get_free_slot(shape, valid, shadow) {
            shadow |= bit(id);
            count += 1;
        }
        count
    }
}
