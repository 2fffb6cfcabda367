//! Fixed-width engine bit-set and positional namespace translation.
//!
//! An [`EngineSet`] is the only representation of "a group of engines" in
//! the crate. Device-global, GPU-partition-local and compute-partition-local
//! masks all use it; [`translate`] maps an engine between two sets by ordinal
//! position within its class.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not, Range, Sub};

use serde::{Deserialize, Serialize};

use crate::engine::class::{EngineClass, EngineCounts, EngineId, MAX_ENGINES};
use crate::error::{PartitionError, PartitionResult};

const WORDS: usize = (MAX_ENGINES as usize) / 64;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineSet([u64; WORDS]);

impl EngineSet {
    pub const fn empty() -> Self {
        Self([0; WORDS])
    }

    pub const fn from_raw(words: [u64; WORDS]) -> Self {
        Self(words)
    }

    pub const fn raw(&self) -> [u64; WORDS] {
        self.0
    }

    pub fn from_ids<I: IntoIterator<Item = EngineId>>(ids: I) -> Self {
        let mut set = Self::empty();
        for id in ids {
            set.insert(id);
        }
        set
    }

    /// Set containing every identifier in `range`.
    pub fn from_range(range: Range<EngineId>) -> Self {
        let mut set = Self::empty();
        set.set_range(range);
        set
    }

    pub fn insert(&mut self, id: EngineId) {
        debug_assert!(id < MAX_ENGINES);
        self.0[(id / 64) as usize] |= 1u64 << (id % 64);
    }

    pub fn remove(&mut self, id: EngineId) {
        debug_assert!(id < MAX_ENGINES);
        self.0[(id / 64) as usize] &= !(1u64 << (id % 64));
    }

    pub fn contains(&self, id: EngineId) -> bool {
        id < MAX_ENGINES && self.0[(id / 64) as usize] & (1u64 << (id % 64)) != 0
    }

    pub fn set_range(&mut self, range: Range<EngineId>) {
        for id in range.start..range.end.min(MAX_ENGINES) {
            self.insert(id);
        }
    }

    pub fn clear(&mut self) {
        self.0 = [0; WORDS];
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    pub fn union(&self, other: &Self) -> Self {
        *self | *other
    }

    pub fn intersection(&self, other: &Self) -> Self {
        *self & *other
    }

    pub fn difference(&self, other: &Self) -> Self {
        *self - *other
    }

    pub fn complement(&self) -> Self {
        !*self
    }

    pub fn is_subset(&self, other: &Self) -> bool {
        (*self - *other).is_empty()
    }

    pub fn is_disjoint(&self, other: &Self) -> bool {
        (*self & *other).is_empty()
    }

    /// Members of this set that fall inside `class`'s identifier range.
    pub fn of_class(&self, class: EngineClass) -> Self {
        *self & Self::from_range(class.range())
    }

    /// Number of members of `class`.
    pub fn count_class(&self, class: EngineClass) -> u32 {
        self.of_class(class).count()
    }

    /// Per-class member counts.
    pub fn counts(&self) -> EngineCounts {
        let mut counts = EngineCounts::default();
        for class in EngineClass::ALL {
            counts.set(class, self.count_class(class));
        }
        counts
    }

    /// The `n`-th (zero-based) set bit in ascending order.
    pub fn nth_set_bit(&self, n: u32) -> Option<EngineId> {
        let mut remaining = n;
        for (idx, word) in self.0.iter().enumerate() {
            let ones = word.count_ones();
            if remaining < ones {
                let mut w = *word;
                for _ in 0..remaining {
                    w &= w - 1;
                }
                return Some(idx as u32 * 64 + w.trailing_zeros());
            }
            remaining -= ones;
        }
        None
    }

    /// Number of set bits strictly below `id`.
    pub fn rank(&self, id: EngineId) -> u32 {
        let mut below = Self::empty();
        below.set_range(0..id);
        (*self & below).count()
    }

    pub fn iter(&self) -> EngineIter {
        EngineIter {
            words: self.0,
            word: 0,
        }
    }
}

pub struct EngineIter {
    words: [u64; WORDS],
    word: usize,
}

impl Iterator for EngineIter {
    type Item = EngineId;

    fn next(&mut self) -> Option<EngineId> {
        while self.word < WORDS {
            let w = self.words[self.word];
            if w != 0 {
                let bit = w.trailing_zeros();
                self.words[self.word] &= w - 1;
                return Some(self.word as u32 * 64 + bit);
            }
            self.word += 1;
        }
        None
    }
}

impl FromIterator<EngineId> for EngineSet {
    fn from_iter<I: IntoIterator<Item = EngineId>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}

impl BitOr for EngineSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self([self.0[0] | rhs.0[0], self.0[1] | rhs.0[1]])
    }
}

impl BitOrAssign for EngineSet {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl BitAnd for EngineSet {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self([self.0[0] & rhs.0[0], self.0[1] & rhs.0[1]])
    }
}

impl BitAndAssign for EngineSet {
    fn bitand_assign(&mut self, rhs: Self) {
        *self = *self & rhs;
    }
}

impl Sub for EngineSet {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self & !rhs
    }
}

impl Not for EngineSet {
    type Output = Self;
    fn not(self) -> Self {
        Self([!self.0[0], !self.0[1]])
    }
}

impl fmt::Debug for EngineSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for EngineSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}{:016x}", self.0[1], self.0[0])
    }
}

/// Map `id`, a member of `src`, to the member of `dst` at the same ordinal
/// position within `id`'s class.
///
/// Non-partitionable identifiers map to themselves. Fails with `NotFound`
/// when `id` is not in `src` or when the two sets hold a different number
/// of engines of that class.
pub fn translate(src: &EngineSet, id: EngineId, dst: &EngineSet) -> PartitionResult<EngineId> {
    let Some(class) = EngineClass::of(id) else {
        return Ok(id);
    };

    if !src.contains(id) {
        return Err(PartitionError::NotFound(format!(
            "engine {id} is not a member of the source set"
        )));
    }

    let src_class = src.of_class(class);
    let dst_class = dst.of_class(class);
    if src_class.count() != dst_class.count() {
        return Err(PartitionError::NotFound(format!(
            "{class} engine counts differ between namespaces ({} vs {})",
            src_class.count(),
            dst_class.count()
        )));
    }

    dst_class
        .nth_set_bit(src_class.rank(id))
        .ok_or_else(|| PartitionError::Internal(format!("no ordinal match for engine {id}")))
}

/// Translate every member of `ids` from the `src` namespace into `dst`.
pub fn translate_set(src: &EngineSet, ids: &EngineSet, dst: &EngineSet) -> PartitionResult<EngineSet> {
    ids.iter().map(|id| translate(src, id, dst)).collect()
}
