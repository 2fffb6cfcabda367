//! Engine classes and the identifier layout they occupy.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Engine identifier. The same numbering is used in every namespace
/// (device-global, GPU-partition-local, compute-partition-local).
pub type EngineId = u32;

/// Width of the engine identifier space.
pub const MAX_ENGINES: u32 = 128;

/// First identifier not owned by any partitionable class.
pub const FIRST_NON_PARTITIONABLE: EngineId = 39;

/// A class of independently schedulable functional unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineClass {
    Gr,
    Copy,
    Nvdec,
    Nvenc,
    Nvjpg,
    Ofa,
}

impl EngineClass {
    pub const ALL: [EngineClass; 6] = [
        EngineClass::Gr,
        EngineClass::Copy,
        EngineClass::Nvdec,
        EngineClass::Nvenc,
        EngineClass::Nvjpg,
        EngineClass::Ofa,
    ];

    /// Identifier range reserved for this class.
    pub const fn range(self) -> Range<EngineId> {
        match self {
            EngineClass::Gr => 0..8,
            EngineClass::Copy => 8..18,
            EngineClass::Nvdec => 18..26,
            EngineClass::Nvenc => 26..30,
            EngineClass::Nvjpg => 30..38,
            EngineClass::Ofa => 38..39,
        }
    }

    /// First identifier of the class.
    pub const fn base(self) -> EngineId {
        self.range().start
    }

    /// Class owning `id`, or `None` for non-partitionable engines.
    pub fn of(id: EngineId) -> Option<EngineClass> {
        Self::ALL.into_iter().find(|c| c.range().contains(&id))
    }

    /// Bit in the per-class sharing flags word.
    pub const fn share_bit(self) -> u32 {
        match self {
            EngineClass::Gr => 0,
            EngineClass::Copy => 1 << 0,
            EngineClass::Nvdec => 1 << 1,
            EngineClass::Nvenc => 1 << 2,
            EngineClass::Nvjpg => 1 << 3,
            EngineClass::Ofa => 1 << 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EngineClass::Gr => "gr",
            EngineClass::Copy => "copy",
            EngineClass::Nvdec => "nvdec",
            EngineClass::Nvenc => "nvenc",
            EngineClass::Nvjpg => "nvjpg",
            EngineClass::Ofa => "ofa",
        }
    }
}

impl fmt::Display for EngineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-class "may be shared with siblings" flags of a compute partition.
///
/// Graphics engines are never shared, so [`EngineClass::Gr`] has no bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedClasses(pub u32);

impl SharedClasses {
    pub const NONE: SharedClasses = SharedClasses(0);

    pub fn of(classes: &[EngineClass]) -> Self {
        Self(classes.iter().fold(0, |acc, c| acc | c.share_bit()))
    }

    pub fn contains(self, class: EngineClass) -> bool {
        let bit = class.share_bit();
        bit != 0 && self.0 & bit != 0
    }
}

/// Requested or provisioned engine counts, one per class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCounts {
    #[serde(default)]
    pub gr: u32,
    #[serde(default)]
    pub copy: u32,
    #[serde(default)]
    pub nvdec: u32,
    #[serde(default)]
    pub nvenc: u32,
    #[serde(default)]
    pub nvjpg: u32,
    #[serde(default)]
    pub ofa: u32,
}

impl EngineCounts {
    pub fn get(&self, class: EngineClass) -> u32 {
        match class {
            EngineClass::Gr => self.gr,
            EngineClass::Copy => self.copy,
            EngineClass::Nvdec => self.nvdec,
            EngineClass::Nvenc => self.nvenc,
            EngineClass::Nvjpg => self.nvjpg,
            EngineClass::Ofa => self.ofa,
        }
    }

    pub fn set(&mut self, class: EngineClass, count: u32) {
        match class {
            EngineClass::Gr => self.gr = count,
            EngineClass::Copy => self.copy = count,
            EngineClass::Nvdec => self.nvdec = count,
            EngineClass::Nvenc => self.nvenc = count,
            EngineClass::Nvjpg => self.nvjpg = count,
            EngineClass::Ofa => self.ofa = count,
        }
    }
}
