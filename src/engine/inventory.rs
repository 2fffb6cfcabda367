//! Device engine inventory.
//!
//! Built once from the device generation and never mutated afterwards.

use crate::engine::bitset::EngineSet;
use crate::engine::class::{EngineClass, EngineCounts, EngineId, FIRST_NON_PARTITIONABLE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEngineInventory {
    present: EngineSet,
    partitionable: EngineSet,
}

impl DeviceEngineInventory {
    /// Populate each class from its base identifier, then append
    /// `system_engines` non-partitionable engines.
    pub fn new(counts: EngineCounts, system_engines: u32) -> Self {
        let mut partitionable = EngineSet::empty();
        for class in EngineClass::ALL {
            let width = class.range().len() as u32;
            let n = counts.get(class).min(width);
            partitionable.set_range(class.base()..class.base() + n);
        }

        let mut present = partitionable;
        present.set_range(FIRST_NON_PARTITIONABLE..FIRST_NON_PARTITIONABLE + system_engines);

        Self {
            present,
            partitionable,
        }
    }

    pub fn present(&self) -> &EngineSet {
        &self.present
    }

    pub fn partitionable(&self) -> &EngineSet {
        &self.partitionable
    }

    pub fn is_partitionable(&self, id: EngineId) -> bool {
        self.partitionable.contains(id)
    }

    pub fn count(&self, class: EngineClass) -> u32 {
        self.partitionable.count_class(class)
    }
}
