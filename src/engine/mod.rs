//! Engine model: identifiers, bit-sets and resource pools.
//!
//! - [`class`]: Engine classes and their identifier ranges
//! - [`bitset`]: Fixed-width engine set and namespace translation
//! - [`inventory`]: Immutable per-device engine inventory
//! - [`pool`]: Device-wide claims and per-partition exclusive/shared books

pub mod bitset;
pub mod class;
pub mod inventory;
pub mod pool;

pub use bitset::{translate, translate_set, EngineSet};
pub use class::{EngineClass, EngineCounts, EngineId, SharedClasses};
pub use inventory::DeviceEngineInventory;
pub use pool::{ClassRequest, EngineBooks, EnginePool};
