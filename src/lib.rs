//! gpu-partd: GPU partition manager.
//!
//! Carves one device into isolated GPU partitions (memory, GPCs and
//! copy/media engines) and subdivides each of those into compute
//! partitions. The topology is saved on detach and rebuilt on attach, so
//! clients see the same partitions across driver reloads.
//!
//! The partition core ([`topology`], [`engine`], [`partition`],
//! [`persist`]) is synchronous. [`control`] and [`server`] put it behind an
//! HTTP control plane.

pub mod collab;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod persist;
pub mod server;
pub mod topology;
