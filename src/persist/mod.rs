//! Topology persistence across detach/attach.
//!
//! - [`record`]: Fixed-size binary snapshot of every active partition
//! - [`store`]: Framed, optionally zstd-compressed encoding and the record file
//! - [`strategy`]: Where the record lives and how restore is carried out,
//!   one implementation per platform

pub mod record;
pub mod store;
pub mod strategy;

use thiserror::Error;

use crate::error::{CollabError, PartitionError};

pub use record::{ComputePartitionSave, GpuPartitionSave, PersistenceRecord};
pub use store::{decode_record, encode_record, RecordStore};
pub use strategy::{select_strategy, PersistenceStrategy, Platform, RestoreOutcome};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad record magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u32),

    #[error("Record truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("Record size mismatch: expected {expected} bytes, found {found}")]
    RecordSize { expected: usize, found: usize },

    #[error("Transport error: {0}")]
    Transport(#[from] CollabError),

    #[error("No transport configured for the {0} platform")]
    NoTransport(&'static str),

    #[error(transparent)]
    Partition(#[from] PartitionError),
}

impl From<PersistError> for PartitionError {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::Partition(inner) => inner,
            other => PartitionError::Internal(other.to_string()),
        }
    }
}
