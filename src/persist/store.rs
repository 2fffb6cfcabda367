//! Record encoding and the on-disk record file.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! magic "GPRT" | version u32 | flags u32 | payload_len u32 | payload
//! ```
//!
//! Flag bit 0 marks a zstd-compressed payload. The decoded payload is the
//! raw bytes of a [`PersistenceRecord`].

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::persist::record::PersistenceRecord;
use crate::persist::PersistError;

const MAGIC: [u8; 4] = *b"GPRT";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 16;
const FLAG_ZSTD: u32 = 1;

/// Frame a record, compressing it with zstd at `zstd_level` when given.
pub fn encode_record(record: &PersistenceRecord, zstd_level: Option<i32>) -> Result<Bytes, PersistError> {
    let raw = record.as_bytes();
    let (flags, payload) = match zstd_level {
        Some(level) => (FLAG_ZSTD, zstd::encode_all(raw, level)?),
        None => (0, raw.to_vec()),
    };

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&MAGIC);
    buf.put_u32_le(VERSION);
    buf.put_u32_le(flags);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

pub fn decode_record(data: &[u8]) -> Result<PersistenceRecord, PersistError> {
    if data.len() < HEADER_LEN {
        return Err(PersistError::Truncated {
            expected: HEADER_LEN,
            found: data.len(),
        });
    }

    let mut buf = data;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(PersistError::BadMagic(magic));
    }
    let version = buf.get_u32_le();
    if version != VERSION {
        return Err(PersistError::UnsupportedVersion(version));
    }
    let flags = buf.get_u32_le();
    let payload_len = buf.get_u32_le() as usize;
    if buf.remaining() < payload_len {
        return Err(PersistError::Truncated {
            expected: HEADER_LEN + payload_len,
            found: data.len(),
        });
    }

    let payload = &buf[..payload_len];
    let raw = if flags & FLAG_ZSTD != 0 {
        zstd::bulk::decompress(payload, std::mem::size_of::<PersistenceRecord>())?
    } else {
        payload.to_vec()
    };

    bytemuck::try_pod_read_unaligned(&raw).map_err(|_| PersistError::RecordSize {
        expected: std::mem::size_of::<PersistenceRecord>(),
        found: raw.len(),
    })
}

/// The record file on the local host.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
    zstd_level: Option<i32>,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>, zstd_level: Option<i32>) -> Self {
        Self {
            path: path.into(),
            zstd_level,
        }
    }

    pub fn from_config(config: &PersistenceConfig) -> Self {
        let level = config.zstd_compression.then_some(config.zstd_level);
        Self::new(&config.path, level)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the record file. Written to a sibling temp file first, then
    /// renamed over the old one.
    pub fn write(&self, record: &PersistenceRecord) -> Result<(), PersistError> {
        let data = encode_record(record, self.zstd_level)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &self.path)?;

        info!(
            path = %self.path.display(),
            size = data.len(),
            gpu_partitions = record.gpu_partitions().count(),
            "Wrote persistence record"
        );
        Ok(())
    }

    /// Read the record file. A missing file is an empty topology.
    pub fn read(&self) -> Result<Option<PersistenceRecord>, PersistError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No persistence record");
            return Ok(None);
        }
        let data = std::fs::read(&self.path)?;
        let record = decode_record(&data)?;
        debug!(
            path = %self.path.display(),
            gpu_partitions = record.gpu_partitions().count(),
            "Read persistence record"
        );
        Ok(Some(record))
    }
}
