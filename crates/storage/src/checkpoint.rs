//! Checkpoint files
//!
//! A checkpoint is a MessagePack image of every committed table:
//!
//! ```text
//! ┌────────────────┬──────────────┬──────────────┬─────────────────────┐
//! │ Magic (4 bytes)│ Version (u16)│ CRC-32 (u32) │ rmp-serde payload   │
//! └────────────────┴──────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! The file is written to a temporary sibling and renamed into place.

use crate::engine::{MemoryEngine, TableRows};
use crate::error::{StorageError, StorageResult};
use replicore_core::{Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const MAGIC: &[u8; 4] = b"RPCK";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 10;

#[derive(Serialize, Deserialize)]
struct Image {
    tables: BTreeMap<String, Vec<Row>>,
}

impl MemoryEngine {
    /// Write committed state to `path`
    pub fn checkpoint(&self, path: &Path) -> StorageResult<()> {
        let image = Image {
            tables: self
                .snapshot()
                .into_iter()
                .map(|(name, rows)| (name, rows.into_values().collect()))
                .collect(),
        };
        let payload = rmp_serde::to_vec(&image)?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        bytes.extend_from_slice(&payload);

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        info!(target: "replicore::storage", path = %path.display(), tables = image.tables.len(), "checkpoint written");
        Ok(())
    }

    /// Load an engine from a checkpoint written by [`MemoryEngine::checkpoint`]
    pub fn open(path: &Path, lock_wait_timeout: Duration) -> StorageResult<Self> {
        let bytes = fs::read(path)?;
        if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
            return Err(StorageError::Corruption("not a checkpoint file".to_string()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported checkpoint version {}",
                version
            )));
        }
        let stored = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let payload = &bytes[HEADER_LEN..];
        if crc32fast::hash(payload) != stored {
            return Err(StorageError::Corruption("checkpoint checksum mismatch".to_string()));
        }

        let image: Image = rmp_serde::from_slice(payload)?;
        let tables = image.tables.into_iter().map(|(name, rows)| {
            let rows: TableRows = rows
                .into_iter()
                .map(|row| (row.first().cloned().unwrap_or(Value::Null), row))
                .collect();
            (name, rows)
        });
        let engine = MemoryEngine::with_tables(lock_wait_timeout, tables);
        info!(target: "replicore::storage", path = %path.display(), "checkpoint loaded");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TrxOptions;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.ckpt");

        let engine = MemoryEngine::new(Duration::from_millis(50));
        engine.create_table("t", false).unwrap();
        engine.create_table("empty", false).unwrap();
        let trx = engine.begin(TrxOptions::default());
        engine.insert(trx, "t", vec![Value::Int(1), Value::from("a")]).unwrap();
        engine.insert(trx, "t", vec![Value::Int(2), Value::Bytes(vec![0, 1])]).unwrap();
        engine.commit(trx, false).unwrap();
        // uncommitted rows stay out of the image
        let open = engine.begin(TrxOptions::default());
        engine.insert(open, "t", vec![Value::Int(3)]).unwrap();

        engine.checkpoint(&path).unwrap();
        let reopened = MemoryEngine::open(&path, Duration::from_millis(50)).unwrap();
        assert_eq!(reopened.table_names(), vec!["empty".to_string(), "t".to_string()]);
        assert_eq!(reopened.scan("t").unwrap(), engine.scan("t").unwrap());
    }

    #[test]
    fn test_corrupted_checkpoint_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.ckpt");
        let engine = MemoryEngine::new(Duration::from_millis(50));
        engine.create_table("t", false).unwrap();
        engine.checkpoint(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = MemoryEngine::open(&path, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_not_a_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk");
        fs::write(&path, b"hello world").unwrap();
        assert!(matches!(
            MemoryEngine::open(&path, Duration::from_millis(50)),
            Err(StorageError::Corruption(_))
        ));
    }
}
