//! sled-backed store.
//!
//! Two trees live in one database:
//!
//! - `state`: checkpoint key-value pairs, keyed by UTF-8 key
//! - `log`: stream records, keyed by `stream ++ 0x00 ++ offset (u64 big-endian)`
//!
//! Big-endian offsets make sled's byte ordering equal to append order within a
//! stream, so reading a stream is a single prefix scan.

use std::path::Path;
use tracing::{debug, error};

use super::DurableStore;
use crate::error::{FleetError, Result};
use crate::telemetry::StorageMetrics;

const STATE_TREE: &str = "state";
const LOG_TREE: &str = "log";
const STREAM_SEPARATOR: u8 = 0;

/// Persistent [`DurableStore`] on local disk.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    state: sled::Tree,
    log: sled::Tree,
    flush_on_write: bool,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("state_entries", &self.state.len())
            .field("log_entries", &self.log.len())
            .field("flush_on_write", &self.flush_on_write)
            .finish()
    }
}

fn stream_prefix(stream: &str) -> Result<Vec<u8>> {
    if stream.as_bytes().contains(&STREAM_SEPARATOR) {
        return Err(FleetError::invalid_field("stream", "must not contain NUL bytes"));
    }
    let mut prefix = Vec::with_capacity(stream.len() + 1);
    prefix.extend_from_slice(stream.as_bytes());
    prefix.push(STREAM_SEPARATOR);
    Ok(prefix)
}

fn record_key(prefix: &[u8], offset: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&offset.to_be_bytes());
    key
}

fn decode_offset(key: &[u8], prefix_len: usize) -> Result<u64> {
    let bytes: [u8; 8] = key
        .get(prefix_len..)
        .and_then(|tail| tail.try_into().ok())
        .ok_or_else(|| FleetError::storage("read_stream", "malformed record key"))?;
    Ok(u64::from_be_bytes(bytes))
}

impl SledStore {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, flush_on_write: bool) -> Result<Self> {
        let db = sled::open(path)?;
        let state = db.open_tree(STATE_TREE)?;
        let log = db.open_tree(LOG_TREE)?;
        debug!(
            state_entries = state.len(),
            log_entries = log.len(),
            "sled storage opened"
        );
        Ok(Self {
            db,
            state,
            log,
            flush_on_write,
        })
    }

    fn after_write(&self, operation: &'static str) -> Result<()> {
        if self.flush_on_write {
            self.db.flush().map_err(|e| {
                StorageMetrics::failure(operation);
                FleetError::from(e)
            })?;
        }
        Ok(())
    }

    /// Undo a write whose flush failed so the failed call leaves nothing
    /// behind for a later flush to persist.
    fn roll_back(&self, tree: &sled::Tree, key: &[u8], previous: Option<sled::IVec>) {
        let undone = match previous {
            Some(value) => tree.insert(key, value).map(|_| ()),
            None => tree.remove(key).map(|_| ()),
        };
        if let Err(e) = undone {
            error!(error = %e, "Rolling back unflushed write failed");
        }
    }
}

impl DurableStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let previous = self.state.insert(key.as_bytes(), value).map_err(|e| {
            StorageMetrics::failure("put");
            FleetError::from(e)
        })?;
        self.after_write("put").map_err(|e| {
            self.roll_back(&self.state, key.as_bytes(), previous);
            e
        })
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.state
            .scan_prefix(prefix.as_bytes())
            .map(|item| -> Result<(String, Vec<u8>)> {
                let (key, value) = item?;
                let key = String::from_utf8(key.to_vec())
                    .map_err(|e| FleetError::storage("scan_prefix", e.to_string()))?;
                Ok((key, value.to_vec()))
            })
            .collect()
    }

    /// Callers serialize appends per stream, so reading the tail and
    /// inserting after it cannot race with another append to the same stream.
    fn append(&self, stream: &str, record: &[u8]) -> Result<u64> {
        let prefix = stream_prefix(stream)?;
        let last = match self.log.scan_prefix(&prefix).next_back() {
            Some(item) => {
                let (key, _) = item?;
                decode_offset(&key, prefix.len())?
            }
            None => 0,
        };
        let offset = last + 1;

        let key = record_key(&prefix, offset);
        self.log.insert(key.as_slice(), record).map_err(|e| {
            StorageMetrics::failure("append");
            FleetError::from(e)
        })?;
        self.after_write("append").map_err(|e| {
            self.roll_back(&self.log, &key, None);
            e
        })?;
        Ok(offset)
    }

    fn read_stream(&self, stream: &str) -> Result<Vec<(u64, Vec<u8>)>> {
        let prefix = stream_prefix(stream)?;
        self.log
            .scan_prefix(&prefix)
            .map(|item| -> Result<(u64, Vec<u8>)> {
                let (key, value) = item?;
                Ok((decode_offset(&key, prefix.len())?, value.to_vec()))
            })
            .collect()
    }

    fn streams(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for item in self.log.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            let Some(end) = key.iter().position(|b| *b == STREAM_SEPARATOR) else {
                continue;
            };
            let name = String::from_utf8_lossy(&key[..end]);
            if names.last().map(|last| last.as_str()) != Some(name.as_ref()) {
                names.push(name.into_owned());
            }
        }
        Ok(names)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path(), true).unwrap();
            assert_eq!(store.append("task/T1", b"a").unwrap(), 1);
            assert_eq!(store.append("task/T1", b"b").unwrap(), 2);
            assert_eq!(store.append("task/T10", b"c").unwrap(), 1);
            store.put("state/robot/r1", b"{}").unwrap();
        }

        let store = SledStore::open(dir.path(), true).unwrap();
        let records = store.read_stream("task/T1").unwrap();
        assert_eq!(records, vec![(1, b"a".to_vec()), (2, b"b".to_vec())]);
        assert_eq!(store.append("task/T1", b"d").unwrap(), 3);
        assert_eq!(store.get("state/robot/r1").unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.streams("task/").unwrap(), vec!["task/T1", "task/T10"]);
    }

    #[test]
    fn test_offsets_order_past_255() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path(), false).unwrap();
        for i in 0..300u32 {
            store.append("fleet/f1", &i.to_be_bytes()).unwrap();
        }
        let records = store.read_stream("fleet/f1").unwrap();
        assert_eq!(records.len(), 300);
        assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(records[299].1, 299u32.to_be_bytes().to_vec());
    }

    #[test]
    fn test_nul_in_stream_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path(), false).unwrap();
        assert!(store.append("task/\0bad", b"x").is_err());
    }
}
