//! Process-local store.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::DurableStore;
use crate::error::{FleetError, Result};

/// In-memory [`DurableStore`]; contents are lost when dropped.
///
/// Write failures can be switched on to exercise storage-failure handling,
/// either before the write or after it has landed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    kv: Mutex<BTreeMap<String, Vec<u8>>>,
    streams: Mutex<BTreeMap<String, Vec<Vec<u8>>>>,
    fail_writes: AtomicBool,
    fail_after_write: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` and `append` fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `put` and `append` store its record and then
    /// report failure, like a flush that fails after the write.
    pub fn set_fail_after_write(&self, fail: bool) {
        self.fail_after_write.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, operation: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FleetError::storage(operation, "writes disabled"));
        }
        Ok(())
    }

    fn acknowledge(&self, operation: &str) -> Result<()> {
        if self.fail_after_write.load(Ordering::SeqCst) {
            return Err(FleetError::storage(operation, "write not acknowledged"));
        }
        Ok(())
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.kv.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_writable("put")?;
        self.kv.lock().insert(key.to_string(), value.to_vec());
        self.acknowledge("put")
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .kv
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn append(&self, stream: &str, record: &[u8]) -> Result<u64> {
        self.check_writable("append")?;
        let offset = {
            let mut streams = self.streams.lock();
            let records = streams.entry(stream.to_string()).or_default();
            records.push(record.to_vec());
            records.len() as u64
        };
        self.acknowledge("append")?;
        Ok(offset)
    }

    fn read_stream(&self, stream: &str) -> Result<Vec<(u64, Vec<u8>)>> {
        Ok(self
            .streams
            .lock()
            .get(stream)
            .map(|records| {
                records
                    .iter()
                    .enumerate()
                    .map(|(i, record)| (i as u64 + 1, record.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn streams(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .streams
            .lock()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_scan() {
        let store = MemoryStore::new();
        store.put("state/robot/a", b"1").unwrap();
        store.put("state/robot/b", b"2").unwrap();
        store.put("state/door/x", b"3").unwrap();

        assert_eq!(store.get("state/robot/a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("missing").unwrap(), None);

        let robots = store.scan_prefix("state/robot/").unwrap();
        assert_eq!(robots.len(), 2);
        assert_eq!(robots[0].0, "state/robot/a");
    }

    #[test]
    fn test_append_offsets_are_per_stream() {
        let store = MemoryStore::new();
        assert_eq!(store.append("task/a", b"x").unwrap(), 1);
        assert_eq!(store.append("task/a", b"y").unwrap(), 2);
        assert_eq!(store.append("task/b", b"z").unwrap(), 1);

        let records = store.read_stream("task/a").unwrap();
        assert_eq!(records, vec![(1, b"x".to_vec()), (2, b"y".to_vec())]);
        assert!(store.read_stream("task/none").unwrap().is_empty());
        assert_eq!(store.streams("task/").unwrap(), vec!["task/a", "task/b"]);
    }

    #[test]
    fn test_fail_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store.append("task/a", b"x").unwrap_err();
        assert!(err.is_retryable());
        assert!(store.put("k", b"v").is_err());
        assert!(store.read_stream("task/a").unwrap().is_empty());

        store.set_fail_writes(false);
        assert_eq!(store.append("task/a", b"x").unwrap(), 1);
    }

    #[test]
    fn test_fail_after_write_keeps_record() {
        let store = MemoryStore::new();
        store.set_fail_after_write(true);
        assert!(store.append("task/a", b"x").is_err());
        assert!(store.put("k", b"v").is_err());
        store.set_fail_after_write(false);

        assert_eq!(store.read_stream("task/a").unwrap(), vec![(1, b"x".to_vec())]);
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.append("task/a", b"y").unwrap(), 2);
    }
}
