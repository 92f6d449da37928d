//! Durable storage primitives.
//!
//! Two synchronous primitives back the engine:
//!
//! - a key-value checkpoint area holding the latest accepted record per entity
//! - append-only streams, one per task (`task/<id>`) and one per fleet (`fleet/<name>`)
//!
//! Records are JSON so a journal can be inspected with ordinary tools. Stream
//! offsets are assigned by the store, start at 1 and never repeat.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{FleetError, Result};
use crate::state::EntityKey;

/// Stream prefix for task journals.
pub const TASK_STREAM_PREFIX: &str = "task/";
/// Stream prefix for fleet journals.
pub const FLEET_STREAM_PREFIX: &str = "fleet/";
/// Key prefix for entity checkpoints.
pub const STATE_KEY_PREFIX: &str = "state/";

pub fn task_stream(task_id: &str) -> String {
    format!("{}{}", TASK_STREAM_PREFIX, task_id)
}

pub fn fleet_stream(fleet: &str) -> String {
    format!("{}{}", FLEET_STREAM_PREFIX, fleet)
}

/// Checkpoint key holding the latest accepted record of an entity.
pub fn checkpoint_key(key: &EntityKey) -> String {
    format!("{}{}/{}", STATE_KEY_PREFIX, key.kind, key.id)
}

/// Synchronous durable store.
///
/// Implementations must make a successful `put` or `append` visible to every
/// later read, including reads after a reopen of the same location.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// All key-value pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Append a record to a stream and return its offset.
    fn append(&self, stream: &str, record: &[u8]) -> Result<u64>;

    /// Every record of a stream in offset order.
    fn read_stream(&self, stream: &str) -> Result<Vec<(u64, Vec<u8>)>>;

    /// Names of the non-empty streams starting with `prefix`, sorted.
    fn streams(&self, prefix: &str) -> Result<Vec<String>>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// JSON helpers over any [`DurableStore`].
pub trait DurableStoreExt: DurableStore {
    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, &bytes)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn append_json<T: Serialize>(&self, stream: &str, record: &T) -> Result<u64> {
        let bytes = serde_json::to_vec(record)?;
        self.append(stream, &bytes)
    }

    fn read_stream_json<T: DeserializeOwned>(&self, stream: &str) -> Result<Vec<(u64, T)>> {
        self.read_stream(stream)?
            .into_iter()
            .map(|(offset, bytes)| {
                serde_json::from_slice(&bytes)
                    .map(|record| (offset, record))
                    .map_err(|e| {
                        FleetError::from(e).with_context("stream", stream).with_context("offset", offset)
                    })
            })
            .collect()
    }
}

impl<S: DurableStore + ?Sized> DurableStoreExt for S {}

/// Open the backend named in the configuration.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn DurableStore>> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sled => {
            info!(path = %config.path.display(), "Opening sled storage");
            Ok(Arc::new(SledStore::open(&config.path, config.flush_on_write)?))
        }
    }
}
