//! Contract with the durable backing store.
//!
//! The cache never performs storage I/O itself. Loads on a cache miss and the
//! commit at the end of a request cycle go through [`Durability`].

mod in_memory;

pub use in_memory::InMemoryDurability;

use crate::core::{GameObject, Result, Tsid};
use crate::tracker::DrainedSets;
use async_trait::async_trait;

/// Everything one request cycle hands to the durability layer.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub request_id: String,
    /// Snapshots of the dirty objects, taken after the drain.
    pub dirty: Vec<GameObject>,
    /// Objects leaving the cache once this batch is committed.
    pub unload: Vec<Tsid>,
}

impl CommitBatch {
    pub fn from_drained(request_id: impl Into<String>, drained: &DrainedSets) -> Result<Self> {
        let dirty = drained
            .dirty
            .values()
            .map(|entity| entity.snapshot())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            request_id: request_id.into(),
            dirty,
            unload: drained.unload_ids(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.unload.is_empty()
    }
}

/// Durable storage collaborator.
#[async_trait]
pub trait Durability: Send + Sync {
    /// Loads an object. `Ok(None)` means the store has no such object; any
    /// error is a load failure and must not be read as absence.
    async fn load(&self, tsid: &Tsid) -> Result<Option<GameObject>>;

    /// Persists one drained request cycle. On error nothing in the batch may
    /// be considered persisted.
    async fn commit(&self, batch: &CommitBatch) -> Result<()>;
}
