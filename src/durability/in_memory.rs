use super::{CommitBatch, Durability};
use crate::core::{CacheError, GameObject, Result, Tsid};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

/// An in-memory implementation of [`Durability`].
///
/// Keeps serialized object snapshots in a map. Used by tests and local runs;
/// failure injection lets callers exercise the commit and load error paths.
#[derive(Clone, Default)]
pub struct InMemoryDurability {
    objects: Arc<Mutex<HashMap<Tsid, serde_json::Value>>>,
    commits: Arc<AtomicU64>,
    loads: Arc<AtomicU64>,
    fail_next_commit: Arc<AtomicBool>,
    fail_loads: Arc<AtomicBool>,
}

impl InMemoryDurability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store as if `object` had been committed earlier.
    pub async fn insert(&self, object: &GameObject) -> Result<()> {
        let mut stored = object.clone();
        stored.metadata.persisted = true;
        let value = serde_json::to_value(&stored)?;
        self.objects.lock().await.insert(object.tsid().clone(), value);
        Ok(())
    }

    /// The last committed state of `tsid`, if any.
    pub async fn stored(&self, tsid: &Tsid) -> Result<Option<GameObject>> {
        let objects = self.objects.lock().await;
        match objects.get(tsid) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Makes the next commit fail without storing anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Makes every load fail until switched off again.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Durability for InMemoryDurability {
    async fn load(&self, tsid: &Tsid) -> Result<Option<GameObject>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(CacheError::LoadFailed {
                id: tsid.to_string(),
                reason: "store unavailable".to_string(),
            });
        }
        self.stored(tsid).await
    }

    async fn commit(&self, batch: &CommitBatch) -> Result<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(CacheError::CommitFailed {
                request_id: batch.request_id.clone(),
                dirty: batch.dirty.iter().map(|obj| obj.tsid().to_string()).collect(),
                unload: batch.unload.iter().map(Tsid::to_string).collect(),
                reason: "injected commit failure".to_string(),
            });
        }

        // Serialize everything before touching the map so a bad object leaves
        // the store unchanged.
        let mut encoded = Vec::with_capacity(batch.dirty.len());
        for object in &batch.dirty {
            let mut stored = object.clone();
            stored.metadata.persisted = true;
            encoded.push((object.tsid().clone(), serde_json::to_value(&stored)?));
        }

        let mut objects = self.objects.lock().await;
        objects.extend(encoded);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
