use crate::core::{EntityRef, Result, Tsid};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{Level, event};

/// Dirty and unload sets handed off at the end of a request cycle.
#[derive(Debug, Default, Clone)]
pub struct DrainedSets {
    pub dirty: BTreeMap<Tsid, EntityRef>,
    pub unload: BTreeMap<Tsid, EntityRef>,
}

impl DrainedSets {
    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.unload.is_empty()
    }

    pub fn dirty_ids(&self) -> Vec<Tsid> {
        self.dirty.keys().cloned().collect()
    }

    pub fn unload_ids(&self) -> Vec<Tsid> {
        self.unload.keys().cloned().collect()
    }
}

#[derive(Debug, Default)]
struct TrackerSets {
    dirty: BTreeMap<Tsid, EntityRef>,
    unload: BTreeMap<Tsid, EntityRef>,
    /// Set by a drain, cleared by the next mark. A drain while set is a repeat.
    drained: bool,
}

/// Request-scoped record of mutated objects and objects to evict.
///
/// One tracker belongs to exactly one request cycle. Marking is `&self` and
/// thread-safe so that concurrently running operations of the same request
/// can record their mutations.
#[derive(Debug, Default)]
pub struct MutationTracker {
    sets: Mutex<TrackerSets>,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `entity` has to be persisted at the next drain.
    ///
    /// Stores the handle, not a copy: later mutations of the same instance are
    /// part of what gets persisted. Marking twice keeps a single entry.
    pub fn mark_dirty(&self, entity: &EntityRef) -> Result<()> {
        let mut sets = self.sets.lock()?;
        sets.drained = false;
        sets.dirty.insert(entity.tsid().clone(), entity.clone());
        Ok(())
    }

    /// Leaves the internal lock poisoned, as after a panic while marking.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _sets = self.sets.lock();
            panic!("tracker poisoned");
        }));
    }

    /// Records that `entity` leaves the cache after the commit of this cycle.
    /// The object stays visible to the rest of the request until then.
    pub fn mark_unload(&self, entity: &EntityRef) -> Result<()> {
        let mut sets = self.sets.lock()?;
        sets.drained = false;
        sets.unload.insert(entity.tsid().clone(), entity.clone());
        Ok(())
    }

    pub fn is_dirty(&self, tsid: &Tsid) -> Result<bool> {
        Ok(self.sets.lock()?.dirty.contains_key(tsid))
    }

    pub fn is_marked_unload(&self, tsid: &Tsid) -> Result<bool> {
        Ok(self.sets.lock()?.unload.contains_key(tsid))
    }

    /// Number of pending `(dirty, unload)` entries.
    pub fn pending(&self) -> Result<(usize, usize)> {
        let sets = self.sets.lock()?;
        Ok((sets.dirty.len(), sets.unload.len()))
    }

    /// Takes both sets and leaves the tracker empty.
    ///
    /// Anything marked afterwards belongs to the next drain.
    pub fn drain(&self) -> Result<DrainedSets> {
        let mut sets = self.sets.lock()?;
        if sets.drained {
            event!(
                Level::WARN,
                "mutation tracker drained twice without new marks in between"
            );
        }
        sets.drained = true;
        Ok(DrainedSets {
            dirty: std::mem::take(&mut sets.dirty),
            unload: std::mem::take(&mut sets.unload),
        })
    }
}
