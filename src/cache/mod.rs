//! Process-wide identity map from object id to live instance.

mod leases;

pub use leases::LeaseSet;
pub(crate) use leases::LeaseTable;

use crate::core::{CacheError, EntityRef, GameObject, Result, Tsid};
use crate::durability::Durability;
use crate::tracker::MutationTracker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{Level, event};

/// Counters describing cache behaviour since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Objects currently cached.
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Objects installed by load-on-miss.
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    /// Evictions skipped because another request still held the object.
    pub deferred_evictions: u64,
    pub identity_conflicts: u64,
    /// Loads thrown away because the object was evicted while they ran.
    pub stale_loads: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
    deferred_evictions: AtomicU64,
    identity_conflicts: AtomicU64,
    stale_loads: AtomicU64,
}

/// Bookkeeping for loads of one id that are currently running.
#[derive(Debug, Default)]
struct InFlightLoad {
    loaders: usize,
    /// Bumped by every eviction of the id while a load is running.
    evictions: u64,
}

/// Attempts per lookup before racing evictions turn a miss into an error.
const MAX_LOAD_ATTEMPTS: usize = 8;

/// Result of one eviction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    Evicted,
    NotCached,
    /// Another in-flight request holds the object; it stays cached.
    Deferred,
}

/// The object cache.
///
/// At most one live [`EntityRef`] exists per id. Lookups of cached ids only
/// take the read lock; inserts and evictions take the write lock, which makes
/// them mutually exclusive per id. Misses are loaded through the
/// [`Durability`] collaborator without holding any lock. A load that
/// overlaps an eviction of the same id is discarded and repeated, so a
/// snapshot read before a commit never replaces the committed state.
pub struct ObjectCache {
    entries: RwLock<HashMap<Tsid, EntityRef>>,
    in_flight: Mutex<HashMap<Tsid, InFlightLoad>>,
    leases: LeaseTable,
    durability: Arc<dyn Durability>,
    load_timeout: Option<Duration>,
    log_hits: bool,
    counters: CacheCounters,
}

impl ObjectCache {
    pub fn new(durability: Arc<dyn Durability>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            leases: LeaseTable::default(),
            durability,
            load_timeout: None,
            log_hits: true,
            counters: CacheCounters::default(),
        }
    }

    pub fn with_load_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn with_hit_logging(mut self, enabled: bool) -> Self {
        self.log_hits = enabled;
        self
    }

    /// Returns the live instance for `tsid`, loading it on a miss.
    ///
    /// `Ok(None)` means the durability layer does not know the object. Load
    /// errors are returned and nothing is cached for the id.
    pub async fn get(&self, tsid: &Tsid) -> Result<Option<EntityRef>> {
        self.get_with(tsid, None).await
    }

    pub(crate) async fn get_with(
        &self,
        tsid: &Tsid,
        leases: Option<&LeaseSet>,
    ) -> Result<Option<EntityRef>> {
        {
            let entries = self.entries.read()?;
            if let Some(entity) = entries.get(tsid) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                if self.log_hits {
                    event!(Level::DEBUG, tsid = %tsid, "cache hit");
                }
                if let Some(leases) = leases {
                    leases.lease(&self.leases, tsid)?;
                }
                return Ok(Some(entity.clone()));
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if self.log_hits {
            event!(Level::DEBUG, tsid = %tsid, "cache miss");
        }

        for attempt in 1..=MAX_LOAD_ATTEMPTS {
            let generation = self.begin_load(tsid)?;
            let loaded = self.load(tsid).await;

            let mut entries = self.entries.write()?;
            let evicted_meanwhile = self.end_load(tsid, generation)?;
            if let Some(existing) = entries.get(tsid) {
                // Another request installed the object while we were loading.
                let entity = existing.clone();
                if let Some(leases) = leases {
                    leases.lease(&self.leases, tsid)?;
                }
                return Ok(Some(entity));
            }

            let loaded = match loaded {
                Ok(loaded) => loaded,
                Err(err) => {
                    self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                    event!(Level::ERROR, tsid = %tsid, error = %err, "object load failed");
                    return Err(err);
                }
            };
            if evicted_meanwhile {
                self.counters.stale_loads.fetch_add(1, Ordering::Relaxed);
                event!(Level::DEBUG, tsid = %tsid, attempt, "object evicted during load, reloading");
                continue;
            }

            let Some(object) = loaded else {
                event!(Level::DEBUG, tsid = %tsid, "object not found in store");
                return Ok(None);
            };
            if object.tsid() != tsid {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                return Err(CacheError::LoadFailed {
                    id: tsid.to_string(),
                    reason: format!("store returned object '{}'", object.tsid()),
                });
            }

            let entity = EntityRef::new(object);
            entries.insert(tsid.clone(), entity.clone());
            self.counters.loads.fetch_add(1, Ordering::Relaxed);
            if let Some(leases) = leases {
                leases.lease(&self.leases, tsid)?;
            }
            return Ok(Some(entity));
        }

        self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
        Err(CacheError::LoadFailed {
            id: tsid.to_string(),
            reason: format!("evicted during each of {} load attempts", MAX_LOAD_ATTEMPTS),
        })
    }

    /// Registers a running load of `tsid`; returns the eviction generation
    /// it started from.
    fn begin_load(&self, tsid: &Tsid) -> Result<u64> {
        let mut in_flight = self.in_flight.lock()?;
        let load = in_flight.entry(tsid.clone()).or_default();
        load.loaders += 1;
        Ok(load.evictions)
    }

    /// Unregisters a finished load. True when `tsid` was evicted after the
    /// load started. Callers hold the entries write lock.
    fn end_load(&self, tsid: &Tsid, generation: u64) -> Result<bool> {
        let mut in_flight = self.in_flight.lock()?;
        let Some(load) = in_flight.get_mut(tsid) else {
            return Ok(false);
        };
        let evicted = load.evictions != generation;
        load.loaders = load.loaders.saturating_sub(1);
        if load.loaders == 0 {
            in_flight.remove(tsid);
        }
        Ok(evicted)
    }

    async fn load(&self, tsid: &Tsid) -> Result<Option<GameObject>> {
        let pending = self.durability.load(tsid);
        let result = match self.load_timeout {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                CacheError::LoadFailed {
                    id: tsid.to_string(),
                    reason: format!("timed out after {} ms", limit.as_millis()),
                }
            })?,
            None => pending.await,
        };
        result.map_err(|err| match err {
            CacheError::LoadFailed { .. } => err,
            other => CacheError::LoadFailed {
                id: tsid.to_string(),
                reason: other.to_string(),
            },
        })
    }

    /// Cache-only lookup; never loads.
    pub fn peek(&self, tsid: &Tsid) -> Result<Option<EntityRef>> {
        Ok(self.entries.read()?.get(tsid).cloned())
    }

    pub fn contains(&self, tsid: &Tsid) -> Result<bool> {
        Ok(self.entries.read()?.contains_key(tsid))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.entries.read()?.is_empty())
    }

    /// Ids of all cached objects, sorted.
    pub fn ids(&self) -> Result<Vec<Tsid>> {
        let mut ids = self.entries.read()?.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }

    /// Installs a newly created object and marks it dirty.
    ///
    /// Fails with [`CacheError::IdentityConflict`] when a different instance
    /// is already cached under the same id. Registering the cached instance
    /// again only re-marks it dirty.
    pub fn register(&self, entity: EntityRef, tracker: &MutationTracker) -> Result<EntityRef> {
        self.register_with(entity, tracker, None)
    }

    pub(crate) fn register_with(
        &self,
        entity: EntityRef,
        tracker: &MutationTracker,
        leases: Option<&LeaseSet>,
    ) -> Result<EntityRef> {
        {
            let mut entries = self.entries.write()?;
            if let Some(existing) = entries.get(entity.tsid()) {
                if !existing.same_instance(&entity) {
                    self.counters.identity_conflicts.fetch_add(1, Ordering::Relaxed);
                    event!(
                        Level::ERROR,
                        tsid = %entity.tsid(),
                        "identity conflict: refusing to replace cached instance"
                    );
                    return Err(CacheError::IdentityConflict(entity.tsid().to_string()));
                }
            } else {
                entries.insert(entity.tsid().clone(), entity.clone());
            }
            if let Some(leases) = leases {
                leases.lease(&self.leases, entity.tsid())?;
            }
        }
        tracker.mark_dirty(&entity)?;
        event!(Level::DEBUG, tsid = %entity.tsid(), "object registered");
        Ok(entity)
    }

    /// Bulk-installs objects that already match durable state. Nothing is
    /// marked dirty.
    ///
    /// The batch is checked against the cache first: on an identity conflict
    /// nothing is inserted.
    pub fn preload(&self, entities: impl IntoIterator<Item = EntityRef>) -> Result<usize> {
        let entities = entities.into_iter().collect::<Vec<_>>();
        let mut entries = self.entries.write()?;

        let mut batch: HashMap<&Tsid, &EntityRef> = HashMap::with_capacity(entities.len());
        for entity in &entities {
            let clash = entries
                .get(entity.tsid())
                .or_else(|| batch.get(entity.tsid()).copied())
                .is_some_and(|existing| !existing.same_instance(entity));
            if clash {
                self.counters.identity_conflicts.fetch_add(1, Ordering::Relaxed);
                event!(Level::ERROR, tsid = %entity.tsid(), "identity conflict during preload");
                return Err(CacheError::IdentityConflict(entity.tsid().to_string()));
            }
            batch.insert(entity.tsid(), entity);
        }

        let mut inserted = 0usize;
        for entity in &entities {
            if !entries.contains_key(entity.tsid()) {
                entries.insert(entity.tsid().clone(), entity.clone());
                inserted += 1;
            }
        }
        event!(Level::DEBUG, count = inserted, "objects preloaded");
        Ok(inserted)
    }

    /// Removes `tsid` from the cache unless a request other than `own`
    /// still holds it.
    ///
    /// Only request-boundary processing (unload after commit, rollback)
    /// calls this.
    pub(crate) fn evict(&self, tsid: &Tsid, own: Option<&LeaseSet>) -> Result<EvictOutcome> {
        let mut entries = self.entries.write()?;
        if !entries.contains_key(tsid) {
            return Ok(EvictOutcome::NotCached);
        }

        let own_lease = match own {
            Some(leases) => usize::from(leases.holds(tsid)?),
            None => 0,
        };
        if self.leases.holders(tsid)? > own_lease {
            self.counters.deferred_evictions.fetch_add(1, Ordering::Relaxed);
            event!(Level::DEBUG, tsid = %tsid, "eviction deferred, object held by another request");
            return Ok(EvictOutcome::Deferred);
        }

        entries.remove(tsid);
        if let Some(load) = self.in_flight.lock()?.get_mut(tsid) {
            load.evictions += 1;
        }
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        event!(Level::DEBUG, tsid = %tsid, "object evicted");
        Ok(EvictOutcome::Evicted)
    }

    pub(crate) fn release(&self, leases: &LeaseSet) -> Result<usize> {
        leases.release_all(&self.leases)
    }

    /// Number of request cycles currently holding `tsid`.
    pub fn lease_holders(&self, tsid: &Tsid) -> Result<usize> {
        self.leases.holders(tsid)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            entries: self.len()?,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            load_failures: self.counters.load_failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            deferred_evictions: self.counters.deferred_evictions.load(Ordering::Relaxed),
            identity_conflicts: self.counters.identity_conflicts.load(Ordering::Relaxed),
            stale_loads: self.counters.stale_loads.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityKind;
    use crate::durability::InMemoryDurability;

    fn cache() -> ObjectCache {
        ObjectCache::new(Arc::new(InMemoryDurability::new()))
    }

    fn entity(raw: &str) -> EntityRef {
        EntityRef::new(GameObject::with_tsid(Tsid::parse(raw).unwrap(), "test"))
    }

    #[test]
    fn evict_respects_foreign_leases() {
        let cache = cache();
        let tracker = MutationTracker::new();
        let mine = LeaseSet::new();
        let theirs = LeaseSet::new();
        let item = entity("item_1");

        cache.register_with(item.clone(), &tracker, Some(&mine)).unwrap();
        theirs.lease(&cache.leases, item.tsid()).unwrap();

        assert_eq!(
            cache.evict(item.tsid(), Some(&mine)).unwrap(),
            EvictOutcome::Deferred
        );
        cache.release(&theirs).unwrap();
        assert_eq!(
            cache.evict(item.tsid(), Some(&mine)).unwrap(),
            EvictOutcome::Evicted
        );
        assert_eq!(
            cache.evict(item.tsid(), Some(&mine)).unwrap(),
            EvictOutcome::NotCached
        );
    }

    #[test]
    fn preload_is_all_or_nothing() {
        let cache = cache();
        let tracker = MutationTracker::new();
        let cached = entity("loc_1");
        cache.register(cached, &tracker).unwrap();

        let fresh = entity("loc_2");
        let impostor = entity("loc_1");
        assert!(matches!(
            cache.preload(vec![fresh.clone(), impostor]),
            Err(CacheError::IdentityConflict(_))
        ));
        assert!(!cache.contains(fresh.tsid()).unwrap());
        assert_eq!(cache.stats().unwrap().identity_conflicts, 1);
    }

    #[test]
    fn preload_rejects_duplicates_within_batch() {
        let cache = cache();
        let tsid = Tsid::generate(EntityKind::Geo);
        let a = EntityRef::new(GameObject::with_tsid(tsid.clone(), "geo"));
        let b = EntityRef::new(GameObject::with_tsid(tsid, "geo"));
        assert!(cache.preload(vec![a.clone(), a.clone()]).is_ok());
        assert!(cache.preload(vec![b]).is_err());
    }
}
