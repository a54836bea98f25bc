use async_trait::async_trait;
use gamecache::{
    CacheError, CommitBatch, Durability, EntityKind, EntityRef, GameObject, InMemoryDurability,
    MutationTracker, ObjectServer, RequestContext, Result, ServerConfig, Tsid,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use tokio::sync::{Notify, Semaphore};

fn tsid(raw: &str) -> Tsid {
    Tsid::parse(raw).unwrap()
}

fn server_with(store: &InMemoryDurability) -> ObjectServer {
    ObjectServer::new(ServerConfig::default(), Arc::new(store.clone())).unwrap()
}

#[tokio::test]
async fn registered_instance_is_returned_by_reference() {
    let store = InMemoryDurability::new();
    let server = server_with(&store);
    let cycle = server.begin_request(RequestContext::new());

    let entity = EntityRef::new(GameObject::with_tsid(tsid("item_1"), "apple"));
    cycle.register(entity.clone()).unwrap();

    let found = cycle.get(&tsid("item_1")).await.unwrap().unwrap();
    assert!(found.same_instance(&entity));
    assert!(cycle.tracker().is_dirty(entity.tsid()).unwrap());

    // Mutations through one handle are visible through the other.
    found.update(|obj| obj.set_field("bites", json!(1))).unwrap();
    assert_eq!(entity.read().unwrap().field("bites"), Some(&json!(1)));

    cycle.finish().await.unwrap();
    assert_eq!(store.load_count(), 0);
}

#[tokio::test]
async fn miss_loads_once_then_hits() {
    let store = InMemoryDurability::new();
    let seeded = GameObject::with_tsid(tsid("LHOME"), "home")
        .with_fields(json!({"name": "Groddle Meadow"}))
        .unwrap();
    store.insert(&seeded).await.unwrap();
    let server = server_with(&store);

    let cycle = server.begin_request(RequestContext::new());
    let first = cycle.get(&tsid("LHOME")).await.unwrap().unwrap();
    let second = cycle.get(&tsid("LHOME")).await.unwrap().unwrap();
    assert!(first.same_instance(&second));
    assert_eq!(first.kind(), EntityKind::Location);
    assert!(first.read().unwrap().metadata.persisted);
    cycle.finish().await.unwrap();

    let stats = server.stats().unwrap();
    assert_eq!(store.load_count(), 1);
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn unknown_objects_are_not_negatively_cached() {
    let store = InMemoryDurability::new();
    let server = server_with(&store);
    let ghost = tsid("IGHOST");

    let cycle = server.begin_request(RequestContext::new());
    assert!(cycle.get(&ghost).await.unwrap().is_none());
    assert!(!server.cache().contains(&ghost).unwrap());

    // Appears in the store later; the next lookup must see it.
    store
        .insert(&GameObject::with_tsid(ghost.clone(), "ghost"))
        .await
        .unwrap();
    assert!(cycle.get(&ghost).await.unwrap().is_some());
    assert_eq!(store.load_count(), 2);
    cycle.finish().await.unwrap();
}

#[tokio::test]
async fn load_failure_is_surfaced_and_not_cached() {
    let store = InMemoryDurability::new();
    store
        .insert(&GameObject::with_tsid(tsid("PFLAKY"), "human"))
        .await
        .unwrap();
    let server = server_with(&store);
    let cycle = server.begin_request(RequestContext::new());

    store.set_fail_loads(true);
    let err = cycle.get(&tsid("PFLAKY")).await.unwrap_err();
    assert!(matches!(err, CacheError::LoadFailed { .. }));
    assert!(cycle.find("PFLAKY").await.is_none());
    assert!(!server.cache().contains(&tsid("PFLAKY")).unwrap());
    assert_eq!(server.stats().unwrap().load_failures, 2);

    store.set_fail_loads(false);
    assert!(cycle.get(&tsid("PFLAKY")).await.unwrap().is_some());
    cycle.finish().await.unwrap();
}

#[tokio::test]
async fn find_tolerates_malformed_ids() {
    let server = server_with(&InMemoryDurability::new());
    let cycle = server.begin_request(RequestContext::new());
    assert!(cycle.find("not an id").await.is_none());
    assert!(cycle.find("").await.is_none());
    cycle.finish().await.unwrap();
}

#[test]
fn concurrent_registration_yields_exactly_one_conflict() {
    let server = server_with(&InMemoryDurability::new());
    let barrier = Arc::new(Barrier::new(2));

    let handles = (0..2)
        .map(|n| {
            let server = server.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let tracker = MutationTracker::new();
                let entity = EntityRef::new(
                    GameObject::with_tsid(Tsid::parse("loc_9").unwrap(), "location")
                        .with_fields(json!({"writer": n}))
                        .unwrap(),
                );
                barrier.wait();
                let result = server.cache().register(entity.clone(), &tracker);
                (entity, result)
            })
        })
        .collect::<Vec<_>>();

    let results = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect::<Vec<_>>();

    let winners = results.iter().filter(|(_, r)| r.is_ok()).collect::<Vec<_>>();
    let conflicts = results
        .iter()
        .filter(|(_, r)| matches!(r, Err(CacheError::IdentityConflict(_))))
        .count();
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 1);

    let cached = server.cache().peek(&tsid("loc_9")).unwrap().unwrap();
    assert!(cached.same_instance(&winners[0].0));
    assert_eq!(server.cache().len().unwrap(), 1);
    assert_eq!(server.stats().unwrap().identity_conflicts, 1);
}

#[tokio::test]
async fn re_registering_the_cached_instance_only_marks_dirty() {
    let server = server_with(&InMemoryDurability::new());
    let entity = EntityRef::new(GameObject::create(EntityKind::Bag, "bag_generic"));
    server.preload(vec![entity.clone()]).unwrap();

    let cycle = server.begin_request(RequestContext::new());
    assert!(!cycle.tracker().is_dirty(entity.tsid()).unwrap());
    let again = cycle.register(entity.clone()).unwrap();
    assert!(again.same_instance(&entity));
    assert!(cycle.tracker().is_dirty(entity.tsid()).unwrap());
    cycle.finish().await.unwrap();
}

#[tokio::test]
async fn preload_does_not_mark_dirty_and_keeps_identity() {
    let store = InMemoryDurability::new();
    let server = server_with(&store);
    let scene = (0..3)
        .map(|n| EntityRef::new(GameObject::with_tsid(tsid(&format!("GSCENE{}", n)), "geo")))
        .collect::<Vec<_>>();
    assert_eq!(server.preload(scene.clone()).unwrap(), 3);

    let cycle = server.begin_request(RequestContext::new());
    for entity in &scene {
        let found = cycle.get(entity.tsid()).await.unwrap().unwrap();
        assert!(found.same_instance(entity));
    }
    let report = cycle.finish().await.unwrap();
    assert!(report.committed.is_empty());
    assert_eq!(store.commit_count(), 0);
    assert_eq!(store.load_count(), 0);
}

/// Store whose next load reads its snapshot and then waits for the gate.
#[derive(Clone)]
struct GatedDurability {
    inner: InMemoryDurability,
    armed: Arc<AtomicBool>,
    reached: Arc<Notify>,
    gate: Arc<Semaphore>,
}

impl GatedDurability {
    fn new(inner: InMemoryDurability) -> Self {
        Self {
            inner,
            armed: Arc::new(AtomicBool::new(true)),
            reached: Arc::new(Notify::new()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }
}

#[async_trait]
impl Durability for GatedDurability {
    async fn load(&self, tsid: &Tsid) -> Result<Option<GameObject>> {
        let snapshot = self.inner.load(tsid).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        Ok(snapshot)
    }

    async fn commit(&self, batch: &CommitBatch) -> Result<()> {
        self.inner.commit(batch).await
    }
}

fn counter(entity: &EntityRef) -> Option<i64> {
    entity.read().unwrap().field("n").and_then(Value::as_i64)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_overlapping_an_eviction_is_reloaded() {
    let store = InMemoryDurability::new();
    store
        .insert(
            &GameObject::with_tsid(tsid("IX"), "counter")
                .with_fields(json!({"n": 1}))
                .unwrap(),
        )
        .await
        .unwrap();
    let gated = GatedDurability::new(store.clone());
    let server = ObjectServer::new(ServerConfig::default(), Arc::new(gated.clone())).unwrap();

    // The slow cycle reads n=1 from the store and stalls.
    let slow = {
        let server = server.clone();
        tokio::spawn(async move {
            let cycle = server.begin_request(RequestContext::with_request_id("rq-slow"));
            let item = cycle.require(&tsid("IX")).await.unwrap();
            let seen = counter(&item);
            cycle.mark_dirty(&item).unwrap();
            cycle.finish().await.unwrap();
            seen
        })
    };
    gated.reached.notified().await;

    // Meanwhile another cycle loads, bumps, commits and unloads the object.
    let fast = server.begin_request(RequestContext::with_request_id("rq-fast"));
    let item = fast.require(&tsid("IX")).await.unwrap();
    item.update(|obj| obj.set_field("n", json!(2))).unwrap();
    fast.mark_dirty(&item).unwrap();
    fast.mark_unload(&item).unwrap();
    let report = fast.finish().await.unwrap();
    assert_eq!(report.evicted, vec![tsid("IX")]);

    gated.gate.add_permits(1);
    assert_eq!(slow.await.unwrap(), Some(2));

    let stored = store.stored(&tsid("IX")).await.unwrap().unwrap();
    assert_eq!(stored.field("n"), Some(&json!(2)));
    assert_eq!(server.stats().unwrap().stale_loads, 1);
}
