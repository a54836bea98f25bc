use gamecache::routing::RemoteCall;
use gamecache::{
    EntityKind, EntityRef, GameObject, HashRouter, InMemoryDurability, InMemoryRemoteDispatch,
    ObjectRouter, ObjectServer, OperationDescriptor, RemoteDispatch, RequestContext, Route,
    ServerConfig, Tsid, handler,
};
use serde_json::{Value, json};
use std::sync::Arc;

const SERVERS: [&str; 2] = ["gs01", "gs02"];

fn servers() -> Vec<String> {
    SERVERS.iter().map(|s| s.to_string()).collect()
}

fn router_for(local: &str) -> Arc<HashRouter> {
    Arc::new(HashRouter::new(local, servers()).unwrap())
}

/// First generated item id the router assigns to `owner`.
fn item_owned_by(router: &HashRouter, owner: &str) -> Tsid {
    loop {
        let candidate = Tsid::generate(EntityKind::Item);
        if router.owner(&candidate) == owner {
            return candidate;
        }
    }
}

fn build(
    server_id: &str,
    store: &InMemoryDurability,
    remote: Option<Arc<dyn RemoteDispatch>>,
) -> ObjectServer {
    let mut builder = ObjectServer::builder(ServerConfig::new(server_id), Arc::new(store.clone()))
        .with_router(router_for(server_id))
        .operation(
            EntityKind::Item,
            OperationDescriptor::mutator("polish"),
            handler(|call| {
                let shine = call
                    .object()
                    .field("shine")
                    .and_then(Value::as_i64)
                    .unwrap_or_default();
                call.object_mut().set_field("shine", json!(shine + 1));
                Ok(json!({"shine": shine + 1, "served_by": call.context().tag()}))
            }),
        );
    if let Some(remote) = remote {
        builder = builder.with_remote(remote);
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn remote_targets_are_forwarded_to_their_owner() {
    let network = InMemoryRemoteDispatch::new();
    let store_a = InMemoryDurability::new();
    let store_b = InMemoryDurability::new();
    let gs01 = build("gs01", &store_a, Some(Arc::new(network.clone())));
    let gs02 = build("gs02", &store_b, Some(Arc::new(network.clone())));
    network.register_peer("gs01", gs01.clone()).await.unwrap();
    network.register_peer("gs02", gs02.clone()).await.unwrap();
    assert_eq!(network.peer_count().await, 2);

    let router = router_for("gs01");
    let local_item = item_owned_by(&router, "gs01");
    let remote_item = item_owned_by(&router, "gs02");
    gs01.preload(vec![EntityRef::new(GameObject::with_tsid(local_item.clone(), "gem"))])
        .unwrap();
    store_b
        .insert(&GameObject::with_tsid(remote_item.clone(), "gem"))
        .await
        .unwrap();

    let cycle = gs01.begin_request(RequestContext::with_request_id("rq-route"));
    let report = cycle
        .invoke(
            "polish",
            vec![local_item.clone(), remote_item.clone()],
            &[],
        )
        .await
        .unwrap();
    assert_eq!(report.succeeded(), 2);
    assert_eq!(
        report.get(remote_item.as_str()).unwrap().to_json()["served_by"],
        json!("remote:gs01")
    );
    cycle.finish().await.unwrap();

    // The owner committed its own mutation; the origin never cached the object.
    assert!(!gs01.cache().contains(&remote_item).unwrap());
    let stored = store_b.stored(&remote_item).await.unwrap().unwrap();
    assert_eq!(stored.field("shine"), Some(&json!(1)));
    assert_eq!(store_a.commit_count(), 1);
}

#[tokio::test]
async fn remote_target_without_forwarder_fails_alone() {
    let store = InMemoryDurability::new();
    let gs01 = build("gs01", &store, None);
    let router = router_for("gs01");
    let local_item = item_owned_by(&router, "gs01");
    let remote_item = item_owned_by(&router, "gs02");
    gs01.preload(vec![EntityRef::new(GameObject::with_tsid(local_item.clone(), "gem"))])
        .unwrap();

    let cycle = gs01.begin_request(RequestContext::new());
    let report = cycle
        .invoke("polish", vec![local_item.clone(), remote_item.clone()], &[])
        .await
        .unwrap();
    assert!(report.get(local_item.as_str()).unwrap().is_ok());
    let failure = report.get(remote_item.as_str()).unwrap().to_json();
    assert_eq!(failure["ok"], json!(false));
    assert!(failure["error"].as_str().unwrap().contains("gs02"));
    cycle.finish().await.unwrap();
}

#[tokio::test]
async fn unknown_peer_is_a_dispatch_error() {
    let network = InMemoryRemoteDispatch::new();
    let call = RemoteCall {
        request_id: "rq-1".to_string(),
        origin_server: "gs01".to_string(),
        operation: "polish".to_string(),
        target: Tsid::parse("IX").unwrap(),
        args: Vec::new(),
        online_only: false,
    };
    assert!(network.dispatch("gs09", call).await.is_err());
    let lonely = build("gs01", &InMemoryDurability::new(), None);
    assert!(network.register_peer(" ", lonely).await.is_err());
}

#[test]
fn router_splits_ids_between_servers() {
    let router = router_for("gs01");
    let local = item_owned_by(&router, "gs01");
    let remote = item_owned_by(&router, "gs02");
    assert_eq!(router.route(&local), Route::Local);
    assert_eq!(router.route(&remote), Route::Remote("gs02".to_string()));
    assert_eq!(router_for("gs02").route(&remote), Route::Local);
}
