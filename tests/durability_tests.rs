use async_trait::async_trait;
use gamecache::{
    CacheError, CommitBatch, Durability, EntityKind, GameObject, InMemoryDurability, ObjectServer,
    RequestContext, Result, ServerConfig, Tsid,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Wraps the in-memory store and stalls every call.
#[derive(Clone, Default)]
struct StallingDurability {
    inner: InMemoryDurability,
    delay_ms: u64,
}

#[async_trait]
impl Durability for StallingDurability {
    async fn load(&self, tsid: &Tsid) -> Result<Option<GameObject>> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        self.inner.load(tsid).await
    }

    async fn commit(&self, batch: &CommitBatch) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        self.inner.commit(batch).await
    }
}

fn stalling(delay_ms: u64) -> StallingDurability {
    StallingDurability {
        inner: InMemoryDurability::new(),
        delay_ms,
    }
}

#[tokio::test]
async fn slow_load_times_out_as_load_failure() {
    let store = stalling(200);
    store
        .inner
        .insert(&GameObject::with_tsid(Tsid::parse("QSLOW").unwrap(), "quest"))
        .await
        .unwrap();
    let config = ServerConfig::default().load_timeout(Duration::from_millis(20));
    let server = ObjectServer::new(config, Arc::new(store)).unwrap();

    let cycle = server.begin_request(RequestContext::new());
    let err = cycle.get(&Tsid::parse("QSLOW").unwrap()).await.unwrap_err();
    match err {
        CacheError::LoadFailed { id, reason } => {
            assert_eq!(id, "QSLOW");
            assert!(reason.contains("timed out"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.cache().len().unwrap(), 0);
    cycle.finish().await.unwrap();
}

#[tokio::test]
async fn slow_commit_times_out_as_commit_failure() {
    let store = stalling(200);
    let config = ServerConfig::default().commit_timeout(Duration::from_millis(20));
    let server = ObjectServer::new(config, Arc::new(store.clone())).unwrap();

    let cycle = server.begin_request(RequestContext::with_request_id("rq-slow"));
    let quest = cycle
        .create_object(EntityKind::Quest, "quest_intro", json!({"step": 1}))
        .unwrap();
    let err = cycle.finish().await.unwrap_err();
    match err {
        CacheError::CommitFailed {
            request_id,
            dirty,
            reason,
            ..
        } => {
            assert_eq!(request_id, "rq-slow");
            assert_eq!(dirty, vec![quest.tsid().to_string()]);
            assert!(reason.contains("timed out"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // Still cached with its in-memory state.
    assert!(server.cache().contains(quest.tsid()).unwrap());
}

#[tokio::test]
async fn without_timeouts_slow_calls_complete() {
    let store = stalling(30);
    let config = ServerConfig::default()
        .load_timeout(Duration::from_millis(1))
        .without_timeouts();
    let server = ObjectServer::new(config, Arc::new(store.clone())).unwrap();

    let cycle = server.begin_request(RequestContext::new());
    let quest = cycle
        .create_object(EntityKind::Quest, "quest_intro", json!({}))
        .unwrap();
    let report = cycle.finish().await.unwrap();
    assert_eq!(report.committed, vec![quest.tsid().clone()]);
    assert_eq!(store.inner.commit_count(), 1);
}

#[test]
fn config_from_json_overrides_defaults() {
    let config = ServerConfig::from_json_str(
        r#"{"server_id": "gs07", "dispatch_mode": "concurrent", "commit_timeout_ms": null}"#,
    )
    .unwrap();
    assert_eq!(config.server_id, "gs07");
    assert_eq!(config.commit_timeout_duration(), None);
    assert_eq!(config.load_timeout_duration(), Some(Duration::from_millis(5_000)));
    assert!(matches!(
        ServerConfig::from_json_str(r#"{"server_id": ""}"#),
        Err(CacheError::Config(_))
    ));
    assert!(ObjectServer::new(
        ServerConfig::new(" "),
        Arc::new(InMemoryDurability::new())
    )
    .is_err());
}
