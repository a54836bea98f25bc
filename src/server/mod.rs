//! The object server: owns the cache and hands out request cycles.

mod cycle;

pub use cycle::{CycleReport, RequestCycle, RollbackReport};

use crate::cache::{CacheStats, ObjectCache};
use crate::config::ServerConfig;
use crate::context::{self, RequestContext};
use crate::core::{EntityKind, EntityRef, Result};
use crate::dispatch::{
    AlwaysReachable, BatchDispatcher, DispatchOutcome, OperationDescriptor, OperationHandler,
    OperationRegistry, ReachabilityOracle,
};
use crate::durability::Durability;
use crate::routing::{LocalRouter, ObjectRouter, RemoteCall, RemoteDispatch};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{Level, event};

struct ServerInner {
    config: ServerConfig,
    cache: ObjectCache,
    durability: Arc<dyn Durability>,
    dispatcher: BatchDispatcher,
}

/// Entry point for request processing.
///
/// Cheap to clone; clones share the same cache, registry and collaborators.
#[derive(Clone)]
pub struct ObjectServer {
    inner: Arc<ServerInner>,
}

pub struct ObjectServerBuilder {
    config: ServerConfig,
    durability: Arc<dyn Durability>,
    registry: OperationRegistry,
    reachability: Arc<dyn ReachabilityOracle>,
    router: Arc<dyn ObjectRouter>,
    remote: Option<Arc<dyn RemoteDispatch>>,
}

impl ObjectServerBuilder {
    pub fn with_registry(mut self, registry: OperationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn operation(
        mut self,
        kind: EntityKind,
        descriptor: OperationDescriptor,
        handler: OperationHandler,
    ) -> Self {
        self.registry.register(kind, descriptor, handler);
        self
    }

    pub fn operation_for_all(
        mut self,
        descriptor: OperationDescriptor,
        handler: OperationHandler,
    ) -> Self {
        self.registry.register_for_all(descriptor, handler);
        self
    }

    pub fn with_reachability(mut self, oracle: Arc<dyn ReachabilityOracle>) -> Self {
        self.reachability = oracle;
        self
    }

    pub fn with_router(mut self, router: Arc<dyn ObjectRouter>) -> Self {
        self.router = router;
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteDispatch>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn build(self) -> Result<ObjectServer> {
        self.config.validate()?;

        let cache = ObjectCache::new(self.durability.clone())
            .with_load_timeout(self.config.load_timeout_duration())
            .with_hit_logging(self.config.log_cache_hits);
        let dispatcher = BatchDispatcher::new(Arc::new(self.registry))
            .with_reachability(self.reachability)
            .with_routing(self.router, self.remote)
            .with_mode(self.config.dispatch_mode)
            .with_max_targets(self.config.max_dispatch_targets)
            .with_server_id(self.config.server_id.clone());

        event!(
            Level::INFO,
            server = %self.config.server_id,
            operations = dispatcher.registry().len(),
            mode = ?self.config.dispatch_mode,
            "object server ready"
        );

        Ok(ObjectServer {
            inner: Arc::new(ServerInner {
                config: self.config,
                cache,
                durability: self.durability,
                dispatcher,
            }),
        })
    }
}

impl ObjectServer {
    pub fn builder(config: ServerConfig, durability: Arc<dyn Durability>) -> ObjectServerBuilder {
        ObjectServerBuilder {
            config,
            durability,
            registry: OperationRegistry::new(),
            reachability: Arc::new(AlwaysReachable),
            router: Arc::new(LocalRouter),
            remote: None,
        }
    }

    pub fn new(config: ServerConfig, durability: Arc<dyn Durability>) -> Result<Self> {
        Self::builder(config, durability).build()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn server_id(&self) -> &str {
        &self.inner.config.server_id
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.inner.cache
    }

    pub fn registry(&self) -> &OperationRegistry {
        self.inner.dispatcher.registry()
    }

    pub fn stats(&self) -> Result<CacheStats> {
        self.inner.cache.stats()
    }

    /// Installs objects that already match durable state, e.g. at startup.
    pub fn preload(&self, entities: impl IntoIterator<Item = EntityRef>) -> Result<usize> {
        self.inner.cache.preload(entities)
    }

    /// Opens a request cycle. The caller must `finish` or `rollback` it;
    /// dropping it unfinished rolls it back.
    pub fn begin_request(&self, context: RequestContext) -> RequestCycle {
        RequestCycle::new(self.clone(), context)
    }

    /// Runs `handler` as one request: the context is bound for its duration,
    /// a successful handler is followed by the commit, a failed one by a
    /// rollback.
    pub async fn process_request<T, F>(
        &self,
        context: RequestContext,
        handler: F,
    ) -> Result<(T, CycleReport)>
    where
        F: for<'c> FnOnce(&'c RequestCycle) -> BoxFuture<'c, Result<T>>,
    {
        let cycle = self.begin_request(context.clone());
        let span = cycle.span().clone();
        context::establish_in(context, span, async move {
            let outcome = handler(&cycle).await;
            match outcome {
                Ok(value) => {
                    let report = cycle.finish().await?;
                    Ok((value, report))
                }
                Err(err) => {
                    event!(Level::ERROR, error = %err, "request handler failed");
                    if let Err(rollback_err) = cycle.rollback() {
                        event!(
                            Level::ERROR,
                            error = %rollback_err,
                            "rollback after handler failure failed"
                        );
                    }
                    Err(err)
                }
            }
        })
        .await
    }

    /// Serves a dispatch call forwarded by another server instance.
    pub async fn serve_remote(&self, call: RemoteCall) -> Result<DispatchOutcome> {
        let context = RequestContext::with_request_id(call.request_id.clone())
            .tagged(format!("remote:{}", call.origin_server));
        let cycle = self.begin_request(context.clone());
        let span = cycle.span().clone();
        let server = self.clone();
        context::establish_in(context, span, async move {
            let outcome = server
                .inner
                .dispatcher
                .invoke_routed_here(&cycle, &call)
                .await;
            cycle.finish().await?;
            Ok(outcome)
        })
        .await
    }

    fn dispatcher(&self) -> &BatchDispatcher {
        &self.inner.dispatcher
    }

    fn durability(&self) -> &Arc<dyn Durability> {
        &self.inner.durability
    }
}
