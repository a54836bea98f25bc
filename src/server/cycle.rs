use super::ObjectServer;
use crate::cache::{EvictOutcome, LeaseSet};
use crate::context::RequestContext;
use crate::core::{CacheError, EntityKind, EntityRef, GameObject, Result, Tsid};
use crate::dispatch::{DispatchReport, DispatchTargets};
use crate::durability::CommitBatch;
use crate::tracker::{DrainedSets, MutationTracker};
use serde_json::Value;
use std::fmt::{self, Display};
use tracing::{Instrument, Level, Span, event};

/// What the end of a successful cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub request_id: String,
    /// Objects handed to the durability layer, in id order.
    pub committed: Vec<Tsid>,
    pub evicted: Vec<Tsid>,
    /// Unload requests skipped because another request still holds the object.
    pub deferred_evictions: Vec<Tsid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub request_id: String,
    /// Dirty objects whose in-memory changes were thrown away.
    pub discarded: Vec<Tsid>,
    pub evicted: Vec<Tsid>,
    pub deferred_evictions: Vec<Tsid>,
}

/// One request against the object server.
///
/// Owns the request's mutation tracker and the leases on every object it
/// touched. Ends with [`RequestCycle::finish`] (drain, commit, evict) or
/// [`RequestCycle::rollback`]; a cycle dropped before either is rolled back.
///
/// Work done through the cycle is recorded under the request span, so its
/// events carry `rc` and `session` without an established context.
pub struct RequestCycle {
    server: ObjectServer,
    context: RequestContext,
    span: Span,
    tracker: MutationTracker,
    leases: LeaseSet,
    settled: bool,
}

impl RequestCycle {
    pub(super) fn new(server: ObjectServer, context: RequestContext) -> Self {
        let span = context.span();
        span.in_scope(|| event!(Level::DEBUG, "request cycle started"));
        Self {
            server,
            context,
            span,
            tracker: MutationTracker::new(),
            leases: LeaseSet::new(),
            settled: false,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn request_id(&self) -> &str {
        self.context.request_id()
    }

    pub fn tracker(&self) -> &MutationTracker {
        &self.tracker
    }

    pub fn server(&self) -> &ObjectServer {
        &self.server
    }

    /// Span the cycle's events are recorded under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Looks `tsid` up through the cache, loading it on a miss, and leases
    /// it to this cycle.
    pub async fn get(&self, tsid: &Tsid) -> Result<Option<EntityRef>> {
        self.server
            .cache()
            .get_with(tsid, Some(&self.leases))
            .instrument(self.span.clone())
            .await
    }

    /// Like [`get`](Self::get) but a missing object is an error.
    pub async fn require(&self, tsid: &Tsid) -> Result<EntityRef> {
        self.get(tsid)
            .await?
            .ok_or_else(|| CacheError::NotFound(tsid.to_string()))
    }

    /// Lenient lookup by raw id for script-facing callers: malformed ids and
    /// load failures are logged and read as "no such object".
    pub async fn find(&self, raw: &str) -> Option<EntityRef> {
        let tsid = match Tsid::parse(raw) {
            Ok(tsid) => tsid,
            Err(err) => {
                let _entered = self.span.enter();
                event!(Level::ERROR, error = %err, "lookup with invalid object id");
                return None;
            }
        };
        match self.get(&tsid).await {
            Ok(found) => found,
            Err(err) => {
                let _entered = self.span.enter();
                event!(Level::ERROR, tsid = %tsid, error = %err, "lookup failed");
                None
            }
        }
    }

    /// Serialized copy of an object's current state.
    pub async fn object_content(&self, tsid: &Tsid) -> Result<Option<Value>> {
        match self.get(tsid).await? {
            Some(entity) => Ok(Some(entity.read()?.to_json()?)),
            None => Ok(None),
        }
    }

    /// Installs a newly created object and marks it dirty.
    pub fn register(&self, entity: EntityRef) -> Result<EntityRef> {
        let _entered = self.span.enter();
        self.server
            .cache()
            .register_with(entity, &self.tracker, Some(&self.leases))
    }

    /// Creates, registers and returns a fresh object with a generated id.
    pub fn create_object(
        &self,
        kind: EntityKind,
        class_tsid: impl Into<String>,
        fields: Value,
    ) -> Result<EntityRef> {
        let object = GameObject::create(kind, class_tsid).with_fields(fields)?;
        let entity = self.register(EntityRef::new(object))?;
        let _entered = self.span.enter();
        event!(
            Level::DEBUG,
            tsid = %entity.tsid(),
            kind = %kind,
            "object created"
        );
        Ok(entity)
    }

    pub fn mark_dirty(&self, entity: &EntityRef) -> Result<()> {
        self.tracker.mark_dirty(entity)
    }

    pub fn mark_unload(&self, entity: &EntityRef) -> Result<()> {
        self.tracker.mark_unload(entity)
    }

    /// Calls `operation` on one object. Unlike batch dispatch, failures are
    /// returned to the caller.
    pub async fn call(&self, tsid: &Tsid, operation: &str, args: &[Value]) -> Result<Value> {
        let entity = self.require(tsid).await?;
        let _entered = self.span.enter();
        self.server.dispatcher().registry().invoke(
            &entity,
            operation,
            args,
            &self.tracker,
            &self.context,
        )
    }

    /// Invokes `operation` on every target; see [`BatchDispatcher`].
    ///
    /// [`BatchDispatcher`]: crate::dispatch::BatchDispatcher
    pub async fn invoke(
        &self,
        operation: &str,
        targets: impl Into<DispatchTargets>,
        args: &[Value],
    ) -> Result<DispatchReport> {
        self.server
            .dispatcher()
            .invoke(self, operation, targets.into(), args, false)
            .instrument(self.span.clone())
            .await
    }

    /// Like [`invoke`](Self::invoke), but unreachable targets are reported
    /// offline without calling the operation.
    pub async fn invoke_for_online(
        &self,
        operation: &str,
        targets: impl Into<DispatchTargets>,
        args: &[Value],
    ) -> Result<DispatchReport> {
        self.server
            .dispatcher()
            .invoke(self, operation, targets.into(), args, true)
            .instrument(self.span.clone())
            .await
    }

    pub fn is_online(&self, tsid: &Tsid) -> bool {
        self.server.dispatcher().is_reachable(tsid)
    }

    /// Writes one entry to the activity log (target `gamecache::actions`).
    pub fn log_action<K, V>(&self, action: &str, fields: impl IntoIterator<Item = (K, V)>)
    where
        K: Display,
        V: Display,
    {
        let details = fields
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(" ");
        let _entered = self.span.enter();
        event!(
            target: "gamecache::actions",
            Level::INFO,
            action = %action,
            details = %details,
            "action"
        );
    }

    /// Ends the request: drains the tracker, commits the dirty set, then
    /// evicts the unload set.
    ///
    /// On a failed commit nothing is evicted and the error lists every id
    /// that was pending. The objects stay cached with their in-memory state.
    pub async fn finish(self) -> Result<CycleReport> {
        let span = self.span.clone();
        self.settle().instrument(span).await
    }

    async fn settle(mut self) -> Result<CycleReport> {
        let drained = self.tracker.drain()?;
        let request_id = self.request_id().to_string();

        let threshold = self.server.config().dirty_warn_threshold;
        if drained.dirty.len() > threshold {
            event!(
                Level::WARN,
                dirty = drained.dirty.len(),
                threshold,
                "request dirtied an unusually large number of objects"
            );
        }

        let batch = match CommitBatch::from_drained(request_id.clone(), &drained) {
            Ok(batch) => batch,
            Err(err) => {
                self.discard(drained)?;
                return Err(err);
            }
        };

        if !batch.is_empty() {
            if let Err(err) = self.commit(&batch).await {
                self.settled = true;
                self.server.cache().release(&self.leases)?;
                let reason = match err {
                    CacheError::CommitFailed { reason, .. } => reason,
                    other => other.to_string(),
                };
                event!(
                    Level::ERROR,
                    dirty = drained.dirty.len(),
                    unload = drained.unload.len(),
                    error = %reason,
                    "commit failed, nothing evicted"
                );
                return Err(CacheError::CommitFailed {
                    request_id,
                    dirty: drained.dirty.keys().map(ToString::to_string).collect(),
                    unload: drained.unload.keys().map(ToString::to_string).collect(),
                    reason,
                });
            }
        }

        for entity in drained.dirty.values() {
            entity.write()?.metadata.persisted = true;
        }

        let mut report = CycleReport {
            request_id,
            committed: drained.dirty_ids(),
            ..CycleReport::default()
        };
        for tsid in drained.unload.keys() {
            match self.server.cache().evict(tsid, Some(&self.leases))? {
                EvictOutcome::Evicted => report.evicted.push(tsid.clone()),
                EvictOutcome::Deferred => report.deferred_evictions.push(tsid.clone()),
                EvictOutcome::NotCached => {}
            }
        }

        self.settled = true;
        self.server.cache().release(&self.leases)?;
        event!(
            Level::DEBUG,
            committed = report.committed.len(),
            evicted = report.evicted.len(),
            deferred = report.deferred_evictions.len(),
            "request cycle finished"
        );
        Ok(report)
    }

    /// Abandons the request: pending marks are dropped and every dirty
    /// object is evicted so the next lookup reloads durable state.
    pub fn rollback(mut self) -> Result<RollbackReport> {
        let span = self.span.clone();
        let _entered = span.enter();
        let drained = self.tracker.drain()?;
        self.discard(drained)
    }

    async fn commit(&self, batch: &CommitBatch) -> Result<()> {
        let pending = self.server.durability().commit(batch);
        match self.server.config().commit_timeout_duration() {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                CacheError::Timeout(format!(
                    "commit of request {} after {} ms",
                    batch.request_id,
                    limit.as_millis()
                ))
            })?,
            None => pending.await,
        }
    }

    fn discard(&mut self, drained: DrainedSets) -> Result<RollbackReport> {
        let span = self.span.clone();
        let _entered = span.enter();
        self.settled = true;
        let mut report = RollbackReport {
            request_id: self.request_id().to_string(),
            discarded: drained.dirty_ids(),
            ..RollbackReport::default()
        };

        let cache = self.server.cache();
        for tsid in drained.dirty.keys() {
            match cache.evict(tsid, Some(&self.leases))? {
                EvictOutcome::Evicted => report.evicted.push(tsid.clone()),
                EvictOutcome::Deferred => {
                    event!(
                        Level::WARN,
                        tsid = %tsid,
                        "rolled back object still held by another request"
                    );
                    report.deferred_evictions.push(tsid.clone());
                }
                EvictOutcome::NotCached => {}
            }
        }
        cache.release(&self.leases)?;

        event!(
            Level::WARN,
            discarded = report.discarded.len(),
            evicted = report.evicted.len(),
            "request cycle rolled back"
        );
        Ok(report)
    }
}

impl Drop for RequestCycle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let span = self.span.clone();
        let _entered = span.enter();
        event!(Level::ERROR, "request cycle dropped unfinished, rolling back");
        let rolled_back = self
            .tracker
            .drain()
            .and_then(|drained| self.discard(drained));
        if let Err(err) = rolled_back {
            event!(Level::ERROR, error = %err, "rollback of dropped request cycle failed");
        }
    }
}

impl fmt::Debug for RequestCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCycle")
            .field("request_id", &self.context.request_id())
            .field("server", &self.server.server_id())
            .field("settled", &self.settled)
            .finish()
    }
}
