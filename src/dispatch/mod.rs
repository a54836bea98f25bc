//! Batch dispatch: one named operation fanned out over many objects, with
//! each target's failure contained in its own outcome.

mod outcome;
mod reachability;
mod registry;

pub use outcome::{DispatchOutcome, DispatchReport, DispatchTargets};
pub use reachability::{AlwaysReachable, Presence, ReachabilityOracle, SessionDirectory};
pub use registry::{
    OperationCall, OperationDescriptor, OperationHandler, OperationRegistry, handler,
};

use crate::config::DispatchMode;
use crate::core::{CacheError, Result, Tsid};
use crate::routing::{LocalRouter, ObjectRouter, RemoteCall, RemoteDispatch, Route};
use crate::server::RequestCycle;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Resolves targets through the request's cache view and invokes registered
/// operations on them.
#[derive(Clone)]
pub struct BatchDispatcher {
    registry: Arc<OperationRegistry>,
    reachability: Arc<dyn ReachabilityOracle>,
    router: Arc<dyn ObjectRouter>,
    remote: Option<Arc<dyn RemoteDispatch>>,
    mode: DispatchMode,
    max_targets: usize,
    server_id: String,
}

impl BatchDispatcher {
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self {
            registry,
            reachability: Arc::new(AlwaysReachable),
            router: Arc::new(LocalRouter),
            remote: None,
            mode: DispatchMode::Sequential,
            max_targets: usize::MAX,
            server_id: String::new(),
        }
    }

    pub fn with_reachability(mut self, oracle: Arc<dyn ReachabilityOracle>) -> Self {
        self.reachability = oracle;
        self
    }

    pub fn with_routing(
        mut self,
        router: Arc<dyn ObjectRouter>,
        remote: Option<Arc<dyn RemoteDispatch>>,
    ) -> Self {
        self.router = router;
        self.remote = remote;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_targets(mut self, max_targets: usize) -> Self {
        self.max_targets = max_targets;
        self
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn is_reachable(&self, tsid: &Tsid) -> bool {
        self.reachability.is_reachable(tsid)
    }

    /// Invokes `operation` with `args` on every target.
    ///
    /// Only a batch exceeding the configured target limit fails as a whole;
    /// everything that goes wrong for a single target ends up in that
    /// target's outcome.
    pub async fn invoke(
        &self,
        cycle: &RequestCycle,
        operation: &str,
        targets: DispatchTargets,
        args: &[Value],
        online_only: bool,
    ) -> Result<DispatchReport> {
        let ids = targets.into_unique();
        if ids.len() > self.max_targets {
            return Err(CacheError::operation(format!(
                "batch of {} targets exceeds the limit of {}",
                ids.len(),
                self.max_targets
            )));
        }

        let span = info_span!(
            "dispatch",
            operation = %operation,
            targets = ids.len(),
            online_only
        );
        let report = self
            .run(cycle, operation, ids, args, online_only, true)
            .instrument(span)
            .await;

        event!(
            Level::DEBUG,
            operation = %operation,
            succeeded = report.succeeded(),
            failed = report.failed(),
            offline = report.offline(),
            "batch dispatch finished"
        );
        Ok(report)
    }

    /// Runs a forwarded call for an object this server owns. Never forwards
    /// again, so misrouted calls cannot bounce between servers.
    pub(crate) async fn invoke_routed_here(
        &self,
        cycle: &RequestCycle,
        call: &RemoteCall,
    ) -> DispatchOutcome {
        self.dispatch_one(
            cycle,
            &call.operation,
            &call.target,
            &call.args,
            call.online_only,
            false,
        )
        .await
    }

    async fn run(
        &self,
        cycle: &RequestCycle,
        operation: &str,
        ids: Vec<Tsid>,
        args: &[Value],
        online_only: bool,
        follow_routes: bool,
    ) -> DispatchReport {
        let mut report = DispatchReport::new();
        match self.mode {
            DispatchMode::Sequential => {
                for tsid in ids {
                    let outcome = self
                        .dispatch_one(cycle, operation, &tsid, args, online_only, follow_routes)
                        .await;
                    report.insert(tsid, outcome);
                }
            }
            DispatchMode::Concurrent => {
                let outcomes = join_all(ids.iter().map(|tsid| {
                    self.dispatch_one(cycle, operation, tsid, args, online_only, follow_routes)
                }))
                .await;
                for (tsid, outcome) in ids.into_iter().zip(outcomes) {
                    report.insert(tsid, outcome);
                }
            }
        }
        report
    }

    async fn dispatch_one(
        &self,
        cycle: &RequestCycle,
        operation: &str,
        tsid: &Tsid,
        args: &[Value],
        online_only: bool,
        follow_routes: bool,
    ) -> DispatchOutcome {
        if follow_routes {
            if let Route::Remote(server) = self.router.route(tsid) {
                return self
                    .forward(cycle, &server, operation, tsid, args, online_only)
                    .await;
            }
        }

        if online_only && !self.reachability.is_reachable(tsid) {
            event!(Level::DEBUG, tsid = %tsid, "target offline, skipped");
            return DispatchOutcome::Offline;
        }

        let entity = match cycle.get(tsid).await {
            Ok(Some(entity)) => entity,
            Ok(None) => return DispatchOutcome::failed(CacheError::NotFound(tsid.to_string())),
            Err(err) => return DispatchOutcome::failed(err),
        };

        match self
            .registry
            .invoke(&entity, operation, args, cycle.tracker(), cycle.context())
        {
            Ok(result) => DispatchOutcome::Success {
                id: tsid.clone(),
                result,
            },
            Err(err) => {
                event!(Level::WARN, tsid = %tsid, error = %err, "operation failed for target");
                DispatchOutcome::failed(err)
            }
        }
    }

    async fn forward(
        &self,
        cycle: &RequestCycle,
        server: &str,
        operation: &str,
        tsid: &Tsid,
        args: &[Value],
        online_only: bool,
    ) -> DispatchOutcome {
        let Some(remote) = self.remote.as_ref() else {
            return DispatchOutcome::failed(CacheError::RemoteDispatch {
                server: server.to_string(),
                reason: format!("no forwarder configured for '{}'", tsid),
            });
        };

        let call = RemoteCall {
            request_id: cycle.context().request_id().to_string(),
            origin_server: self.server_id.clone(),
            operation: operation.to_string(),
            target: tsid.clone(),
            args: args.to_vec(),
            online_only,
        };
        event!(Level::DEBUG, tsid = %tsid, server = %server, "forwarding dispatch");
        match remote.dispatch(server, call).await {
            Ok(outcome) => outcome,
            Err(err) => {
                event!(Level::WARN, tsid = %tsid, server = %server, error = %err, "remote dispatch failed");
                DispatchOutcome::failed(err)
            }
        }
    }
}
