//! Request-scoped correlation context.
//!
//! A [`RequestContext`] is bound for exactly one logical request with
//! [`establish`] (async) or [`establish_sync`]. While bound, [`current`]
//! returns it and every tracing event emitted inside the scope is recorded
//! under the request span, so it carries the `rc` and `session` fields
//! without the call site passing them.

use crate::core::Tsid;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use tracing::{Instrument, Span, field, info_span};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_CONTEXT: RequestContext;
}

/// Reference to the client session a request arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRef {
    pub session_id: String,
    /// Player logged in on the session, once known.
    pub player: Option<Tsid>,
}

impl SessionRef {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            player: None,
        }
    }

    pub fn with_player(mut self, player: Tsid) -> Self {
        self.player = Some(player);
        self
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.player {
            Some(player) => write!(f, "{}({})", self.session_id, player),
            None => f.write_str(&self.session_id),
        }
    }
}

/// Correlation data for one request cycle. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    request_id: String,
    /// Short label for what triggered the request (message type, timer name).
    tag: Option<String>,
    session: Option<SessionRef>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::with_request_id(Uuid::new_v4().to_string())
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tag: None,
            session: None,
        }
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_session(mut self, session: SessionRef) -> Self {
        self.session = Some(session);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn session(&self) -> Option<&SessionRef> {
        self.session.as_ref()
    }

    /// Span that every event of this request is recorded under.
    pub fn span(&self) -> Span {
        let span = info_span!(
            "request",
            rc = %self.request_id,
            tag = field::Empty,
            session = field::Empty
        );
        if let Some(tag) = &self.tag {
            span.record("tag", tag.as_str());
        }
        if let Some(session) = &self.session {
            span.record("session", field::display(session));
        }
        span
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}", self.request_id, tag),
            None => f.write_str(&self.request_id),
        }
    }
}

/// Runs `future` with `ctx` bound as the current request context.
///
/// The binding is released when the future completes, errors or is dropped.
pub async fn establish<F>(ctx: RequestContext, future: F) -> F::Output
where
    F: Future,
{
    let span = ctx.span();
    establish_in(ctx, span, future).await
}

/// Like [`establish`], recording events under an existing request span.
pub async fn establish_in<F>(ctx: RequestContext, span: Span, future: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(ctx, future.instrument(span)).await
}

/// Synchronous counterpart of [`establish`].
pub fn establish_sync<R>(ctx: RequestContext, f: impl FnOnce() -> R) -> R {
    let span = ctx.span();
    let _entered = span.enter();
    CURRENT_CONTEXT.sync_scope(ctx, f)
}

/// The context bound to the running request, if any.
pub fn current() -> Option<RequestContext> {
    CURRENT_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Id of the running request, if any. Avoids cloning the whole context.
pub fn current_request_id() -> Option<String> {
    CURRENT_CONTEXT
        .try_with(|ctx| ctx.request_id.clone())
        .ok()
}
