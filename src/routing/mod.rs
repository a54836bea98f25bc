//! Request-routing hook: decides which server instance owns an object and
//! forwards dispatch calls for objects owned elsewhere.

mod in_memory;

pub use in_memory::InMemoryRemoteDispatch;

use crate::core::{CacheError, Result, Tsid};
use crate::dispatch::DispatchOutcome;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote(String),
}

pub trait ObjectRouter: Send + Sync {
    fn route(&self, tsid: &Tsid) -> Route;
}

/// Single-server setup: everything is local.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRouter;

impl ObjectRouter for LocalRouter {
    fn route(&self, _tsid: &Tsid) -> Route {
        Route::Local
    }
}

/// Assigns objects to a fixed server list by a stable hash of the id.
#[derive(Debug, Clone)]
pub struct HashRouter {
    local_server: String,
    servers: Vec<String>,
}

impl HashRouter {
    pub fn new(local_server: impl Into<String>, servers: Vec<String>) -> Result<Self> {
        let local_server = local_server.into();
        if servers.is_empty() {
            return Err(CacheError::Config(
                "router needs at least one server".to_string(),
            ));
        }
        if servers.iter().any(|server| server.trim().is_empty()) {
            return Err(CacheError::Config(
                "server ids must not be empty".to_string(),
            ));
        }
        if !servers.contains(&local_server) {
            return Err(CacheError::Config(format!(
                "local server '{}' is not part of the server list",
                local_server
            )));
        }
        Ok(Self {
            local_server,
            servers,
        })
    }

    pub fn owner(&self, tsid: &Tsid) -> &str {
        &self.servers[stable_server_index(tsid, self.servers.len())]
    }
}

impl ObjectRouter for HashRouter {
    fn route(&self, tsid: &Tsid) -> Route {
        let owner = self.owner(tsid);
        if owner == self.local_server {
            Route::Local
        } else {
            Route::Remote(owner.to_string())
        }
    }
}

/// FNV-1a over the id bytes, reduced to `count` buckets.
pub fn stable_server_index(tsid: &Tsid, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let mut hash = 14695981039346656037u64;
    for byte in tsid.as_str().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    (hash % count as u64) as usize
}

/// A dispatch call for one target, shipped to the server owning it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteCall {
    pub request_id: String,
    pub origin_server: String,
    pub operation: String,
    pub target: Tsid,
    pub args: Vec<Value>,
    /// The owning server applies its own reachability check.
    pub online_only: bool,
}

/// Transport for [`RemoteCall`]s between server instances.
#[async_trait]
pub trait RemoteDispatch: Send + Sync {
    async fn dispatch(&self, server: &str, call: RemoteCall) -> Result<DispatchOutcome>;
}
