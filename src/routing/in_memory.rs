use super::{RemoteCall, RemoteDispatch};
use crate::core::{CacheError, Result};
use crate::dispatch::DispatchOutcome;
use crate::server::ObjectServer;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Forwards calls to other [`ObjectServer`]s living in the same process.
///
/// Stands in for the network between server instances in tests and local
/// multi-server setups.
#[derive(Clone, Default)]
pub struct InMemoryRemoteDispatch {
    peers: Arc<Mutex<HashMap<String, ObjectServer>>>,
}

impl InMemoryRemoteDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_peer(
        &self,
        server_id: impl Into<String>,
        server: ObjectServer,
    ) -> Result<()> {
        let server_id = server_id.into();
        if server_id.trim().is_empty() {
            return Err(CacheError::Config(
                "server_id must not be empty".to_string(),
            ));
        }
        self.peers.lock().await.insert(server_id, server);
        Ok(())
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }
}

#[async_trait]
impl RemoteDispatch for InMemoryRemoteDispatch {
    async fn dispatch(&self, server: &str, call: RemoteCall) -> Result<DispatchOutcome> {
        let peer = {
            let peers = self.peers.lock().await;
            peers.get(server).cloned().ok_or_else(|| CacheError::RemoteDispatch {
                server: server.to_string(),
                reason: "server is not registered".to_string(),
            })?
        };
        event!(
            Level::DEBUG,
            server = %server,
            target = %call.target,
            operation = %call.operation,
            "delivering forwarded call"
        );
        peer.serve_remote(call).await
    }
}
