use crate::core::{Result, Tsid};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{Level, event};

/// Answers whether an object can currently receive calls, e.g. whether a
/// player is connected.
pub trait ReachabilityOracle: Send + Sync {
    fn is_reachable(&self, tsid: &Tsid) -> bool;
}

/// Treats every object as reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

impl ReachabilityOracle for AlwaysReachable {
    fn is_reachable(&self, _tsid: &Tsid) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    Connected { session_id: String },
    /// Handing over to another server instance; still counts as online.
    MovingServers { target_server: String },
}

/// Players known to be online on this server.
#[derive(Debug, Default)]
pub struct SessionDirectory {
    players: RwLock<HashMap<Tsid, Presence>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, player: Tsid, session_id: impl Into<String>) -> Result<()> {
        let session_id = session_id.into();
        event!(Level::INFO, player = %player, session = %session_id, "player connected");
        self.players
            .write()?
            .insert(player, Presence::Connected { session_id });
        Ok(())
    }

    pub fn begin_move(&self, player: &Tsid, target_server: impl Into<String>) -> Result<()> {
        let mut players = self.players.write()?;
        players.insert(
            player.clone(),
            Presence::MovingServers {
                target_server: target_server.into(),
            },
        );
        Ok(())
    }

    pub fn disconnect(&self, player: &Tsid) -> Result<Option<Presence>> {
        let removed = self.players.write()?.remove(player);
        if removed.is_some() {
            event!(Level::INFO, player = %player, "player disconnected");
        }
        Ok(removed)
    }

    pub fn presence(&self, player: &Tsid) -> Result<Option<Presence>> {
        Ok(self.players.read()?.get(player).cloned())
    }

    pub fn online_count(&self) -> Result<usize> {
        Ok(self.players.read()?.len())
    }
}

impl ReachabilityOracle for SessionDirectory {
    fn is_reachable(&self, tsid: &Tsid) -> bool {
        match self.players.read() {
            Ok(players) => players.contains_key(tsid),
            Err(err) => {
                event!(Level::ERROR, tsid = %tsid, error = %err, "session directory lock poisoned");
                false
            }
        }
    }
}
