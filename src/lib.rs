// ============================================================================
// gamecache: object cache and request cycle of a game server
// ============================================================================

pub mod cache;
pub mod config;
pub mod context;
pub mod core;
pub mod dispatch;
pub mod durability;
pub mod routing;
pub mod server;
pub mod telemetry;
pub mod tracker;

// Re-export main types for convenience
pub use cache::{CacheStats, ObjectCache};
pub use config::{DispatchMode, ServerConfig};
pub use context::{RequestContext, SessionRef};
pub use core::{CacheError, EntityKind, EntityRef, GameObject, Result, Tsid};
pub use dispatch::{
    BatchDispatcher, DispatchOutcome, DispatchReport, DispatchTargets, OperationCall,
    OperationDescriptor, OperationRegistry, ReachabilityOracle, SessionDirectory, handler,
};
pub use durability::{CommitBatch, Durability, InMemoryDurability};
pub use routing::{HashRouter, InMemoryRemoteDispatch, ObjectRouter, RemoteDispatch, Route};
pub use server::{CycleReport, ObjectServer, RequestCycle, RollbackReport};
pub use tracker::{DrainedSets, MutationTracker};
