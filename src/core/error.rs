use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid object id '{0}'")]
    InvalidTsid(String),

    #[error("Identity conflict: a different instance of '{0}' is already cached")]
    IdentityConflict(String),

    #[error("Object '{0}' not found")]
    NotFound(String),

    #[error("Load of '{id}' failed: {reason}")]
    LoadFailed { id: String, reason: String },

    #[error("Commit for request {request_id} failed: {reason}")]
    CommitFailed {
        request_id: String,
        /// Identifiers whose dirty state was not persisted.
        dirty: Vec<String>,
        /// Identifiers that stay cached because the commit did not go through.
        unload: Vec<String>,
        reason: String,
    },

    #[error("Operation '{operation}' is not registered for '{kind}' objects")]
    OperationNotFound { kind: String, operation: String },

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Remote dispatch to '{server}' failed: {reason}")]
    RemoteDispatch { server: String, reason: String },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Shorthand used by operation handlers to fail a single invocation.
    pub fn operation(message: impl Into<String>) -> Self {
        Self::OperationFailed(message.into())
    }

    /// Returns true for errors that signal a broken cache invariant rather than
    /// an expected runtime condition.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::IdentityConflict(_) | Self::LockError(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for CacheError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
