/// Errors surfaced by the lock manager and lock handles.
///
/// Contention is deliberately not represented here: an acquisition
/// that simply failed to reach quorum yields an absent handle, not an
/// error. Only the scoped critical section promotes it to
/// [`LockError::LockAcquisitionFailed`].
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Input validation failure: raised before any server is
    /// contacted and never retried.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// No attempt reached quorum within the retry budget.
    #[error("Failed to acquire lock for resource: {0}")]
    LockAcquisitionFailed(String),

    /// An explicit extension could not be carried out at all, as
    /// opposed to being refused by the servers.
    #[error("Failed to extend lock")]
    LockExtensionFailed(#[source] Box<LockError>),

    /// A single server's script invocation failed. Demoted to a
    /// refusal inside every fan-out; a minority of failed servers
    /// must not poison an operation.
    #[error("Server script error: {0}")]
    ServerScriptError(#[from] redis::RedisError),
}
