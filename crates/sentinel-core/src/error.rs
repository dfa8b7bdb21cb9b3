use thiserror::Error;

/// Error taxonomy for the engine, matching the kinds catalogued in the
/// component design: configuration errors abort construction, store errors
/// surface to the caller with no state change, lock timeouts are reported
/// through [`crate::lock::LockOutcome`] rather than this enum, and probe /
/// sync-lag conditions never escape the engine (they are logged and folded
/// into a passive-style observation or a no-op return).
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shared store error: {0}")]
    Store(String),

    #[error("lock timeout acquiring {0}")]
    LockTimeout(String),
}

pub type Result<T> = std::result::Result<T, SentinelError>;
