//! C2 — locking helpers built on top of the `NamedLock` collaborator.
//!
//! Two named locks matter in this engine: the target-list lock (registry
//! mutations) and the per-target lock (counter/state read-modify-write).
//! Both use the same `(timeout, exptime)` contract from §4.2.

use std::future::Future;
use std::time::Duration;

use crate::store::NamedLock;

/// `timeout=5s` to acquire, `exptime=10s` auto-release, per §4.2.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub exptime: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            exptime: Duration::from_secs(10),
        }
    }
}

/// A zero-wait variant used by the scheduler: a single attempt, no retry,
/// per §4.7 ("if acquisition fails, the tick is a no-op").
impl LockOptions {
    pub fn try_once(exptime: Duration) -> Self {
        Self {
            timeout: Duration::ZERO,
            exptime,
        }
    }
}

/// Whether a locked operation actually ran or was deferred because the
/// lock could not be acquired within `timeout`. This is the "success or
/// async" sentinel described in §4.2: the caller is told the mutation did
/// not happen synchronously rather than being blocked indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome<T> {
    Ran(T),
    Deferred,
}

impl<T> LockOutcome<T> {
    pub fn ran(self) -> Option<T> {
        match self {
            LockOutcome::Ran(t) => Some(t),
            LockOutcome::Deferred => None,
        }
    }
}

/// Acquire `key`, retrying with a short backoff until `opts.timeout`
/// elapses, run `f` while held, then release. Lock release failures (the
/// lock having already expired out from under us) are not possible with
/// this in-process implementation but would be logged and otherwise
/// ignored by a real shared-memory backend, per §4.2/§7.
pub async fn with_lock<F, Fut, T>(lock: &dyn NamedLock, key: &str, opts: LockOptions, f: F) -> LockOutcome<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    if !acquire_with_retry(lock, key, opts).await {
        return LockOutcome::Deferred;
    }
    let result = f().await;
    lock.release(key);
    LockOutcome::Ran(result)
}

async fn acquire_with_retry(lock: &dyn NamedLock, key: &str, opts: LockOptions) -> bool {
    let deadline = tokio::time::Instant::now() + opts.timeout;
    loop {
        if lock.try_acquire(key, opts.exptime) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn with_lock_runs_the_closure_when_acquired() {
        let store = MemoryStore::new();
        let outcome = with_lock(&store, "k", LockOptions::default(), || async { 42 }).await;
        assert_eq!(outcome.ran(), Some(42));
    }

    #[tokio::test]
    async fn with_lock_defers_when_already_held() {
        let store = MemoryStore::new();
        assert!(store.try_acquire("k", Duration::from_secs(10)));
        let opts = LockOptions {
            timeout: Duration::from_millis(50),
            exptime: Duration::from_secs(10),
        };
        let outcome = with_lock(&store, "k", opts, || async { 1 }).await;
        assert_eq!(outcome.ran(), None);
    }
}
