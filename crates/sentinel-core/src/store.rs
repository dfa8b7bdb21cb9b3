//! C1 — the shared-store codec.
//!
//! `SharedStore` is the external collaborator boundary (spec §6): a
//! key-value segment shared across worker processes, with atomic integer
//! increment. A reimplementation embedding this engine in a real proxy
//! hands in its own `SharedStore` backed by actual shared memory; this
//! crate ships `MemoryStore`, a process-local stand-in built on `dashmap`
//! (the same concurrent-map idiom this pack's `cyrup-ai-paraphym` and
//! `migux_proxy` health tracker use) so the engine is usable and testable
//! without an external dependency.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::error::{Result, SentinelError};
use crate::target::{target_key, CounterWord, Selector, Target, TargetList};

/// Namespaces keys as `<shm_name>:<name>:<role>[:<target_key>]`, per §4.1.
/// Two engines sharing a store collide only if they share both `shm_name`
/// and `name`.
#[derive(Debug, Clone)]
pub struct Keyspace {
    shm_name: String,
    name: String,
}

impl Keyspace {
    pub fn new(shm_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            shm_name: shm_name.into(),
            name: name.into(),
        }
    }

    fn role(&self, role: &str) -> String {
        format!("{}:{}:{}", self.shm_name, self.name, role)
    }

    fn per_target(&self, role: &str, target_key: &str) -> String {
        format!("{}:{}:{}:{}", self.shm_name, self.name, role, target_key)
    }

    pub fn target_list(&self) -> String {
        self.role("target_list")
    }

    pub fn target_list_lock(&self) -> String {
        self.role("target_list_lock")
    }

    pub fn state(&self, target_key: &str) -> String {
        self.per_target("state", target_key)
    }

    pub fn counter(&self, target_key: &str) -> String {
        self.per_target("counter", target_key)
    }

    pub fn target_lock(&self, target_key: &str) -> String {
        self.per_target("target_lock", target_key)
    }

    pub fn period_lock(&self, which: &str) -> String {
        self.per_target("period_lock", which)
    }
}

/// The raw key-value segment. Blobs hold the serialized target list;
/// integers hold per-target state and the packed counter word.
pub trait SharedStore: Send + Sync {
    fn get_blob(&self, key: &str) -> Option<Vec<u8>>;
    fn set_blob(&self, key: &str, value: Vec<u8>);

    fn get_int(&self, key: &str) -> Option<i64>;
    fn set_int(&self, key: &str, value: i64);
    /// Atomically add `delta` to the value at `key`, creating it with
    /// `initial` first if absent, and return the post-increment value.
    fn incr_int(&self, key: &str, delta: i64, initial: i64) -> i64;
    fn delete(&self, key: &str);
}

/// A single attempt to extend or acquire a named lock; see `lock.rs` for
/// the retry/timeout contract built on top of this.
pub trait NamedLock: Send + Sync {
    /// Attempt to take `key` right now, holding it for `exptime`. Returns
    /// whether the lock was acquired (or already held by us and renewed).
    fn try_acquire(&self, key: &str, exptime: Duration) -> bool;
    fn release(&self, key: &str);
}

/// Process-local `SharedStore` + `NamedLock` implementation backed by
/// `dashmap`. Stands in for a true shared-memory segment; a production
/// embedding behind a real reverse proxy provides its own implementation
/// of both traits over actual shared memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: DashMap<String, Vec<u8>>,
    ints: DashMap<String, i64>,
    locks: DashMap<String, Instant>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedStore for MemoryStore {
    fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.get(key).map(|v| v.clone())
    }

    fn set_blob(&self, key: &str, value: Vec<u8>) {
        self.blobs.insert(key.to_string(), value);
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.ints.get(key).map(|v| *v)
    }

    fn set_int(&self, key: &str, value: i64) {
        self.ints.insert(key.to_string(), value);
    }

    fn incr_int(&self, key: &str, delta: i64, initial: i64) -> i64 {
        let mut entry = self.ints.entry(key.to_string()).or_insert(initial);
        *entry += delta;
        *entry
    }

    fn delete(&self, key: &str) {
        self.blobs.remove(key);
        self.ints.remove(key);
    }
}

impl NamedLock for MemoryStore {
    fn try_acquire(&self, key: &str, exptime: Duration) -> bool {
        let now = Instant::now();
        match self.locks.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if *e.get() <= now {
                    *e.get_mut() = now + exptime;
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(now + exptime);
                true
            }
        }
    }

    fn release(&self, key: &str) {
        self.locks.remove(key);
    }
}

/// Typed operations over a `SharedStore`, implementing C1's codec: pack
/// and unpack the target list and the counter word.
pub struct Codec {
    store: std::sync::Arc<dyn SharedStore>,
    keyspace: Keyspace,
}

impl Codec {
    pub fn new(store: std::sync::Arc<dyn SharedStore>, keyspace: Keyspace) -> Self {
        Self { store, keyspace }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn put_target_list(&self, list: &TargetList) -> Result<()> {
        let encoded = serde_json::to_vec(list)
            .map_err(|e| SentinelError::Store(format!("encode target list: {e}")))?;
        self.store.set_blob(&self.keyspace.target_list(), encoded);
        Ok(())
    }

    pub fn get_target_list(&self) -> Result<TargetList> {
        match self.store.get_blob(&self.keyspace.target_list()) {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SentinelError::Store(format!("decode target list: {e}"))),
            None => Ok(TargetList::default()),
        }
    }

    pub fn get_state(&self, target: &Target) -> Option<i64> {
        let key = target_key(&target.ip, target.port, target.hostname.as_deref());
        self.store.get_int(&self.keyspace.state(&key))
    }

    pub fn get_state_by_key(&self, key: &str) -> Option<i64> {
        self.store.get_int(&self.keyspace.state(key))
    }

    pub fn set_state_by_key(&self, key: &str, state: i64) {
        self.store.set_int(&self.keyspace.state(key), state);
    }

    pub fn delete_state(&self, key: &str) {
        self.store.delete(&self.keyspace.state(key));
    }

    pub fn incr_counter(&self, key: &str, selector: Selector) -> u32 {
        let word = self
            .store
            .incr_int(&self.keyspace.counter(key), selector.increment_delta(), 0);
        word as u32
    }

    pub fn get_counter_word(&self, key: &str) -> u32 {
        self.store.get_int(&self.keyspace.counter(key)).unwrap_or(0) as u32
    }

    pub fn set_counter_word(&self, key: &str, word: u32) {
        self.store.set_int(&self.keyspace.counter(key), word as i64);
    }

    pub fn clear_counter(&self, key: &str) {
        self.set_counter_word(key, 0);
    }

    pub fn delete_counter(&self, key: &str) {
        self.store.delete(&self.keyspace.counter(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn codec() -> Codec {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        Codec::new(store, Keyspace::new("shm", "test"))
    }

    #[test]
    fn target_list_round_trips_through_the_store() {
        let codec = codec();
        let mut list = TargetList::default();
        list.push(Target::new("10.0.0.1", 80, None, None));
        codec.put_target_list(&list).unwrap();
        let back = codec.get_target_list().unwrap();
        assert_eq!(back.0, list.0);
    }

    #[test]
    fn missing_target_list_is_empty() {
        let codec = codec();
        assert!(codec.get_target_list().unwrap().0.is_empty());
    }

    #[test]
    fn incr_counter_bumps_only_the_selected_byte() {
        let codec = codec();
        let word = codec.incr_counter("t1", Selector::Http);
        assert_eq!(CounterWord(word).extract(Selector::Http), 1);
        let word = codec.incr_counter("t1", Selector::Http);
        assert_eq!(CounterWord(word).extract(Selector::Http), 2);
        assert_eq!(CounterWord(word).extract(Selector::Success), 0);
    }

    #[test]
    fn lock_try_acquire_blocks_concurrent_holders_until_released() {
        let store = MemoryStore::new();
        assert!(store.try_acquire("k", Duration::from_secs(10)));
        assert!(!store.try_acquire("k", Duration::from_secs(10)));
        store.release("k");
        assert!(store.try_acquire("k", Duration::from_secs(10)));
    }
}
