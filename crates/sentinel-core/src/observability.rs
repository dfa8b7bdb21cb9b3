//! Free-standing observability helper (§6): dumps the target list
//! decorated with each target's state and counter breakdown, reading
//! directly from the shared store rather than through any one engine's
//! in-memory index — so it reflects every worker's writes.
//!
//! The source this engine is modeled on binds `ip`/`port`/`hostname`
//! from stale names left over from a previous scope when iterating the
//! target list inside this helper's lock acquisition; each entry ends up
//! decorated with the *previous* iteration's identity instead of its own.
//! Binding fresh locals from the current element on every iteration (as
//! below) is the fix, not a faithful reproduction.

use crate::health::InternalHealth;
use crate::store::{Codec, Keyspace, SharedStore};
use crate::target::{target_key, CounterWord, Selector, Target};

/// One row of the decorated dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub target: Target,
    pub state: Option<InternalHealth>,
    pub success: u8,
    pub http_failure: u8,
    pub tcp_failure: u8,
    pub timeout_failure: u8,
}

/// Reads the target list for `(shm_name, name)` straight from `store` and
/// decorates each entry with its current state and counter breakdown.
pub fn get_target_list(shm_name: &str, name: &str, store: std::sync::Arc<dyn SharedStore>) -> crate::error::Result<Vec<TargetStatus>> {
    let keyspace = Keyspace::new(shm_name, name);
    let codec = Codec::new(store, keyspace);
    let list = codec.get_target_list()?;

    let mut rows = Vec::with_capacity(list.0.len());
    for target in list.0 {
        let key = target_key(&target.ip, target.port, target.hostname.as_deref());
        let state = codec.get_state_by_key(&key).and_then(InternalHealth::from_i64);
        let word = CounterWord(codec.get_counter_word(&key));
        rows.push(TargetStatus {
            target,
            state,
            success: word.extract(Selector::Success),
            http_failure: word.extract(Selector::Http),
            tcp_failure: word.extract(Selector::Tcp),
            timeout_failure: word.extract(Selector::Timeout),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::target::TargetList;
    use std::sync::Arc;

    #[test]
    fn each_row_is_decorated_with_its_own_identity() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let keyspace = Keyspace::new("shm", "n");
        let codec = Codec::new(store.clone(), keyspace);

        let mut list = TargetList::default();
        list.push(Target::new("10.0.0.1", 80, None, None));
        list.push(Target::new("10.0.0.2", 443, Some("api.example".into()), None));
        codec.put_target_list(&list).unwrap();
        codec.set_state_by_key("10.0.0.1:80", InternalHealth::Healthy as i64);
        codec.set_state_by_key("10.0.0.2:443:api.example", InternalHealth::Unhealthy as i64);
        codec.incr_counter("10.0.0.2:443:api.example", Selector::Tcp);

        let rows = get_target_list("shm", "n", store).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].target.ip, "10.0.0.1");
        assert_eq!(rows[0].state, Some(InternalHealth::Healthy));
        assert_eq!(rows[1].target.ip, "10.0.0.2");
        assert_eq!(rows[1].state, Some(InternalHealth::Unhealthy));
        assert_eq!(rows[1].tcp_failure, 1);
    }
}
