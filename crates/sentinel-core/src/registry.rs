//! C3 — the per-worker target index.
//!
//! Each worker keeps a local projection of the shared target list so hot
//! reads (probing, status lookups) never touch the store. The index is a
//! two-layer map, `ip -> port -> hostname -> Entry`, mirroring the
//! `<ip>:<port>:<hostname>` key used in the shared store, plus an ordered
//! `Vec` of keys so iteration order matches insertion order (§4.3).
//!
//! The index is kept in sync two ways: synchronously, when the local
//! worker itself adds/removes/clears targets; and via the event bus, when
//! another worker's mutation or a verdict flip needs to reach us. Health
//! flips from `apply_report` never touch the index directly — only the
//! bus subscriber does that (see `engine.rs`).

use std::collections::HashMap;

use crate::health::InternalHealth;
use crate::target::{target_key, Target};

#[derive(Debug, Clone)]
struct Entry {
    target: Target,
    health: InternalHealth,
}

/// `ip -> port -> hostname_key -> Entry`, plus an insertion-ordered key
/// list for stable iteration over `list()`.
#[derive(Debug, Default)]
pub struct TargetIndex {
    tree: HashMap<String, HashMap<u16, HashMap<String, Entry>>>,
    order: Vec<String>,
}

impl TargetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: Target, health: InternalHealth) {
        let key = target_key(&target.ip, target.port, target.hostname.as_deref());
        let hostname_key = target.key_hostname().to_string();
        let is_new = !self
            .tree
            .get(&target.ip)
            .and_then(|by_port| by_port.get(&target.port))
            .map(|by_host| by_host.contains_key(&hostname_key))
            .unwrap_or(false);

        self.tree
            .entry(target.ip.clone())
            .or_default()
            .entry(target.port)
            .or_default()
            .insert(hostname_key, Entry { target, health });

        if is_new {
            self.order.push(key);
        }
    }

    pub fn remove(&mut self, ip: &str, port: u16, hostname: Option<&str>) {
        let key = target_key(ip, port, hostname);
        let hostname_key = hostname.unwrap_or(ip);

        if let Some(by_port) = self.tree.get_mut(ip) {
            if let Some(by_host) = by_port.get_mut(&port) {
                by_host.remove(hostname_key);
                if by_host.is_empty() {
                    by_port.remove(&port);
                }
            }
            if by_port.is_empty() {
                self.tree.remove(ip);
            }
        }
        self.order.retain(|k| k != &key);
    }

    pub fn clear(&mut self) {
        self.tree.clear();
        self.order.clear();
    }

    pub fn get(&self, ip: &str, port: u16, hostname: Option<&str>) -> Option<&Target> {
        self.entry(ip, port, hostname).map(|e| &e.target)
    }

    pub fn get_health(&self, ip: &str, port: u16, hostname: Option<&str>) -> Option<InternalHealth> {
        self.entry(ip, port, hostname).map(|e| e.health)
    }

    pub fn set_health(&mut self, ip: &str, port: u16, hostname: Option<&str>, health: InternalHealth) {
        if let Some(e) = self.entry_mut(ip, port, hostname) {
            e.health = health;
        }
    }

    /// All targets and their health, in insertion order.
    pub fn list(&self) -> Vec<(Target, InternalHealth)> {
        self.order
            .iter()
            .filter_map(|key| self.find_by_key(key))
            .map(|e| (e.target.clone(), e.health))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn entry(&self, ip: &str, port: u16, hostname: Option<&str>) -> Option<&Entry> {
        let hostname_key = hostname.unwrap_or(ip);
        self.tree.get(ip)?.get(&port)?.get(hostname_key)
    }

    fn entry_mut(&mut self, ip: &str, port: u16, hostname: Option<&str>) -> Option<&mut Entry> {
        let hostname_key = hostname.unwrap_or(ip).to_string();
        self.tree.get_mut(ip)?.get_mut(&port)?.get_mut(&hostname_key)
    }

    fn find_by_key(&self, key: &str) -> Option<&Entry> {
        self.tree.values().flat_map(|by_port| by_port.values()).flat_map(|by_host| by_host.values()).find(|e| {
            target_key(&e.target.ip, e.target.port, e.target.hostname.as_deref()) == key
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ip: &str, port: u16) -> Target {
        Target::new(ip, port, None, None)
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut idx = TargetIndex::new();
        idx.insert(t("10.0.0.1", 80), InternalHealth::Healthy);
        assert_eq!(idx.get("10.0.0.1", 80, None), Some(&t("10.0.0.1", 80)));
        assert_eq!(idx.get_health("10.0.0.1", 80, None), Some(InternalHealth::Healthy));
    }

    #[test]
    fn remove_prunes_empty_leaf_maps() {
        let mut idx = TargetIndex::new();
        idx.insert(t("10.0.0.1", 80), InternalHealth::Healthy);
        idx.remove("10.0.0.1", 80, None);
        assert!(idx.is_empty());
        assert!(idx.tree.is_empty());
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut idx = TargetIndex::new();
        idx.insert(t("10.0.0.2", 80), InternalHealth::Healthy);
        idx.insert(t("10.0.0.1", 80), InternalHealth::Healthy);
        let keys: Vec<String> = idx.list().into_iter().map(|(t, _)| t.ip).collect();
        assert_eq!(keys, vec!["10.0.0.2".to_string(), "10.0.0.1".to_string()]);
    }

    #[test]
    fn set_health_updates_in_place() {
        let mut idx = TargetIndex::new();
        idx.insert(t("10.0.0.1", 80), InternalHealth::Healthy);
        idx.set_health("10.0.0.1", 80, None, InternalHealth::Unhealthy);
        assert_eq!(idx.get_health("10.0.0.1", 80, None), Some(InternalHealth::Unhealthy));
    }

    #[test]
    fn clear_empties_everything() {
        let mut idx = TargetIndex::new();
        idx.insert(t("10.0.0.1", 80), InternalHealth::Healthy);
        idx.insert(t("10.0.0.2", 80), InternalHealth::Healthy);
        idx.clear();
        assert!(idx.is_empty());
    }

    #[test]
    fn distinct_hostnames_on_the_same_ip_port_coexist() {
        let mut idx = TargetIndex::new();
        idx.insert(Target::new("10.0.0.1", 80, Some("a.example".into()), None), InternalHealth::Healthy);
        idx.insert(Target::new("10.0.0.1", 80, Some("b.example".into()), None), InternalHealth::Unhealthy);
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.get_health("10.0.0.1", 80, Some("a.example")), Some(InternalHealth::Healthy));
        assert_eq!(idx.get_health("10.0.0.1", 80, Some("b.example")), Some(InternalHealth::Unhealthy));
    }
}
