//! In-memory cache of active periodic policies.

use std::collections::HashMap;

use jobservice_protocols::Policy;
use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: RwLock<HashMap<String, Policy>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by policy id. Policies without an id are ignored.
    pub fn add(&self, policy: Policy) -> bool {
        if policy.id.is_empty() {
            return false;
        }
        self.policies.write().insert(policy.id.clone(), policy);
        true
    }

    pub fn remove(&self, policy_id: &str) -> Option<Policy> {
        self.policies.write().remove(policy_id)
    }

    pub fn get(&self, policy_id: &str) -> Option<Policy> {
        self.policies.read().get(policy_id).cloned()
    }

    /// Snapshot of every cached policy.
    pub fn list(&self) -> Vec<Policy> {
        self.policies.read().values().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.policies.read().len()
    }

    pub fn clear(&self) {
        self.policies.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobservice_protocols::Parameters;

    #[test]
    fn test_add_remove() {
        let store = PolicyStore::new();
        assert!(store.add(Policy::new("P1", "gc", Parameters::new(), "0 * * * * *")));
        assert!(!store.add(Policy::new("", "gc", Parameters::new(), "0 * * * * *")));
        assert_eq!(store.size(), 1);
        assert_eq!(store.get("P1").unwrap().job_name, "gc");

        assert!(store.remove("P1").is_some());
        assert!(store.remove("P1").is_none());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_add_replaces() {
        let store = PolicyStore::new();
        store.add(Policy::new("P1", "gc", Parameters::new(), "0 * * * * *"));
        store.add(Policy::new("P1", "gc", Parameters::new(), "0 */5 * * * *"));
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get("P1").unwrap().cron_spec, "0 */5 * * * *");

        store.clear();
        assert!(store.list().is_empty());
    }
}
