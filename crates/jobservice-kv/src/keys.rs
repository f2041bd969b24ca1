//! Persistent key schema. Every key lives under `<namespace>:`.

use jobservice_protocols::Parameters;
use sha2::{Digest, Sha256};

/// Builds the keys of one tenant namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    namespace: String,
}

impl KeyBuilder {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace: String = namespace.into();
        Self {
            namespace: namespace.trim_end_matches(':').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.namespace, suffix)
    }

    /// Immediate queue (list) of one job name.
    pub fn jobs(&self, job_name: &str) -> String {
        self.key(&format!("jobs:{}", job_name))
    }

    /// Jobs of `job_name` taken by pool `pool_id` and not yet finished.
    pub fn in_progress(&self, job_name: &str, pool_id: &str) -> String {
        self.key(&format!("jobs:{}:{}:inprogress", job_name, pool_id))
    }

    /// Hash of running job ids, valued by the epoch they started.
    pub fn in_progress_tracker(&self) -> String {
        self.key("job_track:inprogress")
    }

    /// Delayed queue, scored by run epoch.
    pub fn scheduled(&self) -> String {
        self.key("scheduled")
    }

    /// Retry queue, scored by next attempt epoch.
    pub fn retry(&self) -> String {
        self.key("retry")
    }

    /// Dead queue, scored by death epoch.
    pub fn dead(&self) -> String {
        self.key("dead")
    }

    pub fn period_policies(&self) -> String {
        self.key("period:policies")
    }

    pub fn period_key_score(&self) -> String {
        self.key("period:key_score")
    }

    /// Pub/sub channel carrying every cross-replica event.
    pub fn notifications(&self) -> String {
        self.key("period:policies:notifications")
    }

    pub fn period_lock(&self) -> String {
        self.key("period:lock")
    }

    pub fn job_stats(&self, job_id: &str) -> String {
        self.key(&format!("job_stats:{}", job_id))
    }

    pub fn last_periodic_enqueue(&self) -> String {
        self.key("last_periodic_enqueue")
    }

    pub fn unique_running(&self, job_name: &str, params_digest: &str) -> String {
        self.key(&format!("unique:running:{}:{}", job_name, params_digest))
    }

    pub fn upstream_job_executions(&self, job_id: &str) -> String {
        self.key(&format!("upstream_job_executions:{}", job_id))
    }

    /// Heartbeat set of all worker pools, scored by heartbeat epoch.
    pub fn worker_pools(&self) -> String {
        self.key("worker_pools")
    }

    pub fn worker_pool(&self, pool_id: &str) -> String {
        self.key(&format!("worker_pools:{}", pool_id))
    }
}

/// Stable digest of a parameter mapping.
///
/// Parameters are an ordered map, so equal mappings always encode to the
/// same JSON text.
pub fn params_digest(params: &Parameters) -> String {
    let encoded = serde_json::to_vec(params).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_namespaced() {
        let keys = KeyBuilder::new("{harbor_job_service}");
        assert_eq!(keys.scheduled(), "{harbor_job_service}:scheduled");
        assert_eq!(keys.period_policies(), "{harbor_job_service}:period:policies");
        assert_eq!(
            keys.notifications(),
            "{harbor_job_service}:period:policies:notifications"
        );
        assert_eq!(keys.job_stats("J1"), "{harbor_job_service}:job_stats:J1");
        assert_eq!(keys.jobs("DEMO"), "{harbor_job_service}:jobs:DEMO");
        assert_eq!(
            keys.upstream_job_executions("P1"),
            "{harbor_job_service}:upstream_job_executions:P1"
        );
    }

    #[test]
    fn test_trailing_colon_is_trimmed() {
        let keys = KeyBuilder::new("ns:");
        assert_eq!(keys.dead(), "ns:dead");
        assert_eq!(keys.namespace(), "ns");
    }

    #[test]
    fn test_params_digest_ignores_insertion_order() {
        let mut a = Parameters::new();
        a.insert("x".to_string(), json!(1));
        a.insert("y".to_string(), json!("two"));

        let mut b = Parameters::new();
        b.insert("y".to_string(), json!("two"));
        b.insert("x".to_string(), json!(1));

        assert_eq!(params_digest(&a), params_digest(&b));
        assert_eq!(params_digest(&a).len(), 64);

        b.insert("z".to_string(), json!(null));
        assert_ne!(params_digest(&a), params_digest(&b));
    }

    #[test]
    fn test_in_progress_keys() {
        let keys = KeyBuilder::new("ns");
        assert_eq!(keys.in_progress("DEMO", "p1"), "ns:jobs:DEMO:p1:inprogress");
        assert_eq!(keys.in_progress_tracker(), "ns:job_track:inprogress");
    }

    #[test]
    fn test_unique_key() {
        let keys = KeyBuilder::new("ns");
        let key = keys.unique_running("DEMO", "abc");
        assert_eq!(key, "ns:unique:running:DEMO:abc");
    }
}
