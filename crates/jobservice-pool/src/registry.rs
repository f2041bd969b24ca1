//! Job handler registry.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use jobservice_protocols::{Job, JobServiceError, JobServiceResult};

/// Maps job names to handlers, one name per handler type and vice versa.
#[derive(Default)]
pub struct JobRegistry {
    handlers: DashMap<String, Arc<dyn Job>>,
    /// Handler type name -> job name.
    types: DashMap<&'static str, String>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handler: Arc<dyn Job>) -> JobServiceResult<()> {
        if name.is_empty() {
            return Err(JobServiceError::Validation("empty job name".to_string()));
        }

        let type_name = handler.type_name();
        match self.types.entry(type_name) {
            Entry::Occupied(existing) => {
                return Err(JobServiceError::conflict(
                    format!(
                        "handler {} is already registered as '{}'",
                        type_name,
                        existing.get()
                    ),
                    existing.get().clone(),
                ));
            }
            Entry::Vacant(slot) => {
                if self.handlers.contains_key(name) {
                    return Err(JobServiceError::conflict(
                        format!("job name '{}' is already registered", name),
                        name,
                    ));
                }
                self.handlers.insert(name.to_string(), handler);
                slot.insert(name.to_string());
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.handlers.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobservice_protocols::{JobContext, JobError, Parameters};

    struct Gc;
    struct Replicate;

    #[async_trait]
    impl Job for Gc {
        async fn run(&self, _ctx: &JobContext, _params: &Parameters) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Job for Replicate {
        async fn run(&self, _ctx: &JobContext, _params: &Parameters) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = JobRegistry::new();
        registry.register("GC", Arc::new(Gc)).unwrap();
        registry.register("REPLICATION", Arc::new(Replicate)).unwrap();

        assert!(registry.is_known("GC"));
        assert!(!registry.is_known("SCAN"));
        assert!(registry.get("GC").unwrap().type_name().ends_with("Gc"));
        assert_eq!(registry.names(), vec!["GC", "REPLICATION"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registration_is_one_to_one() {
        let registry = JobRegistry::new();
        registry.register("GC", Arc::new(Gc)).unwrap();

        let err = registry.register("GC_AGAIN", Arc::new(Gc)).unwrap_err();
        assert_eq!(err.conflicting_id(), Some("GC"));

        let err = registry.register("GC", Arc::new(Replicate)).unwrap_err();
        assert!(err.is_conflict());

        assert!(registry.register("", Arc::new(Replicate)).is_err());
        assert_eq!(registry.len(), 1);
    }
}
