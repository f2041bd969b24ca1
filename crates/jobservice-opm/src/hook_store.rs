//! In-memory cache of job id to hook URL.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct HookStore {
    hooks: RwLock<HashMap<String, String>>,
}

impl HookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, job_id: &str, url: &str) {
        self.hooks.write().insert(job_id.to_string(), url.to_string());
    }

    pub fn get(&self, job_id: &str) -> Option<String> {
        self.hooks.read().get(job_id).cloned()
    }

    pub fn remove(&self, job_id: &str) -> Option<String> {
        self.hooks.write().remove(job_id)
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }
}
