//! In-memory service store indexed by id and url.

use crate::types::ServiceDefinition;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Indexes {
    by_id: HashMap<String, ServiceDefinition>,
    by_url: HashMap<String, String>,
}

/// Registered services. Both indexes are updated under one lock so a lookup
/// never sees a url pointing at a replaced definition.
#[derive(Debug, Default)]
pub struct ServiceStore {
    inner: RwLock<Indexes>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by id. Returns the definition that was replaced.
    pub fn insert(&self, service: ServiceDefinition) -> Option<ServiceDefinition> {
        let mut inner = self.inner.write();
        let previous = inner.by_id.remove(&service.id);
        if let Some(prev) = &previous {
            if inner.by_url.get(&prev.url) == Some(&prev.id) {
                inner.by_url.remove(&prev.url);
            }
        }
        inner.by_url.insert(service.url.clone(), service.id.clone());
        inner.by_id.insert(service.id.clone(), service);
        previous
    }

    pub fn remove(&self, id: &str) -> Option<ServiceDefinition> {
        let mut inner = self.inner.write();
        let removed = inner.by_id.remove(id)?;
        if inner.by_url.get(&removed.url).map(String::as_str) == Some(id) {
            inner.by_url.remove(&removed.url);
        }
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<ServiceDefinition> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn get_by_url(&self, url: &str) -> Option<ServiceDefinition> {
        let inner = self.inner.read();
        inner.by_url.get(url).and_then(|id| inner.by_id.get(id)).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    /// All services, sorted by id.
    pub fn all(&self) -> Vec<ServiceDefinition> {
        let mut services: Vec<_> = self.inner.read().by_id.values().cloned().collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.read().by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_id.clear();
        inner.by_url.clear();
    }
}
