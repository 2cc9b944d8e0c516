//! Process-local store for non-serialisable objects.
//!
//! Pipeline state crosses the job broker as JSON, so live resources
//! (engine handles, agent bundles, history services) never travel with
//! it. They live here, keyed by opaque ids that the state carries and
//! that only resolve inside the worker process that stored them.

use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Object categories with distinct lifetimes.
pub mod category {
    /// Long-lived, invalidated on connection mutation.
    pub const ENGINE: &str = "engine";
    /// Long-lived per agent version, rebuilt on config change.
    pub const AGENT_BUNDLE: &str = "agent_bundle";
    /// Scoped to one run, dropped in a guaranteed-release step.
    pub const HISTORY_SERVICE: &str = "history_service";
}

type Stored = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct ObjectRegistry {
    objects: DashMap<(String, String), Stored>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self { objects: DashMap::new() }
    }

    /// Stores an object and returns its opaque id.
    pub fn put<T: Any + Send + Sync>(&self, category: &str, obj: Arc<T>) -> String {
        let id = Uuid::new_v4().to_string();
        self.put_with_id(category, &id, obj);
        id
    }

    /// Stores an object under a caller-chosen id, replacing any previous
    /// holder. Used for engines keyed by connection id + version.
    pub fn put_with_id<T: Any + Send + Sync>(&self, category: &str, id: &str, obj: Arc<T>) {
        self.objects.insert((category.to_string(), id.to_string()), obj);
        debug!("registry: stored {}/{}", category, id);
    }

    pub fn get<T: Any + Send + Sync>(
        &self,
        category: &'static str,
        id: &str,
    ) -> CoreResult<Arc<T>> {
        let entry = self
            .objects
            .get(&(category.to_string(), id.to_string()))
            .ok_or(CoreError::NotFound { category, id: id.to_string() })?;
        entry
            .value()
            .clone()
            .downcast::<T>()
            .map_err(|_| CoreError::Internal(format!("registry type mismatch for {}/{}", category, id)))
    }

    pub fn contains(&self, category: &str, id: &str) -> bool {
        self.objects.contains_key(&(category.to_string(), id.to_string()))
    }

    pub fn drop_object(&self, category: &str, id: &str) -> bool {
        let removed = self
            .objects
            .remove(&(category.to_string(), id.to_string()))
            .is_some();
        if removed {
            debug!("registry: dropped {}/{}", category, id);
        }
        removed
    }

    /// Drops every object in a category whose id starts with `prefix`.
    /// Engine ids embed the connection id, so a connection mutation can
    /// invalidate all of its pooled engines in one sweep.
    pub fn drop_prefix(&self, category: &str, prefix: &str) -> usize {
        let keys: Vec<_> = self
            .objects
            .iter()
            .filter(|e| e.key().0 == category && e.key().1.starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let count = keys.len();
        for key in keys {
            self.objects.remove(&key);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Collects run-scoped registry ids and releases them on drop, so the
/// worker's guaranteed-release step holds on every exit path, panics
/// included.
pub struct RunScope<'a> {
    registry: &'a ObjectRegistry,
    owned: Vec<(String, String)>,
}

impl<'a> RunScope<'a> {
    pub fn new(registry: &'a ObjectRegistry) -> Self {
        Self { registry, owned: Vec::new() }
    }

    pub fn track(&mut self, category: &str, id: &str) {
        self.owned.push((category.to_string(), id.to_string()));
    }

    pub fn put<T: Any + Send + Sync>(&mut self, category: &str, obj: Arc<T>) -> String {
        let id = self.registry.put(category, obj);
        self.track(category, &id);
        id
    }
}

impl Drop for RunScope<'_> {
    fn drop(&mut self) {
        for (category, id) in self.owned.drain(..) {
            self.registry.drop_object(&category, &id);
        }
    }
}
