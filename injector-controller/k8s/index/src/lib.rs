#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Read-through caches fed by background watches.
//!
//! One store per resource kind, written only by its `kubert::index` loop and
//! read synchronously everywhere else. A lookup returning `None` is the typed
//! not-found outcome; cache reads cannot fail in transport. Entries are whole
//! `Arc` swaps under the write lock, so readers never observe a half-written
//! object. Consistency is "recent, not transactional" — callers that cannot
//! tolerate staleness (the webhook's binding listing) must read the API
//! directly instead.

use ahash::AHashMap;
use kube::ResourceExt;
use kubert::index::{ClusterRemoved, NamespacedRemoved};
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedStore<T> = Arc<RwLock<Store<T>>>;
pub type SharedClusterStore<T> = Arc<RwLock<ClusterStore<T>>>;

/// Last-observed objects of a namespaced kind, keyed by namespace and name.
#[derive(Debug)]
pub struct Store<T> {
    entries: AHashMap<(String, String), Arc<T>>,
}

/// Last-observed objects of a cluster-scoped kind, keyed by name.
#[derive(Debug)]
pub struct ClusterStore<T> {
    entries: AHashMap<String, Arc<T>>,
}

// === impl Store ===

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            entries: AHashMap::new(),
        }
    }
}

impl<T> Store<T> {
    pub fn shared() -> SharedStore<T> {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<T>> {
        self.entries
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: kube::Resource> kubert::index::IndexNamespacedResource<T> for Store<T> {
    fn apply(&mut self, resource: T) {
        let namespace = resource.namespace().expect("resource must be namespaced");
        let name = resource.name_unchecked();
        self.entries.insert((namespace, name), Arc::new(resource));
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.entries.remove(&(namespace, name));
    }

    fn reset(&mut self, resources: Vec<T>, removed: NamespacedRemoved) {
        for resource in resources {
            kubert::index::IndexNamespacedResource::apply(self, resource);
        }
        for (namespace, names) in removed {
            for name in names {
                self.entries.remove(&(namespace.clone(), name));
            }
        }
    }
}

// === impl ClusterStore ===

impl<T> Default for ClusterStore<T> {
    fn default() -> Self {
        Self {
            entries: AHashMap::new(),
        }
    }
}

impl<T> ClusterStore<T> {
    pub fn shared() -> SharedClusterStore<T> {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(name).cloned()
    }
}

impl<T: kube::Resource> kubert::index::IndexClusterResource<T> for ClusterStore<T> {
    fn apply(&mut self, resource: T) {
        let name = resource.name_unchecked();
        self.entries.insert(name, Arc::new(resource));
    }

    fn delete(&mut self, name: String) {
        self.entries.remove(&name);
    }

    fn reset(&mut self, resources: Vec<T>, removed: ClusterRemoved) {
        for resource in resources {
            kubert::index::IndexClusterResource::apply(self, resource);
        }
        for name in removed {
            self.entries.remove(&name);
        }
    }
}
