//! Resource trees — the structural form of desired and observed state.
//!
//! Both the rendered manifests and the live platform view are expressed as
//! a `ResourceTree`: resources keyed by `(kind, namespace, name)`, each with
//! free-form labels and a JSON `spec` that is diffed field by field.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label that marks a live resource as owned (and therefore prunable) by
/// a reconcile set. The value is the set name.
pub const MANAGED_BY_LABEL: &str = "keel.dev/managed-by";

/// Identity of a resource on the platform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A single declared or observed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub key: ResourceKey,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl Resource {
    pub fn new(key: ResourceKey, spec: serde_json::Value) -> Self {
        Self {
            key,
            labels: BTreeMap::new(),
            spec,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Whether the resource is marked as managed by the given reconcile set.
    pub fn is_managed_by(&self, set: &str) -> bool {
        self.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(set)
    }
}

/// Resources keyed by identity. Serialized as a plain list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Resource>", into = "Vec<Resource>")]
pub struct ResourceTree {
    resources: BTreeMap<ResourceKey, Resource>,
}

impl ResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource, replacing any previous one with the same key.
    pub fn insert(&mut self, resource: Resource) -> Option<Resource> {
        self.resources.insert(resource.key.clone(), resource)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Resource> {
        self.resources.get(key)
    }

    pub fn remove(&mut self, key: &ResourceKey) -> Option<Resource> {
        self.resources.remove(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.resources.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.resources.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Namespaces touched by this tree.
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.resources.keys().map(|k| k.namespace.clone()).collect()
    }

    /// Merge another tree into this one (later entries win).
    pub fn extend(&mut self, other: ResourceTree) {
        self.resources.extend(other.resources);
    }

    /// Sub-tree containing only the given keys that exist here.
    pub fn subset<'a>(&self, keys: impl IntoIterator<Item = &'a ResourceKey>) -> ResourceTree {
        let mut out = ResourceTree::new();
        for key in keys {
            if let Some(r) = self.resources.get(key) {
                out.insert(r.clone());
            }
        }
        out
    }
}

impl From<Vec<Resource>> for ResourceTree {
    fn from(list: Vec<Resource>) -> Self {
        let mut tree = ResourceTree::new();
        for r in list {
            tree.insert(r);
        }
        tree
    }
}

impl From<ResourceTree> for Vec<Resource> {
    fn from(tree: ResourceTree) -> Self {
        tree.resources.into_values().collect()
    }
}

impl FromIterator<Resource> for ResourceTree {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}

/// Which part of the live platform to observe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSelector {
    pub namespaces: BTreeSet<String>,
}

impl ResourceSelector {
    pub fn for_namespaces(namespaces: BTreeSet<String>) -> Self {
        Self { namespaces }
    }

    pub fn matches(&self, key: &ResourceKey) -> bool {
        self.namespaces.contains(&key.namespace)
    }
}

/// Health reported by the platform for an applied resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceHealth {
    Healthy,
    Progressing,
    Unhealthy,
    Missing,
}

/// A resource that could not be applied or did not become healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFailure {
    pub key: ResourceKey,
    pub reason: String,
}

impl ResourceFailure {
    pub fn new(key: ResourceKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tree_serializes_as_list() {
        let tree: ResourceTree = vec![
            Resource::new(ResourceKey::new("Service", "prod", "api"), json!({"port": 80})),
            Resource::new(ResourceKey::new("Namespace", "prod", "prod"), json!({})),
        ]
        .into();

        let json = serde_json::to_value(&tree).unwrap();
        assert!(json.is_array());
        assert_eq!(json.as_array().unwrap().len(), 2);

        let back: ResourceTree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn managed_by_label() {
        let r = Resource::new(ResourceKey::new("ConfigMap", "prod", "cfg"), json!({}))
            .with_label(MANAGED_BY_LABEL, "prod-set");
        assert!(r.is_managed_by("prod-set"));
        assert!(!r.is_managed_by("other"));
    }

    #[test]
    fn selector_matches_namespace() {
        let sel = ResourceSelector::for_namespaces(["prod".to_string()].into());
        assert!(sel.matches(&ResourceKey::new("Service", "prod", "api")));
        assert!(!sel.matches(&ResourceKey::new("Service", "dev", "api")));
    }
}
