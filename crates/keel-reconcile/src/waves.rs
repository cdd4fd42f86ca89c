//! Sync waves: apply order by resource kind.
//!
//! Lower waves are applied (and must report healthy) before higher ones.
//! The built-in table puts namespaces first, then configuration, then
//! stateful workloads, then everything else; `[reconcile.waves]` in
//! `keel.toml` overrides it per kind.

use std::collections::BTreeMap;

use keel_core::ResourceTree;

const DEFAULT_WAVES: &[(&str, u32)] = &[
    ("Namespace", 0),
    ("CustomResourceDefinition", 0),
    ("ServiceAccount", 1),
    ("ConfigMap", 1),
    ("Secret", 1),
    ("PersistentVolumeClaim", 2),
    ("StatefulSet", 2),
];

/// Wave for kinds not in the table or overrides.
pub const STATELESS_WAVE: u32 = 3;

#[derive(Debug, Clone, Default)]
pub struct Waves {
    overrides: BTreeMap<String, u32>,
}

impl Waves {
    pub fn new(overrides: BTreeMap<String, u32>) -> Self {
        Self { overrides }
    }

    pub fn wave_of(&self, kind: &str) -> u32 {
        if let Some(&wave) = self.overrides.get(kind) {
            return wave;
        }
        DEFAULT_WAVES
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, w)| *w)
            .unwrap_or(STATELESS_WAVE)
    }

    /// Split a tree into waves, lowest first. Empty waves are omitted.
    pub fn plan(&self, tree: &ResourceTree) -> BTreeMap<u32, ResourceTree> {
        let mut plan: BTreeMap<u32, ResourceTree> = BTreeMap::new();
        for resource in tree.iter() {
            plan.entry(self.wave_of(&resource.key.kind))
                .or_default()
                .insert(resource.clone());
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Resource, ResourceKey};
    use serde_json::json;

    fn res(kind: &str, name: &str) -> Resource {
        Resource::new(ResourceKey::new(kind, "prod", name), json!({}))
    }

    #[test]
    fn default_ordering() {
        let waves = Waves::default();
        assert!(waves.wave_of("Namespace") < waves.wave_of("ConfigMap"));
        assert!(waves.wave_of("ConfigMap") < waves.wave_of("StatefulSet"));
        assert!(waves.wave_of("StatefulSet") < waves.wave_of("Deployment"));
        assert_eq!(waves.wave_of("Service"), STATELESS_WAVE);
    }

    #[test]
    fn overrides_win() {
        let waves = Waves::new(BTreeMap::from([("Job".to_string(), 1)]));
        assert_eq!(waves.wave_of("Job"), 1);
    }

    #[test]
    fn plan_groups_by_wave() {
        let tree: ResourceTree = [
            res("Deployment", "api"),
            res("Namespace", "prod"),
            res("StatefulSet", "db"),
            res("Secret", "creds"),
            res("Service", "api"),
        ]
        .into_iter()
        .collect();

        let plan = Waves::default().plan(&tree);
        let kinds: Vec<Vec<String>> = plan
            .values()
            .map(|t| t.keys().map(|k| k.kind.clone()).collect())
            .collect();
        assert_eq!(
            kinds,
            vec![
                vec!["Namespace".to_string()],
                vec!["Secret".to_string()],
                vec!["StatefulSet".to_string()],
                vec!["Deployment".to_string(), "Service".to_string()],
            ]
        );
    }
}
