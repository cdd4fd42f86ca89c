//! Field-level comparison of desired and observed resource trees.
//!
//! Each resource is viewed as `{"metadata": {"labels": ...}, "spec": ...}`
//! and compared recursively. Differences are reported as JSON pointers;
//! any pointer equal to or below an ignore path is skipped.

use serde_json::{Value, json};

use keel_core::{Resource, ResourceTree};
use keel_state::{DiffSummary, FieldDrift};

/// Diff two trees. Extras are observed resources with no declaration.
pub fn diff_trees(
    desired: &ResourceTree,
    observed: &ResourceTree,
    ignore: &[String],
) -> DiffSummary {
    let mut summary = DiffSummary::default();

    for wanted in desired.iter() {
        match observed.get(&wanted.key) {
            None => summary.missing.push(wanted.key.clone()),
            Some(live) => {
                let paths = field_diff(&document(wanted), &document(live), ignore);
                if !paths.is_empty() {
                    summary.drifted.push(FieldDrift {
                        key: wanted.key.clone(),
                        paths,
                    });
                }
            }
        }
    }

    summary.extra = observed
        .keys()
        .filter(|key| !desired.contains(key))
        .cloned()
        .collect();
    summary
}

/// JSON pointers at which `desired` and `observed` differ.
pub fn field_diff(desired: &Value, observed: &Value, ignore: &[String]) -> Vec<String> {
    let mut paths = Vec::new();
    walk("", desired, observed, ignore, &mut paths);
    paths
}

fn document(resource: &Resource) -> Value {
    json!({
        "metadata": { "labels": resource.labels },
        "spec": resource.spec,
    })
}

fn walk(path: &str, desired: &Value, observed: &Value, ignore: &[String], out: &mut Vec<String>) {
    if is_ignored(path, ignore) {
        return;
    }
    match (desired, observed) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a
                .keys()
                .chain(b.keys().filter(|k| !a.contains_key(*k)))
                .collect();
            keys.sort();
            for key in keys {
                let child = format!("{path}/{}", escape(key));
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => walk(&child, x, y, ignore, out),
                    _ if is_ignored(&child, ignore) => {}
                    _ => out.push(child),
                }
            }
        }
        (a, b) if a == b => {}
        _ => out.push(if path.is_empty() { "/".to_string() } else { path.to_string() }),
    }
}

fn is_ignored(path: &str, ignore: &[String]) -> bool {
    ignore.iter().any(|prefix| {
        path == prefix
            || path
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// RFC 6901 escaping of a single reference token.
fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResourceKey;

    fn ignore() -> Vec<String> {
        vec!["/status".to_string(), "/spec/replicas".to_string()]
    }

    fn deployment(spec: Value) -> Resource {
        Resource::new(ResourceKey::new("Deployment", "prod", "api"), spec)
    }

    #[test]
    fn equal_trees_have_no_diff() {
        let tree: ResourceTree = [deployment(json!({"image": "api:v1", "port": 80}))]
            .into_iter()
            .collect();
        let summary = diff_trees(&tree, &tree.clone(), &ignore());
        assert!(summary.is_converged());
        assert!(summary.extra.is_empty());
    }

    #[test]
    fn reports_changed_added_and_removed_fields() {
        let paths = field_diff(
            &json!({"spec": {"image": "api:v2", "env": {"A": "1"}, "port": 80}}),
            &json!({"spec": {"image": "api:v1", "env": {"A": "1", "B": "2"}}}),
            &[],
        );
        assert_eq!(paths, vec!["/spec/env/B", "/spec/image", "/spec/port"]);
    }

    #[test]
    fn ignored_paths_are_skipped() {
        let paths = field_diff(
            &json!({"spec": {"image": "api:v1", "replicas": 2}}),
            &json!({"spec": {"image": "api:v1", "replicas": 7}, "status": {"ready": 7}}),
            &ignore(),
        );
        assert!(paths.is_empty());
    }

    #[test]
    fn ignore_matches_whole_tokens_only() {
        let paths = field_diff(
            &json!({"statusPage": "on"}),
            &json!({"statusPage": "off"}),
            &["/status".to_string()],
        );
        assert_eq!(paths, vec!["/statusPage"]);
    }

    #[test]
    fn pointer_tokens_are_escaped() {
        let paths = field_diff(&json!({"a/b": 1}), &json!({"a/b": 2}), &[]);
        assert_eq!(paths, vec!["/a~1b"]);
    }

    #[test]
    fn classifies_missing_drifted_and_extra() {
        let cm = Resource::new(ResourceKey::new("ConfigMap", "prod", "cfg"), json!({"k": "v"}));
        let stray = Resource::new(ResourceKey::new("Service", "prod", "old"), json!({}));
        let desired: ResourceTree = [deployment(json!({"image": "api:v2"})), cm.clone()]
            .into_iter()
            .collect();
        let observed: ResourceTree = [deployment(json!({"image": "api:v1"})), stray.clone()]
            .into_iter()
            .collect();

        let summary = diff_trees(&desired, &observed, &ignore());
        assert_eq!(summary.missing, vec![cm.key]);
        assert_eq!(summary.drifted.len(), 1);
        assert_eq!(summary.drifted[0].paths, vec!["/spec/image"]);
        assert_eq!(summary.extra, vec![stray.key]);
    }

    #[test]
    fn label_changes_are_drift() {
        let desired: ResourceTree = [deployment(json!({})).with_label("team", "core")]
            .into_iter()
            .collect();
        let observed: ResourceTree = [deployment(json!({}))].into_iter().collect();
        let summary = diff_trees(&desired, &observed, &[]);
        assert_eq!(summary.drifted[0].paths, vec!["/metadata/labels/team"]);
    }
}
