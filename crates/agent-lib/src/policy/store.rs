//! Namespace-indexed policy store

use super::Policy;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

/// Latest parsed policies per namespace.
///
/// Written only by policy sync, read concurrently by remediation, scaling and
/// anomaly evaluation. The lock is held for the map operation alone.
#[derive(Debug, Default)]
pub struct PolicyStore {
    by_namespace: RwLock<HashMap<String, Vec<Policy>>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the namespace's policy list atomically
    pub fn update(&self, namespace: &str, policies: Vec<Policy>) {
        let mut map = self
            .by_namespace
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if policies.is_empty() {
            map.remove(namespace);
        } else {
            map.insert(namespace.to_string(), policies);
        }
    }

    /// Owned copy of the namespace's policies, in store order
    pub fn list(&self, namespace: &str) -> Vec<Policy> {
        self.by_namespace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// All policies whose selector matches `labels`, in store order
    pub fn matching(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Vec<Policy> {
        self.by_namespace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .map(|policies| {
                policies
                    .iter()
                    .filter(|p| p.matches(labels))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First matching policy in store order
    pub fn first_match(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Option<Policy> {
        self.by_namespace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .and_then(|policies| policies.iter().find(|p| p.matches(labels)).cloned())
    }

    /// Namespaces currently holding at least one policy, sorted
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .by_namespace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        namespaces.sort();
        namespaces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicySpec;
    use std::sync::Arc;

    fn selector_policy(ns: &str, name: &str, app: Option<&str>) -> Policy {
        let mut spec = PolicySpec::default();
        if let Some(app) = app {
            spec.target_selector
                .match_labels
                .insert("app".to_string(), app.to_string());
        }
        Policy::new(ns, name, spec)
    }

    fn app_labels(app: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), app.to_string())])
    }

    #[test]
    fn test_update_replaces_namespace() {
        let store = PolicyStore::new();
        store.update("ns", vec![selector_policy("ns", "a", None)]);
        store.update("ns", vec![selector_policy("ns", "b", None)]);

        let names: Vec<_> = store.list("ns").into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn test_matching_returns_all_in_order() {
        let store = PolicyStore::new();
        store.update(
            "ns",
            vec![
                selector_policy("ns", "catch-all", None),
                selector_policy("ns", "web", Some("web")),
                selector_policy("ns", "api", Some("api")),
            ],
        );

        let names: Vec<_> = store
            .matching("ns", &app_labels("web"))
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["catch-all", "web"]);

        let first = store.first_match("ns", &app_labels("api")).unwrap();
        assert_eq!(first.name, "catch-all");
    }

    #[test]
    fn test_empty_selector_matches_any_labels() {
        let store = PolicyStore::new();
        store.update("ns", vec![selector_policy("ns", "all", None)]);

        assert_eq!(store.matching("ns", &BTreeMap::new()).len(), 1);
        assert_eq!(store.matching("ns", &app_labels("whatever")).len(), 1);
        assert!(store.matching("other", &BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_list_is_a_copy() {
        let store = PolicyStore::new();
        store.update("ns", vec![selector_policy("ns", "a", None)]);

        let mut copy = store.list("ns");
        copy.clear();
        assert_eq!(store.list("ns").len(), 1);
    }

    #[test]
    fn test_empty_update_drops_namespace() {
        let store = PolicyStore::new();
        store.update("a", vec![selector_policy("a", "p", None)]);
        store.update("b", vec![selector_policy("b", "p", None)]);
        assert_eq!(store.namespaces(), vec!["a", "b"]);

        store.update("a", vec![]);
        assert_eq!(store.namespaces(), vec!["b"]);
        assert!(store.list("a").is_empty());
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let store = Arc::new(PolicyStore::new());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    store.update("ns", vec![selector_policy("ns", &format!("p{i}"), None)]);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        assert!(store.list("ns").len() <= 1);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(store.list("ns")[0].name, "p199");
    }
}
