use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Templates currently queued or building, keyed by template name with the
/// requesting owner as value.
///
/// At most one build per template name exists at a time across all owners.
#[derive(Debug, Default)]
pub struct BuildRegistry {
    entries: Mutex<HashMap<String, String>>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `name` as building for `owner` unless it already is.
    ///
    /// Returns false when another build of `name` is registered.
    pub fn try_admit(&self, name: &str, owner: &str) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(name) {
            return false;
        }
        entries.insert(name.to_string(), owner.to_string());
        true
    }

    /// Remove `name` only if `owner` registered it
    pub fn release(&self, name: &str, owner: &str) {
        let mut entries = self.lock();
        if entries.get(name).is_some_and(|o| o == owner) {
            entries.remove(name);
        }
    }

    /// Remove every entry registered by `owner`, returning how many were dropped
    pub fn release_all_for_owner(&self, owner: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, o| o != owner);
        before - entries.len()
    }

    /// Snapshot of `(name, owner)` pairs, sorted by name
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .lock()
            .iter()
            .map(|(n, o)| (n.clone(), o.clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Admit `name` and tie its release to the returned guard
    pub fn admit(self: &Arc<Self>, name: &str, owner: &str) -> Option<AdmissionGuard> {
        self.try_admit(name, owner).then(|| AdmissionGuard {
            registry: Arc::clone(self),
            name: name.to_string(),
            owner: owner.to_string(),
        })
    }
}

/// Releases its registry entry when dropped, whatever way the build ends
#[derive(Debug)]
pub struct AdmissionGuard {
    registry: Arc<BuildRegistry>,
    name: String,
    owner: String,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.name, &self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_admit_is_exclusive() {
        let registry = BuildRegistry::new();
        assert!(registry.try_admit("debian-12-x64-server-template", "alice"));
        assert!(!registry.try_admit("debian-12-x64-server-template", "alice"));
        assert!(!registry.try_admit("debian-12-x64-server-template", "bob"));
        assert!(registry.try_admit("win2022-server-x64-template", "bob"));
    }

    #[test]
    fn test_release_requires_matching_owner() {
        let registry = BuildRegistry::new();
        assert!(registry.try_admit("kali-x64-desktop-template", "alice"));

        registry.release("kali-x64-desktop-template", "bob");
        assert_eq!(
            registry.entries(),
            vec![("kali-x64-desktop-template".to_string(), "alice".to_string())]
        );

        registry.release("kali-x64-desktop-template", "alice");
        assert!(registry.entries().is_empty());
    }

    #[test]
    fn test_release_all_for_owner_keeps_other_owners() {
        let registry = BuildRegistry::new();
        registry.try_admit("a-template", "alice");
        registry.try_admit("b-template", "alice");
        registry.try_admit("c-template", "bob");

        assert_eq!(registry.release_all_for_owner("alice"), 2);
        assert_eq!(
            registry.entries(),
            vec![("c-template".to_string(), "bob".to_string())]
        );
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = Arc::new(BuildRegistry::new());
        let guard = registry.admit("a-template", "alice").unwrap();
        assert!(registry.admit("a-template", "bob").is_none());

        drop(guard);
        assert!(registry.entries().is_empty());
        assert!(registry.admit("a-template", "bob").is_some());
    }

    #[test]
    fn test_guard_does_not_release_foreign_entry() {
        let registry = Arc::new(BuildRegistry::new());
        let guard = registry.admit("a-template", "alice").unwrap();

        // Abort by alice clears the entry, then bob admits the same name
        registry.release_all_for_owner("alice");
        assert!(registry.try_admit("a-template", "bob"));

        drop(guard);
        assert_eq!(
            registry.entries(),
            vec![("a-template".to_string(), "bob".to_string())]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_admits_exactly_one() {
        let registry = Arc::new(BuildRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.try_admit("contended-template", &format!("user{i}"))
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(registry.entries().len(), 1);
    }
}
