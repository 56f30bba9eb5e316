use crate::crd::Release;
use crate::reconciler::NS;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type FailureStoreRef = Arc<FailureStore>;

/// Consecutive reconcile failures per release, feeding the requeue backoff.
#[derive(Default)]
pub struct FailureStore {
    counts: Mutex<HashMap<NamespacedName, u32>>,
}

pub fn new_store() -> FailureStoreRef {
    Arc::new(FailureStore::default())
}

impl FailureStore {
    /// Records a failure and returns the consecutive count.
    pub fn bump(&self, key: &NamespacedName) -> u32 {
        let mut counts = self.counts.lock().expect("failure store lock poisoned");
        let count = counts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&self, key: &NamespacedName) {
        let mut counts = self.counts.lock().expect("failure store lock poisoned");
        counts.remove(key);
    }
}

/// Exponential requeue backoff, capped at five minutes.
pub fn backoff_for(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(9);
    Duration::from_secs((1u64 << exponent).min(300))
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl From<&Release> for NamespacedName {
    fn from(obj: &Release) -> Self {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_else(|| NS.to_owned());
        NamespacedName { name, namespace }
    }
}

impl From<&Arc<Release>> for NamespacedName {
    fn from(obj: &Arc<Release>) -> Self {
        NamespacedName::from(obj.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> NamespacedName {
        NamespacedName {
            name: "wordpress".to_owned(),
            namespace: "default".to_owned(),
        }
    }

    #[test]
    fn test_bump_and_reset() {
        let store = FailureStore::default();
        assert_eq!(store.bump(&key()), 1);
        assert_eq!(store.bump(&key()), 2);
        store.reset(&key());
        assert_eq!(store.bump(&key()), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_for(1), Duration::from_secs(1));
        assert_eq!(backoff_for(2), Duration::from_secs(2));
        assert_eq!(backoff_for(5), Duration::from_secs(16));
        assert_eq!(backoff_for(50), Duration::from_secs(300));
    }
}
