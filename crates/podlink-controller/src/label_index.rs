use parking_lot::RwLock;
use podlink_core::Labels;
use std::collections::{BTreeSet, HashMap};

/// Index key of a label pair
pub fn label_key(key: &str, value: &str) -> String {
    format!("{}:{}", key, value)
}

#[derive(Default)]
struct IndexInner {
    pods_by_label: HashMap<String, BTreeSet<String>>,
    labels_by_pod: HashMap<String, Labels>,
}

/// Label-to-pod index plus the per-pod label cache it is derived from.
///
/// Safe for concurrent use from the event and drift paths; each call takes
/// the lock once so an insert or remove for one pod is atomic.
#[derive(Default)]
pub struct LabelIndex {
    inner: RwLock<IndexInner>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `labels` for a pod, on top of what it already has. A key
    /// whose value changes moves to the new (key, value) entry.
    pub fn insert(&self, pod_uid: &str, labels: &Labels) {
        let mut inner = self.inner.write();
        let IndexInner {
            pods_by_label,
            labels_by_pod,
        } = &mut *inner;

        let current = labels_by_pod.entry(pod_uid.to_string()).or_default();
        for (k, v) in labels {
            if let Some(old) = current.insert(k.clone(), v.clone()) {
                if &old != v {
                    unindex(pods_by_label, &label_key(k, &old), pod_uid);
                }
            }
            pods_by_label
                .entry(label_key(k, v))
                .or_default()
                .insert(pod_uid.to_string());
        }
    }

    /// Forget `labels` for a pod (only pairs that match exactly)
    pub fn remove(&self, pod_uid: &str, labels: &Labels) {
        let mut inner = self.inner.write();
        let IndexInner {
            pods_by_label,
            labels_by_pod,
        } = &mut *inner;

        let Some(current) = labels_by_pod.get_mut(pod_uid) else {
            return;
        };
        for (k, v) in labels {
            if current.get(k) == Some(v) {
                current.remove(k);
                unindex(pods_by_label, &label_key(k, v), pod_uid);
            }
        }
        if current.is_empty() {
            labels_by_pod.remove(pod_uid);
        }
    }

    /// Forget everything recorded for a pod, returning its label set
    pub fn remove_pod(&self, pod_uid: &str) -> Labels {
        let mut inner = self.inner.write();
        let Some(labels) = inner.labels_by_pod.remove(pod_uid) else {
            return Labels::new();
        };
        for (k, v) in &labels {
            unindex(&mut inner.pods_by_label, &label_key(k, v), pod_uid);
        }
        labels
    }

    /// Current label set of a pod
    pub fn labels_for(&self, pod_uid: &str) -> Labels {
        self.inner
            .read()
            .labels_by_pod
            .get(pod_uid)
            .cloned()
            .unwrap_or_default()
    }

    /// Pods carrying the label `key=value`
    pub fn pods_for(&self, key: &str, value: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .pods_by_label
            .get(&label_key(key, value))
            .cloned()
            .unwrap_or_default()
    }
}

fn unindex(index: &mut HashMap<String, BTreeSet<String>>, key: &str, pod_uid: &str) {
    if let Some(pods) = index.get_mut(key) {
        pods.remove(pod_uid);
        if pods.is_empty() {
            index.remove(key);
        }
    }
}
