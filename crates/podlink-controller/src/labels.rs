use crate::error::{NotFoundExt, Result};
use crate::label_index::LabelIndex;
use crate::store::VmStore;
use crate::traits::VncApi;
use podlink_core::{effective_labels, Labels, PodRecord};
use std::sync::Arc;
use tracing::debug;

/// Mirrors a pod's effective label set onto its ports as tags and onto the
/// label-to-pod index.
pub struct LabelTagSynchronizer {
    api: Arc<dyn VncApi>,
    store: Arc<VmStore>,
    index: Arc<LabelIndex>,
}

impl LabelTagSynchronizer {
    pub fn new(api: Arc<dyn VncApi>, store: Arc<VmStore>, index: Arc<LabelIndex>) -> Self {
        Self { api, store, index }
    }

    pub fn index(&self) -> &LabelIndex {
        &self.index
    }

    /// Explicit pod labels plus the implicit namespace label
    pub fn effective(&self, pod: &PodRecord) -> Labels {
        effective_labels(&pod.labels, &pod.namespace)
    }

    /// Record `labels` for a pod and set one tag per key on each of its ports
    pub async fn apply(&self, pod_uid: &str, labels: &Labels) -> Result<()> {
        self.index.insert(pod_uid, labels);
        self.store.set_pod_labels(pod_uid, labels.clone());
        self.set_tags(pod_uid, labels).await
    }

    /// Drop all label state recorded for a pod. Port tags are left as they
    /// are; the delete cascade and `replace` unset them.
    ///
    /// The returned set also holds labels only the store knows about, such
    /// as those read back from VM annotations at startup.
    pub fn clear(&self, pod_uid: &str) -> Labels {
        let stored = self.store.vm(pod_uid).and_then(|vm| vm.pod_labels);
        let mut previous = self.index.remove_pod(pod_uid);
        for (k, v) in stored.unwrap_or_default() {
            previous.entry(k).or_insert(v);
        }
        self.store.clear_pod_labels(pod_uid);
        previous
    }

    /// Rebuild the index from labels cached on stored VMs
    pub fn seed_index(&self) -> usize {
        let mut seeded = 0;
        for vm in self.store.vms() {
            if let Some(labels) = &vm.pod_labels {
                self.index.insert(&vm.uuid, labels);
                seeded += 1;
            }
        }
        seeded
    }

    /// Full overwrite: clear, apply, then unset tag keys that went away
    pub async fn replace(&self, pod_uid: &str, labels: &Labels) -> Result<()> {
        let previous = self.clear(pod_uid);
        self.apply(pod_uid, labels).await?;

        let removed: Vec<&String> = previous.keys().filter(|k| !labels.contains_key(*k)).collect();
        if removed.is_empty() {
            return Ok(());
        }
        debug!("Unsetting removed label keys {:?} for pod {}", removed, pod_uid);
        for vmi in self.store.vmis_of(pod_uid) {
            for key in &removed {
                self.api.unset_tag(&vmi.uuid, key).await.found()?;
            }
        }
        Ok(())
    }

    /// Add labels to pods outside of a pod event
    pub async fn add_extra(&self, pod_uids: &[String], labels: &Labels) -> Result<()> {
        for uid in pod_uids {
            self.index.insert(uid, labels);
            self.store.set_pod_labels(uid, self.index.labels_for(uid));
            self.set_tags(uid, labels).await?;
        }
        Ok(())
    }

    /// Remove labels from pods outside of a pod event
    pub async fn remove_extra(&self, pod_uids: &[String], labels: &Labels) -> Result<()> {
        for uid in pod_uids {
            self.index.remove(uid, labels);
            self.store.set_pod_labels(uid, self.index.labels_for(uid));
            for vmi in self.store.vmis_of(uid) {
                self.unset_port_tags(&vmi.uuid, labels).await?;
            }
        }
        Ok(())
    }

    /// Unset the tags for `labels` on one port; a vanished port is fine
    pub async fn unset_port_tags(&self, vmi_uuid: &str, labels: &Labels) -> Result<()> {
        for key in labels.keys() {
            if self.api.unset_tag(vmi_uuid, key).await.found()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn set_tags(&self, pod_uid: &str, labels: &Labels) -> Result<()> {
        for vmi in self.store.vmis_of(pod_uid) {
            for (k, v) in labels {
                if self.api.set_tag(&vmi.uuid, k, v).await.found()?.is_none() {
                    debug!("Port {} vanished while tagging pod {}", vmi.uuid, pod_uid);
                    break;
                }
            }
        }
        Ok(())
    }
}
