use crate::error::Result;
use crate::locks::PodLocks;
use crate::reconciler::{is_expected_race, ResourceReconciler};
use crate::traits::ClusterMirror;
use podlink_core::PodEvent;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one drift pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DriftReport {
    /// VMs with no pod, for which a delete notification was sent
    pub orphans: Vec<String>,
    /// VMs attached to their virtual router by this pass
    pub reattached: usize,
    /// Idle per-pod locks dropped
    pub pruned_locks: usize,
}

/// Periodically compares the pod set against the cached VM set.
///
/// Orphaned VMs are not deleted directly: a synthetic DELETED event goes into
/// the same channel the event processor drains, so every consumer sees it.
pub struct DriftReconciler {
    reconciler: Arc<ResourceReconciler>,
    mirror: Arc<dyn ClusterMirror>,
    locks: Arc<PodLocks>,
    events: mpsc::Sender<PodEvent>,
    interval: Duration,
}

impl DriftReconciler {
    pub fn new(
        reconciler: Arc<ResourceReconciler>,
        mirror: Arc<dyn ClusterMirror>,
        locks: Arc<PodLocks>,
        events: mpsc::Sender<PodEvent>,
    ) -> Self {
        let interval = reconciler.config().drift_interval;
        Self {
            reconciler,
            mirror,
            locks,
            events,
            interval,
        }
    }

    /// Run drift passes until cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!("Starting drift reconciler (interval: {:?})", self.interval);

        let mut interval = tokio::time::interval(self.interval);
        // First tick fires immediately; the startup sync just ran
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Drift reconciler shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(report) => debug!("Drift pass done: {:?}", report),
                        Err(e) => error!("Drift pass failed: {}", e),
                    }
                }
            }
        }
    }

    /// One pass: report orphans, then retry router attachment for pods whose
    /// VM lacks it
    pub async fn run_once(&self) -> Result<DriftReport> {
        let mut report = DriftReport::default();
        let pod_uids: HashSet<String> = self.mirror.pod_uids().into_iter().collect();
        let store = self.reconciler.store();
        let config = self.reconciler.config();

        for vm in store.vms() {
            if pod_uids.contains(&vm.uuid)
                || !vm.is_owned_by(&config.owner, &config.cluster_name)
            {
                continue;
            }
            info!("VM {} ({}) has no pod, requesting delete", vm.uuid, vm.display_name);
            let event = PodEvent::deleted(&vm.uuid, vm.pod_labels.clone().unwrap_or_default());
            if self.events.send(event).await.is_err() {
                warn!("Event channel closed, stopping drift pass");
                return Ok(report);
            }
            report.orphans.push(vm.uuid);
        }

        for uid in &pod_uids {
            let Some(vm) = store.vm(uid) else {
                continue;
            };
            if vm.virtual_router.is_some()
                || vm.pod_node.is_none()
                || vm.node_ip.is_none()
                || !vm.is_owned_by(&config.owner, &config.cluster_name)
            {
                continue;
            }

            let _guard = self.locks.lock(uid).await;
            match self.reconciler.repair_attachment(uid).await {
                Ok(true) => {
                    info!("Attached VM {} to its virtual router", uid);
                    report.reattached += 1;
                }
                Ok(false) => debug!("VM {} still has no virtual router", uid),
                Err(e) if is_expected_race(&e) => debug!("Router repair for {}: {}", uid, e),
                Err(e) => warn!("Router repair for VM {} failed: {}", uid, e),
            }
        }

        report.pruned_locks = self.locks.prune();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::label_index::LabelIndex;
    use crate::labels::LabelTagSynchronizer;
    use crate::mirror::ClusterCache;
    use crate::mock::MockVncApi;
    use crate::store::{VmRecord, VmStore};
    use crate::traits::VncApi;
    use podlink_core::{Labels, PodRecord, VirtualMachine, VirtualRouter};

    fn pod(uid: &str) -> PodRecord {
        PodRecord {
            uid: uid.to_string(),
            name: format!("pod-{}", uid),
            namespace: "ns1".to_string(),
            node_name: Some("node1".to_string()),
            host_ip: Some("10.0.0.5".to_string()),
            labels: Labels::new(),
            host_network: false,
            network: None,
        }
    }

    fn owned(uuid: &str, cluster: &str) -> VmRecord {
        let mut vm = VmRecord::new(uuid, format!("{}__ns1__pod-{}", cluster, uuid));
        vm.owner = Some("k8s".to_string());
        vm.cluster = Some(cluster.to_string());
        vm
    }

    fn setup(
        api: Arc<MockVncApi>,
        store: Arc<VmStore>,
        cache: Arc<ClusterCache>,
    ) -> (DriftReconciler, mpsc::Receiver<PodEvent>, Arc<PodLocks>) {
        let labels = Arc::new(LabelTagSynchronizer::new(
            api.clone(),
            store.clone(),
            Arc::new(LabelIndex::new()),
        ));
        let reconciler = Arc::new(ResourceReconciler::new(
            api,
            store,
            cache.clone(),
            Arc::new(ControllerConfig::default()),
            labels,
        ));
        let locks = Arc::new(PodLocks::new());
        let (tx, rx) = mpsc::channel(16);
        (
            DriftReconciler::new(reconciler, cache, locks.clone(), tx),
            rx,
            locks,
        )
    }

    #[tokio::test]
    async fn test_orphan_emits_single_delete() {
        let store = Arc::new(VmStore::new());
        for uuid in ["a", "b", "c"] {
            store.insert_vm(owned(uuid, "k8s"));
        }
        store.insert_vm(owned("d", "other-cluster"));
        let cache = Arc::new(ClusterCache::new());
        cache.upsert_pod(pod("a"));
        cache.upsert_pod(pod("c"));

        let (drift, mut rx, _) = setup(Arc::new(MockVncApi::new()), store, cache);
        let report = drift.run_once().await.unwrap();

        assert_eq!(report.orphans, vec!["b".to_string()]);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, PodEvent::Deleted(_)));
        assert_eq!(event.uid(), Some("b"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reattaches_vm_without_router() {
        let api = Arc::new(MockVncApi::new());
        api.insert_virtual_machine(VirtualMachine {
            uuid: "a".to_string(),
            ..Default::default()
        })
        .await;
        let vr = VirtualRouter {
            uuid: "vr-1".to_string(),
            name: "node1".to_string(),
            ip_address: "10.0.0.5".to_string(),
            virtual_machines: vec![],
        };
        api.add_virtual_router(vr.clone()).await;

        let store = Arc::new(VmStore::new());
        store.insert_vm(owned("a", "k8s"));
        store.set_pod_info("a", "ns1", Some("node1"), Some("10.0.0.5"));
        let cache = Arc::new(ClusterCache::new());
        cache.upsert_pod(pod("a"));
        cache.upsert_virtual_router(vr);

        let (drift, mut rx, locks) = setup(api.clone(), store.clone(), cache);
        let report = drift.run_once().await.unwrap();

        assert_eq!(report.reattached, 1);
        assert!(report.orphans.is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(store.vm("a").unwrap().virtual_router.as_deref(), Some("vr-1"));
        assert_eq!(
            api.virtual_machine_read("a").await.unwrap().virtual_router.as_deref(),
            Some("vr-1")
        );
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_skips_router_repair_for_other_cluster() {
        let api = Arc::new(MockVncApi::new());
        api.insert_virtual_machine(VirtualMachine {
            uuid: "a".to_string(),
            ..Default::default()
        })
        .await;
        let vr = VirtualRouter {
            uuid: "vr-1".to_string(),
            name: "node1".to_string(),
            ip_address: "10.0.0.5".to_string(),
            virtual_machines: vec![],
        };
        api.add_virtual_router(vr.clone()).await;

        let store = Arc::new(VmStore::new());
        store.insert_vm(owned("a", "other-cluster"));
        store.set_pod_info("a", "ns1", Some("node1"), Some("10.0.0.5"));
        let cache = Arc::new(ClusterCache::new());
        cache.upsert_pod(pod("a"));
        cache.upsert_virtual_router(vr);

        let (drift, _rx, _) = setup(api.clone(), store.clone(), cache);
        let report = drift.run_once().await.unwrap();

        assert_eq!(report.reattached, 0);
        assert!(store.vm("a").unwrap().virtual_router.is_none());
        assert!(api.virtual_machine_read("a").await.unwrap().virtual_router.is_none());
    }

    #[tokio::test]
    async fn test_more_orphans_than_channel_capacity() {
        let store = Arc::new(VmStore::new());
        for uuid in ["a", "b", "c", "d", "e"] {
            store.insert_vm(owned(uuid, "k8s"));
        }
        let cache = Arc::new(ClusterCache::new());
        let labels = Arc::new(LabelTagSynchronizer::new(
            Arc::new(MockVncApi::new()),
            store.clone(),
            Arc::new(LabelIndex::new()),
        ));
        let reconciler = Arc::new(ResourceReconciler::new(
            Arc::new(MockVncApi::new()),
            store,
            cache.clone(),
            Arc::new(ControllerConfig::default()),
            labels,
        ));
        let (tx, mut rx) = mpsc::channel(2);
        let drift = DriftReconciler::new(reconciler, cache, Arc::new(PodLocks::new()), tx);

        let drain = async move {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                seen.push(event.uid().unwrap_or_default().to_string());
            }
            seen
        };
        let pass = async move {
            let report = drift.run_once().await;
            drop(drift);
            report
        };
        let (report, mut seen) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(pass, drain)
        })
        .await
        .unwrap();

        assert_eq!(report.unwrap().orphans.len(), 5);
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (drift, _rx, _) = setup(
            Arc::new(MockVncApi::new()),
            Arc::new(VmStore::new()),
            Arc::new(ClusterCache::new()),
        );
        let token = CancellationToken::new();
        token.cancel();
        drift.run(token).await.unwrap();
    }
}
