use crate::traits::ClusterMirror;
use parking_lot::RwLock;
use podlink_core::{NamespaceRecord, PodRecord, VirtualRouter};
use std::collections::{HashMap, HashSet};

/// In-memory mirror of orchestrator pods/namespaces and SDN virtual routers.
///
/// Fed by the pod watch, the namespace listing and the virtual-router
/// refresh in the binary; tests fill it directly.
#[derive(Default)]
pub struct ClusterCache {
    pods: RwLock<HashMap<String, PodRecord>>,
    namespaces: RwLock<HashMap<String, NamespaceRecord>>,
    routers: RwLock<HashMap<String, VirtualRouter>>,
}

impl ClusterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_pod(&self, pod: PodRecord) {
        self.pods.write().insert(pod.uid.clone(), pod);
    }

    pub fn remove_pod(&self, uid: &str) -> Option<PodRecord> {
        self.pods.write().remove(uid)
    }

    /// Replace the pod set from a full listing. `known` holds the uids cached
    /// when the listing was requested; pods outside it arrived through the
    /// watch after the listing's snapshot and are kept.
    pub fn replace_pods(&self, pods: Vec<PodRecord>, known: &HashSet<String>) -> usize {
        let listed: HashSet<String> = pods.iter().map(|p| p.uid.clone()).collect();
        let mut map = self.pods.write();
        let before = map.len();
        map.retain(|uid, _| listed.contains(uid) || !known.contains(uid));
        let dropped = before - map.len();
        map.extend(pods.into_iter().map(|pod| (pod.uid.clone(), pod)));
        dropped
    }

    pub fn upsert_namespace(&self, ns: NamespaceRecord) {
        self.namespaces.write().insert(ns.name.clone(), ns);
    }

    /// Replace the namespace set wholesale (from a full listing)
    pub fn replace_namespaces(&self, namespaces: Vec<NamespaceRecord>) {
        let mut map = self.namespaces.write();
        map.clear();
        map.extend(namespaces.into_iter().map(|ns| (ns.name.clone(), ns)));
    }

    pub fn upsert_virtual_router(&self, vr: VirtualRouter) {
        self.routers.write().insert(vr.uuid.clone(), vr);
    }

    /// Replace the virtual-router set wholesale (from a full listing)
    pub fn replace_virtual_routers(&self, routers: Vec<VirtualRouter>) {
        let mut map = self.routers.write();
        map.clear();
        map.extend(routers.into_iter().map(|vr| (vr.uuid.clone(), vr)));
    }
}

impl ClusterMirror for ClusterCache {
    fn pod(&self, uid: &str) -> Option<PodRecord> {
        self.pods.read().get(uid).cloned()
    }

    fn pod_uids(&self) -> Vec<String> {
        self.pods.read().keys().cloned().collect()
    }

    fn namespace(&self, name: &str) -> Option<NamespaceRecord> {
        self.namespaces.read().get(name).cloned()
    }

    fn virtual_router_by_ip(&self, ip: &str) -> Option<String> {
        self.routers
            .read()
            .values()
            .find(|vr| vr.ip_address == ip)
            .map(|vr| vr.uuid.clone())
    }

    fn virtual_router_by_name(&self, name: &str) -> Option<String> {
        self.routers
            .read()
            .values()
            .find(|vr| vr.name == name)
            .map(|vr| vr.uuid.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlink_core::Labels;

    fn pod(uid: &str, name: &str) -> PodRecord {
        PodRecord {
            uid: uid.to_string(),
            name: name.to_string(),
            namespace: "default".to_string(),
            node_name: None,
            host_ip: None,
            labels: Labels::new(),
            host_network: false,
            network: None,
        }
    }

    #[test]
    fn test_pod_lookup_by_uid() {
        let cache = ClusterCache::new();
        cache.upsert_pod(pod("p1", "web"));

        assert_eq!(cache.pod("p1").unwrap().name, "web");
        assert!(cache.pod("web").is_none());

        cache.remove_pod("p1");
        assert!(cache.pod("p1").is_none());
        assert!(cache.pod_uids().is_empty());
    }

    #[test]
    fn test_replace_pods_drops_stale() {
        let cache = ClusterCache::new();
        cache.upsert_pod(pod("p1", "web"));
        cache.upsert_pod(pod("p2", "db"));
        let known: HashSet<String> = cache.pod_uids().into_iter().collect();

        // Watch delivers p4 while the listing is in flight
        cache.upsert_pod(pod("p4", "queue"));
        let dropped = cache.replace_pods(vec![pod("p2", "db"), pod("p3", "cache")], &known);

        assert_eq!(dropped, 1);
        let mut uids = cache.pod_uids();
        uids.sort();
        assert_eq!(
            uids,
            vec!["p2".to_string(), "p3".to_string(), "p4".to_string()]
        );
        assert!(cache.pod("p1").is_none());
    }

    #[test]
    fn test_virtual_router_lookup() {
        let cache = ClusterCache::new();
        cache.replace_virtual_routers(vec![VirtualRouter {
            uuid: "vr-1".to_string(),
            name: "compute-1".to_string(),
            ip_address: "10.0.0.5".to_string(),
            virtual_machines: vec![],
        }]);

        assert_eq!(cache.virtual_router_by_ip("10.0.0.5").as_deref(), Some("vr-1"));
        assert_eq!(cache.virtual_router_by_name("compute-1").as_deref(), Some("vr-1"));
        assert!(cache.virtual_router_by_ip("10.0.0.6").is_none());
    }

    #[test]
    fn test_replace_namespaces_drops_stale() {
        let cache = ClusterCache::new();
        cache.upsert_namespace(NamespaceRecord::new("old"));
        cache.replace_namespaces(vec![NamespaceRecord::new("new")]);

        assert!(cache.namespace("old").is_none());
        assert!(cache.namespace("new").is_some());
    }
}
