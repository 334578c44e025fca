use crate::config::ControllerConfig;
use crate::error::{ControllerError, NotFoundExt, Result};
use crate::traits::{ClusterMirror, VncApi};
use podlink_core::{FqName, PodRecord, VirtualNetwork};
use std::sync::Arc;
use tracing::{debug, info};

/// Namespace whose settings govern non-isolated pods
const DEFAULT_SCOPE_NAMESPACE: &str = "default";

/// Picks the virtual network a pod's port joins.
///
/// Precedence, first match wins: the pod's network annotation, the
/// namespace's network annotation, the isolated namespace network, the
/// cluster default pod network.
pub struct NetworkResolver {
    api: Arc<dyn VncApi>,
    mirror: Arc<dyn ClusterMirror>,
    config: Arc<ControllerConfig>,
}

impl NetworkResolver {
    pub fn new(
        api: Arc<dyn VncApi>,
        mirror: Arc<dyn ClusterMirror>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            api,
            mirror,
            config,
        }
    }

    /// Resolve and read the pod's network. `None` means the pod, its
    /// namespace or the network itself is gone; the caller drops the event.
    pub async fn resolve(
        &self,
        pod_uid: &str,
        pod_name: &str,
        namespace: &str,
    ) -> Result<Option<VirtualNetwork>> {
        let fq_name = match self.network_name(pod_uid, pod_name, namespace) {
            Ok(name) => name,
            Err(ControllerError::Unresolvable { what, reason }) => {
                info!(
                    "Network for pod {}/{} ({}) unresolved: {}: {}",
                    namespace, pod_name, pod_uid, what, reason
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let vn = self.api.virtual_network_read(&fq_name).await.found()?;
        if vn.is_none() {
            info!(
                "Network {} for pod {}/{} does not exist",
                fq_name, namespace, pod_name
            );
        }
        Ok(vn)
    }

    /// Fully-qualified name of the network the pod should join
    pub fn network_name(&self, pod_uid: &str, pod_name: &str, namespace: &str) -> Result<FqName> {
        let pod = self.mirror.pod(pod_uid).ok_or_else(|| {
            ControllerError::unresolvable(
                format!("pod {}/{} ({})", namespace, pod_name, pod_uid),
                "pod not found in mirror",
            )
        })?;
        self.network_for(&pod)
    }

    fn network_for(&self, pod: &PodRecord) -> Result<FqName> {
        if let Some(network) = &pod.network {
            debug!("Pod {} uses its annotated network {}", pod.uid, network);
            return Ok(network.clone());
        }

        let ns = self.mirror.namespace(&pod.namespace).ok_or_else(|| {
            ControllerError::unresolvable(
                format!("namespace {}", pod.namespace),
                "namespace not found in mirror",
            )
        })?;

        if let Some(network) = ns.annotated_network {
            return Ok(network);
        }
        if ns.isolated {
            return Ok(ns
                .isolated_network
                .unwrap_or_else(|| self.config.isolated_pod_network(&ns.name)));
        }
        Ok(self.config.default_pod_network.clone())
    }

    /// Whether addresses for pods of `namespace` come from the IP-fabric IPAM.
    /// Isolated namespaces decide for themselves; everyone else follows the
    /// `default` namespace, then the global setting.
    pub fn ip_fabric_forwarding(&self, namespace: &str) -> bool {
        let scope = match self.mirror.namespace(namespace) {
            Some(ns) if ns.isolated => Some(ns),
            _ => self.mirror.namespace(DEFAULT_SCOPE_NAMESPACE),
        };
        scope
            .and_then(|ns| ns.ip_fabric_forwarding)
            .unwrap_or(self.config.ip_fabric_forwarding)
    }

    /// Subnet to allocate a pod address from on `vn`, if the network has one
    /// for the chosen IPAM
    pub fn address_subnet(&self, vn: &VirtualNetwork, namespace: &str) -> Option<String> {
        let ipam = if self.ip_fabric_forwarding(namespace) {
            &self.config.ip_fabric_ipam
        } else {
            &self.config.pod_ipam
        };
        vn.ipam_subnet(ipam).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::ClusterCache;
    use crate::mock::MockVncApi;
    use podlink_core::{Labels, NamespaceRecord};

    fn pod(network: Option<FqName>) -> PodRecord {
        PodRecord {
            uid: "p1".to_string(),
            name: "web".to_string(),
            namespace: "ns1".to_string(),
            node_name: None,
            host_ip: None,
            labels: Labels::new(),
            host_network: false,
            network,
        }
    }

    fn resolver(cache: Arc<ClusterCache>) -> NetworkResolver {
        NetworkResolver::new(
            Arc::new(MockVncApi::new()),
            cache,
            Arc::new(ControllerConfig::default()),
        )
    }

    #[test]
    fn test_pod_annotation_wins_over_namespace() {
        let cache = Arc::new(ClusterCache::new());
        let pod_net = FqName::new(["d", "p", "pod-net"]);
        cache.upsert_pod(pod(Some(pod_net.clone())));
        let mut ns = NamespaceRecord::new("ns1");
        ns.annotated_network = Some(FqName::new(["d", "p", "ns-net"]));
        cache.upsert_namespace(ns);

        let r = resolver(cache);
        assert_eq!(r.network_name("p1", "web", "ns1").unwrap(), pod_net);
    }

    #[test]
    fn test_namespace_annotation_then_isolation_then_default() {
        let cache = Arc::new(ClusterCache::new());
        cache.upsert_pod(pod(None));
        let mut ns = NamespaceRecord::new("ns1");
        ns.annotated_network = Some(FqName::new(["d", "p", "ns-net"]));
        ns.isolated = true;
        cache.upsert_namespace(ns.clone());
        let r = resolver(cache.clone());
        assert_eq!(r.network_name("p1", "web", "ns1").unwrap().name(), "ns-net");

        ns.annotated_network = None;
        cache.upsert_namespace(ns.clone());
        assert_eq!(
            r.network_name("p1", "web", "ns1").unwrap().name(),
            "k8s-ns1-pod-network"
        );

        ns.isolated = false;
        cache.upsert_namespace(ns);
        assert_eq!(
            r.network_name("p1", "web", "ns1").unwrap(),
            ControllerConfig::default().default_pod_network
        );
    }

    #[test]
    fn test_missing_pod_is_unresolvable() {
        let r = resolver(Arc::new(ClusterCache::new()));
        assert!(matches!(
            r.network_name("p1", "web", "ns1").unwrap_err(),
            ControllerError::Unresolvable { .. }
        ));
    }

    #[test]
    fn test_same_name_in_other_namespace_does_not_resolve() {
        let cache = Arc::new(ClusterCache::new());
        let mut other = pod(Some(FqName::new(["d", "p", "other-net"])));
        other.uid = "p2".to_string();
        other.namespace = "ns2".to_string();
        cache.upsert_pod(other);
        cache.upsert_namespace(NamespaceRecord::new("ns2"));

        let r = resolver(cache);
        assert!(matches!(
            r.network_name("p1", "web", "ns1").unwrap_err(),
            ControllerError::Unresolvable { .. }
        ));
    }

    #[tokio::test]
    async fn test_resolve_reads_network() {
        let cache = Arc::new(ClusterCache::new());
        cache.upsert_pod(pod(None));
        cache.upsert_namespace(NamespaceRecord::new("ns1"));
        let config = ControllerConfig::default();
        let api = Arc::new(MockVncApi::new());
        api.add_network(VirtualNetwork {
            uuid: "vn-default".to_string(),
            fq_name: config.default_pod_network.clone(),
            ..Default::default()
        })
        .await;

        let r = NetworkResolver::new(api, cache, Arc::new(config));
        let vn = r.resolve("p1", "web", "ns1").await.unwrap().unwrap();
        assert_eq!(vn.uuid, "vn-default");
        assert!(r.resolve("gone", "gone", "ns1").await.unwrap().is_none());
    }

    #[test]
    fn test_ip_fabric_forwarding_scope() {
        let cache = Arc::new(ClusterCache::new());
        let mut default_ns = NamespaceRecord::new("default");
        default_ns.ip_fabric_forwarding = Some(true);
        cache.upsert_namespace(default_ns);
        let mut isolated = NamespaceRecord::new("iso");
        isolated.isolated = true;
        isolated.ip_fabric_forwarding = Some(false);
        cache.upsert_namespace(isolated);
        cache.upsert_namespace(NamespaceRecord::new("plain"));

        let r = resolver(cache);
        assert!(r.ip_fabric_forwarding("plain"));
        assert!(!r.ip_fabric_forwarding("iso"));
    }
}
