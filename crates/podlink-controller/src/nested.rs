use crate::config::ControllerConfig;
use crate::error::{ControllerError, NotFoundExt, Result};
use crate::store::{VmStore, VmiRecord};
use crate::traits::{ClusterMirror, VncApi};
use podlink_core::{ObjectRef, RefOp};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Links pod ports to the host VM's port in nested deployments: VLAN
/// sub-interface allocation, port-to-port references and the
/// virtual-router-to-VM reference.
pub struct NestedOverlayLinker {
    api: Arc<dyn VncApi>,
    store: Arc<VmStore>,
    mirror: Arc<dyn ClusterMirror>,
    config: Arc<ControllerConfig>,
}

impl NestedOverlayLinker {
    pub fn new(
        api: Arc<dyn VncApi>,
        store: Arc<VmStore>,
        mirror: Arc<dyn ClusterMirror>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            api,
            store,
            mirror,
            config,
        }
    }

    /// Port of the host VM the pod runs in: the bound port holding the pod's
    /// node IP on the cluster's default network. `None` until the pod has a
    /// node IP and the host port exists.
    pub async fn resolve_host_port(&self, pod_uid: &str) -> Result<Option<VmiRecord>> {
        let Some(pod) = self.mirror.pod(pod_uid) else {
            debug!("Pod {} not in mirror, host port unresolved", pod_uid);
            return Ok(None);
        };
        let Some(host_ip) = pod.host_ip.as_deref() else {
            debug!("Pod {}/{} has no node IP yet", pod.namespace, pod.name);
            return Ok(None);
        };

        let Some(iip) = self
            .api
            .instance_ip_find(host_ip, &self.config.default_network)
            .await?
        else {
            debug!(
                "No instance IP {} on {}, host port unresolved",
                host_ip, self.config.default_network
            );
            return Ok(None);
        };

        for vmi_uuid in &iip.interfaces {
            if let Some(vmi) = self.store.locate_vmi(self.api.as_ref(), vmi_uuid).await? {
                if vmi.host_id.is_some() {
                    return Ok(Some(vmi));
                }
            }
        }
        Ok(None)
    }

    /// Take the next free VLAN id on the host port
    pub async fn allocate_vlan(&self, host: &VmiRecord) -> Result<u16> {
        let mut in_use = Vec::new();
        for sub in &host.interface_refs {
            if let Some(tag) = self
                .store
                .locate_vmi(self.api.as_ref(), sub)
                .await?
                .and_then(|v| v.vlan_tag)
            {
                in_use.push(tag);
            }
        }
        self.store.reserve_vlans(&host.uuid, in_use);

        self.store.allocate_vlan(&host.uuid).ok_or_else(|| {
            ControllerError::unresolvable(
                format!("VLAN on host port {}", host.uuid),
                "VLAN space exhausted",
            )
        })
    }

    /// Cross-reference host and pod ports, then attach the pod VM to the
    /// host's virtual router (see `attach_host_router`)
    pub async fn link_overlay(
        &self,
        host: &VmiRecord,
        pod_vmi_uuid: &str,
        pod_vm_uuid: &str,
    ) -> Result<bool> {
        let host_ref = ObjectRef::interface(&host.uuid);
        let pod_ref = ObjectRef::interface(pod_vmi_uuid);
        self.api.ref_update(&host_ref, &pod_ref, RefOp::Add).await?;
        self.api.ref_update(&pod_ref, &host_ref, RefOp::Add).await?;
        self.store.link_interfaces(&host.uuid, pod_vmi_uuid);
        info!(
            "Linked pod port {} to host port {} (vlan {:?})",
            pod_vmi_uuid,
            host.uuid,
            self.store.vmi(pod_vmi_uuid).and_then(|v| v.vlan_tag)
        );

        self.attach_host_router(host, pod_vm_uuid).await
    }

    /// Attach the pod VM to the virtual router whose name is the host port's
    /// host-id. Returns false when that router is not known yet.
    pub async fn attach_host_router(&self, host: &VmiRecord, pod_vm_uuid: &str) -> Result<bool> {
        let host_id = host.host_id.as_deref().unwrap_or_default();
        let Some(vr_uuid) = self.mirror.virtual_router_by_name(host_id) else {
            warn!(
                "Virtual router for host {} not found, VM {} left unattached",
                host_id, pod_vm_uuid
            );
            return Ok(false);
        };

        if self
            .api
            .ref_update(
                &ObjectRef::virtual_router(&vr_uuid),
                &ObjectRef::virtual_machine(pod_vm_uuid),
                RefOp::Add,
            )
            .await
            .found()?
            .is_none()
        {
            debug!("VM {} or router {} vanished during attach", pod_vm_uuid, vr_uuid);
            return Ok(false);
        }
        self.store.set_virtual_router(pod_vm_uuid, &vr_uuid);
        debug!("Attached VM {} to virtual router {}", pod_vm_uuid, vr_uuid);
        Ok(true)
    }

    /// Remove the host/pod port references of a pod port and give its VLAN
    /// back to the host port
    pub async fn unlink_overlay(&self, pod_vmi: &VmiRecord) -> Result<()> {
        let pod_ref = ObjectRef::interface(&pod_vmi.uuid);
        for host_uuid in &pod_vmi.interface_refs {
            let host_ref = ObjectRef::interface(host_uuid);
            self.api
                .ref_update(&host_ref, &pod_ref, RefOp::Delete)
                .await
                .found()?;
            self.api
                .ref_update(&pod_ref, &host_ref, RefOp::Delete)
                .await
                .found()?;
            self.store.unlink_interfaces(host_uuid, &pod_vmi.uuid);
            if let Some(tag) = pod_vmi.vlan_tag {
                self.store.release_vlan(host_uuid, tag);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::ClusterCache;
    use crate::mock::MockVncApi;
    use crate::store::VmRecord;
    use podlink_core::{
        InterfaceProperties, Labels, PodRecord, VirtualMachine, VirtualMachineInterface,
        VirtualNetwork, VirtualRouter,
    };

    struct Fixture {
        api: Arc<MockVncApi>,
        store: Arc<VmStore>,
        cache: Arc<ClusterCache>,
        linker: NestedOverlayLinker,
        config: ControllerConfig,
    }

    async fn fixture() -> Fixture {
        let mut config = ControllerConfig::default();
        config.nested_mode = true;
        let api = Arc::new(MockVncApi::new());
        let store = Arc::new(VmStore::new());
        let cache = Arc::new(ClusterCache::new());

        api.add_network(VirtualNetwork {
            uuid: "vn-host".to_string(),
            fq_name: config.default_network.clone(),
            ..Default::default()
        })
        .await;
        api.insert_virtual_machine(VirtualMachine {
            uuid: "host-vm".to_string(),
            ..Default::default()
        })
        .await;
        api.insert_bound_port(
            VirtualMachineInterface {
                uuid: "host-vmi".to_string(),
                virtual_machine: "host-vm".to_string(),
                virtual_network: config.default_network.clone(),
                host_id: Some("compute-1".to_string()),
                ..Default::default()
            },
            "10.0.0.5",
            &config.default_network,
        )
        .await;
        cache.upsert_virtual_router(VirtualRouter {
            uuid: "vr-1".to_string(),
            name: "compute-1".to_string(),
            ip_address: "192.168.0.1".to_string(),
            virtual_machines: vec![],
        });
        api.add_virtual_router(VirtualRouter {
            uuid: "vr-1".to_string(),
            name: "compute-1".to_string(),
            ip_address: "192.168.0.1".to_string(),
            virtual_machines: vec![],
        })
        .await;
        cache.upsert_pod(PodRecord {
            uid: "p1".to_string(),
            name: "web".to_string(),
            namespace: "ns1".to_string(),
            node_name: Some("node1".to_string()),
            host_ip: Some("10.0.0.5".to_string()),
            labels: Labels::new(),
            host_network: false,
            network: None,
        });

        let linker = NestedOverlayLinker::new(
            api.clone(),
            store.clone(),
            cache.clone(),
            Arc::new(config.clone()),
        );
        Fixture {
            api,
            store,
            cache,
            linker,
            config,
        }
    }

    #[tokio::test]
    async fn test_resolve_host_port() {
        let f = fixture().await;
        let host = f.linker.resolve_host_port("p1").await.unwrap().unwrap();
        assert_eq!(host.uuid, "host-vmi");
        assert_eq!(host.host_id.as_deref(), Some("compute-1"));
    }

    #[tokio::test]
    async fn test_resolve_host_port_same_name_other_namespace() {
        let f = fixture().await;
        f.api
            .insert_virtual_machine(VirtualMachine {
                uuid: "host-vm-2".to_string(),
                ..Default::default()
            })
            .await;
        f.api
            .insert_bound_port(
                VirtualMachineInterface {
                    uuid: "host-vmi-2".to_string(),
                    virtual_machine: "host-vm-2".to_string(),
                    virtual_network: f.config.default_network.clone(),
                    host_id: Some("compute-2".to_string()),
                    ..Default::default()
                },
                "10.0.0.6",
                &f.config.default_network,
            )
            .await;
        f.cache.upsert_pod(PodRecord {
            uid: "p9".to_string(),
            name: "web".to_string(),
            namespace: "ns2".to_string(),
            node_name: Some("node2".to_string()),
            host_ip: Some("10.0.0.6".to_string()),
            labels: Labels::new(),
            host_network: false,
            network: None,
        });

        for _ in 0..20 {
            let host = f.linker.resolve_host_port("p9").await.unwrap().unwrap();
            assert_eq!(host.uuid, "host-vmi-2");
            let host = f.linker.resolve_host_port("p1").await.unwrap().unwrap();
            assert_eq!(host.uuid, "host-vmi");
        }
    }

    #[tokio::test]
    async fn test_resolve_host_port_without_node_ip() {
        let f = fixture().await;
        f.cache.upsert_pod(PodRecord {
            uid: "p2".to_string(),
            name: "db".to_string(),
            namespace: "ns1".to_string(),
            node_name: None,
            host_ip: None,
            labels: Labels::new(),
            host_network: false,
            network: None,
        });
        assert!(f.linker.resolve_host_port("p2").await.unwrap().is_none());
        assert!(f.linker.resolve_host_port("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_link_and_unlink_overlay() {
        let f = fixture().await;
        let host = f.linker.resolve_host_port("p1").await.unwrap().unwrap();
        let tag = f.linker.allocate_vlan(&host).await.unwrap();
        assert_eq!(tag, 1);

        f.api
            .virtual_machine_create(&VirtualMachine {
                uuid: "p1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        f.store.insert_vm(VmRecord::new("p1", "k8s__ns1__web"));
        let pod_vmi = VirtualMachineInterface {
            uuid: "pod-vmi".to_string(),
            virtual_machine: "p1".to_string(),
            virtual_network: f.config.default_network.clone(),
            properties: Some(InterfaceProperties {
                sub_interface_vlan_tag: Some(tag),
            }),
            ..Default::default()
        };
        f.api.virtual_machine_interface_create(&pod_vmi).await.unwrap();
        f.store.upsert_vmi_from_remote(&pod_vmi);

        assert!(f.linker.link_overlay(&host, "pod-vmi", "p1").await.unwrap());
        assert_eq!(
            f.api.virtual_machine_read("p1").await.unwrap().virtual_router.as_deref(),
            Some("vr-1")
        );
        assert!(f.store.vmi("host-vmi").unwrap().interface_refs.contains("pod-vmi"));

        // Second pod on the same host gets the next VLAN
        let host = f.store.vmi("host-vmi").unwrap();
        assert_eq!(f.linker.allocate_vlan(&host).await.unwrap(), 2);

        let pod_vmi = f.store.vmi("pod-vmi").unwrap();
        f.linker.unlink_overlay(&pod_vmi).await.unwrap();
        assert!(!f.store.vmi("host-vmi").unwrap().interface_refs.contains("pod-vmi"));
        f.api.virtual_machine_interface_delete("pod-vmi").await.unwrap();
    }

    #[tokio::test]
    async fn test_link_without_router_leaves_vm_unattached() {
        let f = fixture().await;
        f.cache.replace_virtual_routers(vec![]);
        let host = f.linker.resolve_host_port("p1").await.unwrap().unwrap();

        f.api
            .virtual_machine_create(&VirtualMachine {
                uuid: "p1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        f.store.insert_vm(VmRecord::new("p1", "web"));
        f.api
            .virtual_machine_interface_create(&VirtualMachineInterface {
                uuid: "pod-vmi".to_string(),
                virtual_machine: "p1".to_string(),
                virtual_network: f.config.default_network.clone(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(!f.linker.link_overlay(&host, "pod-vmi", "p1").await.unwrap());
        assert!(f.store.vm("p1").unwrap().virtual_router.is_none());
    }
}
