//! Per-pod state machine for the VM -> port -> instance IP -> tags chain.
//!
//! Every call acts on behalf of one pod uid; callers hold that uid's lock
//! from `PodLocks`. Creation is idempotent (an existing object is updated)
//! and deletion tolerates objects that are already gone, so an interrupted
//! chain is completed or torn down by the next event or drift pass.

use crate::config::ControllerConfig;
use crate::error::{ControllerError, NotFoundExt, Result};
use crate::labels::LabelTagSynchronizer;
use crate::nested::NestedOverlayLinker;
use crate::network::NetworkResolver;
use crate::store::{vm_annotations, ReconcileState, VmRecord, VmStore, VmiRecord};
use crate::traits::{ClusterMirror, VncApi};
use podlink_core::objects::{CLUSTER_KEY, NAMESPACE_KEY, OWNER_KEY, POD_NAME_KEY};
use podlink_core::{
    make_display_name, make_name, InstanceIp, InterfaceProperties, Labels, ObjectRef, PodRecord,
    RefOp, VirtualMachine, VirtualMachineInterface, VirtualNetwork,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ResourceReconciler {
    api: Arc<dyn VncApi>,
    store: Arc<VmStore>,
    mirror: Arc<dyn ClusterMirror>,
    config: Arc<ControllerConfig>,
    resolver: NetworkResolver,
    nested: NestedOverlayLinker,
    labels: Arc<LabelTagSynchronizer>,
}

impl ResourceReconciler {
    pub fn new(
        api: Arc<dyn VncApi>,
        store: Arc<VmStore>,
        mirror: Arc<dyn ClusterMirror>,
        config: Arc<ControllerConfig>,
        labels: Arc<LabelTagSynchronizer>,
    ) -> Self {
        let resolver = NetworkResolver::new(api.clone(), mirror.clone(), config.clone());
        let nested =
            NestedOverlayLinker::new(api.clone(), store.clone(), mirror.clone(), config.clone());
        Self {
            api,
            store,
            mirror,
            config,
            resolver,
            nested,
            labels,
        }
    }

    pub fn store(&self) -> &Arc<VmStore> {
        &self.store
    }

    pub fn labels(&self) -> &Arc<LabelTagSynchronizer> {
        &self.labels
    }

    pub fn nested(&self) -> &NestedOverlayLinker {
        &self.nested
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Seed the object store from the remote API
    pub async fn sync_from_remote(&self) -> Result<usize> {
        let count = self.store.sync(self.api.as_ref()).await?;
        let labelled = self.labels.seed_index();
        info!(
            "Cached {} virtual machines from the SDN API ({} with labels)",
            count, labelled
        );
        Ok(count)
    }

    /// Build the full chain for a new pod. An existing VM for the uid turns
    /// this into an update.
    pub async fn add(
        &self,
        pod: &PodRecord,
        labels: &Labels,
        host_port: Option<&VmiRecord>,
    ) -> Result<()> {
        if let Some(vm) = self.store.locate_vm(self.api.as_ref(), &pod.uid).await? {
            debug!("VM {} already exists, updating", vm.uuid);
            return self.update_existing(vm, pod, labels, host_port).await;
        }
        self.check_pod_uuid_change(pod).await?;
        self.provision(pod, labels, host_port).await
    }

    /// Bring an existing chain in line with the pod; creates it when absent
    pub async fn update(
        &self,
        pod: &PodRecord,
        labels: &Labels,
        host_port: Option<&VmiRecord>,
    ) -> Result<()> {
        match self.store.locate_vm(self.api.as_ref(), &pod.uid).await? {
            Some(vm) => self.update_existing(vm, pod, labels, host_port).await,
            None => {
                self.check_pod_uuid_change(pod).await?;
                self.provision(pod, labels, host_port).await
            }
        }
    }

    /// Tear down the chain of a VM. Objects already gone are skipped.
    pub async fn delete(&self, vm_uuid: &str) -> Result<()> {
        let Some(mut vm) = self.store.locate_vm(self.api.as_ref(), vm_uuid).await? else {
            debug!("VM {} not found, nothing to delete", vm_uuid);
            self.labels.clear(vm_uuid);
            return Ok(());
        };
        self.store.set_state(vm_uuid, ReconcileState::Deleting);

        // A router reference may exist remotely before we have seen it
        if vm.virtual_router.is_none() {
            if let Some(fresh) = self.store.refresh_vm(self.api.as_ref(), vm_uuid).await? {
                vm = fresh;
            }
        }

        let mut labels = vm.pod_labels.clone().unwrap_or_default();
        labels.extend(self.labels.clear(vm_uuid));

        for port_uuid in &vm.interfaces {
            let Some(port) = self.port_for_delete(port_uuid).await? else {
                continue;
            };
            self.delete_port(&port, &labels).await?;
        }

        if let Some(vr_uuid) = &vm.virtual_router {
            self.api
                .ref_update(
                    &ObjectRef::virtual_router(vr_uuid),
                    &ObjectRef::virtual_machine(vm_uuid),
                    RefOp::Delete,
                )
                .await
                .found()?;
            self.store.clear_virtual_router(vm_uuid);
        }

        if self.api.virtual_machine_delete(vm_uuid).await.found()?.is_none() {
            debug!("VM {} was already deleted", vm_uuid);
        }
        self.store.remove_vm(vm_uuid);
        info!("Deleted VM {} ({})", vm_uuid, vm.display_name);
        Ok(())
    }

    /// Attach the VM to the virtual router registered with the node IP.
    /// Returns whether the VM is attached afterwards.
    pub async fn attach_virtual_router(&self, vm_uuid: &str, node_ip: Option<&str>) -> Result<bool> {
        let Some(vm) = self.store.vm(vm_uuid) else {
            return Ok(false);
        };
        if vm.virtual_router.is_some() {
            return Ok(true);
        }
        let Some(ip) = node_ip.or(vm.node_ip.as_deref()) else {
            debug!("VM {} has no node IP yet, router attach deferred", vm_uuid);
            return Ok(false);
        };
        let Some(vr_uuid) = self.mirror.virtual_router_by_ip(ip) else {
            info!(
                "No virtual router registered for node IP {}, VM {} left unattached",
                ip, vm_uuid
            );
            return Ok(false);
        };

        if self
            .api
            .ref_update(
                &ObjectRef::virtual_router(&vr_uuid),
                &ObjectRef::virtual_machine(vm_uuid),
                RefOp::Add,
            )
            .await
            .found()?
            .is_none()
        {
            debug!("VM {} or router {} vanished during attach", vm_uuid, vr_uuid);
            return Ok(false);
        }
        self.store.set_virtual_router(vm_uuid, &vr_uuid);
        debug!("Attached VM {} to virtual router {} ({})", vm_uuid, vr_uuid, ip);
        Ok(true)
    }

    /// Retry router attachment for a VM that lacks it
    pub async fn repair_attachment(&self, vm_uuid: &str) -> Result<bool> {
        let Some(vm) = self.store.vm(vm_uuid) else {
            return Ok(false);
        };
        if vm.virtual_router.is_some() {
            return Ok(true);
        }
        if !self.config.nested_mode {
            return self.attach_virtual_router(vm_uuid, None).await;
        }

        let Some(host) = self.nested.resolve_host_port(vm_uuid).await? else {
            return Ok(false);
        };
        self.nested.attach_host_router(&host, vm_uuid).await
    }

    // --- Create path ---

    async fn provision(
        &self,
        pod: &PodRecord,
        labels: &Labels,
        host_port: Option<&VmiRecord>,
    ) -> Result<()> {
        let Some(vn) = self
            .resolver
            .resolve(&pod.uid, &pod.name, &pod.namespace)
            .await?
        else {
            return Ok(());
        };

        self.create_vm(pod, labels).await?;
        let port = self.create_port(pod, &vn, host_port).await?;
        self.create_instance_ip(pod, &vn, &port.uuid).await?;
        self.attach(pod, host_port, &port).await?;
        self.labels.apply(&pod.uid, labels).await?;

        self.store.set_state(&pod.uid, ReconcileState::Attached);
        info!(
            "Provisioned pod {}/{} ({}) on {}",
            pod.namespace, pod.name, pod.uid, vn.fq_name
        );
        Ok(())
    }

    /// Delete a VM left behind by an earlier pod with the same name
    async fn check_pod_uuid_change(&self, pod: &PodRecord) -> Result<()> {
        let display_name =
            make_display_name(&self.config.cluster_name, &pod.namespace, &pod.name);
        if let Some(stale) = self.store.vm_by_display_name(&display_name) {
            if stale.uuid != pod.uid {
                info!(
                    "Pod {}/{} changed uid {} -> {}, deleting stale VM",
                    pod.namespace, pod.name, stale.uuid, pod.uid
                );
                self.delete(&stale.uuid).await?;
            }
        }
        Ok(())
    }

    fn vm_object(&self, pod: &PodRecord, labels: &Labels) -> VirtualMachine {
        VirtualMachine {
            uuid: pod.uid.clone(),
            name: make_name([pod.name.as_str(), pod.uid.as_str()]),
            display_name: make_display_name(&self.config.cluster_name, &pod.namespace, &pod.name),
            annotations: vm_annotations(
                &self.config.owner,
                &self.config.cluster_name,
                &pod.namespace,
                &pod.name,
                &pod.uid,
                labels,
            ),
            ..Default::default()
        }
    }

    async fn create_vm(&self, pod: &PodRecord, labels: &Labels) -> Result<()> {
        let vm = self.vm_object(pod, labels);
        match self.api.virtual_machine_create(&vm).await {
            Ok(_) => debug!("Created VM {}", vm.uuid),
            Err(e) if e.is_already_exists() => {
                debug!("VM {} already exists remotely, updating", vm.uuid);
                self.api.virtual_machine_update(&vm).await?;
            }
            Err(e) => return Err(e),
        }

        let mut record = VmRecord::new(&vm.uuid, &vm.display_name);
        record.owner = Some(self.config.owner.clone());
        record.cluster = Some(self.config.cluster_name.clone());
        self.store.insert_vm(record);
        self.store.set_pod_info(
            &pod.uid,
            &pod.namespace,
            pod.node_name.as_deref(),
            pod.host_ip.as_deref(),
        );
        Ok(())
    }

    fn object_annotations(&self, pod: &PodRecord) -> BTreeMap<String, String> {
        BTreeMap::from([
            (OWNER_KEY.to_string(), self.config.owner.clone()),
            (CLUSTER_KEY.to_string(), self.config.cluster_name.clone()),
            (NAMESPACE_KEY.to_string(), pod.namespace.clone()),
            (POD_NAME_KEY.to_string(), pod.name.clone()),
        ])
    }

    async fn create_port(
        &self,
        pod: &PodRecord,
        vn: &VirtualNetwork,
        host_port: Option<&VmiRecord>,
    ) -> Result<VmiRecord> {
        let vlan = match host_port {
            Some(host) if self.config.nested_mode => Some(self.nested.allocate_vlan(host).await?),
            _ => None,
        };

        let vmi = VirtualMachineInterface {
            uuid: Uuid::new_v4().to_string(),
            name: make_name([pod.name.as_str(), pod.uid.as_str()]),
            display_name: make_display_name(&self.config.cluster_name, &pod.namespace, &pod.name),
            parent: self.config.project_fq_name(&pod.namespace),
            virtual_network: vn.fq_name.clone(),
            virtual_machine: pod.uid.clone(),
            properties: vlan.map(|tag| InterfaceProperties {
                sub_interface_vlan_tag: Some(tag),
            }),
            security_groups: vec![self.config.default_security_group(&pod.namespace)],
            port_security_enabled: true,
            annotations: self.object_annotations(pod),
            ..Default::default()
        };

        let created = match self.api.virtual_machine_interface_create(&vmi).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => self.api.virtual_machine_interface_update(&vmi).await,
            Err(e) => Err(e),
        };
        if let Err(e) = created {
            if let (Some(host), Some(tag)) = (host_port, vlan) {
                self.store.release_vlan(&host.uuid, tag);
            }
            return Err(e);
        }

        debug!("Created port {} for pod {}", vmi.uuid, pod.uid);
        Ok(self.store.upsert_vmi_from_remote(&vmi))
    }

    async fn create_instance_ip(
        &self,
        pod: &PodRecord,
        vn: &VirtualNetwork,
        vmi_uuid: &str,
    ) -> Result<()> {
        let iip = InstanceIp {
            uuid: Uuid::new_v4().to_string(),
            name: make_name([pod.name.as_str(), pod.uid.as_str()]),
            display_name: make_display_name(&self.config.cluster_name, &pod.namespace, &pod.name),
            address: None,
            subnet_uuid: self.resolver.address_subnet(vn, &pod.namespace),
            virtual_network: vn.fq_name.clone(),
            interfaces: vec![vmi_uuid.to_string()],
            annotations: self.object_annotations(pod),
        };

        match self.api.instance_ip_create(&iip).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => self.api.instance_ip_update(&iip).await?,
            Err(e) => return Err(e),
        }
        self.store.add_instance_ip(vmi_uuid, &iip.uuid);
        debug!("Created instance IP {} on port {}", iip.uuid, vmi_uuid);
        Ok(())
    }

    /// Router attachment for a freshly created or completed port
    async fn attach(
        &self,
        pod: &PodRecord,
        host_port: Option<&VmiRecord>,
        port: &VmiRecord,
    ) -> Result<bool> {
        if self.config.nested_mode {
            let Some(host) = host_port else {
                return Ok(false);
            };
            if port.interface_refs.contains(&host.uuid) {
                return self.nested.attach_host_router(host, &pod.uid).await;
            }
            return self.nested.link_overlay(host, &port.uuid, &pod.uid).await;
        }
        self.attach_virtual_router(&pod.uid, pod.host_ip.as_deref())
            .await
    }

    // --- Update path ---

    async fn update_existing(
        &self,
        vm: VmRecord,
        pod: &PodRecord,
        labels: &Labels,
        host_port: Option<&VmiRecord>,
    ) -> Result<()> {
        if vm.state == ReconcileState::Deleting {
            warn!(
                "Pod {}/{} ({}) is being deleted, update skipped",
                pod.namespace, pod.name, pod.uid
            );
            return Ok(());
        }
        self.store.set_state(&pod.uid, ReconcileState::Updating);
        self.store.set_pod_info(
            &pod.uid,
            &pod.namespace,
            pod.node_name.as_deref(),
            pod.host_ip.as_deref(),
        );

        let mut remote = self.vm_object(pod, labels);
        remote.display_name = vm.display_name.clone();
        if self
            .api
            .virtual_machine_update(&remote)
            .await
            .found()?
            .is_none()
        {
            info!("VM {} vanished remotely, recreating", pod.uid);
            self.store.remove_vm(&pod.uid);
            return self.provision(pod, labels, host_port).await;
        }

        self.complete_chain(&vm, pod, host_port).await?;

        if self.store.vm(&pod.uid).is_some_and(|v| v.virtual_router.is_none()) {
            if let Some(port) = self.store.vmis_of(&pod.uid).into_iter().next() {
                self.attach(pod, host_port, &port).await?;
            } else {
                self.attach_virtual_router(&pod.uid, pod.host_ip.as_deref())
                    .await?;
            }
        }

        self.labels.replace(&pod.uid, labels).await?;
        self.store.set_state(&pod.uid, ReconcileState::Attached);
        debug!("Updated pod {}/{} ({})", pod.namespace, pod.name, pod.uid);
        Ok(())
    }

    /// Create the port and instance IP an interrupted Add left out
    async fn complete_chain(
        &self,
        vm: &VmRecord,
        pod: &PodRecord,
        host_port: Option<&VmiRecord>,
    ) -> Result<()> {
        let mut ports = Vec::new();
        for uuid in &vm.interfaces {
            if let Some(port) = self.store.locate_vmi(self.api.as_ref(), uuid).await? {
                ports.push(port);
            }
        }
        if !ports.is_empty() && ports.iter().all(|p| !p.instance_ips.is_empty()) {
            return Ok(());
        }

        let Some(vn) = self
            .resolver
            .resolve(&pod.uid, &pod.name, &pod.namespace)
            .await?
        else {
            return Ok(());
        };

        if ports.is_empty() {
            info!("Completing chain of pod {}: creating port", pod.uid);
            let port = self.create_port(pod, &vn, host_port).await?;
            self.create_instance_ip(pod, &vn, &port.uuid).await?;
            return Ok(());
        }
        for port in ports.iter().filter(|p| p.instance_ips.is_empty()) {
            info!(
                "Completing chain of pod {}: creating instance IP on port {}",
                pod.uid, port.uuid
            );
            self.create_instance_ip(pod, &vn, &port.uuid).await?;
        }
        Ok(())
    }

    // --- Delete path ---

    /// Current view of a port for teardown: the remote object, plus any
    /// addresses only the cache knows about
    async fn port_for_delete(&self, uuid: &str) -> Result<Option<VmiRecord>> {
        let cached = self.store.vmi(uuid);
        let remote = self
            .api
            .virtual_machine_interface_read(uuid)
            .await
            .found()?
            .map(|vmi| self.store.upsert_vmi_from_remote(&vmi));

        Ok(match (remote, cached) {
            (Some(mut port), Some(cached)) => {
                port.instance_ips.extend(cached.instance_ips);
                port.floating_ips.extend(cached.floating_ips);
                Some(port)
            }
            (Some(port), None) => Some(port),
            (None, cached) => cached,
        })
    }

    async fn delete_port(&self, port: &VmiRecord, labels: &Labels) -> Result<()> {
        self.labels.unset_port_tags(&port.uuid, labels).await?;

        for iip in &port.instance_ips {
            if self.api.instance_ip_delete(iip).await.found()?.is_none() {
                debug!("Instance IP {} was already deleted", iip);
            }
            self.store.remove_instance_ip(&port.uuid, iip);
        }
        for fip in &port.floating_ips {
            if self.api.floating_ip_delete(fip).await.found()?.is_none() {
                debug!("Floating IP {} was already deleted", fip);
            }
            self.store.remove_floating_ip(&port.uuid, fip);
        }

        self.nested.unlink_overlay(port).await?;

        if self
            .api
            .virtual_machine_interface_delete(&port.uuid)
            .await
            .found()?
            .is_none()
        {
            debug!("Port {} was already deleted", port.uuid);
        }
        self.store.remove_vmi(&port.uuid);
        Ok(())
    }
}

/// Outcomes of racing the orchestrator or the control plane, absorbed by
/// the dispatcher
pub fn is_expected_race(err: &ControllerError) -> bool {
    matches!(
        err,
        ControllerError::NotFound { .. }
            | ControllerError::AlreadyExists { .. }
            | ControllerError::Unresolvable { .. }
    )
}
