use crate::error::{ControllerError, Result};
use crate::traits::VncApi;
use async_trait::async_trait;
use podlink_core::{
    FloatingIp, FqName, InstanceIp, ObjectKind, ObjectRef, RefOp, VirtualMachine,
    VirtualMachineInterface, VirtualNetwork, VirtualRouter,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct MockState {
    networks: HashMap<FqName, VirtualNetwork>,
    vms: HashMap<String, VirtualMachine>,
    vmis: HashMap<String, VirtualMachineInterface>,
    iips: HashMap<String, InstanceIp>,
    fips: HashMap<String, FloatingIp>,
    routers: HashMap<String, VirtualRouter>,
    tags: HashMap<String, BTreeMap<String, String>>,
    next_host: u32,
    failing: HashSet<&'static str>,
}

impl MockState {
    fn check(&self, op: &'static str) -> Result<()> {
        if self.failing.contains(op) {
            return Err(ControllerError::remote_failure(op, "injected failure"));
        }
        Ok(())
    }

    fn allocate_address(&mut self) -> String {
        self.next_host += 1;
        let base = u32::from(Ipv4Addr::new(10, 32, 0, 1));
        Ipv4Addr::from(base + self.next_host).to_string()
    }
}

fn remove_id(list: &mut Vec<String>, id: &str) {
    list.retain(|x| x != id);
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|x| x == id) {
        list.push(id.to_string());
    }
}

/// In-memory SDN API for testing and development
///
/// Keeps back-references consistent the way the real API server does and,
/// like it, refuses to delete objects that are still referenced (a VM with
/// ports or a virtual router, a port with addresses or overlay links).
#[derive(Default)]
pub struct MockVncApi {
    state: RwLock<MockState>,
}

impl MockVncApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_network(&self, vn: VirtualNetwork) {
        self.state.write().await.networks.insert(vn.fq_name.clone(), vn);
    }

    pub async fn add_virtual_router(&self, vr: VirtualRouter) {
        self.state.write().await.routers.insert(vr.uuid.clone(), vr);
    }

    /// Insert a VM directly, bypassing create (objects owned by someone else)
    pub async fn insert_virtual_machine(&self, vm: VirtualMachine) {
        self.state.write().await.vms.insert(vm.uuid.clone(), vm);
    }

    /// Insert a bound port directly, together with its address on `network`
    pub async fn insert_bound_port(
        &self,
        vmi: VirtualMachineInterface,
        address: &str,
        network: &FqName,
    ) {
        let mut state = self.state.write().await;
        let iip_uuid = format!("{}-iip", vmi.uuid);
        let mut vmi = vmi;
        push_unique(&mut vmi.instance_ips, &iip_uuid);
        if let Some(vm) = state.vms.get_mut(&vmi.virtual_machine) {
            push_unique(&mut vm.interfaces, &vmi.uuid);
        }
        state.iips.insert(
            iip_uuid.clone(),
            InstanceIp {
                uuid: iip_uuid.clone(),
                name: iip_uuid,
                address: Some(address.to_string()),
                virtual_network: network.clone(),
                interfaces: vec![vmi.uuid.clone()],
                ..Default::default()
            },
        );
        state.vmis.insert(vmi.uuid.clone(), vmi);
    }

    /// Attach a floating IP to a port
    pub async fn attach_floating_ip(&self, vmi_uuid: &str, fip_uuid: &str) {
        let mut state = self.state.write().await;
        state.fips.insert(
            fip_uuid.to_string(),
            FloatingIp {
                uuid: fip_uuid.to_string(),
                address: None,
                interfaces: vec![vmi_uuid.to_string()],
            },
        );
        if let Some(vmi) = state.vmis.get_mut(vmi_uuid) {
            push_unique(&mut vmi.floating_ips, fip_uuid);
        }
    }

    /// Make every call of `op` fail with a remote failure
    pub async fn fail_operation(&self, op: &'static str) {
        self.state.write().await.failing.insert(op);
    }

    pub async fn vm_count(&self) -> usize {
        self.state.read().await.vms.len()
    }

    pub async fn vmi_count(&self) -> usize {
        self.state.read().await.vmis.len()
    }

    pub async fn iip_count(&self) -> usize {
        self.state.read().await.iips.len()
    }

    pub async fn fip_count(&self) -> usize {
        self.state.read().await.fips.len()
    }

    pub async fn instance_ip(&self, uuid: &str) -> Option<InstanceIp> {
        self.state.read().await.iips.get(uuid).cloned()
    }

    pub async fn instance_ips_of(&self, vmi_uuid: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .vmis
            .get(vmi_uuid)
            .map(|v| v.instance_ips.clone())
            .unwrap_or_default()
    }

    pub async fn tags_of(&self, vmi_uuid: &str) -> BTreeMap<String, String> {
        self.state
            .read()
            .await
            .tags
            .get(vmi_uuid)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl VncApi for MockVncApi {
    async fn virtual_network_read(&self, fq_name: &FqName) -> Result<VirtualNetwork> {
        let state = self.state.read().await;
        state.check("virtual-network-read")?;
        state
            .networks
            .get(fq_name)
            .cloned()
            .ok_or_else(|| ControllerError::object_not_found(ObjectKind::VirtualNetwork, fq_name.to_string()))
    }

    async fn virtual_machine_create(&self, vm: &VirtualMachine) -> Result<String> {
        let mut state = self.state.write().await;
        state.check("virtual-machine-create")?;
        if state.vms.contains_key(&vm.uuid) {
            return Err(ControllerError::already_exists(
                ObjectKind::VirtualMachine,
                &vm.uuid,
            ));
        }
        let mut vm = vm.clone();
        vm.interfaces.clear();
        vm.virtual_router = None;
        state.vms.insert(vm.uuid.clone(), vm.clone());
        debug!("Mock: virtual machine created: {}", vm.uuid);
        Ok(vm.uuid)
    }

    async fn virtual_machine_read(&self, uuid: &str) -> Result<VirtualMachine> {
        let state = self.state.read().await;
        state.check("virtual-machine-read")?;
        state
            .vms
            .get(uuid)
            .cloned()
            .ok_or_else(|| ControllerError::object_not_found(ObjectKind::VirtualMachine, uuid))
    }

    async fn virtual_machine_update(&self, vm: &VirtualMachine) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("virtual-machine-update")?;
        let existing = state
            .vms
            .get_mut(&vm.uuid)
            .ok_or_else(|| ControllerError::object_not_found(ObjectKind::VirtualMachine, &vm.uuid))?;
        existing.name = vm.name.clone();
        existing.display_name = vm.display_name.clone();
        existing.annotations = vm.annotations.clone();
        Ok(())
    }

    async fn virtual_machine_delete(&self, uuid: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("virtual-machine-delete")?;
        let vm = state
            .vms
            .get(uuid)
            .ok_or_else(|| ControllerError::object_not_found(ObjectKind::VirtualMachine, uuid))?;
        if !vm.interfaces.is_empty() || vm.virtual_router.is_some() {
            return Err(ControllerError::remote_failure(
                "virtual-machine-delete",
                format!("virtual machine {} is still referenced", uuid),
            ));
        }
        state.vms.remove(uuid);
        debug!("Mock: virtual machine deleted: {}", uuid);
        Ok(())
    }

    async fn virtual_machine_list(&self) -> Result<Vec<VirtualMachine>> {
        let state = self.state.read().await;
        state.check("virtual-machine-list")?;
        Ok(state.vms.values().cloned().collect())
    }

    async fn virtual_machine_interface_create(
        &self,
        vmi: &VirtualMachineInterface,
    ) -> Result<String> {
        let mut state = self.state.write().await;
        state.check("virtual-machine-interface-create")?;
        if state.vmis.contains_key(&vmi.uuid) {
            return Err(ControllerError::already_exists(
                ObjectKind::VirtualMachineInterface,
                &vmi.uuid,
            ));
        }
        if !state.networks.contains_key(&vmi.virtual_network) {
            return Err(ControllerError::object_not_found(
                ObjectKind::VirtualNetwork,
                vmi.virtual_network.to_string(),
            ));
        }
        let vm = state.vms.get_mut(&vmi.virtual_machine).ok_or_else(|| {
            ControllerError::object_not_found(ObjectKind::VirtualMachine, &vmi.virtual_machine)
        })?;
        push_unique(&mut vm.interfaces, &vmi.uuid);

        let mut vmi = vmi.clone();
        vmi.instance_ips.clear();
        vmi.floating_ips.clear();
        vmi.interface_refs.clear();
        state.vmis.insert(vmi.uuid.clone(), vmi.clone());
        debug!("Mock: port created: {}", vmi.uuid);
        Ok(vmi.uuid)
    }

    async fn virtual_machine_interface_read(&self, uuid: &str) -> Result<VirtualMachineInterface> {
        let state = self.state.read().await;
        state.check("virtual-machine-interface-read")?;
        state.vmis.get(uuid).cloned().ok_or_else(|| {
            ControllerError::object_not_found(ObjectKind::VirtualMachineInterface, uuid)
        })
    }

    async fn virtual_machine_interface_update(&self, vmi: &VirtualMachineInterface) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("virtual-machine-interface-update")?;
        let existing = state.vmis.get_mut(&vmi.uuid).ok_or_else(|| {
            ControllerError::object_not_found(ObjectKind::VirtualMachineInterface, &vmi.uuid)
        })?;
        existing.display_name = vmi.display_name.clone();
        existing.properties = vmi.properties.clone();
        existing.security_groups = vmi.security_groups.clone();
        existing.port_security_enabled = vmi.port_security_enabled;
        existing.annotations = vmi.annotations.clone();
        Ok(())
    }

    async fn virtual_machine_interface_delete(&self, uuid: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("virtual-machine-interface-delete")?;
        let vmi = state.vmis.get(uuid).ok_or_else(|| {
            ControllerError::object_not_found(ObjectKind::VirtualMachineInterface, uuid)
        })?;
        let referenced_by_port = state
            .vmis
            .values()
            .any(|other| other.uuid != uuid && other.interface_refs.iter().any(|r| r == uuid));
        if !vmi.instance_ips.is_empty() || !vmi.floating_ips.is_empty() || referenced_by_port {
            return Err(ControllerError::remote_failure(
                "virtual-machine-interface-delete",
                format!("port {} is still referenced", uuid),
            ));
        }
        let vm_uuid = vmi.virtual_machine.clone();
        state.vmis.remove(uuid);
        state.tags.remove(uuid);
        if let Some(vm) = state.vms.get_mut(&vm_uuid) {
            remove_id(&mut vm.interfaces, uuid);
        }
        debug!("Mock: port deleted: {}", uuid);
        Ok(())
    }

    async fn instance_ip_create(&self, iip: &InstanceIp) -> Result<String> {
        let mut state = self.state.write().await;
        state.check("instance-ip-create")?;
        if state.iips.contains_key(&iip.uuid) {
            return Err(ControllerError::already_exists(ObjectKind::InstanceIp, &iip.uuid));
        }
        for vmi_uuid in &iip.interfaces {
            if !state.vmis.contains_key(vmi_uuid) {
                return Err(ControllerError::object_not_found(
                    ObjectKind::VirtualMachineInterface,
                    vmi_uuid,
                ));
            }
        }
        let mut iip = iip.clone();
        if iip.address.is_none() {
            iip.address = Some(state.allocate_address());
        }
        for vmi_uuid in &iip.interfaces {
            if let Some(vmi) = state.vmis.get_mut(vmi_uuid) {
                push_unique(&mut vmi.instance_ips, &iip.uuid);
            }
        }
        state.iips.insert(iip.uuid.clone(), iip.clone());
        debug!("Mock: instance ip created: {} ({:?})", iip.uuid, iip.address);
        Ok(iip.uuid)
    }

    async fn instance_ip_update(&self, iip: &InstanceIp) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("instance-ip-update")?;
        let existing = state
            .iips
            .get_mut(&iip.uuid)
            .ok_or_else(|| ControllerError::object_not_found(ObjectKind::InstanceIp, &iip.uuid))?;
        existing.display_name = iip.display_name.clone();
        existing.annotations = iip.annotations.clone();
        Ok(())
    }

    async fn instance_ip_delete(&self, uuid: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("instance-ip-delete")?;
        let iip = state
            .iips
            .remove(uuid)
            .ok_or_else(|| ControllerError::object_not_found(ObjectKind::InstanceIp, uuid))?;
        for vmi_uuid in &iip.interfaces {
            if let Some(vmi) = state.vmis.get_mut(vmi_uuid) {
                remove_id(&mut vmi.instance_ips, uuid);
            }
        }
        debug!("Mock: instance ip deleted: {}", uuid);
        Ok(())
    }

    async fn instance_ip_find(
        &self,
        address: &str,
        network: &FqName,
    ) -> Result<Option<InstanceIp>> {
        let state = self.state.read().await;
        state.check("instance-ip-find")?;
        Ok(state
            .iips
            .values()
            .find(|iip| iip.address.as_deref() == Some(address) && &iip.virtual_network == network)
            .cloned())
    }

    async fn floating_ip_delete(&self, uuid: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("floating-ip-delete")?;
        let fip = state
            .fips
            .remove(uuid)
            .ok_or_else(|| ControllerError::object_not_found(ObjectKind::FloatingIp, uuid))?;
        for vmi_uuid in &fip.interfaces {
            if let Some(vmi) = state.vmis.get_mut(vmi_uuid) {
                remove_id(&mut vmi.floating_ips, uuid);
            }
        }
        Ok(())
    }

    async fn virtual_router_read(&self, uuid: &str) -> Result<VirtualRouter> {
        let state = self.state.read().await;
        state.check("virtual-router-read")?;
        state
            .routers
            .get(uuid)
            .cloned()
            .ok_or_else(|| ControllerError::object_not_found(ObjectKind::VirtualRouter, uuid))
    }

    async fn virtual_router_list(&self) -> Result<Vec<VirtualRouter>> {
        let state = self.state.read().await;
        state.check("virtual-router-list")?;
        Ok(state.routers.values().cloned().collect())
    }

    async fn ref_update(&self, from: &ObjectRef, to: &ObjectRef, op: RefOp) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("ref-update")?;

        match (from.kind, to.kind) {
            (ObjectKind::VirtualRouter, ObjectKind::VirtualMachine) => {
                if !state.vms.contains_key(&to.uuid) {
                    return Err(ControllerError::object_not_found(to.kind, &to.uuid));
                }
                let vr = state
                    .routers
                    .get_mut(&from.uuid)
                    .ok_or_else(|| ControllerError::object_not_found(from.kind, &from.uuid))?;
                match op {
                    RefOp::Add => push_unique(&mut vr.virtual_machines, &to.uuid),
                    RefOp::Delete => remove_id(&mut vr.virtual_machines, &to.uuid),
                }
                if let Some(vm) = state.vms.get_mut(&to.uuid) {
                    vm.virtual_router = match op {
                        RefOp::Add => Some(from.uuid.clone()),
                        RefOp::Delete => None,
                    };
                }
            }
            (ObjectKind::VirtualMachineInterface, ObjectKind::VirtualMachineInterface) => {
                if !state.vmis.contains_key(&to.uuid) {
                    return Err(ControllerError::object_not_found(to.kind, &to.uuid));
                }
                let vmi = state
                    .vmis
                    .get_mut(&from.uuid)
                    .ok_or_else(|| ControllerError::object_not_found(from.kind, &from.uuid))?;
                match op {
                    RefOp::Add => push_unique(&mut vmi.interface_refs, &to.uuid),
                    RefOp::Delete => remove_id(&mut vmi.interface_refs, &to.uuid),
                }
            }
            (f, t) => {
                return Err(ControllerError::remote_failure(
                    "ref-update",
                    format!("unsupported reference {} -> {}", f, t),
                ))
            }
        }
        debug!("Mock: ref {:?} {} -> {}", op, from, to);
        Ok(())
    }

    async fn set_tag(&self, vmi_uuid: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("set-tag")?;
        if !state.vmis.contains_key(vmi_uuid) {
            return Err(ControllerError::object_not_found(
                ObjectKind::VirtualMachineInterface,
                vmi_uuid,
            ));
        }
        state
            .tags
            .entry(vmi_uuid.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn unset_tag(&self, vmi_uuid: &str, key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check("unset-tag")?;
        if !state.vmis.contains_key(vmi_uuid) {
            return Err(ControllerError::object_not_found(
                ObjectKind::VirtualMachineInterface,
                vmi_uuid,
            ));
        }
        if let Some(tags) = state.tags.get_mut(vmi_uuid) {
            tags.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> VirtualNetwork {
        VirtualNetwork {
            uuid: "vn-1".to_string(),
            fq_name: FqName::new(["d", "p", "net"]),
            ipam_subnets: BTreeMap::new(),
        }
    }

    fn vm(uuid: &str) -> VirtualMachine {
        VirtualMachine {
            uuid: uuid.to_string(),
            name: uuid.to_string(),
            ..Default::default()
        }
    }

    fn port(uuid: &str, vm: &str) -> VirtualMachineInterface {
        VirtualMachineInterface {
            uuid: uuid.to_string(),
            virtual_network: network().fq_name,
            virtual_machine: vm.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_create_returns_already_exists() {
        let api = MockVncApi::new();
        api.virtual_machine_create(&vm("a")).await.unwrap();
        assert!(api
            .virtual_machine_create(&vm("a"))
            .await
            .unwrap_err()
            .is_already_exists());
    }

    #[tokio::test]
    async fn test_port_create_maintains_back_refs() {
        let api = MockVncApi::new();
        api.add_network(network()).await;
        api.virtual_machine_create(&vm("a")).await.unwrap();
        api.virtual_machine_interface_create(&port("vmi-a", "a"))
            .await
            .unwrap();

        let read = api.virtual_machine_read("a").await.unwrap();
        assert_eq!(read.interfaces, vec!["vmi-a".to_string()]);
    }

    #[tokio::test]
    async fn test_vm_delete_refused_while_ports_attached() {
        let api = MockVncApi::new();
        api.add_network(network()).await;
        api.virtual_machine_create(&vm("a")).await.unwrap();
        api.virtual_machine_interface_create(&port("vmi-a", "a"))
            .await
            .unwrap();

        assert!(matches!(
            api.virtual_machine_delete("a").await.unwrap_err(),
            ControllerError::RemoteFailure { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_objects_return_not_found() {
        let api = MockVncApi::new();
        assert!(api.virtual_machine_read("x").await.unwrap_err().is_not_found());
        assert!(api.instance_ip_delete("x").await.unwrap_err().is_not_found());
        assert!(api.floating_ip_delete("x").await.unwrap_err().is_not_found());
        assert!(api
            .virtual_machine_interface_delete("x")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_router_ref_sets_vm_back_ref() {
        let api = MockVncApi::new();
        api.add_virtual_router(VirtualRouter {
            uuid: "vr-1".to_string(),
            name: "node1".to_string(),
            ip_address: "10.0.0.5".to_string(),
            virtual_machines: vec![],
        })
        .await;
        api.virtual_machine_create(&vm("a")).await.unwrap();

        api.ref_update(
            &ObjectRef::virtual_router("vr-1"),
            &ObjectRef::virtual_machine("a"),
            RefOp::Add,
        )
        .await
        .unwrap();
        assert_eq!(
            api.virtual_machine_read("a").await.unwrap().virtual_router.as_deref(),
            Some("vr-1")
        );

        api.ref_update(
            &ObjectRef::virtual_router("vr-1"),
            &ObjectRef::virtual_machine("a"),
            RefOp::Delete,
        )
        .await
        .unwrap();
        assert!(api.virtual_machine_read("a").await.unwrap().virtual_router.is_none());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let api = MockVncApi::new();
        api.fail_operation("virtual-machine-create").await;
        assert!(matches!(
            api.virtual_machine_create(&vm("a")).await.unwrap_err(),
            ControllerError::RemoteFailure { .. }
        ));
    }
}
