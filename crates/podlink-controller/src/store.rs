//! Owned, keyed cache of the SDN objects this controller manages.
//!
//! Callers get snapshots (clones) of records; every mutation goes through a
//! `VmStore` method so the invariants hold:
//! - a VM record's uuid never changes and equals the pod uid
//! - a port record never outlives its VM record
//! - `pod_labels` always carries the implicit namespace label
//! - the virtual-router reference is set at most once per attachment cycle

use crate::error::{NotFoundExt, Result};
use crate::traits::VncApi;
use parking_lot::RwLock;
use podlink_core::objects::{CLUSTER_KEY, LABELS_KEY, NAMESPACE_KEY, OWNER_KEY};
use podlink_core::{FqName, Labels, VirtualMachine, VirtualMachineInterface, NAMESPACE_LABEL_KEY};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Usable VLAN ids on a host port
pub const VLAN_RANGE: std::ops::RangeInclusive<u16> = 1..=4094;

/// Per-pod reconciliation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileState {
    #[default]
    Absent,
    Provisioning,
    Attached,
    Updating,
    Deleting,
}

impl ReconcileState {
    pub fn can_transition_to(self, next: ReconcileState) -> bool {
        use ReconcileState::*;
        matches!(
            (self, next),
            (Absent, Provisioning)
                | (Provisioning, Provisioning)
                | (Provisioning, Attached)
                | (Provisioning, Updating)
                | (Attached, Updating)
                | (Updating, Updating)
                | (Updating, Attached)
                | (_, Deleting)
        )
    }
}

/// Cached virtual machine
#[derive(Debug, Clone, PartialEq)]
pub struct VmRecord {
    pub uuid: String,
    pub display_name: String,
    pub owner: Option<String>,
    pub cluster: Option<String>,
    pub pod_namespace: Option<String>,
    pub pod_node: Option<String>,
    pub node_ip: Option<String>,
    pub virtual_router: Option<String>,
    pub pod_labels: Option<Labels>,
    pub interfaces: BTreeSet<String>,
    pub state: ReconcileState,
}

impl VmRecord {
    pub fn new(uuid: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            display_name: display_name.into(),
            owner: None,
            cluster: None,
            pod_namespace: None,
            pod_node: None,
            node_ip: None,
            virtual_router: None,
            pod_labels: None,
            interfaces: BTreeSet::new(),
            state: ReconcileState::Absent,
        }
    }

    fn from_remote(vm: &VirtualMachine) -> Self {
        let mut record = Self::new(&vm.uuid, &vm.display_name);
        record.owner = vm.owner().map(str::to_string);
        record.cluster = vm.cluster().map(str::to_string);
        record.pod_namespace = vm.annotations.get(NAMESPACE_KEY).cloned();
        record.pod_labels = vm
            .annotations
            .get(LABELS_KEY)
            .and_then(|raw| serde_json::from_str::<Labels>(raw).ok());
        record.virtual_router = vm.virtual_router.clone();
        record.interfaces = vm.interfaces.iter().cloned().collect();
        record.state = ReconcileState::Attached;
        record
    }

    /// Owned by this controller instance
    pub fn is_owned_by(&self, owner: &str, cluster: &str) -> bool {
        self.owner.as_deref() == Some(owner) && self.cluster.as_deref() == Some(cluster)
    }
}

/// Cached port
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VmiRecord {
    pub uuid: String,
    pub vm_uuid: String,
    pub virtual_network: FqName,
    pub vlan_tag: Option<u16>,
    pub security_groups: Vec<FqName>,
    pub host_id: Option<String>,
    pub instance_ips: BTreeSet<String>,
    pub floating_ips: BTreeSet<String>,
    /// Port-to-port references (host port <-> pod port in nested mode)
    pub interface_refs: BTreeSet<String>,
    /// VLAN ids handed out to pod sub-interfaces (host ports only)
    pub used_vlans: BTreeSet<u16>,
}

impl VmiRecord {
    fn from_remote(vmi: &VirtualMachineInterface) -> Self {
        Self {
            uuid: vmi.uuid.clone(),
            vm_uuid: vmi.virtual_machine.clone(),
            virtual_network: vmi.virtual_network.clone(),
            vlan_tag: vmi.vlan_tag(),
            security_groups: vmi.security_groups.clone(),
            host_id: vmi.host_id.clone(),
            instance_ips: vmi.instance_ips.iter().cloned().collect(),
            floating_ips: vmi.floating_ips.iter().cloned().collect(),
            interface_refs: vmi.interface_refs.iter().cloned().collect(),
            used_vlans: BTreeSet::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    vms: HashMap<String, VmRecord>,
    vmis: HashMap<String, VmiRecord>,
}

/// Process-wide object store shared by the event and drift paths
#[derive(Default)]
pub struct VmStore {
    inner: RwLock<Inner>,
}

impl VmStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Virtual machines ---

    pub fn vm(&self, uuid: &str) -> Option<VmRecord> {
        self.inner.read().vms.get(uuid).cloned()
    }

    pub fn vm_uuids(&self) -> Vec<String> {
        self.inner.read().vms.keys().cloned().collect()
    }

    pub fn vms(&self) -> Vec<VmRecord> {
        self.inner.read().vms.values().cloned().collect()
    }

    /// VM carrying `display_name`, if any
    pub fn vm_by_display_name(&self, display_name: &str) -> Option<VmRecord> {
        self.inner
            .read()
            .vms
            .values()
            .find(|vm| vm.display_name == display_name)
            .cloned()
    }

    pub fn state(&self, uuid: &str) -> ReconcileState {
        self.inner
            .read()
            .vms
            .get(uuid)
            .map(|vm| vm.state)
            .unwrap_or_default()
    }

    /// Record a freshly created VM in `Provisioning`
    pub fn insert_vm(&self, mut record: VmRecord) {
        record.state = ReconcileState::Provisioning;
        let mut inner = self.inner.write();
        if let Some(existing) = inner.vms.get(&record.uuid) {
            record.interfaces.extend(existing.interfaces.iter().cloned());
        }
        inner.vms.insert(record.uuid.clone(), record);
    }

    /// Move a VM to `next`. Returns false (and leaves the record alone) for an
    /// illegal transition or an unknown VM.
    pub fn set_state(&self, uuid: &str, next: ReconcileState) -> bool {
        let mut inner = self.inner.write();
        let Some(vm) = inner.vms.get_mut(uuid) else {
            return false;
        };
        if !vm.state.can_transition_to(next) {
            warn!(
                "Refusing state transition {:?} -> {:?} for VM {}",
                vm.state, next, uuid
            );
            return false;
        }
        vm.state = next;
        true
    }

    pub fn set_pod_info(
        &self,
        uuid: &str,
        namespace: &str,
        node: Option<&str>,
        node_ip: Option<&str>,
    ) {
        if let Some(vm) = self.inner.write().vms.get_mut(uuid) {
            vm.pod_namespace = Some(namespace.to_string());
            if node.is_some() {
                vm.pod_node = node.map(str::to_string);
            }
            if node_ip.is_some() {
                vm.node_ip = node_ip.map(str::to_string);
            }
        }
    }

    /// Record the VM's virtual router. A VM already attached keeps its router
    /// until `clear_virtual_router`; returns whether the reference was set.
    pub fn set_virtual_router(&self, uuid: &str, vr_uuid: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.vms.get_mut(uuid) {
            Some(vm) if vm.virtual_router.is_none() => {
                vm.virtual_router = Some(vr_uuid.to_string());
                true
            }
            Some(vm) => vm.virtual_router.as_deref() == Some(vr_uuid),
            None => false,
        }
    }

    pub fn clear_virtual_router(&self, uuid: &str) {
        if let Some(vm) = self.inner.write().vms.get_mut(uuid) {
            vm.virtual_router = None;
        }
    }

    /// Store the effective label set; the namespace label is forced to the
    /// VM's namespace when known.
    pub fn set_pod_labels(&self, uuid: &str, mut labels: Labels) {
        if let Some(vm) = self.inner.write().vms.get_mut(uuid) {
            if let Some(ns) = &vm.pod_namespace {
                labels.insert(NAMESPACE_LABEL_KEY.to_string(), ns.clone());
            }
            vm.pod_labels = Some(labels);
        }
    }

    pub fn clear_pod_labels(&self, uuid: &str) {
        if let Some(vm) = self.inner.write().vms.get_mut(uuid) {
            vm.pod_labels = None;
        }
    }

    /// Drop a VM together with every port it owns
    pub fn remove_vm(&self, uuid: &str) -> Option<VmRecord> {
        let mut inner = self.inner.write();
        let vm = inner.vms.remove(uuid)?;
        inner.vmis.retain(|_, vmi| vmi.vm_uuid != uuid);
        Some(vm)
    }

    // --- Ports ---

    pub fn vmi(&self, uuid: &str) -> Option<VmiRecord> {
        self.inner.read().vmis.get(uuid).cloned()
    }

    /// Ports of a VM, in uuid order
    pub fn vmis_of(&self, vm_uuid: &str) -> Vec<VmiRecord> {
        let inner = self.inner.read();
        let Some(vm) = inner.vms.get(vm_uuid) else {
            return Vec::new();
        };
        vm.interfaces
            .iter()
            .filter_map(|id| inner.vmis.get(id).cloned())
            .collect()
    }

    /// Record a port. Ports of unknown VMs are still cached (host ports
    /// belong to VMs this controller does not own).
    pub fn upsert_vmi_from_remote(&self, vmi: &VirtualMachineInterface) -> VmiRecord {
        let mut inner = self.inner.write();
        let mut record = VmiRecord::from_remote(vmi);
        if let Some(existing) = inner.vmis.get(&vmi.uuid) {
            record.used_vlans = existing.used_vlans.clone();
        }
        if let Some(vm) = inner.vms.get_mut(&record.vm_uuid) {
            vm.interfaces.insert(record.uuid.clone());
        }
        inner.vmis.insert(record.uuid.clone(), record.clone());
        record
    }

    pub fn add_instance_ip(&self, vmi_uuid: &str, iip_uuid: &str) {
        if let Some(vmi) = self.inner.write().vmis.get_mut(vmi_uuid) {
            vmi.instance_ips.insert(iip_uuid.to_string());
        }
    }

    pub fn remove_instance_ip(&self, vmi_uuid: &str, iip_uuid: &str) {
        if let Some(vmi) = self.inner.write().vmis.get_mut(vmi_uuid) {
            vmi.instance_ips.remove(iip_uuid);
        }
    }

    pub fn remove_floating_ip(&self, vmi_uuid: &str, fip_uuid: &str) {
        if let Some(vmi) = self.inner.write().vmis.get_mut(vmi_uuid) {
            vmi.floating_ips.remove(fip_uuid);
        }
    }

    /// Record a symmetric port-to-port link
    pub fn link_interfaces(&self, a: &str, b: &str) {
        let mut inner = self.inner.write();
        if let Some(vmi) = inner.vmis.get_mut(a) {
            vmi.interface_refs.insert(b.to_string());
        }
        if let Some(vmi) = inner.vmis.get_mut(b) {
            vmi.interface_refs.insert(a.to_string());
        }
    }

    pub fn unlink_interfaces(&self, a: &str, b: &str) {
        let mut inner = self.inner.write();
        if let Some(vmi) = inner.vmis.get_mut(a) {
            vmi.interface_refs.remove(b);
        }
        if let Some(vmi) = inner.vmis.get_mut(b) {
            vmi.interface_refs.remove(a);
        }
    }

    pub fn remove_vmi(&self, uuid: &str) -> Option<VmiRecord> {
        let mut inner = self.inner.write();
        let vmi = inner.vmis.remove(uuid)?;
        if let Some(vm) = inner.vms.get_mut(&vmi.vm_uuid) {
            vm.interfaces.remove(uuid);
        }
        Some(vmi)
    }

    // --- VLAN space of host ports ---

    /// Mark VLAN ids already in use on a host port
    pub fn reserve_vlans(&self, host_vmi: &str, tags: impl IntoIterator<Item = u16>) {
        if let Some(vmi) = self.inner.write().vmis.get_mut(host_vmi) {
            vmi.used_vlans.extend(tags);
        }
    }

    /// Hand out the lowest free VLAN id on a host port
    pub fn allocate_vlan(&self, host_vmi: &str) -> Option<u16> {
        let mut inner = self.inner.write();
        let vmi = inner.vmis.get_mut(host_vmi)?;
        let tag = VLAN_RANGE.into_iter().find(|t| !vmi.used_vlans.contains(t))?;
        vmi.used_vlans.insert(tag);
        Some(tag)
    }

    pub fn release_vlan(&self, host_vmi: &str, tag: u16) {
        if let Some(vmi) = self.inner.write().vmis.get_mut(host_vmi) {
            vmi.used_vlans.remove(&tag);
        }
    }

    // --- Read-through from the remote API ---

    /// Cached VM, or read it from the remote API and cache it
    pub async fn locate_vm(&self, api: &dyn VncApi, uuid: &str) -> Result<Option<VmRecord>> {
        if let Some(vm) = self.vm(uuid) {
            return Ok(Some(vm));
        }
        self.refresh_vm(api, uuid).await
    }

    /// Re-read a VM from the remote API, keeping local reconcile state and labels
    pub async fn refresh_vm(&self, api: &dyn VncApi, uuid: &str) -> Result<Option<VmRecord>> {
        let Some(remote) = api.virtual_machine_read(uuid).await.found()? else {
            return Ok(None);
        };
        let mut record = VmRecord::from_remote(&remote);

        let mut inner = self.inner.write();
        if let Some(existing) = inner.vms.get(uuid) {
            record.state = existing.state;
            record.pod_node = existing.pod_node.clone();
            record.node_ip = existing.node_ip.clone();
            if existing.pod_labels.is_some() {
                record.pod_labels = existing.pod_labels.clone();
            }
        }
        inner.vms.insert(record.uuid.clone(), record.clone());
        Ok(Some(record))
    }

    /// Cached port, or read it from the remote API and cache it
    pub async fn locate_vmi(&self, api: &dyn VncApi, uuid: &str) -> Result<Option<VmiRecord>> {
        if let Some(vmi) = self.vmi(uuid) {
            return Ok(Some(vmi));
        }
        let Some(remote) = api.virtual_machine_interface_read(uuid).await.found()? else {
            return Ok(None);
        };
        Ok(Some(self.upsert_vmi_from_remote(&remote)))
    }

    /// Seed the store with every VM (and its ports) known to the remote API.
    /// Returns the number of VMs cached.
    pub async fn sync(&self, api: &dyn VncApi) -> Result<usize> {
        let vms = api.virtual_machine_list().await?;
        let count = vms.len();

        for vm in &vms {
            self.inner
                .write()
                .vms
                .insert(vm.uuid.clone(), VmRecord::from_remote(vm));
            for vmi_uuid in &vm.interfaces {
                if let Some(vmi) = api
                    .virtual_machine_interface_read(vmi_uuid)
                    .await
                    .found()?
                {
                    self.upsert_vmi_from_remote(&vmi);
                } else {
                    debug!("Port {} of VM {} vanished during sync", vmi_uuid, vm.uuid);
                }
            }
        }

        Ok(count)
    }
}

/// VM annotations identifying the pod and this controller
pub fn vm_annotations(
    owner: &str,
    cluster: &str,
    namespace: &str,
    pod_name: &str,
    pod_uid: &str,
    labels: &Labels,
) -> std::collections::BTreeMap<String, String> {
    use podlink_core::objects::{POD_NAME_KEY, POD_UID_KEY};

    let mut annotations = std::collections::BTreeMap::new();
    annotations.insert(OWNER_KEY.to_string(), owner.to_string());
    annotations.insert(CLUSTER_KEY.to_string(), cluster.to_string());
    annotations.insert(NAMESPACE_KEY.to_string(), namespace.to_string());
    annotations.insert(POD_NAME_KEY.to_string(), pod_name.to_string());
    annotations.insert(POD_UID_KEY.to_string(), pod_uid.to_string());
    if let Ok(json) = serde_json::to_string(labels) {
        annotations.insert(LABELS_KEY.to_string(), json);
    }
    annotations
}
