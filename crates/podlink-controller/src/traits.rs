use crate::error::Result;
use async_trait::async_trait;
use podlink_core::{
    FqName, InstanceIp, NamespaceRecord, ObjectRef, PodRecord, RefOp, VirtualMachine,
    VirtualMachineInterface, VirtualNetwork, VirtualRouter,
};

/// Trait for the remote SDN resource-graph API
///
/// Create calls return `ControllerError::AlreadyExists` on conflict; reads
/// and deletes return `ControllerError::NotFound` for missing objects. Every
/// other failure is a `RemoteFailure` (or `Timeout`). Implementations do not
/// retry. `MockVncApi` provides an in-memory implementation for tests.
#[async_trait]
pub trait VncApi: Send + Sync {
    // --- Virtual networks ---

    async fn virtual_network_read(&self, fq_name: &FqName) -> Result<VirtualNetwork>;

    // --- Virtual machines ---

    async fn virtual_machine_create(&self, vm: &VirtualMachine) -> Result<String>;
    async fn virtual_machine_read(&self, uuid: &str) -> Result<VirtualMachine>;
    async fn virtual_machine_update(&self, vm: &VirtualMachine) -> Result<()>;
    async fn virtual_machine_delete(&self, uuid: &str) -> Result<()>;
    async fn virtual_machine_list(&self) -> Result<Vec<VirtualMachine>>;

    // --- Ports ---

    async fn virtual_machine_interface_create(&self, vmi: &VirtualMachineInterface)
        -> Result<String>;
    async fn virtual_machine_interface_read(&self, uuid: &str) -> Result<VirtualMachineInterface>;
    async fn virtual_machine_interface_update(&self, vmi: &VirtualMachineInterface) -> Result<()>;
    async fn virtual_machine_interface_delete(&self, uuid: &str) -> Result<()>;

    // --- Addresses ---

    async fn instance_ip_create(&self, iip: &InstanceIp) -> Result<String>;
    async fn instance_ip_update(&self, iip: &InstanceIp) -> Result<()>;
    async fn instance_ip_delete(&self, uuid: &str) -> Result<()>;
    /// Instance IP holding `address` on `network`, if any
    async fn instance_ip_find(&self, address: &str, network: &FqName)
        -> Result<Option<InstanceIp>>;
    async fn floating_ip_delete(&self, uuid: &str) -> Result<()>;

    // --- Virtual routers ---

    async fn virtual_router_read(&self, uuid: &str) -> Result<VirtualRouter>;
    async fn virtual_router_list(&self) -> Result<Vec<VirtualRouter>>;

    // --- References and tags ---

    /// Add or delete the reference `from -> to`
    async fn ref_update(&self, from: &ObjectRef, to: &ObjectRef, op: RefOp) -> Result<()>;
    async fn set_tag(&self, vmi_uuid: &str, key: &str, value: &str) -> Result<()>;
    async fn unset_tag(&self, vmi_uuid: &str, key: &str) -> Result<()>;
}

/// Read-only mirrors of orchestrator pods and namespaces and of the SDN's
/// virtual routers. `ClusterCache` is the in-process implementation.
pub trait ClusterMirror: Send + Sync {
    /// Pod by uid. Names are only unique within a namespace.
    fn pod(&self, uid: &str) -> Option<PodRecord>;

    fn pod_uids(&self) -> Vec<String>;

    fn namespace(&self, name: &str) -> Option<NamespaceRecord>;

    /// Uuid of the virtual router registered with `ip`
    fn virtual_router_by_ip(&self, ip: &str) -> Option<String>;

    /// Uuid of the virtual router named `name` (a compute node's host-id)
    fn virtual_router_by_name(&self, name: &str) -> Option<String>;
}
