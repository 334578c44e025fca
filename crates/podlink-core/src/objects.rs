//! SDN resource-graph objects as exchanged with the remote API.
//!
//! Back-references (`interfaces` on a VM, `instance_ips` on a port, ...) are
//! maintained by the remote side and are read-only for the controller; the
//! controller changes them through create/delete calls and reference updates.

use crate::types::FqName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation key holding the owner tag of a virtual machine
pub const OWNER_KEY: &str = "owner";
/// Annotation key holding the cluster tag of a virtual machine
pub const CLUSTER_KEY: &str = "cluster";
pub const NAMESPACE_KEY: &str = "namespace";
pub const POD_NAME_KEY: &str = "name";
pub const POD_UID_KEY: &str = "k8s_uuid";
pub const LABELS_KEY: &str = "labels";

/// Kind of an SDN object, in the remote API's hyphenated form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    VirtualMachine,
    VirtualMachineInterface,
    InstanceIp,
    FloatingIp,
    VirtualRouter,
    VirtualNetwork,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::VirtualMachine => "virtual-machine",
            ObjectKind::VirtualMachineInterface => "virtual-machine-interface",
            ObjectKind::InstanceIp => "instance-ip",
            ObjectKind::FloatingIp => "floating-ip",
            ObjectKind::VirtualRouter => "virtual-router",
            ObjectKind::VirtualNetwork => "virtual-network",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed reference to an SDN object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub uuid: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, uuid: impl Into<String>) -> Self {
        Self {
            kind,
            uuid: uuid.into(),
        }
    }

    pub fn virtual_machine(uuid: impl Into<String>) -> Self {
        Self::new(ObjectKind::VirtualMachine, uuid)
    }

    pub fn interface(uuid: impl Into<String>) -> Self {
        Self::new(ObjectKind::VirtualMachineInterface, uuid)
    }

    pub fn virtual_router(uuid: impl Into<String>) -> Self {
        Self::new(ObjectKind::VirtualRouter, uuid)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.uuid)
    }
}

/// Reference update operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RefOp {
    Add,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VirtualMachine {
    pub uuid: String,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Virtual router hosting this VM (back-reference)
    #[serde(default)]
    pub virtual_router: Option<String>,
    /// Ports attached to this VM (back-references)
    #[serde(default)]
    pub interfaces: Vec<String>,
}

impl VirtualMachine {
    pub fn owner(&self) -> Option<&str> {
        self.annotations.get(OWNER_KEY).map(String::as_str)
    }

    pub fn cluster(&self) -> Option<&str> {
        self.annotations.get(CLUSTER_KEY).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceProperties {
    pub sub_interface_vlan_tag: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VirtualMachineInterface {
    pub uuid: String,
    pub name: String,
    pub display_name: String,
    /// Owning project
    pub parent: FqName,
    pub virtual_network: FqName,
    pub virtual_machine: String,
    #[serde(default)]
    pub properties: Option<InterfaceProperties>,
    #[serde(default)]
    pub security_groups: Vec<FqName>,
    #[serde(default)]
    pub port_security_enabled: bool,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Compute node the port is bound on
    #[serde(default)]
    pub host_id: Option<String>,
    /// Port-to-port references (nested overlay links)
    #[serde(default)]
    pub interface_refs: Vec<String>,
    #[serde(default)]
    pub instance_ips: Vec<String>,
    #[serde(default)]
    pub floating_ips: Vec<String>,
}

impl VirtualMachineInterface {
    pub fn vlan_tag(&self) -> Option<u16> {
        self.properties
            .as_ref()
            .and_then(|p| p.sub_interface_vlan_tag)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceIp {
    pub uuid: String,
    pub name: String,
    pub display_name: String,
    /// Allocated address; filled in by the remote side
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub subnet_uuid: Option<String>,
    pub virtual_network: FqName,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FloatingIp {
    pub uuid: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VirtualRouter {
    pub uuid: String,
    /// Hostname of the compute node; matches a bound port's host-id
    pub name: String,
    pub ip_address: String,
    #[serde(default)]
    pub virtual_machines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VirtualNetwork {
    pub uuid: String,
    pub fq_name: FqName,
    /// Subnet uuid per IPAM, keyed by the IPAM's fully-qualified name
    #[serde(default)]
    pub ipam_subnets: BTreeMap<String, String>,
}

impl VirtualNetwork {
    /// Subnet drawn from the given IPAM on this network
    pub fn ipam_subnet(&self, ipam: &FqName) -> Option<&str> {
        self.ipam_subnets.get(&ipam.to_string()).map(String::as_str)
    }
}

/// Object name: components joined with `__`
pub fn make_name<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .map(|p| p.as_ref().to_string())
        .collect::<Vec<_>>()
        .join("__")
}

/// Display name identifying a pod across uid changes
pub fn make_display_name(cluster: &str, namespace: &str, pod_name: &str) -> String {
    make_name([cluster, namespace, pod_name])
}
