use crate::error::{ControllerError, Result};
use podlink_core::FqName;
use std::time::Duration;

/// Configuration for the reconciliation controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Cluster name, stamped on every VM and used to derive object names
    pub cluster_name: String,
    /// Owner tag of VMs created by this controller
    pub owner: String,
    /// SDN domain
    pub domain: String,
    /// Shared project for all namespaces. When unset each namespace maps to
    /// its own `<cluster>-<namespace>` project.
    pub cluster_project: Option<String>,
    /// Default network for pods of non-isolated namespaces
    pub default_pod_network: FqName,
    /// Network the nested host VMs' ports live on
    pub default_network: FqName,
    /// IPAM used for pod addresses
    pub pod_ipam: FqName,
    /// Fabric-wide IPAM used when IP-fabric forwarding is on
    pub ip_fabric_ipam: FqName,
    /// Pods run inside VMs that have an SDN port of their own
    pub nested_mode: bool,
    /// Global IP-fabric forwarding, overridable per namespace
    pub ip_fabric_forwarding: bool,
    /// Interval between drift reconciliation passes
    pub drift_interval: Duration,
    /// Deadline for each remote API call
    pub request_timeout: Duration,
}

impl ControllerConfig {
    /// Build a configuration with object names derived from the cluster name
    pub fn new(cluster_name: impl Into<String>) -> Self {
        let cluster_name = cluster_name.into();
        let domain = "default-domain".to_string();
        let project = FqName::new([domain.clone(), format!("{}-default", cluster_name)]);

        Self {
            default_pod_network: project.child(format!("{}-default-pod-network", cluster_name)),
            default_network: project.child(format!("{}-default-network", cluster_name)),
            pod_ipam: project.child(format!("{}-pod-ipam", cluster_name)),
            ip_fabric_ipam: project.child(format!("{}-ip-fabric-ipam", cluster_name)),
            owner: "k8s".to_string(),
            cluster_project: None,
            nested_mode: false,
            ip_fabric_forwarding: false,
            drift_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            cluster_name,
            domain,
        }
    }

    /// Project holding the objects of a namespace
    pub fn project_fq_name(&self, namespace: &str) -> FqName {
        match &self.cluster_project {
            Some(project) => FqName::new([self.domain.as_str(), project.as_str()]),
            None => FqName::new([
                self.domain.clone(),
                format!("{}-{}", self.cluster_name, namespace),
            ]),
        }
    }

    /// Private pod network of an isolated namespace
    pub fn isolated_pod_network(&self, namespace: &str) -> FqName {
        self.project_fq_name(namespace)
            .child(format!("{}-{}-pod-network", self.cluster_name, namespace))
    }

    /// Default security group of a namespace
    pub fn default_security_group(&self, namespace: &str) -> FqName {
        self.project_fq_name(namespace)
            .child(format!("{}-{}-default-sg", self.cluster_name, namespace))
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(ControllerError::invalid_config(
                "cluster name is empty",
                "Pass --cluster-name (or set PODLINK_CLUSTER_NAME)",
            ));
        }
        if self.drift_interval.is_zero() {
            return Err(ControllerError::invalid_config(
                "drift interval must be positive",
                "Use a value like --drift-interval-secs 60",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ControllerError::invalid_config(
                "request timeout must be positive",
                "Use a value like --request-timeout-secs 10",
            ));
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new("k8s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let config = ControllerConfig::default();
        assert_eq!(
            config.default_pod_network.to_string(),
            "default-domain:k8s-default:k8s-default-pod-network"
        );
        assert_eq!(config.owner, "k8s");
        assert_eq!(config.drift_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_project_per_namespace() {
        let config = ControllerConfig::new("east");
        assert_eq!(
            config.project_fq_name("ns1").to_string(),
            "default-domain:east-ns1"
        );
        assert_eq!(
            config.default_security_group("ns1").to_string(),
            "default-domain:east-ns1:east-ns1-default-sg"
        );
    }

    #[test]
    fn test_shared_cluster_project() {
        let mut config = ControllerConfig::new("east");
        config.cluster_project = Some("admin".to_string());
        assert_eq!(
            config.isolated_pod_network("ns1").to_string(),
            "default-domain:admin:east-ns1-pod-network"
        );
    }

    #[test]
    fn test_validate_rejects_empty_cluster() {
        let config = ControllerConfig::new("");
        assert!(matches!(
            config.validate().unwrap_err(),
            ControllerError::InvalidConfig { .. }
        ));
        assert!(ControllerConfig::default().validate().is_ok());
    }
}
